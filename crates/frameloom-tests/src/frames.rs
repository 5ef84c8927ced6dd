//! Frame sharing, copy-on-write and guard band behavior.

use crate::filters::{fill_video_frame, test_core, yuv420p8};
use frameloom_core::{alignment, MediaType, AUDIO_FRAME_SAMPLES};

// ── Copy-on-write ──────────────────────────────────────────────

#[test]
fn copy_shares_all_planes() {
    let core = test_core(1);
    let format = yuv420p8();
    let frame = core.new_video_frame(&format, 64, 64, None);
    let copy = core.copy_frame(&frame);

    for plane in 0..3 {
        assert_eq!(frame.read_ptr(plane), copy.read_ptr(plane));
    }
    core.free();
}

#[test]
fn write_clones_only_the_touched_plane() {
    let core = test_core(1);
    let format = yuv420p8();
    let mut frame = core.new_video_frame(&format, 64, 64, None);
    fill_video_frame(&mut frame, 7);

    let mut copy = core.copy_frame(&frame);
    let original_ptr0 = frame.read_ptr(0);

    let write = copy.write_ptr(0);
    assert!(!write.is_null());

    // Plane 0 diverged; planes 1 and 2 are still shared.
    assert_ne!(copy.read_ptr(0), frame.read_ptr(0));
    assert_eq!(copy.read_ptr(1), frame.read_ptr(1));
    assert_eq!(copy.read_ptr(2), frame.read_ptr(2));
    // The original frame is untouched.
    assert_eq!(frame.read_ptr(0), original_ptr0);
    assert!(frame.plane_slice(0).iter().all(|&b| b == 7));
    // The clone carried the original content.
    assert!(copy.plane_slice(0).iter().all(|&b| b == 7));
    core.free();
}

#[test]
fn unique_frame_writes_in_place() {
    let core = test_core(1);
    let format = yuv420p8();
    let mut frame = core.new_video_frame(&format, 64, 64, None);
    let before = frame.read_ptr(0);
    frame.write_ptr(0);
    assert_eq!(frame.read_ptr(0), before);
    core.free();
}

#[test]
fn plane_sharing_constructor() {
    let core = test_core(1);
    let format = yuv420p8();
    let mut src = core.new_video_frame(&format, 64, 64, None);
    fill_video_frame(&mut src, 3);

    // Share planes 0 and 2, allocate plane 1 fresh.
    let frame = core.new_video_frame_from_planes(
        &format,
        64,
        64,
        &[Some((&src, 0)), None, Some((&src, 2))],
        Some(&src),
    );

    assert_eq!(frame.read_ptr(0), src.read_ptr(0));
    assert_ne!(frame.read_ptr(1), src.read_ptr(1));
    assert_eq!(frame.read_ptr(2), src.read_ptr(2));
    core.free();
}

// ── Geometry ───────────────────────────────────────────────────

#[test]
fn strides_are_aligned() {
    let core = test_core(1);
    let format = yuv420p8();
    // 100 px is not a multiple of the alignment.
    let frame = core.new_video_frame(&format, 100, 64, None);
    for plane in 0..3 {
        let stride = frame.stride(plane);
        let width_bytes = frame.plane_width(plane) as usize * format.bytes_per_sample as usize;
        assert_eq!(stride % alignment(), 0);
        assert!(stride >= width_bytes);
        assert!(stride < width_bytes + alignment());
    }
    assert_eq!(frame.plane_width(1), 50);
    assert_eq!(frame.plane_height(1), 32);
    core.free();
}

// ── Guard bands ────────────────────────────────────────────────

#[test]
fn fresh_frame_has_intact_guards() {
    let core = test_core(1);
    let mut frame = core.new_video_frame(&yuv420p8(), 64, 64, None);
    fill_video_frame(&mut frame, 255);
    assert!(frame.verify_guard_pattern());
    core.free();
}

#[test]
fn underflow_write_corrupts_guard() {
    let core = test_core(1);
    let mut frame = core.new_video_frame(&yuv420p8(), 64, 64, None);
    let ptr = frame.write_ptr(0);
    unsafe {
        // One byte before the usable region lands in the guard band.
        *ptr.sub(1) = 0x55;
    }
    assert!(!frame.verify_guard_pattern());
    core.free();
}

#[test]
fn overflow_write_corrupts_guard() {
    let core = test_core(1);
    let mut frame = core.new_video_frame(&yuv420p8(), 64, 64, None);
    let len = frame.stride(0) * frame.plane_height(0) as usize;
    let ptr = frame.write_ptr(0);
    unsafe {
        *ptr.add(len) = 0x55;
    }
    assert!(!frame.verify_guard_pattern());
    core.free();
}

// ── Audio frames ───────────────────────────────────────────────

#[test]
fn audio_channels_are_offsets_into_one_block() {
    let core = test_core(1);
    let format = crate::filters::stereo16();
    let frame = core.new_audio_frame(&format, AUDIO_FRAME_SAMPLES as i32, None);

    assert_eq!(frame.media_type(), MediaType::Audio);
    assert_eq!(frame.num_planes(), 2);
    let stride = frame.stride(0);
    assert_eq!(
        stride,
        format.bytes_per_sample as usize * AUDIO_FRAME_SAMPLES as usize
    );
    let base = frame.read_ptr(0);
    assert_eq!(unsafe { base.add(stride) }, frame.read_ptr(1));
    core.free();
}

#[test]
fn audio_write_clones_the_whole_block() {
    let core = test_core(1);
    let format = crate::filters::stereo16();
    let frame = core.new_audio_frame(&format, 1024, None);
    let mut copy = core.copy_frame(&frame);
    assert_eq!(copy.read_ptr(0), frame.read_ptr(0));

    // Writing channel 1 detaches both channels: one backing block.
    copy.write_ptr(1);
    assert_ne!(copy.read_ptr(0), frame.read_ptr(0));
    assert_ne!(copy.read_ptr(1), frame.read_ptr(1));
    core.free();
}

#[test]
fn frame_properties_travel_with_prop_src() {
    use frameloom_core::AppendMode;

    let core = test_core(1);
    let format = yuv420p8();
    let mut src = core.new_video_frame(&format, 64, 64, None);
    src.props_mut()
        .set_int("_FrameNumber", 42, AppendMode::Replace)
        .expect("valid key");

    let derived = core.new_video_frame(&format, 64, 64, Some(&src));
    assert_eq!(derived.props().get_int("_FrameNumber", 0).unwrap(), 42);

    // Property maps are isolated after the copy.
    let mut derived = derived;
    derived
        .props_mut()
        .set_int("_FrameNumber", 1, AppendMode::Replace)
        .expect("valid key");
    assert_eq!(src.props().get_int("_FrameNumber", 0).unwrap(), 42);
    core.free();
}
