//! Scheduler behavior: dependencies, error propagation, ordering,
//! reservation and cancellation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::filters::{
    test_core, video_info, yuv420p8, ConcurrencyProbe, ConstantAudio, ConstantVideo,
    FailingSource, PassThrough,
};
use frameloom_core::{
    flags, ActivationReason, Core, Filter, FilterError, FilterMode, Frame, FrameContext,
    NodeHandle, AUDIO_FRAME_SAMPLES,
};

fn constant_source(core: &Core, num_frames: i32) -> NodeHandle {
    ConstantVideo::node(core, 64, 64, num_frames, 10)
}

// ── Basic evaluation ───────────────────────────────────────────

#[test]
fn source_frame_round_trip() {
    let core = test_core(2);
    let node = constant_source(&core, 10);

    let frame = core.get_frame(&node, 3).expect("frame");
    assert_eq!(frame.plane_width(0), 64);
    assert!(frame.plane_slice(0).iter().all(|&b| b == 13));

    drop(node);
    core.free();
}

#[test]
fn dependent_request_resumes_requester() {
    let core = test_core(2);
    let source = constant_source(&core, 10);
    let through = PassThrough::node(&core, source.clone());

    let frame = core.get_frame(&through, 5).expect("frame");
    assert!(frame.plane_slice(0).iter().all(|&b| b == 15));

    drop((source, through));
    core.free();
}

#[test]
fn invalid_frame_number_fails_through_callback() {
    let core = test_core(1);
    let node = constant_source(&core, 10);

    let err = core.get_frame(&node, -1).expect_err("negative frame");
    assert!(err.0.contains("invalid frame number"));
    let err = core.get_frame(&node, 10).expect_err("past the end");
    assert!(err.0.contains("invalid frame number"));

    drop(node);
    core.free();
}

// ── Multi-dependency and re-requests ───────────────────────────

/// Averages frames `n` and `n+1` of the upstream clip.
struct AveragePair {
    upstream: NodeHandle,
}

impl Filter for AveragePair {
    fn get_frame(
        &self,
        n: i32,
        reason: ActivationReason,
        ctx: &mut FrameContext<'_>,
        core: &Core,
    ) -> Result<Option<Frame>, FilterError> {
        match reason {
            ActivationReason::Initial => {
                ctx.request_frame_filter(&self.upstream, n);
                ctx.request_frame_filter(&self.upstream, n + 1);
                Ok(None)
            }
            ActivationReason::AllFramesReady => {
                let a = ctx
                    .frame_filter(&self.upstream, n)
                    .ok_or_else(|| FilterError("first frame missing".into()))?;
                let b = ctx
                    .frame_filter(&self.upstream, n + 1)
                    .ok_or_else(|| FilterError("second frame missing".into()))?;
                let mut out = core.new_video_frame(
                    a.video_format().expect("video"),
                    a.plane_width(0),
                    a.plane_height(0),
                    Some(&a),
                );
                for plane in 0..out.num_planes() {
                    let pa = a.plane_slice(plane);
                    let pb = b.plane_slice(plane);
                    for (dst, (&x, &y)) in
                        out.plane_slice_mut(plane).iter_mut().zip(pa.iter().zip(pb))
                    {
                        *dst = ((x as u16 + y as u16) / 2) as u8;
                    }
                }
                Ok(Some(out))
            }
            ActivationReason::Error => Ok(None),
        }
    }
}

#[test]
fn two_upstream_frames_are_delivered_together() {
    let core = test_core(4);
    let source = constant_source(&core, 10);
    let vi = *source.video_info().expect("video");
    let avg = core
        .create_video_filter(
            "AveragePair",
            vec![vi],
            FilterMode::Parallel,
            0,
            Box::new(AveragePair {
                upstream: source.clone(),
            }),
        )
        .expect("filter creation")
        .remove(0);

    // Frames 4 and 5 hold bytes 14 and 15; the average is 14.
    let frame = core.get_frame(&avg, 4).expect("frame");
    assert!(frame.plane_slice(0).iter().all(|&b| b == 14));

    drop((source, avg));
    core.free();
}

/// Requests one upstream frame, then a second one from the all-ready
/// activation before producing output.
struct TwoPhase {
    upstream: NodeHandle,
    phase: Mutex<std::collections::HashMap<i32, u8>>,
}

impl Filter for TwoPhase {
    fn get_frame(
        &self,
        n: i32,
        reason: ActivationReason,
        ctx: &mut FrameContext<'_>,
        _core: &Core,
    ) -> Result<Option<Frame>, FilterError> {
        match reason {
            ActivationReason::Initial => {
                ctx.request_frame_filter(&self.upstream, n);
                self.phase.lock().insert(n, 0);
                Ok(None)
            }
            ActivationReason::AllFramesReady => {
                let mut phases = self.phase.lock();
                let phase = phases.get(&n).copied().unwrap_or(0);
                if phase == 0 {
                    phases.insert(n, 1);
                    drop(phases);
                    ctx.request_frame_filter(&self.upstream, n + 1);
                    Ok(None)
                } else {
                    drop(phases);
                    let frame = ctx
                        .frame_filter(&self.upstream, n + 1)
                        .ok_or_else(|| FilterError("second-phase frame missing".into()))?;
                    Ok(Some(frame))
                }
            }
            ActivationReason::Error => Ok(None),
        }
    }
}

#[test]
fn filters_may_request_more_after_all_ready() {
    let core = test_core(2);
    let source = constant_source(&core, 10);
    let vi = *source.video_info().expect("video");
    let node = core
        .create_video_filter(
            "TwoPhase",
            vec![vi],
            FilterMode::Unordered,
            0,
            Box::new(TwoPhase {
                upstream: source.clone(),
                phase: Mutex::new(std::collections::HashMap::new()),
            }),
        )
        .expect("filter creation")
        .remove(0);

    // The output of frame 2 is upstream frame 3.
    let frame = core.get_frame(&node, 2).expect("frame");
    assert!(frame.plane_slice(0).iter().all(|&b| b == 13));

    drop((source, node));
    core.free();
}

// ── Error propagation ──────────────────────────────────────────

#[test]
fn upstream_error_reaches_the_user_callback() {
    let core = test_core(4);
    let failing = core
        .create_video_filter(
            "FailingSource",
            vec![video_info(yuv420p8(), 64, 64, 10)],
            FilterMode::Parallel,
            0,
            Box::new(FailingSource {
                inner: ConstantVideo {
                    format: yuv420p8(),
                    width: 64,
                    height: 64,
                    base: 0,
                    delay: None,
                },
                fail_on: 5,
            }),
        )
        .expect("filter creation")
        .remove(0);
    let b = PassThrough::node(&core, failing.clone());
    let c = PassThrough::node(&core, b.clone());

    let err = core.get_frame(&c, 5).expect_err("propagated error");
    assert!(err.0.contains("deliberate failure on frame 5"));

    // Other frames of the same chain still work.
    let frame = core.get_frame(&c, 4).expect("frame");
    assert!(frame.plane_slice(0).iter().all(|&b| b == 4));

    drop((failing, b, c));
    core.free();
}

#[test]
fn filter_returning_nothing_is_an_error() {
    struct Lazy;
    impl Filter for Lazy {
        fn get_frame(
            &self,
            _n: i32,
            _reason: ActivationReason,
            _ctx: &mut FrameContext<'_>,
            _core: &Core,
        ) -> Result<Option<Frame>, FilterError> {
            Ok(None)
        }
    }

    let core = test_core(1);
    let node = core
        .create_video_filter(
            "Lazy",
            vec![video_info(yuv420p8(), 64, 64, 10)],
            FilterMode::Parallel,
            0,
            Box::new(Lazy),
        )
        .expect("filter creation")
        .remove(0);

    let err = core.get_frame(&node, 0).expect_err("no frame, no requests");
    assert!(err.0.contains("returned no frame"));

    drop(node);
    core.free();
}

// ── Concurrency disciplines ────────────────────────────────────

#[test]
fn unordered_invocations_never_overlap() {
    let core = test_core(4);
    let running = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let node = core
        .create_video_filter(
            "UnorderedProbe",
            vec![video_info(yuv420p8(), 64, 64, 16)],
            FilterMode::Unordered,
            0,
            Box::new(ConcurrencyProbe {
                inner: ConstantVideo {
                    format: yuv420p8(),
                    width: 64,
                    height: 64,
                    base: 0,
                    delay: None,
                },
                running: Arc::clone(&running),
                max_seen: Arc::clone(&max_seen),
            }),
        )
        .expect("filter creation")
        .remove(0);

    let (tx, rx) = mpsc::channel();
    for n in 0..8 {
        let tx = tx.clone();
        core.request_frame(&node, n, false, move |result, _, _| {
            tx.send(result.is_ok()).expect("send");
        });
    }
    for _ in 0..8 {
        assert!(rx.recv_timeout(Duration::from_secs(5)).expect("result"));
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);

    drop(node);
    core.free();
}

#[test]
fn parallel_invocations_do_overlap() {
    let core = test_core(4);
    let running = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let node = core
        .create_video_filter(
            "ParallelProbe",
            vec![video_info(yuv420p8(), 64, 64, 16)],
            FilterMode::Parallel,
            0,
            Box::new(ConcurrencyProbe {
                inner: ConstantVideo {
                    format: yuv420p8(),
                    width: 64,
                    height: 64,
                    base: 0,
                    delay: Some(Box::new(|_| Duration::from_millis(20))),
                },
                running: Arc::clone(&running),
                max_seen: Arc::clone(&max_seen),
            }),
        )
        .expect("filter creation")
        .remove(0);

    let (tx, rx) = mpsc::channel();
    for n in 0..8 {
        let tx = tx.clone();
        core.request_frame(&node, n, false, move |result, _, _| {
            tx.send(result.is_ok()).expect("send");
        });
    }
    for _ in 0..8 {
        assert!(rx.recv_timeout(Duration::from_secs(5)).expect("result"));
    }
    assert!(max_seen.load(Ordering::SeqCst) > 1);

    drop(node);
    core.free();
}

#[test]
fn linear_node_completes_in_ascending_order() {
    let core = test_core(4);
    let node = core
        .create_video_filter(
            "LinearSource",
            vec![video_info(yuv420p8(), 64, 64, 10)],
            FilterMode::Parallel,
            flags::MAKE_LINEAR,
            Box::new(ConstantVideo {
                format: yuv420p8(),
                width: 64,
                height: 64,
                base: 0,
                // Later frames would finish first if they could run early.
                delay: Some(Box::new(|n| Duration::from_millis(5 * (10 - n as u64)))),
            }),
        )
        .expect("filter creation")
        .remove(0);

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    for n in 0..10 {
        let order = Arc::clone(&order);
        let tx = tx.clone();
        core.request_frame(&node, n, true, move |result, n, _| {
            assert!(result.is_ok());
            order.lock().push(n);
            tx.send(()).expect("send");
        });
    }
    for _ in 0..10 {
        rx.recv_timeout(Duration::from_secs(10)).expect("completion");
    }
    assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());

    drop(node);
    core.free();
}

// ── Reservation ────────────────────────────────────────────────

/// Reserves a worker, then blocks for a while before producing.
struct BlockingSource {
    inner: ConstantVideo,
    block_for: Duration,
}

impl Filter for BlockingSource {
    fn get_frame(
        &self,
        n: i32,
        reason: ActivationReason,
        ctx: &mut FrameContext<'_>,
        core: &Core,
    ) -> Result<Option<Frame>, FilterError> {
        core.reserve_thread();
        std::thread::sleep(self.block_for);
        core.release_thread();
        self.inner.get_frame(n, reason, ctx, core)
    }
}

#[test]
fn reserved_threads_keep_the_pool_responsive() {
    let core = test_core(4);

    // Four blockers occupy every original worker.
    let blockers: Vec<NodeHandle> = (0..4)
        .map(|i| {
            core.create_video_filter(
                &format!("Blocker{i}"),
                vec![video_info(yuv420p8(), 64, 64, 4)],
                FilterMode::Parallel,
                0,
                Box::new(BlockingSource {
                    inner: ConstantVideo {
                        format: yuv420p8(),
                        width: 64,
                        height: 64,
                        base: 0,
                        delay: None,
                    },
                    block_for: Duration::from_millis(500),
                }),
            )
            .expect("filter creation")
            .remove(0)
        })
        .collect();

    let (block_tx, block_rx) = mpsc::channel();
    for node in &blockers {
        let tx = block_tx.clone();
        core.request_frame(node, 0, false, move |result, _, _| {
            tx.send(result.is_ok()).expect("send");
        });
    }

    // Give the blockers time to start and reserve replacements.
    std::thread::sleep(Duration::from_millis(100));

    // Quick work must be dispatched while all four blockers sleep.
    let quick = constant_source(&core, 4);
    let (tx, rx) = mpsc::channel();
    for n in 0..4 {
        let tx = tx.clone();
        core.request_frame(&quick, n, false, move |result, _, _| {
            tx.send(result.is_ok()).expect("send");
        });
    }
    for _ in 0..4 {
        assert!(rx
            .recv_timeout(Duration::from_millis(300))
            .expect("quick work starved by blocked workers"));
    }
    for _ in 0..4 {
        assert!(block_rx.recv_timeout(Duration::from_secs(5)).expect("blocker"));
    }

    drop((blockers, quick));
    core.free();
}

// ── Cancellation ───────────────────────────────────────────────

#[test]
fn cancelled_request_reports_an_error() {
    let core = test_core(1);
    let slow = core
        .create_video_filter(
            "SlowSource",
            vec![video_info(yuv420p8(), 64, 64, 10)],
            FilterMode::Parallel,
            0,
            Box::new(ConstantVideo {
                format: yuv420p8(),
                width: 64,
                height: 64,
                base: 0,
                delay: Some(Box::new(|_| Duration::from_millis(100))),
            }),
        )
        .expect("filter creation")
        .remove(0);

    // Occupy the only worker, then queue and cancel a second request.
    let (tx1, rx1) = mpsc::channel();
    core.request_frame(&slow, 0, false, move |result, _, _| {
        tx1.send(result.is_ok()).expect("send");
    });

    let (tx2, rx2) = mpsc::channel();
    let ticket = core.request_frame(&slow, 1, false, move |result, _, _| {
        tx2.send(result).expect("send");
    });
    ticket.cancel();

    assert!(rx1.recv_timeout(Duration::from_secs(5)).expect("first request"));
    let second = rx2.recv_timeout(Duration::from_secs(5)).expect("second request");
    let err = second.expect_err("cancelled request must fail");
    assert!(err.0.contains("cancelled"));

    drop(slow);
    core.free();
}

// ── Output locking ─────────────────────────────────────────────

#[test]
fn lock_on_output_serializes_callbacks() {
    let core = test_core(4);
    let node = constant_source(&core, 16);

    let in_callback = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    for n in 0..16 {
        let in_callback = Arc::clone(&in_callback);
        let overlapped = Arc::clone(&overlapped);
        let tx = tx.clone();
        core.request_frame(&node, n, true, move |result, _, _| {
            assert!(result.is_ok());
            if in_callback.fetch_add(1, Ordering::SeqCst) != 0 {
                overlapped.store(true, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(2));
            in_callback.fetch_sub(1, Ordering::SeqCst);
            tx.send(()).expect("send");
        });
    }
    for _ in 0..16 {
        rx.recv_timeout(Duration::from_secs(5)).expect("completion");
    }
    assert!(!overlapped.load(Ordering::SeqCst));

    drop(node);
    core.free();
}

// ── Audio requests ─────────────────────────────────────────────

#[test]
fn audio_stream_splits_into_fixed_frames() {
    let core = test_core(2);
    let node = ConstantAudio::node(&core, AUDIO_FRAME_SAMPLES * 2 + 100);
    assert_eq!(node.num_frames(), 3);

    let full = core.get_frame(&node, 0).expect("frame");
    assert_eq!(full.sample_count() as i64, AUDIO_FRAME_SAMPLES);
    let tail = core.get_frame(&node, 2).expect("frame");
    assert_eq!(tail.sample_count(), 100);

    drop(node);
    core.free();
}
