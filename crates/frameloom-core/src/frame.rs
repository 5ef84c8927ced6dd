//! Reference-counted frames with copy-on-write planes.
//!
//! A video frame holds up to three independently shared planes; an audio
//! frame holds a single block covering all channels. Cloning a frame
//! shares the underlying plane data; requesting a write pointer clones a
//! plane only when it is not uniquely owned.

use smallvec::SmallVec;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::core::Core;
use crate::format::{AudioFormat, ColorFamily, VideoFormat, AUDIO_FRAME_SAMPLES};
use crate::pool::{alignment, MemoryPool};
use crate::props::PropertyMap;

/// Word written into the guard bands surrounding every plane.
pub const GUARD_PATTERN: u32 = 0xDEAD_BEEF;

/// Bytes reserved before and after each plane when guards are enabled.
/// A multiple of the pool alignment so the payload stays aligned.
pub const GUARD_SPACE: usize = 64;

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Media type of a frame or node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Video,
    Audio,
}

/// The shared backing buffer of a single plane or audio block.
///
/// Holds a reference to the pool it was drawn from so the pool outlives
/// the buffer regardless of teardown order.
pub struct PlaneData {
    data: NonNull<u8>,
    size: usize,
    guard: usize,
    pool: Arc<MemoryPool>,
}

unsafe impl Send for PlaneData {}
unsafe impl Sync for PlaneData {}

impl PlaneData {
    fn new(plane_bytes: usize, guarded: bool, pool: &Arc<MemoryPool>) -> Self {
        let guard = if guarded { GUARD_SPACE } else { 0 };
        let size = plane_bytes + 2 * guard;
        let data = pool.alloc_buffer(size);
        pool.add(size);

        let plane = Self {
            data,
            size,
            guard,
            pool: Arc::clone(pool),
        };
        plane.fill_guards();
        plane
    }

    fn fill_guards(&self) {
        if self.guard == 0 {
            return;
        }
        let words = self.guard / std::mem::size_of::<u32>();
        unsafe {
            let head = self.data.as_ptr() as *mut u32;
            let tail = self.data.as_ptr().add(self.size - self.guard) as *mut u32;
            for i in 0..words {
                *head.add(i) = GUARD_PATTERN;
                *tail.add(i) = GUARD_PATTERN;
            }
        }
    }

    /// Pointer to the usable region past the leading guard band.
    fn payload(&self) -> *mut u8 {
        unsafe { self.data.as_ptr().add(self.guard) }
    }

    fn payload_len(&self) -> usize {
        self.size - 2 * self.guard
    }

    fn guards_intact(&self) -> bool {
        if self.guard == 0 {
            return true;
        }
        let words = self.guard / std::mem::size_of::<u32>();
        unsafe {
            let head = self.data.as_ptr() as *const u32;
            let tail = self.data.as_ptr().add(self.size - self.guard) as *const u32;
            for i in 0..words {
                if *head.add(i) != GUARD_PATTERN || *tail.add(i) != GUARD_PATTERN {
                    return false;
                }
            }
        }
        true
    }
}

impl Clone for PlaneData {
    /// Deep copy through the pool. This is the copy-on-write hook used by
    /// `Arc::make_mut` when a shared plane is written to.
    fn clone(&self) -> Self {
        let data = self.pool.alloc_buffer(self.size);
        self.pool.add(self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.as_ptr(), data.as_ptr(), self.size);
        }
        Self {
            data,
            size: self.size,
            guard: self.guard,
            pool: Arc::clone(&self.pool),
        }
    }
}

impl Drop for PlaneData {
    fn drop(&mut self) {
        unsafe { self.pool.free_buffer(self.data) };
        self.pool.subtract(self.size);
    }
}

#[derive(Clone)]
enum FrameContent {
    Video {
        format: VideoFormat,
        width: i32,
        height: i32,
        planes: SmallVec<[Arc<PlaneData>; 3]>,
        strides: SmallVec<[usize; 3]>,
    },
    Audio {
        format: AudioFormat,
        num_samples: i32,
        block: Arc<PlaneData>,
        stride: usize,
    },
}

/// A video or audio frame. Cheap to clone: planes are shared and cloned
/// lazily on write, properties share a copy-on-write container.
#[derive(Clone)]
pub struct Frame {
    content: FrameContent,
    props: PropertyMap,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame").finish_non_exhaustive()
    }
}

impl Frame {
    pub(crate) fn new_video(
        core: &Core,
        format: &VideoFormat,
        width: i32,
        height: i32,
        prop_src: Option<&Frame>,
    ) -> Frame {
        let (strides, heights) = video_geometry(core, format, width, height);
        let pool = core.pool();
        let guarded = core.frame_guards();
        let planes = strides
            .iter()
            .zip(heights.iter())
            .map(|(&stride, &h)| Arc::new(PlaneData::new(stride * h as usize, guarded, pool)))
            .collect();

        Frame {
            content: FrameContent::Video {
                format: *format,
                width,
                height,
                planes,
                strides,
            },
            props: prop_src.map(|f| f.props.clone()).unwrap_or_default(),
        }
    }

    pub(crate) fn new_video_from_planes(
        core: &Core,
        format: &VideoFormat,
        width: i32,
        height: i32,
        sources: &[Option<(&Frame, usize)>],
        prop_src: Option<&Frame>,
    ) -> Frame {
        let (strides, heights) = video_geometry(core, format, width, height);
        if sources.len() != strides.len() {
            core.log_fatal(&format!(
                "error in frame creation: {} plane sources supplied for a {}-plane format",
                sources.len(),
                strides.len()
            ));
        }

        let pool = core.pool();
        let guarded = core.frame_guards();
        let mut planes: SmallVec<[Arc<PlaneData>; 3]> = SmallVec::new();
        for (i, source) in sources.iter().enumerate() {
            match source {
                Some((src, src_plane)) => {
                    let FrameContent::Video {
                        planes: src_planes, ..
                    } = &src.content
                    else {
                        core.log_fatal("error in frame creation: plane source is not a video frame");
                    };
                    if *src_plane >= src_planes.len() {
                        core.log_fatal(&format!(
                            "error in frame creation: plane {} does not exist in the source frame",
                            src_plane
                        ));
                    }
                    if src.plane_width(*src_plane) != plane_width(format, width, i)
                        || src.plane_height(*src_plane) != plane_height(format, height, i)
                    {
                        core.log_fatal(&format!(
                            "error in frame creation: dimensions of plane {} do not match; source: {}x{}, destination: {}x{}",
                            src_plane,
                            src.plane_width(*src_plane),
                            src.plane_height(*src_plane),
                            plane_width(format, width, i),
                            plane_height(format, height, i)
                        ));
                    }
                    planes.push(Arc::clone(&src_planes[*src_plane]));
                }
                None => {
                    planes.push(Arc::new(PlaneData::new(
                        strides[i] * heights[i] as usize,
                        guarded,
                        pool,
                    )));
                }
            }
        }

        Frame {
            content: FrameContent::Video {
                format: *format,
                width,
                height,
                planes,
                strides,
            },
            props: prop_src.map(|f| f.props.clone()).unwrap_or_default(),
        }
    }

    pub(crate) fn new_audio(
        core: &Core,
        format: &AudioFormat,
        num_samples: i32,
        prop_src: Option<&Frame>,
    ) -> Frame {
        if num_samples <= 0 || num_samples as i64 > AUDIO_FRAME_SAMPLES {
            core.log_fatal(&format!(
                "error in frame creation: bad number of samples ({num_samples})"
            ));
        }

        let stride = format.bytes_per_sample as usize * AUDIO_FRAME_SAMPLES as usize;
        let block = Arc::new(PlaneData::new(
            stride * format.num_channels as usize,
            core.frame_guards(),
            core.pool(),
        ));

        Frame {
            content: FrameContent::Audio {
                format: *format,
                num_samples,
                block,
                stride,
            },
            props: prop_src.map(|f| f.props.clone()).unwrap_or_default(),
        }
    }

    pub fn media_type(&self) -> MediaType {
        match self.content {
            FrameContent::Video { .. } => MediaType::Video,
            FrameContent::Audio { .. } => MediaType::Audio,
        }
    }

    pub fn video_format(&self) -> Option<&VideoFormat> {
        match &self.content {
            FrameContent::Video { format, .. } => Some(format),
            FrameContent::Audio { .. } => None,
        }
    }

    pub fn audio_format(&self) -> Option<&AudioFormat> {
        match &self.content {
            FrameContent::Audio { format, .. } => Some(format),
            FrameContent::Video { .. } => None,
        }
    }

    /// Number of planes (video) or channels (audio).
    pub fn num_planes(&self) -> usize {
        match &self.content {
            FrameContent::Video { planes, .. } => planes.len(),
            FrameContent::Audio { format, .. } => format.num_channels as usize,
        }
    }

    /// Samples carried by an audio frame; 0 for video.
    pub fn sample_count(&self) -> i32 {
        match &self.content {
            FrameContent::Audio { num_samples, .. } => *num_samples,
            FrameContent::Video { .. } => 0,
        }
    }

    /// Width of a video plane, accounting for sub-sampling.
    pub fn plane_width(&self, plane: usize) -> i32 {
        match &self.content {
            FrameContent::Video { format, width, .. } => plane_width(format, *width, plane),
            FrameContent::Audio { .. } => 0,
        }
    }

    /// Height of a video plane, accounting for sub-sampling.
    pub fn plane_height(&self, plane: usize) -> i32 {
        match &self.content {
            FrameContent::Video { format, height, .. } => plane_height(format, *height, plane),
            FrameContent::Audio { .. } => 0,
        }
    }

    /// Stride in bytes of a plane (video) or of one channel (audio).
    pub fn stride(&self, plane: usize) -> usize {
        match &self.content {
            FrameContent::Video { strides, .. } => {
                match strides.get(plane) {
                    Some(&s) => s,
                    None => crate::log::fatal(&format!(
                        "requested stride of nonexistent plane {plane}"
                    )),
                }
            }
            FrameContent::Audio { format, stride, .. } => {
                if plane >= format.num_channels as usize {
                    crate::log::fatal(&format!(
                        "requested stride of nonexistent channel {plane}"
                    ));
                }
                *stride
            }
        }
    }

    /// Read pointer into a plane (video) or channel (audio).
    pub fn read_ptr(&self, plane: usize) -> *const u8 {
        match &self.content {
            FrameContent::Video { planes, .. } => match planes.get(plane) {
                Some(data) => data.payload() as *const u8,
                None => crate::log::fatal(&format!(
                    "requested read pointer for nonexistent plane {plane}"
                )),
            },
            FrameContent::Audio { format, block, stride, .. } => {
                if plane >= format.num_channels as usize {
                    crate::log::fatal(&format!(
                        "requested read pointer for nonexistent channel {plane}"
                    ));
                }
                unsafe { block.payload().add(plane * stride) as *const u8 }
            }
        }
    }

    /// Write pointer into a plane (video) or channel (audio). Clones the
    /// backing data first when it is shared with another frame; for audio
    /// the whole block is cloned.
    pub fn write_ptr(&mut self, plane: usize) -> *mut u8 {
        match &mut self.content {
            FrameContent::Video { planes, .. } => {
                if plane >= planes.len() {
                    crate::log::fatal(&format!(
                        "requested write pointer for nonexistent plane {plane}"
                    ));
                }
                Arc::make_mut(&mut planes[plane]).payload()
            }
            FrameContent::Audio { format, block, stride, .. } => {
                if plane >= format.num_channels as usize {
                    crate::log::fatal(&format!(
                        "requested write pointer for nonexistent channel {plane}"
                    ));
                }
                let data = Arc::make_mut(block);
                unsafe { data.payload().add(plane * *stride) }
            }
        }
    }

    /// Read-only view of a plane (video: `stride * plane_height` bytes;
    /// audio: one channel's `stride` bytes).
    pub fn plane_slice(&self, plane: usize) -> &[u8] {
        let len = self.plane_len(plane);
        unsafe { std::slice::from_raw_parts(self.read_ptr(plane), len) }
    }

    /// Mutable view of a plane; performs the copy-on-write step first.
    pub fn plane_slice_mut(&mut self, plane: usize) -> &mut [u8] {
        let len = self.plane_len(plane);
        unsafe { std::slice::from_raw_parts_mut(self.write_ptr(plane), len) }
    }

    fn plane_len(&self, plane: usize) -> usize {
        match &self.content {
            FrameContent::Video { .. } => self.stride(plane) * self.plane_height(plane) as usize,
            FrameContent::Audio { .. } => self.stride(plane),
        }
    }

    pub fn props(&self) -> &PropertyMap {
        &self.props
    }

    pub fn props_mut(&mut self) -> &mut PropertyMap {
        &mut self.props
    }

    pub fn set_props(&mut self, props: PropertyMap) {
        self.props = props;
    }

    /// Check the guard bands of every distinct backing buffer.
    pub fn verify_guard_pattern(&self) -> bool {
        match &self.content {
            FrameContent::Video { planes, .. } => planes.iter().all(|p| p.guards_intact()),
            FrameContent::Audio { block, .. } => block.guards_intact(),
        }
    }

    /// Total bytes of backing memory, counting shared planes once per
    /// reference.
    pub fn memory_size(&self) -> usize {
        match &self.content {
            FrameContent::Video { planes, .. } => planes.iter().map(|p| p.payload_len()).sum(),
            FrameContent::Audio { block, .. } => block.payload_len(),
        }
    }
}

fn plane_width(format: &VideoFormat, width: i32, plane: usize) -> i32 {
    if plane > 0 {
        width >> format.sub_sampling_w
    } else {
        width
    }
}

fn plane_height(format: &VideoFormat, height: i32, plane: usize) -> i32 {
    if plane > 0 {
        height >> format.sub_sampling_h
    } else {
        height
    }
}

/// Strides and heights of every plane; validates dimensions.
fn video_geometry(
    core: &Core,
    format: &VideoFormat,
    width: i32,
    height: i32,
) -> (SmallVec<[usize; 3]>, SmallVec<[i32; 3]>) {
    if width <= 0 || height <= 0 {
        core.log_fatal(&format!(
            "error in frame creation: dimensions are not positive ({width}x{height})"
        ));
    }
    if format.color_family == ColorFamily::Undefined {
        core.log_fatal("error in frame creation: the format is undefined");
    }

    let align = alignment();
    let mut strides = SmallVec::new();
    let mut heights = SmallVec::new();
    for plane in 0..format.num_planes as usize {
        let w = plane_width(format, width, plane);
        strides.push(align_up(w as usize * format.bytes_per_sample as usize, align));
        heights.push(plane_height(format, height, plane));
    }
    (strides, heights)
}
