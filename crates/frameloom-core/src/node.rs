//! Filter nodes: graph vertices wrapping a filter instance.
//!
//! A node carries the filter, its declared outputs and the concurrency
//! discipline the scheduler must apply. External references are
//! [`NodeHandle`]s, one per output; the node is destroyed when the last
//! handle and the last in-flight request drop it.

use num_rational::Rational64;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::{ActivationReason, FrameContext};
use crate::core::Core;
use crate::error::{CoreError, FilterError};
use crate::format::{
    is_valid_audio_format, is_valid_video_format, AudioFormat, VideoFormat, AUDIO_FRAME_SAMPLES,
};
use crate::frame::{Frame, MediaType};

/// Concurrency discipline of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterMode {
    /// Any number of concurrent invocations.
    Parallel,
    /// Concurrent requests, but never re-entered for the same
    /// `(frame, reason)` pair.
    ParallelRequests,
    /// Invocations mutually excluded across all frames, any order.
    Unordered,
    /// One invocation at a time, frames strictly in ascending order; the
    /// filter may keep per-frame state between calls.
    FrameState,
}

/// Node behavior flags.
pub mod flags {
    /// The node's output frames must not be cached.
    pub const NO_CACHE: u32 = 1;
    /// The node is itself a cache (implies `NO_CACHE`).
    pub const IS_CACHE: u32 = 2;
    /// Frames must be produced strictly in ascending order.
    pub const MAKE_LINEAR: u32 = 4;
    /// The filter wants upstream frame-ready notifications.
    pub const FRAME_READY: u32 = 8;

    pub(crate) const ALL: u32 = NO_CACHE | IS_CACHE | MAKE_LINEAR | FRAME_READY;
}

/// Declared properties of one video output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub format: VideoFormat,
    pub fps_num: i64,
    pub fps_den: i64,
    pub width: i32,
    pub height: i32,
    pub num_frames: i32,
}

/// Declared properties of one audio output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub format: AudioFormat,
    pub sample_rate: i32,
    pub num_samples: i64,
}

impl AudioInfo {
    /// Number of frames needed to carry all samples at the fixed frame
    /// granularity.
    pub fn num_frames(&self) -> i32 {
        ((self.num_samples + AUDIO_FRAME_SAMPLES - 1) / AUDIO_FRAME_SAMPLES) as i32
    }
}

/// Whether a video info is self-consistent: valid format fields, a
/// reduced frame rate, width and height either both set or both zero,
/// and at least one frame.
pub fn is_valid_video_info(vi: &VideoInfo) -> bool {
    if !is_valid_video_format(
        vi.format.color_family,
        vi.format.sample_type,
        vi.format.bits_per_sample,
        vi.format.sub_sampling_w,
        vi.format.sub_sampling_h,
    ) {
        return false;
    }

    if vi.fps_num < 0 || vi.fps_den < 0 || vi.width < 0 || vi.height < 0 || vi.num_frames < 1 {
        return false;
    }

    // Frame rates must be reduced fractions; 0/0 marks variable rate.
    match (vi.fps_num, vi.fps_den) {
        (0, 0) => {}
        (_, 0) | (0, _) => return false,
        (num, den) => {
            let reduced = Rational64::new(num, den);
            if *reduced.numer() != num || *reduced.denom() != den {
                return false;
            }
        }
    }

    if (vi.height != 0) != (vi.width != 0) {
        return false;
    }

    true
}

/// Whether an audio info is self-consistent.
pub fn is_valid_audio_info(ai: &AudioInfo) -> bool {
    if !is_valid_audio_format(
        ai.format.sample_type,
        ai.format.bits_per_sample,
        ai.format.channel_layout,
    ) {
        return false;
    }

    ai.num_samples >= 1 && ai.sample_rate >= 1
}

/// A filter instance. Implementations produce frames on demand; the
/// scheduler drives [`get_frame`](Filter::get_frame) through its
/// activation phases.
pub trait Filter: Send + Sync {
    /// Produce frame `n`, request upstream frames, or report an error.
    ///
    /// - `Initial`: register upstream requests via the context and
    ///   return `Ok(None)`, or produce the frame directly.
    /// - `AllFramesReady`: consume the requested frames and produce the
    ///   output, or request more and return `Ok(None)` again.
    /// - `Error`: an upstream request failed; clean up. The return value
    ///   is ignored.
    fn get_frame(
        &self,
        n: i32,
        reason: ActivationReason,
        ctx: &mut FrameContext<'_>,
        core: &Core,
    ) -> Result<Option<Frame>, FilterError>;
}

pub(crate) enum NodeOutputs {
    Video(Vec<VideoInfo>),
    Audio(Vec<AudioInfo>),
}

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// A filter bound into the graph.
pub struct Node {
    pub(crate) id: u64,
    name: String,
    mode: FilterMode,
    flags: u32,
    outputs: NodeOutputs,
    filter: Option<Box<dyn Filter>>,
    core: Core,
}

impl Node {
    fn validate_flags(name: &str, node_flags: u32) -> Result<(), CoreError> {
        if node_flags & !flags::ALL != 0 {
            return Err(CoreError::Filter(format!(
                "filter {name} specified unknown flags"
            )));
        }
        if node_flags & flags::IS_CACHE != 0 && node_flags & flags::NO_CACHE == 0 {
            return Err(CoreError::Filter(format!(
                "filter {name} specified an illegal combination of flags (NO_CACHE must always be set with IS_CACHE)"
            )));
        }
        Ok(())
    }

    pub(crate) fn new_video(
        core: &Core,
        name: &str,
        vi: Vec<VideoInfo>,
        mode: FilterMode,
        node_flags: u32,
        filter: Box<dyn Filter>,
    ) -> Result<Arc<Node>, CoreError> {
        Self::validate_flags(name, node_flags)?;
        if vi.is_empty() {
            return Err(CoreError::Filter(format!(
                "filter {name} needs to have at least one output"
            )));
        }
        for info in &vi {
            if !is_valid_video_info(info) {
                return Err(CoreError::Filter(format!(
                    "the video info passed by {name} is invalid"
                )));
            }
        }

        core.filter_instance_created();
        Ok(Arc::new(Node {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            mode,
            flags: node_flags,
            outputs: NodeOutputs::Video(vi),
            filter: Some(filter),
            core: core.clone(),
        }))
    }

    pub(crate) fn new_audio(
        core: &Core,
        name: &str,
        ai: Vec<AudioInfo>,
        mode: FilterMode,
        node_flags: u32,
        filter: Box<dyn Filter>,
    ) -> Result<Arc<Node>, CoreError> {
        Self::validate_flags(name, node_flags)?;
        if ai.is_empty() {
            return Err(CoreError::Filter(format!(
                "filter {name} needs to have at least one output"
            )));
        }
        let max_samples = i32::MAX as i64 * AUDIO_FRAME_SAMPLES;
        for info in &ai {
            if !is_valid_audio_info(info) {
                return Err(CoreError::Filter(format!(
                    "the audio info passed by {name} is invalid"
                )));
            }
            if info.num_samples > max_samples {
                return Err(CoreError::Filter(format!(
                    "filter {name} specified {} output samples but {} samples is the upper limit",
                    info.num_samples, max_samples
                )));
            }
        }

        core.filter_instance_created();
        Ok(Arc::new(Node {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            mode,
            flags: node_flags,
            outputs: NodeOutputs::Audio(ai),
            filter: Some(filter),
            core: core.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn media_type(&self) -> MediaType {
        match self.outputs {
            NodeOutputs::Video(_) => MediaType::Video,
            NodeOutputs::Audio(_) => MediaType::Audio,
        }
    }

    pub fn num_outputs(&self) -> usize {
        match &self.outputs {
            NodeOutputs::Video(v) => v.len(),
            NodeOutputs::Audio(a) => a.len(),
        }
    }

    pub fn video_info(&self, index: usize) -> Option<&VideoInfo> {
        match &self.outputs {
            NodeOutputs::Video(v) => v.get(index),
            NodeOutputs::Audio(_) => None,
        }
    }

    pub fn audio_info(&self, index: usize) -> Option<&AudioInfo> {
        match &self.outputs {
            NodeOutputs::Audio(a) => a.get(index),
            NodeOutputs::Video(_) => None,
        }
    }

    pub(crate) fn core(&self) -> &Core {
        &self.core
    }

    /// Whether the scheduler must serialize this node's frames in
    /// ascending order.
    pub(crate) fn is_linear(&self) -> bool {
        self.mode == FilterMode::FrameState || self.flags & flags::MAKE_LINEAR != 0
    }

    /// Frame count of one output, in frames for video and in fixed-size
    /// audio frames for audio.
    pub(crate) fn output_frames(&self, index: usize) -> i32 {
        match &self.outputs {
            NodeOutputs::Video(v) => v.get(index).map(|vi| vi.num_frames).unwrap_or(0),
            NodeOutputs::Audio(a) => a.get(index).map(|ai| ai.num_frames()).unwrap_or(0),
        }
    }

    /// Invoke the filter and validate whatever it returned against the
    /// declared output. Structural mismatches are fatal.
    pub(crate) fn produce_frame(
        &self,
        n: i32,
        reason: ActivationReason,
        ctx: &mut FrameContext<'_>,
    ) -> Result<Option<Frame>, FilterError> {
        let Some(filter) = self.filter.as_ref() else {
            self.core
                .log_fatal(&format!("filter {} invoked during teardown", self.name));
        };

        let result = filter.get_frame(n, reason, ctx, &self.core)?;

        // The error activation exists only for cleanup; whatever it
        // returns is discarded unvalidated.
        if reason == ActivationReason::Error {
            return Ok(None);
        }

        if let Some(frame) = &result {
            self.validate_output(n, ctx.output_index(), frame);
        }
        Ok(result)
    }

    fn validate_output(&self, n: i32, index: usize, frame: &Frame) {
        match &self.outputs {
            NodeOutputs::Video(infos) => {
                let Some(declared) = infos.get(index) else {
                    self.core.log_fatal(&format!(
                        "filter {} produced a frame for nonexistent output {index}",
                        self.name
                    ));
                };
                let Some(actual) = frame.video_format() else {
                    self.core.log_fatal(&format!(
                        "filter {} returned an audio frame on a video output",
                        self.name
                    ));
                };
                use crate::format::ColorFamily;
                if declared.format.color_family == ColorFamily::Undefined {
                    if actual.color_family.is_compat() {
                        self.core
                            .log_fatal(&format!("illegal compat frame returned by {}", self.name));
                    }
                } else if *actual != declared.format {
                    self.core.log_fatal(&format!(
                        "filter {} returned a frame that's not of the declared format",
                        self.name
                    ));
                } else if (declared.width != 0 || declared.height != 0)
                    && (frame.plane_width(0) != declared.width
                        || frame.plane_height(0) != declared.height)
                {
                    self.core.log_fatal(&format!(
                        "filter {} declared the size {}x{}, but it returned a frame with the size {}x{}",
                        self.name,
                        declared.width,
                        declared.height,
                        frame.plane_width(0),
                        frame.plane_height(0)
                    ));
                }
            }
            NodeOutputs::Audio(infos) => {
                let Some(declared) = infos.get(index) else {
                    self.core.log_fatal(&format!(
                        "filter {} produced a frame for nonexistent output {index}",
                        self.name
                    ));
                };
                let Some(actual) = frame.audio_format() else {
                    self.core.log_fatal(&format!(
                        "filter {} returned a video frame on an audio output",
                        self.name
                    ));
                };
                if *actual != declared.format {
                    self.core.log_fatal(&format!(
                        "filter {} returned a frame that's not of the declared format",
                        self.name
                    ));
                }
                let tail = declared.num_samples % AUDIO_FRAME_SAMPLES;
                let expected = if (n as i64) < declared.num_frames() as i64 - 1 || tail == 0 {
                    AUDIO_FRAME_SAMPLES
                } else {
                    tail
                };
                if frame.sample_count() as i64 != expected {
                    self.core.log_fatal(&format!(
                        "filter {} returned an audio frame with {} samples but {} were expected from the declared length",
                        self.name,
                        frame.sample_count(),
                        expected
                    ));
                }
            }
        }

        if self.core.frame_guards() && !frame.verify_guard_pattern() {
            self.core.log_fatal(&format!(
                "guard memory corrupted in frame {n} returned from {}",
                self.name
            ));
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(filter) = self.filter.take() {
            defer_filter_free(filter, self.core.clone());
        }
    }
}

/// External reference to one output of a node.
#[derive(Clone)]
pub struct NodeHandle {
    node: Arc<Node>,
    index: usize,
}

impl NodeHandle {
    pub(crate) fn new(node: Arc<Node>, index: usize) -> Self {
        Self { node, index }
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn output_index(&self) -> usize {
        self.index
    }

    pub fn media_type(&self) -> MediaType {
        self.node.media_type()
    }

    pub fn video_info(&self) -> Option<&VideoInfo> {
        self.node.video_info(self.index)
    }

    pub fn audio_info(&self) -> Option<&AudioInfo> {
        self.node.audio_info(self.index)
    }

    /// Frame count of this output (fixed-granularity frames for audio).
    pub fn num_frames(&self) -> i32 {
        self.node.output_frames(self.index)
    }

    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Whether this output declares a compat color family.
    pub(crate) fn has_compat_output(&self) -> bool {
        self.video_info()
            .map(|vi| vi.format.color_family.is_compat())
            .unwrap_or(false)
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node) && self.index == other.index
    }
}

impl Eq for NodeHandle {}

// ── Deferred teardown ──────────────────────────────────────────
//
// A filter being dropped may hold the last handles to upstream nodes,
// whose drop would recurse arbitrarily deep for long chains. Pending
// filters are parked in a thread-local list and drained only at the
// outermost level, so all destruction happens at a flat stack depth.

thread_local! {
    static FREE_DEPTH: Cell<u32> = const { Cell::new(0) };
    static PENDING_FREE: RefCell<Vec<(Box<dyn Filter>, Core)>> = const { RefCell::new(Vec::new()) };
}

fn defer_filter_free(filter: Box<dyn Filter>, core: Core) {
    FREE_DEPTH.with(|d| d.set(d.get() + 1));
    PENDING_FREE.with(|list| list.borrow_mut().push((filter, core)));

    if FREE_DEPTH.with(|d| d.get()) == 1 {
        loop {
            let entry = PENDING_FREE.with(|list| list.borrow_mut().pop());
            match entry {
                Some((filter, core)) => {
                    drop(filter);
                    core.filter_instance_destroyed();
                }
                None => break,
            }
        }
    }

    FREE_DEPTH.with(|d| d.set(d.get() - 1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ColorFamily, SampleType};

    fn yuv420p8() -> VideoFormat {
        VideoFormat::query(ColorFamily::Yuv, SampleType::Integer, 8, 1, 1).unwrap()
    }

    fn base_info() -> VideoInfo {
        VideoInfo {
            format: yuv420p8(),
            fps_num: 24,
            fps_den: 1,
            width: 640,
            height: 480,
            num_frames: 100,
        }
    }

    #[test]
    fn video_info_accepts_reduced_fps() {
        assert!(is_valid_video_info(&base_info()));
    }

    #[test]
    fn video_info_rejects_unreduced_fps() {
        let vi = VideoInfo {
            fps_num: 48,
            fps_den: 2,
            ..base_info()
        };
        assert!(!is_valid_video_info(&vi));
    }

    #[test]
    fn video_info_variable_rate_and_size() {
        let vi = VideoInfo {
            fps_num: 0,
            fps_den: 0,
            width: 0,
            height: 0,
            ..base_info()
        };
        assert!(is_valid_video_info(&vi));
    }

    #[test]
    fn video_info_rejects_half_set_dimensions() {
        let vi = VideoInfo {
            width: 640,
            height: 0,
            ..base_info()
        };
        assert!(!is_valid_video_info(&vi));
    }

    #[test]
    fn video_info_requires_frames() {
        let vi = VideoInfo {
            num_frames: 0,
            ..base_info()
        };
        assert!(!is_valid_video_info(&vi));
    }

    #[test]
    fn audio_info_frame_count_rounds_up() {
        let ai = AudioInfo {
            format: AudioFormat::query(SampleType::Integer, 16, 0b11).unwrap(),
            sample_rate: 48000,
            num_samples: AUDIO_FRAME_SAMPLES * 2 + 1,
        };
        assert!(is_valid_audio_info(&ai));
        assert_eq!(ai.num_frames(), 3);
    }
}
