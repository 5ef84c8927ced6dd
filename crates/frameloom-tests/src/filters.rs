//! Shared test filters and helpers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use frameloom_core::{
    ActivationReason, AudioFormat, AudioInfo, ColorFamily, Core, CoreOptions, Filter, FilterError,
    FilterMode, Frame, FrameContext, NodeHandle, SampleType, VideoFormat, VideoInfo,
};

pub fn test_core(threads: usize) -> Core {
    Core::with_options(CoreOptions {
        threads: Some(threads),
        ..Default::default()
    })
}

pub fn yuv420p8() -> VideoFormat {
    VideoFormat::query(ColorFamily::Yuv, SampleType::Integer, 8, 1, 1).expect("valid format")
}

pub fn stereo16() -> AudioFormat {
    AudioFormat::query(SampleType::Integer, 16, 0b11).expect("valid format")
}

pub fn video_info(format: VideoFormat, width: i32, height: i32, num_frames: i32) -> VideoInfo {
    VideoInfo {
        format,
        fps_num: 24,
        fps_den: 1,
        width,
        height,
        num_frames,
    }
}

pub fn fill_video_frame(frame: &mut Frame, value: u8) {
    for plane in 0..frame.num_planes() {
        frame.plane_slice_mut(plane).fill(value);
    }
}

/// Source producing frames whose every byte is `base + n`.
pub struct ConstantVideo {
    pub format: VideoFormat,
    pub width: i32,
    pub height: i32,
    pub base: u8,
    /// Per-frame artificial delay, for scheduling tests.
    pub delay: Option<Box<dyn Fn(i32) -> Duration + Send + Sync>>,
}

impl ConstantVideo {
    pub fn node(core: &Core, width: i32, height: i32, num_frames: i32, base: u8) -> NodeHandle {
        let format = yuv420p8();
        let mut handles = core
            .create_video_filter(
                "ConstantVideo",
                vec![video_info(format, width, height, num_frames)],
                FilterMode::Parallel,
                0,
                Box::new(ConstantVideo {
                    format,
                    width,
                    height,
                    base,
                    delay: None,
                }),
            )
            .expect("filter creation");
        handles.remove(0)
    }
}

impl Filter for ConstantVideo {
    fn get_frame(
        &self,
        n: i32,
        _reason: ActivationReason,
        _ctx: &mut FrameContext<'_>,
        core: &Core,
    ) -> Result<Option<Frame>, FilterError> {
        if let Some(delay) = &self.delay {
            std::thread::sleep(delay(n));
        }
        let mut frame = core.new_video_frame(&self.format, self.width, self.height, None);
        fill_video_frame(&mut frame, self.base.wrapping_add(n as u8));
        Ok(Some(frame))
    }
}

/// Source that fails on one specific frame.
pub struct FailingSource {
    pub inner: ConstantVideo,
    pub fail_on: i32,
}

impl Filter for FailingSource {
    fn get_frame(
        &self,
        n: i32,
        reason: ActivationReason,
        ctx: &mut FrameContext<'_>,
        core: &Core,
    ) -> Result<Option<Frame>, FilterError> {
        if n == self.fail_on {
            return Err(FilterError(format!("deliberate failure on frame {n}")));
        }
        self.inner.get_frame(n, reason, ctx, core)
    }
}

/// Requests the same frame upstream and forwards it unchanged.
pub struct PassThrough {
    pub upstream: NodeHandle,
}

impl PassThrough {
    pub fn node(core: &Core, upstream: NodeHandle) -> NodeHandle {
        let vi = *upstream.video_info().expect("video upstream");
        let mut handles = core
            .create_video_filter(
                "PassThrough",
                vec![vi],
                FilterMode::Parallel,
                0,
                Box::new(PassThrough { upstream }),
            )
            .expect("filter creation");
        handles.remove(0)
    }
}

impl Filter for PassThrough {
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
                Ok(None)
            }
            ActivationReason::AllFramesReady => {
                let frame = ctx
                    .frame_filter(&self.upstream, n)
                    .ok_or_else(|| FilterError("upstream frame missing".into()))?;
                Ok(Some(frame))
            }
            ActivationReason::Error => Ok(None),
        }
    }
}

/// Records the maximum number of concurrently running invocations.
pub struct ConcurrencyProbe {
    pub inner: ConstantVideo,
    pub running: Arc<AtomicUsize>,
    pub max_seen: Arc<AtomicUsize>,
}

impl Filter for ConcurrencyProbe {
    fn get_frame(
        &self,
        n: i32,
        reason: ActivationReason,
        ctx: &mut FrameContext<'_>,
        core: &Core,
    ) -> Result<Option<Frame>, FilterError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        let result = self.inner.get_frame(n, reason, ctx, core);
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Constant silence with a fixed total sample count.
pub struct ConstantAudio {
    pub format: AudioFormat,
    pub num_samples: i64,
}

impl ConstantAudio {
    pub fn node(core: &Core, num_samples: i64) -> NodeHandle {
        let format = stereo16();
        let mut handles = core
            .create_audio_filter(
                "ConstantAudio",
                vec![AudioInfo {
                    format,
                    sample_rate: 48_000,
                    num_samples,
                }],
                FilterMode::Parallel,
                0,
                Box::new(ConstantAudio {
                    format,
                    num_samples,
                }),
            )
            .expect("filter creation");
        handles.remove(0)
    }
}

impl Filter for ConstantAudio {
    fn get_frame(
        &self,
        n: i32,
        _reason: ActivationReason,
        _ctx: &mut FrameContext<'_>,
        core: &Core,
    ) -> Result<Option<Frame>, FilterError> {
        use frameloom_core::AUDIO_FRAME_SAMPLES;
        let total_frames = ((self.num_samples + AUDIO_FRAME_SAMPLES - 1) / AUDIO_FRAME_SAMPLES) as i32;
        let tail = self.num_samples % AUDIO_FRAME_SAMPLES;
        let samples = if n < total_frames - 1 || tail == 0 {
            AUDIO_FRAME_SAMPLES
        } else {
            tail
        };
        let mut frame = core.new_audio_frame(&self.format, samples as i32, None);
        for channel in 0..frame.num_planes() {
            frame.plane_slice_mut(channel).fill(0);
        }
        Ok(Some(frame))
    }
}
