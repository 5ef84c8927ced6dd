//! Frameloom Core - runtime of a lazy frame-server
//!
//! A directed acyclic graph of filter nodes produces video and audio
//! frames on demand. This crate provides:
//! - The frame-request scheduler and worker pool (per-filter concurrency
//!   modes, re-entrancy control, ordered outputs, thread reservation)
//! - Copy-on-write frames backed by a budgeted, size-bucketed buffer pool
//! - Filter nodes, request contexts and error propagation
//! - The plugin argument protocol with legacy-generation bridging
//! - Ordered property maps with typed value arrays

pub mod context;
pub mod core;
pub mod error;
pub mod format;
pub mod frame;
pub mod log;
pub mod node;
pub mod plugin;
pub mod pool;
pub mod props;

mod scheduler;

pub use context::{ActivationReason, FrameContext, RequestTicket};
pub use self::core::{Core, CoreInfo, CoreOptions, VERSION};
pub use error::{CoreError, FilterError, PropError, Result};
pub use format::{
    is_legacy_format_id, video_format_id, AudioFormat, ColorFamily, FormatRegistry,
    LegacyColorFamily, LegacyVideoFormat, SampleType, VideoFormat, AUDIO_FRAME_SAMPLES,
};
pub use frame::{Frame, MediaType, GUARD_PATTERN, GUARD_SPACE};
pub use log::{MessageHandlerId, MessageSeverity};
pub use node::{
    flags, is_valid_audio_info, is_valid_video_info, AudioInfo, Filter, FilterMode, NodeHandle,
    VideoInfo,
};
pub use plugin::{
    emit_signature, is_valid_identifier, parse_signature, ApiGeneration, FilterArgument, FuncRef,
    Plugin, PluginFunction, PublicFunction,
};
pub use pool::{alignment, MemoryPool};
pub use props::{AppendMode, DataHint, DataItem, PropType, PropertyMap, Value};
