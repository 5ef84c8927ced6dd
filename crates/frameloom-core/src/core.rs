//! The core: lifetime owner of the pool, scheduler, plugin registry and
//! format table, plus the diagnostic log sink.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::context::{FrameDoneCallback, RequestTicket};
use crate::error::{CoreError, FilterError, Result};
use crate::format::{
    is_legacy_format_id, AudioFormat, ColorFamily, FormatRegistry, LegacyColorFamily,
    LegacyVideoFormat, SampleType, VideoFormat,
};
use crate::frame::Frame;
use crate::log::{forward_to_tracing, MessageHandler, MessageHandlerId, MessageSeverity};
use crate::node::{AudioInfo, Filter, FilterMode, Node, NodeHandle, VideoInfo};
use crate::plugin::{ApiGeneration, Plugin};
use crate::pool::MemoryPool;
use crate::scheduler::ThreadPool;

/// Version string reported by [`Core::info`].
pub const VERSION: &str = concat!("Frameloom ", env!("CARGO_PKG_VERSION"));

/// Tunables applied when a core is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreOptions {
    /// Worker thread count; defaults to the hardware concurrency.
    pub threads: Option<usize>,
    /// Framebuffer byte budget; defaults to 4 GiB (1 GiB on 32-bit).
    pub max_memory_bytes: Option<i64>,
    /// Surround every plane with guard bands verified after each filter
    /// invocation.
    pub frame_guards: bool,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            threads: None,
            max_memory_bytes: None,
            frame_guards: true,
        }
    }
}

/// Snapshot of the core's runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreInfo {
    pub version: String,
    pub num_threads: usize,
    pub max_framebuffer_size: usize,
    pub used_framebuffer_size: usize,
}

pub(crate) struct CoreInner {
    pool: Arc<MemoryPool>,
    scheduler: ThreadPool,
    formats: FormatRegistry,
    plugins: Mutex<BTreeMap<String, Arc<Plugin>>>,
    handlers: Mutex<Vec<(u64, MessageHandler)>>,
    next_handler_id: Mutex<u64>,
    filter_instances: AtomicUsize,
    function_instances: AtomicUsize,
    core_freed: AtomicBool,
    output_lock: Mutex<()>,
    frame_guards: bool,
}

/// Handle to a frame-server core. Cloning is cheap; the underlying core
/// lives until the last handle, node and in-flight request are gone.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    pub fn new() -> Self {
        Self::with_options(CoreOptions::default())
    }

    pub fn with_options(options: CoreOptions) -> Self {
        let threads = options.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

        let pool = MemoryPool::new();
        if let Some(limit) = options.max_memory_bytes {
            pool.set_limit(limit);
        }

        Self {
            inner: Arc::new(CoreInner {
                pool,
                scheduler: ThreadPool::new(threads),
                formats: FormatRegistry::new(),
                plugins: Mutex::new(BTreeMap::new()),
                handlers: Mutex::new(Vec::new()),
                next_handler_id: Mutex::new(0),
                filter_instances: AtomicUsize::new(0),
                function_instances: AtomicUsize::new(0),
                core_freed: AtomicBool::new(false),
                output_lock: Mutex::new(()),
                frame_guards: options.frame_guards,
            }),
        }
    }

    // ── Diagnostics ────────────────────────────────────────────

    /// Dispatch a message to every registered handler (under the log
    /// lock, so handlers see a consistent stream) and into `tracing`.
    /// Fatal severity terminates evaluation after the handlers ran.
    pub fn log_message(&self, severity: MessageSeverity, msg: &str) {
        {
            let handlers = self.inner.handlers.lock();
            for (_, handler) in handlers.iter() {
                handler(severity, msg);
            }
            forward_to_tracing(severity, msg);
        }
        if severity == MessageSeverity::Fatal {
            crate::log::fatal(msg);
        }
    }

    pub(crate) fn log_fatal(&self, msg: &str) -> ! {
        self.log_message(MessageSeverity::Fatal, msg);
        unreachable!("fatal messages do not return");
    }

    pub fn add_message_handler(
        &self,
        handler: impl Fn(MessageSeverity, &str) + Send + Sync + 'static,
    ) -> MessageHandlerId {
        let mut next = self.inner.next_handler_id.lock();
        let id = *next;
        *next += 1;
        self.inner.handlers.lock().push((id, Box::new(handler)));
        MessageHandlerId(id)
    }

    pub fn remove_message_handler(&self, id: MessageHandlerId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id.0);
        handlers.len() != before
    }

    // ── Memory ─────────────────────────────────────────────────

    pub fn memory_in_use(&self) -> usize {
        self.inner.pool.in_use()
    }

    pub fn memory_limit(&self) -> usize {
        self.inner.pool.limit()
    }

    pub fn set_memory_limit(&self, bytes: i64) -> usize {
        self.inner.pool.set_limit(bytes)
    }

    pub(crate) fn pool(&self) -> &Arc<MemoryPool> {
        &self.inner.pool
    }

    pub(crate) fn frame_guards(&self) -> bool {
        self.inner.frame_guards
    }

    // ── Threads ────────────────────────────────────────────────

    pub fn thread_count(&self) -> usize {
        self.inner.scheduler.thread_count()
    }

    pub fn set_thread_count(&self, threads: usize) -> usize {
        self.inner.scheduler.set_thread_count(threads)
    }

    /// Grow the worker pool by one before the calling filter blocks.
    pub fn reserve_thread(&self) {
        self.inner.scheduler.reserve_thread();
    }

    /// Retire the temporary worker added by [`reserve_thread`].
    pub fn release_thread(&self) {
        self.inner.scheduler.release_thread();
    }

    /// Whether the current thread is a scheduler worker.
    pub fn is_worker_thread(&self) -> bool {
        ThreadPool::is_worker_thread()
    }

    // ── Formats ────────────────────────────────────────────────

    pub fn query_video_format(
        &self,
        color_family: ColorFamily,
        sample_type: SampleType,
        bits_per_sample: i32,
        sub_sampling_w: i32,
        sub_sampling_h: i32,
    ) -> Option<VideoFormat> {
        VideoFormat::query(
            color_family,
            sample_type,
            bits_per_sample,
            sub_sampling_w,
            sub_sampling_h,
        )
    }

    /// Resolve a packed or legacy format ID.
    pub fn query_video_format_by_id(&self, id: u32) -> Option<VideoFormat> {
        if is_legacy_format_id(id) {
            self.inner.formats.by_id(id as i32)?.to_current()
        } else {
            let color_family = ColorFamily::from_code((id >> 28) & 0xF)?;
            let sample_type = SampleType::from_code((id >> 24) & 0xF)?;
            VideoFormat::query(
                color_family,
                sample_type,
                ((id >> 16) & 0xFF) as i32,
                ((id >> 8) & 0xFF) as i32,
                (id & 0xFF) as i32,
            )
        }
    }

    pub fn query_audio_format(
        &self,
        sample_type: SampleType,
        bits_per_sample: i32,
        channel_layout: u64,
    ) -> Option<AudioFormat> {
        AudioFormat::query(sample_type, bits_per_sample, channel_layout)
    }

    /// Look up or register a named legacy format.
    pub fn query_legacy_video_format(
        &self,
        color_family: LegacyColorFamily,
        sample_type: SampleType,
        bits_per_sample: i32,
        sub_sampling_w: i32,
        sub_sampling_h: i32,
    ) -> Option<LegacyVideoFormat> {
        self.inner.formats.query(
            color_family,
            sample_type,
            bits_per_sample,
            sub_sampling_w,
            sub_sampling_h,
            None,
            None,
        )
    }

    pub fn legacy_format_by_id(&self, id: i32) -> Option<LegacyVideoFormat> {
        self.inner.formats.by_id(id)
    }

    /// Translate a current-generation format into its legacy
    /// registration, registering one on demand. Compat families map to
    /// their fixed presets.
    pub fn legacy_video_format_from(&self, format: &VideoFormat) -> Option<LegacyVideoFormat> {
        use crate::format::preset;
        match format.color_family {
            ColorFamily::CompatBgr32 => self.inner.formats.by_id(preset::COMPAT_BGR32),
            ColorFamily::CompatYuy2 => self.inner.formats.by_id(preset::COMPAT_YUY2),
            family => self.inner.formats.query(
                LegacyColorFamily::from_current(family)?,
                format.sample_type,
                format.bits_per_sample,
                format.sub_sampling_w,
                format.sub_sampling_h,
                None,
                None,
            ),
        }
    }

    // ── Frames ─────────────────────────────────────────────────

    pub fn new_video_frame(
        &self,
        format: &VideoFormat,
        width: i32,
        height: i32,
        prop_src: Option<&Frame>,
    ) -> Frame {
        Frame::new_video(self, format, width, height, prop_src)
    }

    /// Create a video frame sharing planes from existing frames where a
    /// source is given and allocating fresh planes elsewhere.
    pub fn new_video_frame_from_planes(
        &self,
        format: &VideoFormat,
        width: i32,
        height: i32,
        sources: &[Option<(&Frame, usize)>],
        prop_src: Option<&Frame>,
    ) -> Frame {
        Frame::new_video_from_planes(self, format, width, height, sources, prop_src)
    }

    pub fn new_audio_frame(
        &self,
        format: &AudioFormat,
        num_samples: i32,
        prop_src: Option<&Frame>,
    ) -> Frame {
        Frame::new_audio(self, format, num_samples, prop_src)
    }

    /// Share all planes of `src` into a new frame.
    pub fn copy_frame(&self, src: &Frame) -> Frame {
        src.clone()
    }

    // ── Filters and requests ───────────────────────────────────

    /// Create a video filter node; returns one handle per output.
    pub fn create_video_filter(
        &self,
        name: &str,
        vi: Vec<VideoInfo>,
        mode: FilterMode,
        flags: u32,
        filter: Box<dyn Filter>,
    ) -> Result<Vec<NodeHandle>> {
        let node = Node::new_video(self, name, vi, mode, flags, filter)?;
        Ok((0..node.num_outputs())
            .map(|i| NodeHandle::new(Arc::clone(&node), i))
            .collect())
    }

    /// Create an audio filter node; returns one handle per output.
    pub fn create_audio_filter(
        &self,
        name: &str,
        ai: Vec<AudioInfo>,
        mode: FilterMode,
        flags: u32,
        filter: Box<dyn Filter>,
    ) -> Result<Vec<NodeHandle>> {
        let node = Node::new_audio(self, name, ai, mode, flags, filter)?;
        Ok((0..node.num_outputs())
            .map(|i| NodeHandle::new(Arc::clone(&node), i))
            .collect())
    }

    /// Submit an asynchronous frame request. The callback receives the
    /// frame or the propagated error; with `lock_on_output` callbacks
    /// are serialized through the core's output lock.
    pub fn request_frame(
        &self,
        node: &NodeHandle,
        n: i32,
        lock_on_output: bool,
        done: impl FnOnce(std::result::Result<Frame, FilterError>, i32, &NodeHandle) + Send + 'static,
    ) -> RequestTicket {
        let callback: FrameDoneCallback = Box::new(done);
        self.inner
            .scheduler
            .start_user(node.clone(), n, lock_on_output, callback)
    }

    /// Fetch one frame synchronously. Must not be called from a filter
    /// running on a worker thread; request upstream frames through the
    /// frame context instead.
    pub fn get_frame(&self, node: &NodeHandle, n: i32) -> std::result::Result<Frame, FilterError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let _ticket = self.request_frame(node, n, false, move |result, _n, _node| {
            let _ = tx.send(result);
        });
        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(FilterError("request dropped without completing".into())),
        }
    }

    pub(crate) fn output_lock(&self) -> MutexGuard<'_, ()> {
        self.inner.output_lock.lock()
    }

    // ── Plugins ────────────────────────────────────────────────

    /// Register a plugin. The `init` closure registers the plugin's
    /// functions; it runs before the registry lock is taken, so plugin
    /// initialization may itself register further plugins.
    pub fn register_plugin(
        &self,
        id: &str,
        namespace: &str,
        fullname: &str,
        version: i32,
        api: ApiGeneration,
        read_only: bool,
        init: impl FnOnce(&Plugin, &Core),
    ) -> Result<Arc<Plugin>> {
        let plugin = Arc::new(Plugin::new(id, namespace, fullname, version, api));
        init(&plugin, self);
        if read_only {
            plugin.lock_registration();
        }

        let mut plugins = self.inner.plugins.lock();
        if plugins.contains_key(id) {
            return Err(CoreError::Plugin(format!("plugin {id} already loaded")));
        }
        if plugins.values().any(|p| p.namespace() == namespace) {
            return Err(CoreError::Plugin(format!(
                "plugin load of {id} failed, namespace {namespace} already populated"
            )));
        }
        plugins.insert(id.to_string(), Arc::clone(&plugin));
        Ok(plugin)
    }

    pub fn plugin_by_id(&self, id: &str) -> Option<Arc<Plugin>> {
        self.inner.plugins.lock().get(id).cloned()
    }

    pub fn plugin_by_namespace(&self, namespace: &str) -> Option<Arc<Plugin>> {
        self.inner
            .plugins
            .lock()
            .values()
            .find(|p| p.namespace() == namespace)
            .cloned()
    }

    /// `namespace;id;fullname` description of every loaded plugin.
    pub fn plugins(&self) -> Vec<String> {
        self.inner
            .plugins
            .lock()
            .values()
            .map(|p| format!("{};{};{}", p.namespace(), p.id(), p.fullname()))
            .collect()
    }

    /// Invoke a plugin function; errors come back on the returned map.
    pub fn invoke(
        &self,
        plugin: &Plugin,
        func_name: &str,
        args: &crate::props::PropertyMap,
    ) -> crate::props::PropertyMap {
        plugin.invoke(self, func_name, args)
    }

    // ── Lifetime ───────────────────────────────────────────────

    pub(crate) fn filter_instance_created(&self) {
        self.inner.filter_instances.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn filter_instance_destroyed(&self) {
        self.inner.filter_instances.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn function_instance_created(&self) {
        self.inner.function_instances.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn function_instance_destroyed(&self) {
        self.inner.function_instances.fetch_sub(1, Ordering::Relaxed);
    }

    /// Live filter instance count (diagnostics).
    pub fn filter_instance_count(&self) -> usize {
        self.inner.filter_instances.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> CoreInfo {
        CoreInfo {
            version: VERSION.to_string(),
            num_threads: self.thread_count(),
            max_framebuffer_size: self.memory_limit(),
            used_framebuffer_size: self.memory_in_use(),
        }
    }

    /// Tear down this handle: drain the scheduler and warn about
    /// anything still alive. Nodes and frames keep the underlying core
    /// and pool alive until they are gone themselves.
    pub fn free(self) {
        if self.inner.core_freed.swap(true, Ordering::SeqCst) {
            self.log_fatal("double free of core");
        }
        self.inner.scheduler.wait_for_done();

        let filters = self.inner.filter_instances.load(Ordering::Relaxed);
        if filters > 0 {
            self.log_message(
                MessageSeverity::Warning,
                &format!("core freed but {filters} filter instance(s) still exist"),
            );
        }
        let bytes = self.inner.pool.in_use();
        if bytes > 0 {
            self.log_message(
                MessageSeverity::Warning,
                &format!("core freed but {bytes} bytes still allocated in framebuffers"),
            );
        }
        let functions = self.inner.function_instances.load(Ordering::Relaxed);
        if functions > 0 {
            self.log_message(
                MessageSeverity::Warning,
                &format!("core freed but {functions} function instance(s) still exist"),
            );
        }
    }
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_info_reports_threads_and_memory() {
        let core = Core::with_options(CoreOptions {
            threads: Some(2),
            max_memory_bytes: Some(64 * 1024 * 1024),
            frame_guards: true,
        });
        let info = core.info();
        assert_eq!(info.num_threads, 2);
        assert_eq!(info.max_framebuffer_size, 64 * 1024 * 1024);
        assert_eq!(info.used_framebuffer_size, 0);
        assert!(info.version.starts_with("Frameloom"));
        core.free();
    }

    #[test]
    fn message_handlers_receive_and_unregister() {
        use std::sync::atomic::AtomicUsize;

        let core = Core::with_options(CoreOptions {
            threads: Some(1),
            ..Default::default()
        });
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let id = core.add_message_handler(move |severity, _msg| {
            if severity == MessageSeverity::Warning {
                seen2.fetch_add(1, Ordering::Relaxed);
            }
        });

        core.log_message(MessageSeverity::Warning, "one");
        core.log_message(MessageSeverity::Information, "two");
        assert_eq!(seen.load(Ordering::Relaxed), 1);

        assert!(core.remove_message_handler(id));
        assert!(!core.remove_message_handler(id));
        core.log_message(MessageSeverity::Warning, "three");
        assert_eq!(seen.load(Ordering::Relaxed), 1);
        core.free();
    }

    #[test]
    fn plugin_registry_enforces_uniqueness() {
        let core = Core::with_options(CoreOptions {
            threads: Some(1),
            ..Default::default()
        });
        core.register_plugin(
            "com.frameloom.std",
            "std",
            "Core functions",
            1,
            ApiGeneration::Current,
            true,
            |_, _| {},
        )
        .expect("first registration");

        let dup_id = core.register_plugin(
            "com.frameloom.std",
            "std2",
            "Duplicate id",
            1,
            ApiGeneration::Current,
            true,
            |_, _| {},
        );
        assert!(dup_id.is_err());

        let dup_ns = core.register_plugin(
            "com.frameloom.other",
            "std",
            "Duplicate namespace",
            1,
            ApiGeneration::Current,
            true,
            |_, _| {},
        );
        assert!(dup_ns.is_err());

        assert!(core.plugin_by_id("com.frameloom.std").is_some());
        assert!(core.plugin_by_namespace("std").is_some());
        assert_eq!(core.plugins().len(), 1);
        core.free();
    }

    #[test]
    fn format_id_resolution() {
        let core = Core::with_options(CoreOptions {
            threads: Some(1),
            ..Default::default()
        });
        let f = core
            .query_video_format(ColorFamily::Yuv, SampleType::Integer, 8, 1, 1)
            .unwrap();
        assert_eq!(core.query_video_format_by_id(f.id()), Some(f));

        // Legacy preset IDs resolve through the registry.
        let legacy = core
            .query_video_format_by_id(crate::format::preset::YUV420P8 as u32)
            .unwrap();
        assert_eq!(legacy, f);
        core.free();
    }
}
