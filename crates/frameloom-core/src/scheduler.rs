//! Worker pool driving filter evaluation.
//!
//! Workers pop runnable requests from a shared queue and invoke filters
//! through their activation phases. Suspension is not a blocked thread:
//! a filter that registers upstream requests and returns simply yields
//! the worker to the next runnable task. Threads block only inside
//! reserve/release regions, which temporarily grow the pool.

use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::context::{
    frame_key, ActivationReason, FrameContext, FrameDoneCallback, Notify, RequestContext,
    RequestTicket,
};
use crate::error::FilterError;
use crate::frame::Frame;
use crate::node::{FilterMode, NodeHandle};

thread_local! {
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Per-node scheduling discipline state.
#[derive(Default)]
struct NodeSched {
    /// Exclusive invocation in progress (unordered and linear nodes).
    busy: bool,
    /// `(frame, reason)` pairs currently executing (parallel-requests).
    pairs: HashSet<(i32, u8)>,
    /// The frame a linear node is committed to until it completes.
    serial_frame: Option<i32>,
    /// Queued tasks referencing this node; entry is dropped at zero.
    refs: usize,
}

impl NodeSched {
    fn idle(&self) -> bool {
        self.refs == 0 && !self.busy && self.pairs.is_empty() && self.serial_frame.is_none()
    }
}

struct PoolState {
    tasks: VecDeque<Arc<RequestContext>>,
    node_sched: HashMap<u64, NodeSched>,
    /// Workers currently alive.
    threads: usize,
    /// Target worker count, not counting reservations.
    max_threads: usize,
    /// Temporary workers added by `reserve_thread`.
    reserved: usize,
    /// Tasks currently being processed.
    active: usize,
    spawned: u64,
    next_req_order: u64,
    stop: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work: Condvar,
    done: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Fixed-size worker pool with transient reserved workers.
pub(crate) struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    pub(crate) fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let pool = Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    tasks: VecDeque::new(),
                    node_sched: HashMap::new(),
                    threads: 0,
                    max_threads: threads,
                    reserved: 0,
                    active: 0,
                    spawned: 0,
                    next_req_order: 0,
                    stop: false,
                }),
                work: Condvar::new(),
                done: Condvar::new(),
                handles: Mutex::new(Vec::new()),
            }),
        };
        {
            let mut state = pool.shared.state.lock();
            for _ in 0..threads {
                spawn_worker(&pool.shared, &mut state);
            }
        }
        pool
    }

    /// Submit a user request. Invalid frame numbers fail through the
    /// callback without entering the queue.
    pub(crate) fn start_user(
        &self,
        handle: NodeHandle,
        n: i32,
        lock_on_output: bool,
        done: FrameDoneCallback,
    ) -> RequestTicket {
        let req_order = {
            let mut state = self.shared.state.lock();
            let order = state.next_req_order;
            state.next_req_order += 1;
            order
        };
        let ctx = RequestContext::new_user(handle, n, req_order, lock_on_output, done);

        if n < 0 || n >= ctx.handle.num_frames() {
            complete(
                &self.shared,
                &ctx,
                Err(FilterError(format!(
                    "invalid frame number {n} requested from {}",
                    ctx.handle.name()
                ))),
            );
            return RequestTicket { ctx };
        }

        let mut state = self.shared.state.lock();
        enqueue(&mut state, Arc::clone(&ctx));
        self.shared.work.notify_one();
        RequestTicket { ctx }
    }

    /// Grow the pool by one temporary worker so the calling filter may
    /// block without starving the queue.
    pub(crate) fn reserve_thread(&self) {
        let mut state = self.shared.state.lock();
        state.reserved += 1;
        spawn_worker(&self.shared, &mut state);
    }

    /// Retire one worker added by [`reserve_thread`].
    pub(crate) fn release_thread(&self) {
        let mut state = self.shared.state.lock();
        if state.reserved > 0 {
            state.reserved -= 1;
        }
        self.shared.work.notify_all();
    }

    /// Block until the queue is empty and all workers are idle.
    pub(crate) fn wait_for_done(&self) {
        let mut state = self.shared.state.lock();
        while !(state.tasks.is_empty() && state.active == 0) {
            self.shared.done.wait(&mut state);
        }
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.shared.state.lock().max_threads
    }

    pub(crate) fn set_thread_count(&self, threads: usize) -> usize {
        let threads = threads.max(1);
        let mut state = self.shared.state.lock();
        state.max_threads = threads;
        while state.threads < state.max_threads + state.reserved {
            spawn_worker(&self.shared, &mut state);
        }
        self.shared.work.notify_all();
        state.max_threads
    }

    /// Whether the current thread belongs to this (or any) worker pool.
    pub(crate) fn is_worker_thread() -> bool {
        IS_WORKER.with(|w| w.get())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            self.shared.work.notify_all();
        }
        let handles = std::mem::take(&mut *self.shared.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn spawn_worker(shared: &Arc<PoolShared>, state: &mut PoolState) {
    state.threads += 1;
    state.spawned += 1;
    let name = format!("frameloom-worker-{}", state.spawned);
    let worker_shared = Arc::clone(shared);
    let builder = std::thread::Builder::new().name(name);
    match builder.spawn(move || worker_main(worker_shared)) {
        Ok(handle) => {
            // The handles lock nests inside the state lock, never the
            // other way around.
            shared_handles_push(handle, shared);
        }
        Err(e) => {
            state.threads -= 1;
            tracing::error!(error = %e, "failed to spawn worker thread");
        }
    }
}

fn shared_handles_push(handle: JoinHandle<()>, shared: &Arc<PoolShared>) {
    shared.handles.lock().push(handle);
}

fn worker_main(shared: Arc<PoolShared>) {
    IS_WORKER.with(|w| w.set(true));
    let mut state = shared.state.lock();
    loop {
        if state.stop {
            break;
        }
        // Retire surplus workers left behind by released reservations.
        if state.threads > state.max_threads + state.reserved {
            break;
        }

        match find_eligible(&state) {
            Some(index) => {
                let Some(ctx) = state.tasks.remove(index) else {
                    continue;
                };
                mark_running(&mut state, &ctx);
                state.active += 1;
                drop(state);

                process(&shared, &ctx);

                state = shared.state.lock();
                state.active -= 1;
                unmark_running(&mut state, &ctx);
                release_node_ref(&mut state, &ctx);
                if state.tasks.is_empty() && state.active == 0 {
                    shared.done.notify_all();
                }
                // Finishing may have made previously blocked tasks
                // runnable.
                shared.work.notify_all();
            }
            None => {
                shared.work.wait(&mut state);
            }
        }
    }
    state.threads -= 1;
    shared.done.notify_all();
}

/// Pick the oldest queued task whose node discipline admits it.
fn find_eligible(state: &PoolState) -> Option<usize> {
    // Smallest queued frame per linear node; only that frame may start.
    let mut linear_min: HashMap<u64, i32> = HashMap::new();
    for ctx in &state.tasks {
        let node = ctx.handle.node();
        if node.is_linear() {
            linear_min
                .entry(node.id)
                .and_modify(|m| *m = (*m).min(ctx.n))
                .or_insert(ctx.n);
        }
    }

    for (index, ctx) in state.tasks.iter().enumerate() {
        let node = ctx.handle.node();
        let sched = state.node_sched.get(&node.id);
        let busy = sched.map(|s| s.busy).unwrap_or(false);

        let eligible = if node.is_linear() {
            let serial = sched.and_then(|s| s.serial_frame);
            !busy
                && match serial {
                    // Committed to a frame: only its own continuation
                    // may run.
                    Some(frame) => frame == ctx.n,
                    None => linear_min.get(&node.id) == Some(&ctx.n),
                }
        } else {
            match node.mode() {
                FilterMode::Parallel => true,
                FilterMode::ParallelRequests => sched
                    .map(|s| !s.pairs.contains(&(ctx.n, ctx.reason().discriminant())))
                    .unwrap_or(true),
                FilterMode::Unordered | FilterMode::FrameState => !busy,
            }
        };

        if eligible {
            return Some(index);
        }
    }
    None
}

fn enqueue(state: &mut PoolState, ctx: Arc<RequestContext>) {
    let node = ctx.handle.node();
    state.node_sched.entry(node.id).or_default().refs += 1;
    state.tasks.push_back(ctx);
}

fn mark_running(state: &mut PoolState, ctx: &Arc<RequestContext>) {
    let node = ctx.handle.node();
    let Some(sched) = state.node_sched.get_mut(&node.id) else {
        return;
    };
    if node.is_linear() {
        sched.busy = true;
        if sched.serial_frame.is_none() {
            sched.serial_frame = Some(ctx.n);
        }
    } else {
        match node.mode() {
            FilterMode::Parallel => {}
            FilterMode::ParallelRequests => {
                sched.pairs.insert((ctx.n, ctx.reason().discriminant()));
            }
            FilterMode::Unordered | FilterMode::FrameState => sched.busy = true,
        }
    }
}

fn unmark_running(state: &mut PoolState, ctx: &Arc<RequestContext>) {
    let node = ctx.handle.node();
    let Some(sched) = state.node_sched.get_mut(&node.id) else {
        return;
    };
    if node.is_linear() {
        sched.busy = false;
    } else {
        match node.mode() {
            FilterMode::Parallel => {}
            FilterMode::ParallelRequests => {
                sched.pairs.remove(&(ctx.n, ctx.reason().discriminant()));
            }
            FilterMode::Unordered | FilterMode::FrameState => sched.busy = false,
        }
    }
}

fn release_node_ref(state: &mut PoolState, ctx: &Arc<RequestContext>) {
    let node_id = ctx.handle.node().id;
    if let Some(sched) = state.node_sched.get_mut(&node_id) {
        sched.refs = sched.refs.saturating_sub(1);
        if sched.idle() {
            state.node_sched.remove(&node_id);
        }
    }
}

/// Drive one activation of a request.
fn process(shared: &Arc<PoolShared>, ctx: &Arc<RequestContext>) {
    let reason = ctx.reason();

    // Cancelled requests are reported as errored instead of invoking the
    // filter; the error cleanup pass still runs.
    if ctx.is_cancelled() && reason != ActivationReason::Error {
        complete(shared, ctx, Err(FilterError("request cancelled".into())));
        return;
    }

    match reason {
        ActivationReason::Error => {
            let mut fctx = FrameContext::new(ctx, reason);
            let _ = ctx.handle.node().produce_frame(ctx.n, reason, &mut fctx);
            let msg = ctx
                .state
                .lock()
                .error
                .clone()
                .unwrap_or_else(|| "upstream request failed".to_string());
            complete(shared, ctx, Err(FilterError(msg)));
        }
        ActivationReason::Initial | ActivationReason::AllFramesReady => {
            let mut fctx = FrameContext::new(ctx, reason);
            let result = ctx.handle.node().produce_frame(ctx.n, reason, &mut fctx);
            let new_requests = std::mem::take(&mut fctx.new_requests);
            drop(fctx);

            match result {
                Err(e) => complete(shared, ctx, Err(e)),
                Ok(Some(frame)) => complete(shared, ctx, Ok(frame)),
                Ok(None) if !new_requests.is_empty() => {
                    register_requests(shared, ctx, new_requests);
                }
                Ok(None) => complete(
                    shared,
                    ctx,
                    Err(FilterError(format!(
                        "filter {} returned no frame and set no error",
                        ctx.handle.name()
                    ))),
                ),
            }
        }
    }
}

/// Turn requests registered during an activation into dependent
/// contexts and queue them.
fn register_requests(
    shared: &Arc<PoolShared>,
    ctx: &Arc<RequestContext>,
    requests: Vec<(NodeHandle, i32)>,
) {
    let mut children = Vec::with_capacity(requests.len());
    {
        let mut st = ctx.state.lock();
        st.pending += requests.len();
        for (handle, n) in requests {
            st.requested_keys.push(frame_key(&handle, n));
            children.push(RequestContext::new_dependent(handle, n, ctx));
        }
    }

    let mut state = shared.state.lock();
    for child in children {
        enqueue(&mut state, child);
    }
    shared.work.notify_all();
}

/// Finish a request: deliver the frame or error to the requester or
/// user callback, waking dependents whose last upstream settled.
fn complete(
    shared: &Arc<PoolShared>,
    ctx: &Arc<RequestContext>,
    result: Result<Frame, FilterError>,
) {
    let notifies = {
        let mut st = ctx.state.lock();
        if st.completed {
            return;
        }
        st.completed = true;
        if let Err(e) = &result {
            if st.error.is_none() {
                st.error = Some(e.0.clone());
            }
        }
        std::mem::take(&mut st.notify)
    };

    let mut callbacks: Vec<FrameDoneCallback> = Vec::new();
    {
        let mut state = shared.state.lock();

        // A completed linear frame releases the node for its successor.
        let node = ctx.handle.node();
        if node.is_linear() {
            if let Some(sched) = state.node_sched.get_mut(&node.id) {
                if sched.serial_frame == Some(ctx.n) {
                    sched.serial_frame = None;
                }
                if sched.idle() {
                    state.node_sched.remove(&node.id);
                }
            }
        }

        for notify in notifies {
            match notify {
                Notify::Requester(requester) => {
                    let settled = {
                        let mut rst = requester.state.lock();
                        match &result {
                            Ok(frame) => {
                                rst.available
                                    .insert(frame_key(&ctx.handle, ctx.n), frame.clone());
                            }
                            Err(e) => {
                                if rst.error.is_none() {
                                    rst.error = Some(e.0.clone());
                                }
                            }
                        }
                        rst.pending = rst.pending.saturating_sub(1);
                        if rst.pending == 0 {
                            Some(rst.error.is_some())
                        } else {
                            None
                        }
                    };
                    if let Some(has_error) = settled {
                        requester.set_reason(if has_error {
                            ActivationReason::Error
                        } else {
                            ActivationReason::AllFramesReady
                        });
                        enqueue(&mut state, requester);
                    }
                }
                Notify::Callback(cb) => callbacks.push(cb),
            }
        }
        shared.work.notify_all();
    }

    for cb in callbacks {
        let outcome = result.clone();
        if ctx.lock_on_output {
            let core = ctx.handle.node().core().clone();
            let _output = core.output_lock();
            cb(outcome, ctx.n, &ctx.handle);
        } else {
            cb(outcome, ctx.n, &ctx.handle);
        }
    }
}
