//! Per-request state carried through the scheduler.
//!
//! A request context exists from submission until its callback fires or
//! its requester is resumed. The requester link is non-owning in spirit:
//! the scheduler owns the context until completion and uses the link
//! only to deliver the finished frame.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::FilterError;
use crate::frame::Frame;
use crate::node::NodeHandle;

/// Phase in which a filter's frame callback is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationReason {
    /// First entry for this request.
    Initial,
    /// All previously requested upstream frames are available.
    AllFramesReady,
    /// One or more upstream requests failed; clean up only.
    Error,
}

impl ActivationReason {
    pub(crate) fn discriminant(self) -> u8 {
        match self {
            Self::Initial => 0,
            Self::AllFramesReady => 1,
            Self::Error => 2,
        }
    }

    fn from_discriminant(value: u8) -> Self {
        match value {
            0 => Self::Initial,
            1 => Self::AllFramesReady,
            _ => Self::Error,
        }
    }
}

/// Callback invoked when a user-submitted request completes.
pub type FrameDoneCallback = Box<dyn FnOnce(Result<Frame, FilterError>, i32, &NodeHandle) + Send>;

/// Identifies one produced frame: node, output index, frame number.
pub(crate) type FrameKey = (u64, usize, i32);

pub(crate) fn frame_key(handle: &NodeHandle, n: i32) -> FrameKey {
    (handle.node().id, handle.output_index(), n)
}

/// Who to resume when a context completes.
pub(crate) enum Notify {
    /// The requesting downstream context.
    Requester(Arc<RequestContext>),
    /// A user callback, serialized through the output lock on request.
    Callback(FrameDoneCallback),
}

pub(crate) struct CtxState {
    /// Upstream requests still outstanding.
    pub pending: usize,
    /// Frames delivered by completed upstream requests.
    pub available: HashMap<FrameKey, Frame>,
    /// Keys requested during past activations (deduplication).
    pub requested_keys: Vec<FrameKey>,
    /// Sticky first error.
    pub error: Option<String>,
    /// Completion list.
    pub notify: Vec<Notify>,
    pub completed: bool,
}

/// One outstanding frame request.
pub(crate) struct RequestContext {
    pub(crate) handle: NodeHandle,
    pub(crate) n: i32,
    /// Submission-order sequence number, inherited by upstream requests.
    pub(crate) req_order: u64,
    pub(crate) lock_on_output: bool,
    reason: AtomicU8,
    cancelled: AtomicBool,
    pub(crate) state: Mutex<CtxState>,
}

impl RequestContext {
    /// Context for a user-submitted request.
    pub(crate) fn new_user(
        handle: NodeHandle,
        n: i32,
        req_order: u64,
        lock_on_output: bool,
        done: FrameDoneCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            n,
            req_order,
            lock_on_output,
            reason: AtomicU8::new(ActivationReason::Initial.discriminant()),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(CtxState {
                pending: 0,
                available: HashMap::new(),
                requested_keys: Vec::new(),
                error: None,
                notify: vec![Notify::Callback(done)],
                completed: false,
            }),
        })
    }

    /// Context for an upstream request registered by a filter; inherits
    /// the requester's ordering position.
    pub(crate) fn new_dependent(handle: NodeHandle, n: i32, requester: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            handle,
            n,
            req_order: requester.req_order,
            lock_on_output: true,
            reason: AtomicU8::new(ActivationReason::Initial.discriminant()),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(CtxState {
                pending: 0,
                available: HashMap::new(),
                requested_keys: Vec::new(),
                error: None,
                notify: vec![Notify::Requester(Arc::clone(requester))],
                completed: false,
            }),
        })
    }

    pub(crate) fn reason(&self) -> ActivationReason {
        ActivationReason::from_discriminant(self.reason.load(Ordering::Acquire))
    }

    pub(crate) fn set_reason(&self, reason: ActivationReason) {
        self.reason.store(reason.discriminant(), Ordering::Release);
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// The surface a filter sees while its frame callback runs.
pub struct FrameContext<'a> {
    pub(crate) ctx: &'a RequestContext,
    /// Requests registered during this activation, drained by the
    /// scheduler after the callback returns.
    pub(crate) new_requests: Vec<(NodeHandle, i32)>,
    reason: ActivationReason,
}

impl<'a> FrameContext<'a> {
    pub(crate) fn new(ctx: &'a RequestContext, reason: ActivationReason) -> Self {
        Self {
            ctx,
            new_requests: Vec::new(),
            reason,
        }
    }

    /// Frame number of the request being served.
    pub fn frame_number(&self) -> i32 {
        self.ctx.n
    }

    /// Output index of the request being served.
    pub fn output_index(&self) -> usize {
        self.ctx.handle.output_index()
    }

    /// Activation reason of the current invocation.
    pub fn reason(&self) -> ActivationReason {
        self.reason
    }

    /// Register an upstream frame request. The frame number is clamped
    /// to the upstream output's valid range. Duplicate requests for a
    /// frame that is already requested or available are ignored.
    pub fn request_frame_filter(&mut self, node: &NodeHandle, n: i32) {
        let last = node.num_frames() - 1;
        let n = n.clamp(0, last.max(0));
        let key = frame_key(node, n);

        {
            let state = self.ctx.state.lock();
            if state.available.contains_key(&key) || state.requested_keys.contains(&key) {
                return;
            }
        }
        if self
            .new_requests
            .iter()
            .any(|(handle, m)| frame_key(handle, *m) == key)
        {
            return;
        }
        self.new_requests.push((node.clone(), n));
    }

    /// Fetch a previously requested upstream frame. Available from the
    /// `AllFramesReady` activation onwards.
    pub fn frame_filter(&self, node: &NodeHandle, n: i32) -> Option<Frame> {
        let last = node.num_frames() - 1;
        let n = n.clamp(0, last.max(0));
        self.ctx
            .state
            .lock()
            .available
            .get(&frame_key(node, n))
            .cloned()
    }

    /// The upstream error text during an `Error` activation.
    pub fn error(&self) -> Option<String> {
        self.ctx.state.lock().error.clone()
    }
}

/// Cancels a user-submitted request when asked.
///
/// Cancellation is cooperative: it is observed at activation-reason
/// boundaries, the request completes as errored, and any in-flight
/// upstream work finishes with its result discarded.
pub struct RequestTicket {
    pub(crate) ctx: Arc<RequestContext>,
}

impl RequestTicket {
    pub fn cancel(&self) {
        self.ctx.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_discriminant_round_trip() {
        for reason in [
            ActivationReason::Initial,
            ActivationReason::AllFramesReady,
            ActivationReason::Error,
        ] {
            assert_eq!(
                ActivationReason::from_discriminant(reason.discriminant()),
                reason
            );
        }
    }
}
