//! Message severities and the fatal-error path.
//!
//! Core diagnostics flow through registered message handlers and are
//! mirrored into `tracing`. Fatal messages indicate memory corruption or
//! API misuse where continuing would be unsafe.

use serde::{Deserialize, Serialize};

/// Severity of a core diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageSeverity {
    Debug,
    Information,
    Warning,
    Critical,
    /// Terminates evaluation after handlers have been notified.
    Fatal,
}

/// Callback invoked for every core diagnostic message.
pub type MessageHandler = Box<dyn Fn(MessageSeverity, &str) + Send + Sync>;

/// Opaque handle identifying a registered message handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandlerId(pub(crate) u64);

/// Forward a message into the `tracing` ecosystem.
pub(crate) fn forward_to_tracing(severity: MessageSeverity, msg: &str) {
    match severity {
        MessageSeverity::Debug => tracing::debug!("{msg}"),
        MessageSeverity::Information => tracing::info!("{msg}"),
        MessageSeverity::Warning => tracing::warn!("{msg}"),
        MessageSeverity::Critical | MessageSeverity::Fatal => tracing::error!("{msg}"),
    }
}

/// Abort evaluation over a structural invariant violation. Used directly
/// by code that has no core handle; `Core::log_message` routes fatal
/// messages here after notifying handlers.
pub(crate) fn fatal(msg: &str) -> ! {
    tracing::error!("{msg}");
    panic!("{}", msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_are_ordered() {
        assert!(MessageSeverity::Debug < MessageSeverity::Information);
        assert!(MessageSeverity::Critical < MessageSeverity::Fatal);
    }

    #[test]
    #[should_panic(expected = "bad state")]
    fn fatal_panics() {
        fatal("bad state");
    }
}
