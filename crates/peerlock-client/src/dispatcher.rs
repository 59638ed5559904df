//! Completion delivery for asynchronous operations.
//!
//! Every submitted operation runs on its own task and reports through its
//! callback exactly once, from that task, as soon as it finishes. Callbacks
//! of independent operations therefore fire in completion order, not in
//! submission order.

use std::future::Future;

use peerlock_core::{CallbackOutcome, EngineError};
use tokio::task::JoinHandle;

/// What a callback receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion<T> {
    /// Success or failure
    pub outcome: CallbackOutcome,
    /// Diagnostic text; empty on success
    pub message: String,
    /// Operation result, present exactly on success
    pub value: Option<T>,
}

impl<T> Completion<T> {
    fn success(value: T) -> Self {
        Self { outcome: CallbackOutcome::Success, message: String::new(), value: Some(value) }
    }

    fn failure(message: String) -> Self {
        Self { outcome: CallbackOutcome::Fail, message, value: None }
    }

    /// True on `CallbackOutcome::Success`.
    pub fn is_success(&self) -> bool {
        self.outcome == CallbackOutcome::Success
    }
}

/// Run `operation` on a new task and hand its result to `callback`.
///
/// The callback runs exactly once: with the operation's value, with its
/// error, or with a failure if the operation task panicked or was cancelled
/// by runtime shutdown. Must be called from within a Tokio runtime.
pub fn dispatch<T, F, C>(operation: F, callback: C) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Future<Output = Result<T, EngineError>> + Send + 'static,
    C: FnOnce(Completion<T>) + Send + 'static,
{
    tokio::spawn(async move {
        let completion = match tokio::spawn(operation).await {
            Ok(Ok(value)) => Completion::success(value),
            Ok(Err(err)) => {
                tracing::debug!("operation failed: {}", err);
                Completion::failure(err.outcome_message())
            },
            Err(join_error) => {
                tracing::error!("operation task aborted: {}", join_error);
                Completion::failure(format!("operation aborted: {join_error}"))
            },
        };
        callback(completion);
    })
}
