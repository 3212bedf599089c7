use crate::error::AmiError;

/// Receives errors that occur on background tasks (batch flush failures,
/// malformed entries, bootstrap failures after retries are exhausted) and
/// that would otherwise have nowhere to surface since `Producer`/`Consumer`
/// drive their own tasks.
pub trait ErrorNotifier: Send + Sync {
    fn notify(&self, err: &AmiError);
}

/// Adapts any `Fn(&AmiError)` closure into an [`ErrorNotifier`].
pub struct ClosureNotifier<F>(F)
where
    F: Fn(&AmiError) + Send + Sync;

impl<F> ClosureNotifier<F>
where
    F: Fn(&AmiError) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ErrorNotifier for ClosureNotifier<F>
where
    F: Fn(&AmiError) + Send + Sync,
{
    fn notify(&self, err: &AmiError) {
        (self.0)(err)
    }
}

/// Logs via `tracing` and drops the error. Used when no notifier is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl ErrorNotifier for TracingNotifier {
    fn notify(&self, err: &AmiError) {
        tracing::error!(error = %err, "ami background task error");
    }
}
