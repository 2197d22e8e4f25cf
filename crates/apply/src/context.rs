use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Caller-supplied deadline and cancellation for one reconcile pass.
#[derive(Debug, Clone, Default)]
pub struct ApplyContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl ApplyContext {
    pub fn new() -> Self { Self::default() }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> { self.deadline }

    /// `Err(reason)` once the context is cancelled or past its deadline.
    pub fn check(&self) -> Result<(), &'static str> {
        if self.cancel.is_cancelled() {
            return Err("cancelled");
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err("deadline exceeded"),
            _ => Ok(()),
        }
    }
}
