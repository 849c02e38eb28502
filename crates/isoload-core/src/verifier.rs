//! Unload verification.
//!
//! An [`UnloadTicket`] is a weak observation handle on a context. The
//! [`UnloadVerifier`] polls it with a bounded budget, pausing between attempts
//! so asynchronous teardown can drop its leases, and reports either
//! [`UnloadOutcome::Unloaded`] or [`UnloadOutcome::Stuck`]. Stuck is terminal
//! and non-fatal: the context stays resident and is never retried.

use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::config::{UnloadConfig, defaults};
use crate::context::{ContextInner, ContextState, IsolatedContext};

/// Whether a context is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Released,
}

/// Result of an unload verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// Released after `attempts` waits (0 when already released)
    Unloaded { attempts: u32 },
    /// Budget exhausted with `outstanding` strong handles remaining
    Stuck { outstanding: usize },
}

impl UnloadOutcome {
    pub fn is_unloaded(&self) -> bool {
        matches!(self, UnloadOutcome::Unloaded { .. })
    }
}

impl Display for UnloadOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            UnloadOutcome::Unloaded { attempts } => {
                write!(f, "unloaded after {} attempts", attempts)
            }
            UnloadOutcome::Stuck { outstanding } => {
                write!(f, "stuck with {} outstanding handle(s)", outstanding)
            }
        }
    }
}

/// Non-owning observation handle on one context.
pub struct UnloadTicket {
    context: String,
    inner: Weak<ContextInner>,
}

impl UnloadTicket {
    pub(crate) fn new(inner: &Arc<ContextInner>) -> Self {
        Self {
            context: inner.name().to_string(),
            inner: Arc::downgrade(inner),
        }
    }

    /// Name of the observed context.
    pub fn context_name(&self) -> &str {
        &self.context
    }

    pub fn poll(&self) -> Liveness {
        if self.inner.strong_count() == 0 {
            Liveness::Released
        } else {
            Liveness::Alive
        }
    }

    /// Strong handles still keeping the context alive.
    pub fn outstanding(&self) -> usize {
        self.inner.strong_count()
    }

    pub(crate) fn mark_stuck(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.set_state(ContextState::Stuck);
        }
    }
}

impl std::fmt::Debug for UnloadTicket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnloadTicket")
            .field("context", &self.context)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Bounded-retry unload verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnloadVerifier {
    max_attempts: u32,
    retry_interval: Duration,
}

impl Default for UnloadVerifier {
    fn default() -> Self {
        Self::new(
            defaults::UNLOAD_MAX_ATTEMPTS,
            Duration::from_millis(defaults::UNLOAD_RETRY_INTERVAL_MS),
        )
    }
}

impl UnloadVerifier {
    pub fn new(max_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            max_attempts,
            retry_interval,
        }
    }

    /// A verifier with no retry budget: the verdict is the reference count at
    /// the moment of the call.
    pub fn immediate() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn from_config(config: &UnloadConfig) -> Self {
        Self::new(config.max_attempts, config.retry_interval())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Request unload of `context` and return the ticket observing it.
    pub fn begin_unload(&self, context: IsolatedContext) -> UnloadTicket {
        context.unload()
    }

    /// Poll `ticket` until the context is released or the budget runs out.
    pub async fn verify(&self, ticket: &UnloadTicket) -> UnloadOutcome {
        let mut attempts = 0;
        while ticket.poll() == Liveness::Alive && attempts < self.max_attempts {
            tokio::task::yield_now().await;
            tokio::time::sleep(self.retry_interval).await;
            attempts += 1;
        }

        match ticket.poll() {
            Liveness::Released => {
                tracing::info!(
                    "[{}] context unloaded after {} attempts",
                    ticket.context_name(),
                    attempts
                );
                UnloadOutcome::Unloaded { attempts }
            }
            Liveness::Alive => {
                ticket.mark_stuck();
                let outstanding = ticket.outstanding();
                tracing::warn!(
                    "[{}] failed to unload context: {} handle(s) still outstanding after {} attempts",
                    ticket.context_name(),
                    outstanding,
                    attempts
                );
                UnloadOutcome::Stuck { outstanding }
            }
        }
    }

    /// [`begin_unload`](Self::begin_unload) followed by [`verify`](Self::verify).
    pub async fn unload(&self, context: IsolatedContext) -> UnloadOutcome {
        let ticket = self.begin_unload(context);
        self.verify(&ticket).await
    }
}
