use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation shared by every task of one invocation.
///
/// A token is cancelled when its flag is raised (Ctrl-C, explicit call) or when
/// its deadline passes. Child tokens share the parent's flag and may carry a
/// tighter deadline, so cancelling the parent also cancels every child.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Derive a token that expires after `timeout` or when `self` is cancelled.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// True when the flag was raised, as opposed to the deadline passing.
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Time left before the deadline, `None` when the token has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self) -> Result<(), crate::TransferError> {
        if self.is_cancelled() {
            Err(crate::TransferError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Wire Ctrl-C to `token`. A second Ctrl-C exits immediately.
pub fn cancel_on_ctrlc(token: &CancelToken) {
    let token = token.clone();
    let _ = ctrlc::set_handler(move || {
        if token.flag.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        token.cancel();
        eprintln!("\ninterrupt received, stopping after in-flight requests...");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
        assert!(token.remaining().is_none());
    }

    #[test]
    fn cancel_propagates_to_clones_and_children() {
        let token = CancelToken::new();
        let clone = token.clone();
        let child = token.child_with_timeout(Duration::from_secs(60));
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_cancel_reaches_parent_flag() {
        // Children share the flag; only deadlines are per-token.
        let token = CancelToken::new();
        let child = token.child_with_timeout(Duration::from_secs(60));
        child.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn expired_deadline_cancels() {
        let token = CancelToken::with_timeout(Duration::ZERO);
        assert!(token.is_cancelled());
        assert!(matches!(
            token.check(),
            Err(crate::TransferError::Cancelled)
        ));
        assert!(!token.is_interrupted());
    }

    #[test]
    fn interrupt_is_distinct_from_expiry() {
        let parent = CancelToken::new();
        let child = parent.child_with_timeout(Duration::ZERO);
        assert!(child.is_cancelled());
        assert!(!child.is_interrupted());
        parent.cancel();
        assert!(child.is_interrupted());
    }

    #[test]
    fn child_keeps_tighter_parent_deadline() {
        let parent = CancelToken::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert!(child.remaining().unwrap() <= Duration::from_millis(10));
    }
}
