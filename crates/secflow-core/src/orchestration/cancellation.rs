use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// Cooperative cancellation flag shared by a workflow run and its adapter calls.
///
/// Clones observe the same flag. Blocking adapters poll [`is_cancelled`];
/// async code awaits [`cancelled`].
///
/// [`is_cancelled`]: TaskCancellationToken::is_cancelled
/// [`cancelled`]: TaskCancellationToken::cancelled
#[derive(Clone, Debug, Default)]
pub struct TaskCancellationToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl TaskCancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancellationMode {
    Immediate,
    Graceful { grace_period: Duration },
}

impl CancellationMode {
    pub fn grace_period(self) -> Duration {
        match self {
            Self::Immediate => Duration::ZERO,
            Self::Graceful { grace_period } => grace_period,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TaskCancellationToken;

    #[tokio::test]
    async fn cancelled_resolves_for_every_clone() {
        let token = TaskCancellationToken::new();
        let observer = token.clone();
        let waiter = tokio::spawn(async move { observer.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_set() {
        let token = TaskCancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("already cancelled token should resolve");
    }
}
