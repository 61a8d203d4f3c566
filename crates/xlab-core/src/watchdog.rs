//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "One-shot runtime deadline per admitted experiment."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::record::RecordToken;

/// Deadline timer armed once per admission.
///
/// On expiry the callback runs on its own task with the token captured at
/// arm time, so closing the watchdog never cancels a callback that already
/// started. Dropping the watchdog closes it.
#[derive(Debug)]
pub struct AbortWatchdog {
    token: RecordToken,
    timer: JoinHandle<()>,
}

impl AbortWatchdog {
    pub fn arm<F, Fut>(token: RecordToken, after: Duration, on_expire: F) -> Self
    where
        F: FnOnce(RecordToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            debug!(token = token.0, "abort deadline reached");
            tokio::spawn(on_expire(token));
        });
        Self { token, timer }
    }

    pub fn token(&self) -> RecordToken {
        self.token
    }

    /// Cancel the timer if it has not fired yet.
    pub fn close(self) {
        self.timer.abort();
    }
}

impl Drop for AbortWatchdog {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_once_with_captured_token() {
        let fired = Arc::new(AtomicU64::new(0));
        let observed = fired.clone();
        let _watchdog = AbortWatchdog::arm(RecordToken(42), Duration::from_secs(60), move |token| async move {
            observed.fetch_add(token.0, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 42);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_watchdog_never_fires() {
        let fired = Arc::new(AtomicU64::new(0));
        let observed = fired.clone();
        let watchdog = AbortWatchdog::arm(RecordToken(1), Duration::from_secs(5), move |_| async move {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(watchdog.token(), RecordToken(1));
        watchdog.close();
        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
