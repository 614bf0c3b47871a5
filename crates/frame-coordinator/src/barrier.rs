//! Reference-counted latch coupling input actions with the navigations they
//! may trigger.

use std::sync::Arc;

use tokio::sync::watch;

use crate::frame::Frame;
use crate::frame_task::FrameTask;
use crate::types::UrlMatcher;

struct BarrierInner {
    count: watch::Sender<usize>,
}

/// Counts in-flight navigations attributable to one input action. The
/// caller waits until the count first returns to zero; retain/release are
/// strictly paired, so the latch cannot fire early.
#[derive(Clone)]
pub struct SignalBarrier {
    inner: Arc<BarrierInner>,
}

impl SignalBarrier {
    /// Creates a barrier holding one self-retain, released by
    /// [`SignalBarrier::wait_for`].
    pub fn new() -> Self {
        let (count, _) = watch::channel(1usize);
        Self {
            inner: Arc::new(BarrierInner { count }),
        }
    }

    pub fn retain(&self) {
        self.inner.count.send_modify(|count| *count += 1);
    }

    pub fn release(&self) {
        self.inner.count.send_modify(|count| {
            debug_assert!(*count > 0, "signal barrier released below zero");
            *count = count.saturating_sub(1);
        });
    }

    /// Tracks one observed frame navigation: retains, then releases once the
    /// navigation settles in any way (commit, failure, frame detach, page
    /// disconnect).
    pub fn add_frame_navigation(&self, frame: &Arc<Frame>) {
        self.retain();
        let barrier = self.clone();
        let frame = Arc::clone(frame);
        tokio::spawn(async move {
            let task = FrameTask::new(&frame);
            let mut new_document = task.wait_for_new_document(UrlMatcher::Any);
            let mut same_document = task.wait_for_same_document(UrlMatcher::Any);
            let disconnect = frame.page_disconnect_token();
            let detach = frame.detach_token();
            tokio::select! {
                _ = disconnect.cancelled() => {}
                _ = detach.cancelled() => {}
                _ = &mut new_document => {}
                _ = &mut same_document => {}
            }
            task.done();
            barrier.release();
        });
    }

    /// Releases the self-retain and resolves once the count reaches zero.
    pub async fn wait_for(&self) {
        self.release();
        let mut rx = self.inner.count.subscribe();
        // The sender lives in self, so the channel cannot close under us.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    pub(crate) fn ptr_eq(&self, other: &SignalBarrier) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for SignalBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn wait_for_resolves_once_count_drops_to_zero() {
        let barrier = SignalBarrier::new();
        barrier.retain();

        let waiter = barrier.clone();
        let done = tokio::spawn(async move {
            waiter.wait_for().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!done.is_finished());

        barrier.release();
        tokio::time::timeout(Duration::from_secs(1), done)
            .await
            .expect("barrier should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_barrier_resolves_immediately() {
        let barrier = SignalBarrier::new();
        barrier.wait_for().await;
    }

    #[tokio::test(start_paused = true)]
    async fn paired_retains_keep_barrier_closed() {
        let barrier = SignalBarrier::new();
        barrier.retain();
        barrier.retain();
        barrier.release();

        let waiter = barrier.clone();
        let done = tokio::spawn(async move { waiter.wait_for().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!done.is_finished());

        barrier.release();
        done.await.unwrap();
    }
}
