//! Owned, cancellable timer handles

use tokio::task::JoinHandle;

/// Slot holding at most one timer task.
///
/// Cancelling aborts the task; cancelling an empty slot is a no-op.
#[derive(Debug, Default)]
pub(crate) struct Timer {
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// Install a new timer task, cancelling the previous one.
    pub(crate) fn replace(&mut self, handle: JoinHandle<()>) {
        self.cancel();
        self.handle = Some(handle);
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_task_and_is_idempotent() {
        let fired = Arc::new(AtomicBool::new(false));
        let mut timer = Timer::default();

        let flag = Arc::clone(&fired);
        timer.replace(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flag.store(true, Ordering::SeqCst);
        }));
        assert!(timer.is_armed());

        timer.cancel();
        timer.cancel();
        assert!(!timer.is_armed());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn replace_cancels_previous() {
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        let mut timer = Timer::default();

        let flag = Arc::clone(&first);
        timer.replace(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flag.store(true, Ordering::SeqCst);
        }));
        let flag = Arc::clone(&second);
        timer.replace(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flag.store(true, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
    }
}
