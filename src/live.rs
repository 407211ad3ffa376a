//! Callback-driven consumption of an observation.
//!
//! [`subscribe`] drives an observation on a background task and hands every
//! item to a callback. The returned [`LiveHandle`] stops the task; stopping
//! drops the observation, which cancels everything it holds.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::error::ObserveError;
use crate::source::Observation;

/// Handle for a running [`subscribe`] task.
///
/// Call [`shutdown`](LiveHandle::shutdown) to stop the task and collect its
/// result. Dropping every clone of the handle also stops the task, but its
/// result is lost.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct LiveHandle {
    /// Sends `true` to signal the task to stop.
    shutdown_tx: watch::Sender<bool>,
    /// Taken and awaited exactly once by [`shutdown`](LiveHandle::shutdown).
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<Result<(), ObserveError>>>>>,
}

impl LiveHandle {
    /// Whether the task is still forwarding items.
    ///
    /// `false` once the observation ended or failed, or after
    /// [`shutdown`](LiveHandle::shutdown).
    pub fn is_running(&self) -> bool {
        match self.task.try_lock() {
            Ok(task) => task.as_ref().is_some_and(|handle| !handle.is_finished()),
            // Someone is in `shutdown`.
            Err(_) => false,
        }
    }

    /// Stop the task and wait for it to exit.
    ///
    /// Calling `shutdown` more than once is safe -- later calls return
    /// `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// * The error the observation ended with, if it failed before the
    ///   shutdown signal arrived.
    /// * [`ObserveError::TaskFailed`] -- the callback panicked.
    pub async fn shutdown(&self) -> Result<(), ObserveError> {
        // The task may already be gone; nobody to notify then.
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| ObserveError::TaskFailed(e.to_string()))?,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for LiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

/// Forward every item of `observation` to `on_change` until shut down.
///
/// Must be called within a tokio runtime.
///
/// # Arguments
///
/// * `observation` - Usually an aggregate from
///   [`observe_registry`](crate::observe_registry) or
///   [`observe_all`](crate::observe_all).
/// * `on_change` - Called with each new value, on the task.
///
/// # Returns
///
/// A [`LiveHandle`] controlling the spawned task. The task ends on its own
/// when the observation completes or yields an error; the error is returned
/// by [`LiveHandle::shutdown`].
pub fn subscribe<T, F>(observation: Observation<T>, on_change: F) -> LiveHandle
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run(observation, on_change, shutdown_rx));
    LiveHandle {
        shutdown_tx,
        task: Arc::new(tokio::sync::Mutex::new(Some(task))),
    }
}

async fn run<T, F>(
    mut observation: Observation<T>,
    mut on_change: F,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ObserveError>
where
    F: FnMut(T),
{
    loop {
        tokio::select! {
            // Prefer shutdown over further items.
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("live subscription shut down");
                    return Ok(());
                }
            }
            item = observation.next() => match item {
                Some(Ok(value)) => on_change(value),
                Some(Err(e)) => {
                    tracing::error!(error = %e, "live subscription failed");
                    return Err(e);
                }
                None => {
                    tracing::debug!("live subscription completed");
                    return Ok(());
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;

    fn channel() -> (
        mpsc::UnboundedSender<Result<u32, ObserveError>>,
        Observation<u32>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn wait_for(seen: &Mutex<Vec<u32>>, len: usize) {
        for _ in 0..100 {
            if seen.lock().unwrap().len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("callback never saw {len} items");
    }

    async fn wait_stopped(handle: &LiveHandle) {
        for _ in 0..100 {
            if !handle.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never stopped");
    }

    #[tokio::test]
    async fn forwards_items_until_shutdown() {
        let (tx, observation) = channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = subscribe(observation, move |value| sink.lock().unwrap().push(value));

        tx.send(Ok(1)).unwrap();
        tx.send(Ok(2)).unwrap();
        wait_for(&seen, 2).await;
        assert!(handle.is_running());

        handle.shutdown().await.expect("clean shutdown");
        assert!(!handle.is_running());
        // Observation dropped with the task.
        assert!(tx.is_closed());
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn error_ends_task_and_is_returned() {
        let (tx, observation) = channel();
        let handle = subscribe(observation, |_| {});

        tx.send(Err(ObserveError::SourceGone)).unwrap();
        wait_stopped(&handle).await;
        assert_eq!(handle.shutdown().await, Err(ObserveError::SourceGone));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (_tx, observation) = channel();
        let handle = subscribe(observation, |_| {});
        handle.shutdown().await.unwrap();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn panicking_callback_reports_task_failure() {
        let (tx, observation) = channel();
        let handle = subscribe(observation, |_| panic!("callback exploded"));
        tx.send(Ok(1)).unwrap();
        wait_stopped(&handle).await;
        let err = handle.shutdown().await.unwrap_err();
        assert!(matches!(err, ObserveError::TaskFailed(_)));
    }

    #[test]
    fn handle_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LiveHandle>();
    }
}
