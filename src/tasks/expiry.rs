//! TTL Expiry Worker
//!
//! Per-entry timer tasks post expirations onto an unbounded channel, and a
//! single background task drains that channel and removes the expired
//! entries one at a time.

use std::sync::{Arc, Weak};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

// == Expiration ==
/// Signal that the entry inserted under `ticket` reached its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Expiration<K> {
    pub key: K,
    pub ticket: u64,
}

// == Expiry Sink ==
/// Receiver of expirations, implemented by the cache core.
pub(crate) trait ExpirySink<K>: Send + Sync + 'static {
    /// Removes the entry if it is still the one identified by the expiration.
    fn expire(&self, expiration: Expiration<K>);
}

// == Expiry Scheduler ==
/// Schedules per-entry timer tasks on the worker's runtime.
#[derive(Debug)]
pub(crate) struct ExpiryScheduler<K> {
    runtime: Handle,
    sender: mpsc::UnboundedSender<Expiration<K>>,
}

impl<K: Send + 'static> ExpiryScheduler<K> {
    pub fn new(runtime: Handle, sender: mpsc::UnboundedSender<Expiration<K>>) -> Self {
        Self { runtime, sender }
    }

    /// Spawns a timer task that posts the expiration at `deadline`.
    ///
    /// The returned handle cancels the task.
    pub fn schedule(&self, key: K, ticket: u64, deadline: Instant) -> AbortHandle {
        let sender = self.sender.clone();
        self.runtime
            .spawn(async move {
                tokio::time::sleep_until(deadline.into()).await;
                if sender.send(Expiration { key, ticket }).is_err() {
                    debug!(ticket, "Expiry worker gone, dropping expiration");
                }
            })
            .abort_handle()
    }
}

/// Spawns the background task that applies expirations to `sink`.
///
/// The task exits when `shutdown` is notified, when every sender of the
/// channel is gone, or when the sink itself has been dropped. It only
/// holds a weak reference, so it never keeps a dropped cache alive.
/// Removals run on the blocking pool since they wait on the cache lock.
///
/// # Returns
/// A JoinHandle for the spawned task.
pub(crate) fn spawn_expiry_worker<K, S>(
    sink: Weak<S>,
    mut receiver: mpsc::UnboundedReceiver<Expiration<K>>,
    shutdown: Arc<Notify>,
    runtime: &Handle,
) -> JoinHandle<()>
where
    K: Send + 'static,
    S: ExpirySink<K>,
{
    runtime.spawn(async move {
        info!("Starting expiry worker");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    debug!("Expiry worker received stop signal");
                    break;
                }
                received = receiver.recv() => {
                    let Some(expiration) = received else {
                        debug!("Expiry channel closed");
                        break;
                    };
                    let Some(target) = sink.upgrade() else {
                        debug!("Cache dropped, expiry worker exiting");
                        break;
                    };
                    let ticket = expiration.ticket;
                    if let Err(err) = tokio::task::spawn_blocking(move || target.expire(expiration)).await {
                        warn!(ticket, "Expiry removal failed: {}", err);
                    }
                }
            }
        }

        info!("Expiry worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        expired: Mutex<Vec<Expiration<&'static str>>>,
    }

    impl ExpirySink<&'static str> for RecordingSink {
        fn expire(&self, expiration: Expiration<&'static str>) {
            self.expired.lock().unwrap().push(expiration);
        }
    }

    impl RecordingSink {
        fn expired(&self) -> Vec<Expiration<&'static str>> {
            self.expired.lock().unwrap().clone()
        }
    }

    fn start(sink: &Arc<RecordingSink>) -> (ExpiryScheduler<&'static str>, Arc<Notify>, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let runtime = Handle::current();
        let worker = spawn_expiry_worker(Arc::downgrade(sink), receiver, shutdown.clone(), &runtime);
        (ExpiryScheduler::new(runtime, sender), shutdown, worker)
    }

    #[tokio::test]
    async fn test_scheduled_expiration_reaches_sink() {
        let sink = Arc::new(RecordingSink::default());
        let (scheduler, shutdown, worker) = start(&sink);

        scheduler.schedule("soon", 3, Instant::now() + Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(sink.expired(), vec![Expiration { key: "soon", ticket: 3 }]);

        shutdown.notify_one();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_aborted_timer_never_fires() {
        let sink = Arc::new(RecordingSink::default());
        let (scheduler, shutdown, worker) = start(&sink);

        let task = scheduler.schedule("cancelled", 1, Instant::now() + Duration::from_millis(20));
        task.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(sink.expired().is_empty());

        shutdown.notify_one();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_stops_on_signal() {
        let sink = Arc::new(RecordingSink::default());
        let (_scheduler, shutdown, worker) = start(&sink);

        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker should stop after the signal")
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_stops_when_senders_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let (scheduler, _shutdown, worker) = start(&sink);

        drop(scheduler);

        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker should stop once the channel closes")
            .unwrap();
    }
}
