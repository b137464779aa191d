use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SweepOutcome {
    Keep,
    Remove,
}

/// Something that needs periodic attention, typically a connection
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SweepTarget: Send + Sync + 'static {
    async fn sweep(&self, now: Instant) -> SweepOutcome;
}

/// A single timer loop that drives retransmission, ack flushing and the end of closing for
///  all registered connections. It runs on its own schedule, independent of traffic.
pub struct Sweeper {
    interval: Duration,
    next_id: AtomicU64,
    targets: Mutex<FxHashMap<u64, Arc<dyn SweepTarget>>>,
    active_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Sweeper {
    pub fn new(interval: Duration) -> Arc<Sweeper> {
        Arc::new(Sweeper {
            interval,
            next_id: AtomicU64::new(0),
            targets: Default::default(),
            active_handle: Default::default(),
        })
    }

    /// Create a sweeper and spawn its loop on the current tokio runtime
    pub fn start(interval: Duration) -> Arc<Sweeper> {
        let sweeper = Self::new(interval);
        let handle = tokio::spawn(Self::do_loop(Arc::downgrade(&sweeper), sweeper.interval));
        *sweeper.active_handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        sweeper
    }

    pub fn register(&self, target: Arc<dyn SweepTarget>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
            .insert(id, target);
        trace!("registered sweep target {}", id);
        id
    }

    pub fn deregister(&self, id: u64) {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn num_targets(&self) -> usize {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Sweep all targets once. The target table is not locked while targets are swept, so
    ///  targets may register or deregister concurrently.
    pub async fn sweep_once(&self, now: Instant) {
        let targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(&id, target)| (id, target.clone()))
            .collect::<Vec<_>>();

        let mut finished = Vec::new();
        for (id, target) in targets {
            if target.sweep(now).await == SweepOutcome::Remove {
                finished.push(id);
            }
        }

        if !finished.is_empty() {
            debug!("removing {} finished sweep target(s)", finished.len());
            let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
            for id in finished {
                targets.remove(&id);
            }
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.active_handle.lock().unwrap_or_else(PoisonError::into_inner).take() {
            debug!("stopping sweeper");
            handle.abort();
        }
    }

    /// Active loop - this runs until the sweeper is dropped or shut down
    async fn do_loop(sweeper: Weak<Sweeper>, interval: Duration) {
        let mut ticks = time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;
            let Some(sweeper) = sweeper.upgrade() else {
                return;
            };
            sweeper.sweep_once(Instant::now()).await;
        }
    }
}
