use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, Instant, interval};

/// A queued scheduling attempt. Higher priority pops first; equal priorities
/// pop in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPod {
    pub priority: i64,
    pub seq: u64,
    pub pod_id: String,
}

impl PartialOrd for QueuedPod {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedPod {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

pub struct BackOffPod {
    pub pod: QueuedPod,
    pub expire: Instant,
}

impl PartialEq for BackOffPod {
    fn eq(&self, other: &Self) -> bool {
        self.expire == other.expire
    }
}

impl Eq for BackOffPod {}

impl PartialOrd for BackOffPod {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BackOffPod {
    fn cmp(&self, other: &Self) -> Ordering {
        other.expire.cmp(&self.expire)
    }
}

type ActiveQueue = Arc<Mutex<BinaryHeap<QueuedPod>>>;
type BackoffQueue = Arc<Mutex<BinaryHeap<BackOffPod>>>;
type ParkedQueue = Arc<Mutex<Vec<(BackOffPod, Instant)>>>;

/// Three-tier retry queue: active pods are tried immediately, backed-off pods
/// return after an exponential delay, repeatedly failing pods are parked
/// until a cluster change (or a long timer) wakes them.
pub struct SchedulingQueue {
    active_queue: ActiveQueue,
    backoff_queue: BackoffQueue,
    parked_queue: ParkedQueue,
    /// Used for waiting for state changes when no pods are schedulable.
    /// Each pod addition increments the state change counter.
    status_count: Mutex<watch::Receiver<usize>>,
    status_sx: watch::Sender<usize>,
    seq: AtomicU64,
}

const PARK_AFTER_ATTEMPTS: usize = 8;
const PARK_FLUSH_AFTER: Duration = Duration::from_secs(5 * 60);

impl Default for SchedulingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulingQueue {
    pub fn new() -> Self {
        let (sx, rx) = watch::channel(0);
        Self {
            active_queue: Arc::new(Mutex::new(BinaryHeap::new())),
            backoff_queue: Arc::new(Mutex::new(BinaryHeap::new())),
            parked_queue: Arc::new(Mutex::new(Vec::new())),
            status_count: Mutex::new(rx),
            status_sx: sx,
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    pub async fn push(&self, pod_id: String, priority: i64) {
        let entry = QueuedPod {
            priority,
            seq: self.next_seq(),
            pod_id,
        };
        self.active_queue.lock().await.push(entry);
        self.add_count();
    }

    /// Requeue a failed attempt. The delay doubles per attempt; after
    /// `PARK_AFTER_ATTEMPTS` failures the pod is parked instead.
    pub async fn push_backoff(&self, pod_id: String, priority: i64, attempts: usize) {
        let expire = Instant::now() + Duration::from_secs(2_u64.pow(attempts.min(6) as u32));
        let entry = BackOffPod {
            pod: QueuedPod {
                priority,
                seq: self.next_seq(),
                pod_id,
            },
            expire,
        };
        if attempts > PARK_AFTER_ATTEMPTS {
            self.parked_queue.lock().await.push((entry, Instant::now()));
        } else {
            self.backoff_queue.lock().await.push(entry);
        }
    }

    pub async fn next_pod(&self) -> QueuedPod {
        loop {
            if let Some(next) = self.active_queue.lock().await.pop() {
                return next;
            }
            let mut status_guard = self.status_count.lock().await;
            status_guard
                .changed()
                .await
                .expect("queue status sender closed unexpectedly");
        }
    }

    /// Wake every parked pod; called on cluster change so pending pods are
    /// reconsidered.
    pub async fn move_all_to_active(&self) {
        let mut active_guard = self.active_queue.lock().await;
        self.parked_queue
            .lock()
            .await
            .drain(..)
            .for_each(|(p, _)| active_guard.push(p.pod));
        drop(active_guard);
        self.add_count();
    }

    async fn flush_backoff_completed(
        active: ActiveQueue,
        backoff: BackoffQueue,
        sx: watch::Sender<usize>,
    ) {
        let now = Instant::now();
        let mut active_guard = active.lock().await;
        let mut backoff_guard = backoff.lock().await;
        while backoff_guard
            .peek()
            .is_some_and(|entry| entry.expire <= now)
        {
            let entry = backoff_guard.pop().unwrap();
            active_guard.push(entry.pod);
        }
        sx.send_modify(|v| *v += 1);
    }

    async fn flush_parked_left_over(
        active: ActiveQueue,
        backoff: BackoffQueue,
        parked: ParkedQueue,
        sx: watch::Sender<usize>,
    ) {
        let now = Instant::now();
        let mut active_guard = active.lock().await;
        let mut backoff_guard = backoff.lock().await;
        let mut parked_guard = parked.lock().await;
        let mut kept = Vec::new();
        for (entry, parked_at) in parked_guard.drain(..) {
            if now - parked_at > PARK_FLUSH_AFTER {
                if now >= entry.expire {
                    active_guard.push(entry.pod);
                } else {
                    backoff_guard.push(entry);
                }
            } else {
                kept.push((entry, parked_at));
            }
        }
        *parked_guard = kept;
        sx.send_modify(|v| *v += 1);
    }

    /// Spawn the timers that drain backoff and parked pods.
    pub fn run(&self) {
        let active_queue = self.active_queue.clone();
        let backoff_queue = self.backoff_queue.clone();
        let status_sx = self.status_sx.clone();
        tokio::spawn(async move {
            let mut timer = interval(Duration::from_secs(1));
            loop {
                Self::flush_backoff_completed(
                    active_queue.clone(),
                    backoff_queue.clone(),
                    status_sx.clone(),
                )
                .await;
                timer.tick().await;
            }
        });

        let active_queue = self.active_queue.clone();
        let backoff_queue = self.backoff_queue.clone();
        let parked_queue = self.parked_queue.clone();
        let status_sx = self.status_sx.clone();
        tokio::spawn(async move {
            let mut timer = interval(Duration::from_secs(30));
            loop {
                Self::flush_parked_left_over(
                    active_queue.clone(),
                    backoff_queue.clone(),
                    parked_queue.clone(),
                    status_sx.clone(),
                )
                .await;
                timer.tick().await;
            }
        });
    }

    fn add_count(&self) {
        self.status_sx.send_modify(|v| *v += 1);
    }
}
