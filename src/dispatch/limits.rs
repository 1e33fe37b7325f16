//! Request concurrency control.
//!
//! Global and per-IP in-flight caps with a priority wait queue. A request
//! that cannot get a permit waits up to the queue timeout; overflow and
//! per-IP rejection surface as 429. Route patterns map to integer
//! priorities; higher-priority waiters are dequeued first, FIFO within a
//! priority.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::core::{XyPrissError, XyResult};
use crate::middleware::scope_matches;

#[derive(Debug, Clone)]
pub struct ConcurrencyOptions {
    pub max_concurrent_requests: usize,
    pub max_per_ip: usize,
    pub queue_timeout: Duration,
    /// `(path prefix, priority)`; the longest matching prefix wins.
    pub route_priorities: Vec<(String, i32)>,
}

impl Default for ConcurrencyOptions {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 1024,
            max_per_ip: 64,
            queue_timeout: Duration::from_secs(2),
            route_priorities: Vec::new(),
        }
    }
}

struct Waiter {
    priority: i32,
    seq: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then earlier arrival.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

pub struct ConcurrencyController {
    options: ConcurrencyOptions,
    available: Mutex<usize>,
    queue: Mutex<BinaryHeap<Waiter>>,
    per_ip: DashMap<String, usize>,
    next_seq: AtomicU64,
}

/// An admitted request. Dropping the permit releases the slots and wakes
/// the next waiter.
pub struct RequestPermit {
    controller: Arc<ConcurrencyController>,
    ip: Option<String>,
}

impl Drop for RequestPermit {
    fn drop(&mut self) {
        self.controller.release(self.ip.take());
    }
}

impl ConcurrencyController {
    pub fn new(options: ConcurrencyOptions) -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(options.max_concurrent_requests.max(1)),
            queue: Mutex::new(BinaryHeap::new()),
            per_ip: DashMap::new(),
            next_seq: AtomicU64::new(0),
            options,
        })
    }

    fn priority_of(&self, path: &str) -> i32 {
        self.options
            .route_priorities
            .iter()
            .filter(|(prefix, _)| scope_matches(prefix, path))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, priority)| *priority)
            .unwrap_or(0)
    }

    /// Admits a request, waiting in the priority queue when the global cap
    /// is reached. `ip` participation in the per-IP cap is skipped when
    /// unknown.
    pub async fn acquire(
        self: &Arc<Self>,
        path: &str,
        ip: Option<&str>,
    ) -> XyResult<RequestPermit> {
        if let Some(ip) = ip {
            let mut count = self.per_ip.entry(ip.to_string()).or_insert(0);
            if *count >= self.options.max_per_ip {
                return Err(XyPrissError::RateLimited(format!(
                    "per-client concurrency cap reached for {ip}"
                )));
            }
            *count += 1;
        }
        let ip_owned = ip.map(|s| s.to_string());

        let rx = {
            let mut available = self.available.lock().unwrap();
            if *available > 0 {
                *available -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                self.queue.lock().unwrap().push(Waiter {
                    priority: self.priority_of(path),
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    tx,
                });
                Some(rx)
            }
        };

        if let Some(mut rx) = rx {
            match tokio::time::timeout(self.options.queue_timeout, &mut rx).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    // Sender dropped without granting: controller shutdown.
                    self.undo_ip(ip_owned);
                    return Err(XyPrissError::RateLimited(
                        "request queue overflow".to_string(),
                    ));
                }
                Err(_) => {
                    // A grant may have raced the timeout; only reject when
                    // the slot truly never arrived.
                    if rx.try_recv().is_err() {
                        self.undo_ip(ip_owned);
                        return Err(XyPrissError::RateLimited(
                            "request queue overflow".to_string(),
                        ));
                    }
                }
            }
        }

        Ok(RequestPermit {
            controller: self.clone(),
            ip: ip_owned,
        })
    }

    fn undo_ip(&self, ip: Option<String>) {
        let Some(ip) = ip else { return };
        let drained = match self.per_ip.get_mut(&ip) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if drained {
            self.per_ip.remove_if(&ip, |_, count| *count == 0);
        }
    }

    fn release(&self, ip: Option<String>) {
        self.undo_ip(ip);

        let mut queue = self.queue.lock().unwrap();
        // Hand the slot to the highest-priority live waiter; waiters whose
        // receivers timed out are discarded.
        while let Some(waiter) = queue.pop() {
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }
        drop(queue);
        *self.available.lock().unwrap() += 1;
    }

    pub fn in_flight(&self) -> usize {
        self.options.max_concurrent_requests - *self.available.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max: usize, per_ip: usize, queue_timeout_ms: u64) -> Arc<ConcurrencyController> {
        ConcurrencyController::new(ConcurrencyOptions {
            max_concurrent_requests: max,
            max_per_ip: per_ip,
            queue_timeout: Duration::from_millis(queue_timeout_ms),
            route_priorities: vec![("/important".to_string(), 10)],
        })
    }

    #[tokio::test]
    async fn test_permits_cap_concurrency() {
        let controller = controller(2, 10, 50);
        let p1 = controller.acquire("/a", None).await.unwrap();
        let _p2 = controller.acquire("/a", None).await.unwrap();
        assert_eq!(controller.in_flight(), 2);

        // Third request overflows the queue within the timeout.
        let err = controller.acquire("/a", None).await.unwrap_err();
        assert!(matches!(err, XyPrissError::RateLimited(_)));

        // Releasing a permit lets a new request in.
        drop(p1);
        let _p3 = controller.acquire("/a", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_waiter_gets_released_slot() {
        let controller = controller(1, 10, 1000);
        let p1 = controller.acquire("/a", None).await.unwrap();

        let waiting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.acquire("/b", None).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(p1);
        assert!(waiting.await.unwrap());
    }

    #[tokio::test]
    async fn test_priority_dequeue_order() {
        let controller = controller(1, 10, 2000);
        let blocker = controller.acquire("/a", None).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));

        let normal = {
            let (controller, order) = (controller.clone(), order.clone());
            tokio::spawn(async move {
                let _permit = controller.acquire("/normal", None).await.unwrap();
                order.lock().unwrap().push("normal");
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let important = {
            let (controller, order) = (controller.clone(), order.clone());
            tokio::spawn(async move {
                let _permit = controller.acquire("/important", None).await.unwrap();
                order.lock().unwrap().push("important");
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The high-priority waiter arrived later but is dequeued first.
        drop(blocker);
        important.await.unwrap();
        normal.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["important", "normal"]);
    }

    #[tokio::test]
    async fn test_per_ip_cap() {
        let controller = controller(10, 2, 50);
        let _a = controller.acquire("/", Some("10.0.0.1")).await.unwrap();
        let _b = controller.acquire("/", Some("10.0.0.1")).await.unwrap();

        let err = controller.acquire("/", Some("10.0.0.1")).await.unwrap_err();
        assert!(matches!(err, XyPrissError::RateLimited(_)));

        // Another client is unaffected.
        assert!(controller.acquire("/", Some("10.0.0.2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_permit_drop_restores_per_ip_budget() {
        let controller = controller(10, 1, 50);
        let permit = controller.acquire("/", Some("10.0.0.3")).await.unwrap();
        drop(permit);
        assert!(controller.acquire("/", Some("10.0.0.3")).await.is_ok());
    }
}
