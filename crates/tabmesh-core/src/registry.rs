//! Pending-operation registry.
//!
//! Tracks outstanding request/response exchanges (connect, election,
//! leadership) so callers can await their outcome without blocking the
//! inbound dispatch path. Every waiter settles exactly once: by a matching
//! response, by TTL exhaustion, by a timeout fallback, or by being dropped.
//! Dropping an unsettled [`Waiter`] removes its entry, so cancellation never
//! leaks.

use futures::stream::{self, Stream};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

use crate::protocol::envelope::Token;

/// Operation category a waiter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Connect,
    Election,
    Leadership,
}

/// Key of a waiter within its category.
///
/// `Own` is used by untokened operations, which allow a single outstanding
/// waiter per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaiterKey {
    Own,
    Token(Token),
}

/// How a waiter concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A matching response arrived
    Succeeded,
    /// The exchange ran out of TTL before a response arrived (inconclusive)
    Exhausted,
    /// A deadline elapsed first
    TimedOut,
    /// A newer waiter replaced this one
    Superseded,
    /// The operation hit a fatal protocol violation
    Aborted,
    /// The node shut down or the registry went away
    Cancelled,
}

struct Entry {
    generation: u64,
    tx: oneshot::Sender<Outcome>,
}

/// Registry of outstanding waiters. Wrap in `Arc` to register.
#[derive(Default)]
pub struct PendingRegistry {
    entries: Mutex<HashMap<(Category, WaiterKey), Entry>>,
    next_generation: AtomicU64,
    settled: Notify,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. An existing waiter under the same key is settled
    /// with [`Outcome::Superseded`].
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn register(self: &Arc<Self>, category: Category, key: WaiterKey) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let previous = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((category, key), Entry { generation, tx });

        if let Some(previous) = previous {
            let _ = previous.tx.send(Outcome::Superseded);
            self.settled.notify_waiters();
        }

        Waiter {
            registry: Arc::downgrade(self),
            category,
            key,
            generation,
            rx,
            done: false,
        }
    }

    /// Resolve the matching waiter. Absent or already-settled waiters are a no-op.
    pub fn settle(&self, category: Category, key: WaiterKey, outcome: Outcome) -> bool {
        let entry = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(category, key));

        match entry {
            Some(entry) => {
                let _ = entry.tx.send(outcome);
                self.settled.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Settle every waiter, in every category. Returns how many were pending.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Outcome::Cancelled);
        }
        self.settled.notify_waiters();
        count
    }

    /// Number of waiters pending in a category.
    pub fn len(&self, category: Category) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|(c, _)| *c == category)
            .count()
    }

    pub fn is_empty(&self, category: Category) -> bool {
        self.len(category) == 0
    }

    pub fn contains(&self, category: Category, key: WaiterKey) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(category, key))
    }

    fn deregister(&self, category: Category, key: WaiterKey, generation: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        // A replacement registered under the same key must survive
        if entries
            .get(&(category, key))
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(&(category, key));
            drop(entries);
            self.settled.notify_waiters();
        }
    }

    /// Stream that ends once every waiter in `category` has settled.
    ///
    /// Each item is the number still pending after a settle plus `grace`.
    /// Waiters registered while draining are picked up at the next recheck.
    pub fn drain(
        self: &Arc<Self>,
        category: Category,
        grace: Duration,
    ) -> impl Stream<Item = usize> + Send + 'static {
        stream::unfold(Arc::clone(self), move |registry| async move {
            {
                let notified = registry.settled.notified();
                tokio::pin!(notified);
                // Enable before checking so a settle between check and await is not missed
                notified.as_mut().enable();
                if registry.is_empty(category) {
                    return None;
                }
                notified.await;
            }

            // Give late arrivals a chance to register
            tokio::time::sleep(grace).await;
            let remaining = registry.len(category);
            Some((remaining, registry))
        })
    }

    /// Wait until `category` is empty at a recheck.
    pub async fn settled(self: &Arc<Self>, category: Category, grace: Duration) {
        use futures::StreamExt;
        let drain = self.drain(category, grace);
        futures::pin_mut!(drain);
        while drain.next().await.is_some() {}
    }
}

/// Handle to one outstanding operation. Await it for the [`Outcome`].
pub struct Waiter {
    registry: Weak<PendingRegistry>,
    category: Category,
    key: WaiterKey,
    generation: u64,
    rx: oneshot::Receiver<Outcome>,
    done: bool,
}

impl Future for Waiter {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                self.done = true;
                Poll::Ready(outcome)
            }
            Poll::Ready(Err(_)) => {
                self.done = true;
                Poll::Ready(Outcome::Cancelled)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if !self.done {
            if let Some(registry) = self.registry.upgrade() {
                registry.deregister(self.category, self.key, self.generation);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::time::timeout;
    use uuid::Uuid;

    fn registry() -> Arc<PendingRegistry> {
        Arc::new(PendingRegistry::new())
    }

    // ==================== Register / settle ====================

    #[tokio::test]
    async fn test_settle_resolves_waiter() {
        let reg = registry();
        let token = WaiterKey::Token(Uuid::new_v4());
        let waiter = reg.register(Category::Connect, token);

        assert!(reg.settle(Category::Connect, token, Outcome::Succeeded));
        assert_eq!(waiter.await, Outcome::Succeeded);
        assert!(reg.is_empty(Category::Connect));
    }

    #[tokio::test]
    async fn test_settle_twice_is_noop() {
        let reg = registry();
        let waiter = reg.register(Category::Election, WaiterKey::Own);

        assert!(reg.settle(Category::Election, WaiterKey::Own, Outcome::Exhausted));
        assert!(!reg.settle(Category::Election, WaiterKey::Own, Outcome::Succeeded));
        assert_eq!(waiter.await, Outcome::Exhausted);
    }

    #[tokio::test]
    async fn test_settle_absent_is_noop() {
        let reg = registry();
        assert!(!reg.settle(Category::Leadership, WaiterKey::Own, Outcome::Succeeded));
    }

    #[tokio::test]
    async fn test_n_waiters_settled_leaves_empty() {
        let reg = registry();
        let tokens: Vec<_> = (0..32).map(|_| WaiterKey::Token(Uuid::new_v4())).collect();
        let waiters: Vec<_> = tokens
            .iter()
            .map(|t| reg.register(Category::Connect, *t))
            .collect();
        assert_eq!(reg.len(Category::Connect), 32);

        for token in &tokens {
            assert!(reg.settle(Category::Connect, *token, Outcome::Succeeded));
        }
        for waiter in waiters {
            assert_eq!(waiter.await, Outcome::Succeeded);
        }
        assert!(reg.is_empty(Category::Connect));
    }

    #[tokio::test]
    async fn test_categories_are_independent() {
        let reg = registry();
        let _election = reg.register(Category::Election, WaiterKey::Own);
        let _leadership = reg.register(Category::Leadership, WaiterKey::Own);

        assert!(reg.settle(Category::Election, WaiterKey::Own, Outcome::Succeeded));
        assert!(reg.contains(Category::Leadership, WaiterKey::Own));
        assert_eq!(reg.len(Category::Election), 0);
    }

    // ==================== Cancellation ====================

    #[tokio::test]
    async fn test_drop_deregisters() {
        let reg = registry();
        let waiter = reg.register(Category::Election, WaiterKey::Own);
        assert_eq!(reg.len(Category::Election), 1);

        drop(waiter);
        assert!(reg.is_empty(Category::Election));
    }

    #[tokio::test]
    async fn test_timeout_drop_deregisters() {
        let reg = registry();
        let waiter = reg.register(Category::Connect, WaiterKey::Own);

        let result = timeout(Duration::from_millis(10), waiter).await;
        assert!(result.is_err());
        assert!(reg.is_empty(Category::Connect));
    }

    #[tokio::test]
    async fn test_reregister_supersedes() {
        let reg = registry();
        let first = reg.register(Category::Election, WaiterKey::Own);
        let second = reg.register(Category::Election, WaiterKey::Own);

        assert_eq!(first.await, Outcome::Superseded);
        assert_eq!(reg.len(Category::Election), 1);

        reg.settle(Category::Election, WaiterKey::Own, Outcome::TimedOut);
        assert_eq!(second.await, Outcome::TimedOut);
    }

    #[tokio::test]
    async fn test_dropping_superseded_keeps_replacement() {
        let reg = registry();
        let first = reg.register(Category::Election, WaiterKey::Own);
        let _second = reg.register(Category::Election, WaiterKey::Own);

        // first was settled by the replacement; dropping it must not remove _second
        drop(first);
        assert!(reg.contains(Category::Election, WaiterKey::Own));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let reg = registry();
        let a = reg.register(Category::Connect, WaiterKey::Token(Uuid::new_v4()));
        let b = reg.register(Category::Election, WaiterKey::Own);

        assert_eq!(reg.cancel_all(), 2);
        assert_eq!(a.await, Outcome::Cancelled);
        assert_eq!(b.await, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn test_registry_dropped_cancels() {
        let reg = registry();
        let waiter = reg.register(Category::Connect, WaiterKey::Own);
        drop(reg);
        assert_eq!(waiter.await, Outcome::Cancelled);
    }

    // ==================== Drain ====================

    #[tokio::test]
    async fn test_drain_empty_ends_immediately() {
        let reg = registry();
        let drain = reg.drain(Category::Connect, Duration::from_millis(1));
        futures::pin_mut!(drain);
        assert!(drain.next().await.is_none());
    }

    #[tokio::test]
    async fn test_drain_waits_for_all() {
        let reg = registry();
        let t1 = WaiterKey::Token(Uuid::new_v4());
        let t2 = WaiterKey::Token(Uuid::new_v4());
        let _w1 = reg.register(Category::Connect, t1);
        let _w2 = reg.register(Category::Connect, t2);

        let settler = Arc::clone(&reg);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            settler.settle(Category::Connect, t1, Outcome::Succeeded);
            tokio::time::sleep(Duration::from_millis(30)).await;
            settler.settle(Category::Connect, t2, Outcome::Exhausted);
        });

        timeout(Duration::from_secs(2), reg.settled(Category::Connect, Duration::from_millis(2)))
            .await
            .expect("drain should finish");
        assert!(reg.is_empty(Category::Connect));
    }

    #[tokio::test]
    async fn test_drain_picks_up_late_arrivals() {
        let reg = registry();
        let first = WaiterKey::Token(Uuid::new_v4());
        let late = WaiterKey::Token(Uuid::new_v4());
        let _w = reg.register(Category::Connect, first);

        let worker = Arc::clone(&reg);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            // Registered inside the grace window of the first settle
            let late_waiter = worker.register(Category::Connect, late);
            worker.settle(Category::Connect, first, Outcome::Succeeded);
            tokio::time::sleep(Duration::from_millis(40)).await;
            worker.settle(Category::Connect, late, Outcome::Succeeded);
            late_waiter.await
        });

        let drain = reg.drain(Category::Connect, Duration::from_millis(10));
        futures::pin_mut!(drain);
        let counts: Vec<usize> = timeout(Duration::from_secs(2), drain.collect())
            .await
            .expect("drain should finish");

        // First recheck still sees the late waiter, last sees none
        assert_eq!(counts.first(), Some(&1));
        assert_eq!(counts.last(), Some(&0));
    }
}
