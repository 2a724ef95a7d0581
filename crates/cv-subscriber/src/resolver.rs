//! Per-entity conflict resolution.
//!
//! Serializes concurrent work targeting the same entity id. Each claim is a
//! lease in a per-key FIFO queue; the head lease holds the critical section
//! and every other lease waits for a single-shot `ready` signal. A claim
//! arriving behind a still-queued lease of equal or higher priority is
//! flagged as conflicting at insertion time; the flag never reorders the
//! queue. A background reaper expires head leases older than a TTL so a
//! hung worker cannot starve a key.
//!
//! State is guarded by one mutex across all keys: the conflict decision and
//! head promotion must observe every queue atomically. `ready` signals are
//! always fired after the mutex is released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::Error;

/// Callback receiving reaper diagnostics.
pub type LockCallback = Arc<dyn Fn(String) + Send + Sync>;

struct Lease {
    id: u64,
    priority: u64,
    created: Instant,
    /// Present while the lease is pending; taken when the lease is admitted.
    ready: Option<oneshot::Sender<u64>>,
}

/// Per-entity-id serialization with priority-based conflict annotation and
/// TTL-based liveness. Each subscriber owns exactly one resolver; clones
/// share state. A lease never references its queue: identity inside
/// [`ConflictResolver::leave`] is by id alone, which is what lets the
/// reaper drop a lease while the owner's later release stays clean.
#[derive(Clone)]
pub struct ConflictResolver {
    inner: Arc<Inner>,
}

struct Inner {
    idseq: AtomicU64,
    locks: Mutex<HashMap<String, VecDeque<Lease>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                idseq: AtomicU64::new(0),
                locks: Mutex::new(HashMap::new()),
                reaper: Mutex::new(None),
            }),
        }
    }

    /// Claim the critical section for `key`.
    ///
    /// Suspends until the claim is head-of-line for its key. Returns the
    /// lease id and the conflict flag: true when the most recently queued
    /// lease for `key` had priority greater than or equal to `priority` at
    /// insertion time.
    pub async fn enter(&self, key: &str, priority: u64) -> (u64, bool) {
        let id = self.inner.idseq.fetch_add(1, Ordering::Relaxed) + 1;
        let (ready_tx, ready_rx) = oneshot::channel();

        let conflict;
        let mut admit = None;
        {
            let mut locks = self.inner.locks.lock();
            let queue = locks.entry(key.to_string()).or_default();
            conflict = queue
                .back()
                .map_or(false, |tail| tail.priority >= priority);
            let ready = if queue.is_empty() {
                // Sole queue member: admitted immediately, off-lock below.
                admit = Some(ready_tx);
                None
            } else {
                Some(ready_tx)
            };
            queue.push_back(Lease {
                id,
                priority,
                created: Instant::now(),
                ready,
            });
        }
        if let Some(ready) = admit {
            let _ = ready.send(id);
        }

        // If the lease is removed before being admitted, the dropped sender
        // resolves the wait as well; either way head-of-line is ours.
        let _ = ready_rx.await;

        (id, conflict)
    }

    /// Release lease `id` for `key`; when the head was released, the next
    /// lease in line is admitted.
    ///
    /// `LockForIdNotFound` is non-fatal to callers: the reaper may have
    /// expired the lease first.
    pub fn leave(&self, key: &str, id: u64) -> Result<(), Error> {
        let mut admit = None;
        {
            let mut locks = self.inner.locks.lock();
            let queue = locks.get_mut(key).ok_or(Error::LockForKeyNotFound)?;
            let pos = queue
                .iter()
                .position(|lease| lease.id == id)
                .ok_or(Error::LockForIdNotFound)?;
            queue.remove(pos);
            if queue.is_empty() {
                locks.remove(key);
            } else if pos == 0 {
                if let Some(head) = queue.front_mut() {
                    let head_id = head.id;
                    admit = head.ready.take().map(|ready| (ready, head_id));
                }
            }
        }
        if let Some((ready, head_id)) = admit {
            let _ = ready.send(head_id);
        }
        Ok(())
    }

    /// Start the reaper, replacing a previously running one.
    ///
    /// Every `interval` the reaper inspects all keys: a head lease older
    /// than `ttl` is treated as hung, removed, and its successor admitted.
    /// `err_fn` receives one message per expired lease; `info_fn` receives
    /// one joined queue-depth summary per tick. Both are invoked off-lock.
    pub fn check_locks(
        &self,
        interval: Duration,
        ttl: Duration,
        err_fn: Option<LockCallback>,
        info_fn: Option<LockCallback>,
    ) {
        let inner = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.resolve_expired(ttl, err_fn.as_ref(), info_fn.as_ref());
            }
        });

        let mut reaper = self.inner.reaper.lock();
        if let Some(previous) = reaper.replace(handle) {
            previous.abort();
        }
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.inner.locks.lock().is_empty()
    }
}

impl Inner {
    fn resolve_expired(
        &self,
        ttl: Duration,
        err_fn: Option<&LockCallback>,
        info_fn: Option<&LockCallback>,
    ) {
        let mut admit = Vec::new();
        let mut expired = Vec::new();
        let mut infos = Vec::new();
        {
            let mut locks = self.locks.lock();
            let now = Instant::now();
            let mut emptied = Vec::new();
            for (key, queue) in locks.iter_mut() {
                if info_fn.is_some() {
                    infos.push(format!("{key} in queue {}", queue.len()));
                }

                // Only the head can be hung; successors have not run yet and
                // become candidates once they are themselves head.
                let hung = queue
                    .front()
                    .is_some_and(|head| now.duration_since(head.created) > ttl);
                if !hung {
                    continue;
                }
                if let Some(head) = queue.pop_front() {
                    debug!(key = %key, id = head.id, "Expired hung lease");
                    expired.push(format!(
                        "{key} ttl({ttl:?}) expired, created {age:?} ago",
                        age = now.duration_since(head.created),
                    ));
                }
                match queue.front_mut() {
                    Some(next) => {
                        let next_id = next.id;
                        if let Some(ready) = next.ready.take() {
                            admit.push((ready, next_id));
                        }
                    }
                    None => emptied.push(key.clone()),
                }
            }
            for key in emptied {
                locks.remove(&key);
            }
        }

        // Successors are admitted before any diagnostics go out.
        for (ready, id) in admit {
            let _ = ready.send(id);
        }
        if let Some(err_fn) = err_fn {
            for message in expired {
                err_fn(message);
            }
        }
        if let Some(info_fn) = info_fn {
            info_fn(format!("processing: [{}]", infos.join(",")));
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.get_mut().take() {
            reaper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn solo_enter_returns_immediately_and_leave_clears_the_key() {
        let resolver = ConflictResolver::new();

        let (id, conflict) = resolver.enter("x", 5).await;
        assert_eq!(id, 1);
        assert!(!conflict);

        resolver.leave("x", id).unwrap();
        assert!(resolver.is_idle());
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let resolver = ConflictResolver::new();

        let mut previous = 0;
        for key in ["a", "b", "c", "d"] {
            let (id, _) = resolver.enter(key, 1).await;
            assert!(id > previous);
            previous = id;
            resolver.leave(key, id).unwrap();
        }
    }

    #[tokio::test]
    async fn leave_for_unknown_key_fails() {
        let resolver = ConflictResolver::new();
        assert!(matches!(
            resolver.leave("missing", 1),
            Err(Error::LockForKeyNotFound)
        ));
    }

    #[tokio::test]
    async fn leave_for_unknown_id_fails_without_perturbing_the_queue() {
        let resolver = ConflictResolver::new();

        let (id, _) = resolver.enter("x", 5).await;
        assert!(matches!(
            resolver.leave("x", id + 100),
            Err(Error::LockForIdNotFound)
        ));

        // The held lease is still there and can be released normally.
        resolver.leave("x", id).unwrap();
        assert!(resolver.is_idle());
    }

    #[tokio::test]
    async fn conflict_depends_only_on_the_tail_lease() {
        let resolver = ConflictResolver::new();

        let (head_id, head_conflict) = resolver.enter("x", 5).await;
        assert!(!head_conflict);

        // Tail priority 5 < 99: no conflict for the newcomer.
        let second = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.enter("x", 99).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Tail priority 99 >= 7: conflict.
        let third = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.enter("x", 7).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        resolver.leave("x", head_id).unwrap();
        let (second_id, second_conflict) = second.await.unwrap();
        assert!(!second_conflict);

        resolver.leave("x", second_id).unwrap();
        let (third_id, third_conflict) = third.await.unwrap();
        assert!(third_conflict);

        resolver.leave("x", third_id).unwrap();
        assert!(resolver.is_idle());
    }
}
