//! Per-image mutual exclusion for detection runs.
//!
//! A run holds its image's guard from backend submission until the
//! detection set is persisted, so two runs for the same image never
//! interleave. Runs for different images do not contend.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// Registry of per-image async locks.
///
/// Entries are weak; a lock is freed once no run holds or awaits it.
#[derive(Debug, Default)]
pub struct ImageLocks {
    locks: Mutex<HashMap<i64, Weak<AsyncMutex<()>>>>,
}

/// Held for the duration of one run; releases on drop
#[derive(Debug)]
pub struct RunGuard {
    image_id: i64,
    _guard: OwnedMutexGuard<()>,
}

impl RunGuard {
    pub fn image_id(&self) -> i64 {
        self.image_id
    }
}

impl ImageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `image_id`
    pub async fn acquire(&self, image_id: i64) -> RunGuard {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|_, weak| weak.strong_count() > 0);

            match locks.get(&image_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    locks.insert(image_id, Arc::downgrade(&lock));
                    lock
                }
            }
        };

        trace!(image_id = image_id, "Waiting for image run guard");
        let guard = lock.lock_owned().await;

        RunGuard {
            image_id,
            _guard: guard,
        }
    }

    /// Number of images with a live lock (held or awaited)
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_image_is_exclusive() {
        let locks = Arc::new(ImageLocks::new());
        let first = locks.acquire(42).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(42).await.image_id() })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        assert_eq!(waiter.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_different_images_do_not_block() {
        let locks = ImageLocks::new();
        let _a = locks.acquire(1).await;

        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(2)).await;
        assert!(b.is_ok());
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn test_released_locks_are_pruned() {
        let locks = ImageLocks::new();
        {
            let _guard = locks.acquire(7).await;
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);

        // A fresh acquisition after release still works
        let guard = locks.acquire(7).await;
        assert_eq!(guard.image_id(), 7);
    }
}
