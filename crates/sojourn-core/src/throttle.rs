// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bound on the number of instances resident in the directory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{CoreError, Result};

/// Counting semaphore sized from `HostConfig::max_instances`.
///
/// Slots are taken before a load and given back when the loaded context is
/// evicted, which can happen on another task, so permits are tracked
/// manually rather than through guards.
#[derive(Debug)]
pub struct InstanceThrottle {
    semaphore: Semaphore,
    max: usize,
    in_use: AtomicUsize,
}

impl InstanceThrottle {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Semaphore::new(max),
            max,
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take a slot, waiting up to `timeout` for one to free up.
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.in_use.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(_)) => Err(CoreError::CommunicationObjectAborted {
                detail: "instance throttle was aborted".to_string(),
            }),
            Err(_) => {
                debug!(max = self.max, "Timed out waiting for an instance slot");
                Err(CoreError::timeout("acquire instance throttle", timeout))
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.in_use.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    pub fn release(&self) {
        let previous = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous.is_ok() {
            self.semaphore.add_permits(1);
        }
    }

    /// Fail every current and future waiter.
    pub fn abort(&self) {
        self.semaphore.close();
    }

    pub fn is_aborted(&self) -> bool {
        self.semaphore.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_acquire_blocks_at_capacity() {
        let throttle = InstanceThrottle::new(2);
        throttle.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(throttle.try_acquire());
        assert_eq!(throttle.in_use(), 2);

        let err = throttle
            .acquire(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(throttle.in_use(), 2);
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let throttle = Arc::new(InstanceThrottle::new(1));
        throttle.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let throttle = throttle.clone();
            tokio::spawn(async move { throttle.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        throttle.release();

        waiter.await.unwrap().unwrap();
        assert_eq!(throttle.in_use(), 1);
        assert_eq!(throttle.available(), 0);
    }

    #[tokio::test]
    async fn test_release_without_acquire_is_ignored() {
        let throttle = InstanceThrottle::new(1);
        throttle.release();
        assert_eq!(throttle.available(), 1);
    }

    #[tokio::test]
    async fn test_abort_fails_waiters() {
        let throttle = Arc::new(InstanceThrottle::new(1));
        assert!(throttle.try_acquire());

        let waiter = {
            let throttle = throttle.clone();
            tokio::spawn(async move { throttle.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        throttle.abort();

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "COMMUNICATION_OBJECT_ABORTED");
        assert!(throttle.is_aborted());
    }
}
