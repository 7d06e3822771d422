//! Fixed-capacity pool of agent lanes.
//!
//! Capacity is a tokio [`Semaphore`], which queues waiters FIFO. A [`Lane`]
//! pairs the permit with a stable lane index for logs and events; dropping
//! the lane frees both.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    occupied: Arc<Mutex<Vec<bool>>>,
}

/// One held slot.
#[derive(Debug)]
pub struct Lane {
    index: usize,
    occupied: Arc<Mutex<Vec<bool>>>,
    _permit: OwnedSemaphorePermit,
}

impl Lane {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        // Runs before the permit field is dropped, so the next holder always
        // finds a free index.
        if let Some(flag) = lock(&self.occupied).get_mut(self.index) {
            *flag = false;
        }
    }
}

fn lock(occupied: &Mutex<Vec<bool>>) -> MutexGuard<'_, Vec<bool>> {
    occupied.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SlotPool {
    pub fn new(slot_count: usize) -> Result<Self> {
        if slot_count == 0 {
            return Err(anyhow!("slot count must be > 0"));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(slot_count)),
            occupied: Arc::new(Mutex::new(vec![false; slot_count])),
        })
    }

    pub fn slot_count(&self) -> usize {
        lock(&self.occupied).len()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        lock(&self.occupied).iter().filter(|held| **held).count()
    }

    /// Wait for a free lane. Waiters are served in arrival order.
    pub async fn acquire(&self) -> Result<Lane> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("slot pool closed")?;
        Ok(self.claim(permit))
    }

    /// Take a free lane if one exists right now.
    pub fn try_acquire(&self) -> Option<Lane> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.claim(permit))
    }

    /// Return a lane to the pool.
    pub fn release(&self, lane: Lane) {
        drop(lane);
    }

    fn claim(&self, permit: OwnedSemaphorePermit) -> Lane {
        let mut occupied = lock(&self.occupied);
        // A permit guarantees a free flag: permits and flags are released together.
        let index = occupied.iter().position(|held| !*held).unwrap_or(0);
        if let Some(flag) = occupied.get_mut(index) {
            *flag = true;
        }
        Lane {
            index,
            occupied: Arc::clone(&self.occupied),
            _permit: permit,
        }
    }
}
