//! Device memory accounting
//!
//! Every [`DeviceBuffer`](crate::buffer::DeviceBuffer) reserves its device-side
//! bytes from a shared [`DeviceMemory`] budget and gives them back on drop, so
//! running out of accelerator memory surfaces as
//! [`Error::MemoryBudgetExceeded`] from the call that tried to allocate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Shared device memory budget
#[derive(Debug)]
pub struct DeviceMemory {
    /// The total budget in bytes
    total_budget: usize,

    /// The current reservation in bytes
    current_usage: AtomicUsize,

    /// Usage statistics
    stats: RwLock<DeviceMemoryStats>,
}

/// Device memory statistics
#[derive(Debug, Clone)]
pub struct DeviceMemoryStats {
    /// Total bytes ever reserved
    pub total_allocated: usize,

    /// Total bytes ever released
    pub total_released: usize,

    /// Peak reservation in bytes
    pub peak_usage: usize,

    /// Number of live reservations
    pub live_allocations: usize,

    /// Last time the stats were updated
    pub last_updated: Instant,
}

/// Host and device footprint of one dataset, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Bytes held in host mirrors
    pub host_bytes: usize,
    /// Bytes reserved on the device
    pub device_bytes: usize,
}

impl std::ops::Add for MemoryUsage {
    type Output = MemoryUsage;

    fn add(self, rhs: MemoryUsage) -> MemoryUsage {
        MemoryUsage {
            host_bytes: self.host_bytes + rhs.host_bytes,
            device_bytes: self.device_bytes + rhs.device_bytes,
        }
    }
}

impl std::iter::Sum for MemoryUsage {
    fn sum<I: Iterator<Item = MemoryUsage>>(iter: I) -> MemoryUsage {
        iter.fold(MemoryUsage::default(), |acc, usage| acc + usage)
    }
}

impl DeviceMemory {
    /// Create a budget of `total_budget` bytes
    pub fn new(total_budget: usize) -> Self {
        Self {
            total_budget,
            current_usage: AtomicUsize::new(0),
            stats: RwLock::new(DeviceMemoryStats {
                total_allocated: 0,
                total_released: 0,
                peak_usage: 0,
                live_allocations: 0,
                last_updated: Instant::now(),
            }),
        }
    }

    /// Create a budget with no practical limit, shared behind an `Arc`
    pub fn unbounded() -> Arc<Self> {
        Arc::new(Self::new(usize::MAX))
    }

    /// Create a budget of `total_budget` bytes, shared behind an `Arc`
    pub fn shared(total_budget: usize) -> Arc<Self> {
        Arc::new(Self::new(total_budget))
    }

    /// Try to reserve `bytes`, returns false if the budget would be exceeded
    pub fn try_allocate(&self, bytes: usize) -> bool {
        let mut current = self.current_usage.load(Ordering::SeqCst);

        loop {
            let Some(next) = current.checked_add(bytes) else {
                return false;
            };
            if next > self.total_budget {
                return false;
            }

            match self.current_usage.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
                    stats.total_allocated += bytes;
                    stats.live_allocations += 1;
                    stats.peak_usage = stats.peak_usage.max(next);
                    stats.last_updated = Instant::now();
                    return true;
                }
                Err(actual) => {
                    current = actual;
                }
            }
        }
    }

    /// Reserve `bytes`, returning an error if it exceeds the budget
    pub fn allocate(&self, bytes: usize) -> Result<()> {
        if self.try_allocate(bytes) {
            Ok(())
        } else {
            Err(Error::MemoryBudgetExceeded {
                requested: bytes,
                available: self.available(),
            })
        }
    }

    /// Release a previous reservation
    pub fn release(&self, bytes: usize) {
        let prev = self.current_usage.fetch_sub(bytes, Ordering::SeqCst);

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        stats.total_released += bytes;
        stats.live_allocations = stats.live_allocations.saturating_sub(1);
        stats.last_updated = Instant::now();

        debug_assert!(
            prev >= bytes,
            "Attempted to release more memory than reserved: prev={prev}, release={bytes}"
        );
    }

    /// Current reservation in bytes
    pub fn usage(&self) -> usize {
        self.current_usage.load(Ordering::SeqCst)
    }

    /// Bytes still available
    pub fn available(&self) -> usize {
        self.total_budget.saturating_sub(self.usage())
    }

    /// Total budget in bytes
    pub fn total_budget(&self) -> usize {
        self.total_budget
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> DeviceMemoryStats {
        self.stats.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Default for DeviceMemory {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}
