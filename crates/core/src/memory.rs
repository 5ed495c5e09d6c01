//! Memory placement model.
//!
//! The target device has two heaps:
//!
//! | Region    | Speed | DMA             | Typical use                    |
//! |-----------|-------|-----------------|--------------------------------|
//! | Fast      | fast  | always          | bank0, native framebuffers     |
//! | Extended  | slow  | board dependent | cache banks, display swap cache|
//!
//! [`MemoryPool`] tracks a byte budget per region so that allocation can
//! fail the way it does on hardware, which is what drives every graceful
//! degradation in the pipeline (fewer banks, single buffer, fallback
//! compositor). Requests name a [`Placement`] preference and fall back to
//! the other region exactly like the firmware's allocator does.

use crate::config::MemoryBudget;
use std::ops::{Deref, DerefMut};

/// Which heap a block came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    Fast,
    Extended,
}

/// Allocation preference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Fast memory first, then extended.
    PreferFast,
    /// Extended memory first, then fast.
    PreferExtended,
    /// Extended memory or nothing.
    ExtendedOnly,
}

#[derive(Clone, Copy, Debug)]
struct RegionBudget {
    capacity: usize,
    used: usize,
}

impl RegionBudget {
    fn free(&self) -> usize {
        self.capacity - self.used
    }
}

/// An owned buffer charged against one region of a [`MemoryPool`].
#[derive(Debug)]
pub struct Block<T> {
    data: Vec<T>,
    region: Region,
    dma_capable: bool,
}

impl<T> Block<T> {
    pub fn region(&self) -> Region {
        self.region
    }

    pub fn dma_capable(&self) -> bool {
        self.dma_capable
    }

    fn bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<T>()
    }
}

impl<T> Deref for Block<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T> DerefMut for Block<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

/// Byte-budgeted allocator over the fast and extended regions.
#[derive(Debug)]
pub struct MemoryPool {
    fast: RegionBudget,
    extended: Option<RegionBudget>,
    extended_dma: bool,
}

impl MemoryPool {
    pub fn new(budget: &MemoryBudget) -> Self {
        MemoryPool {
            fast: RegionBudget { capacity: budget.fast_bytes, used: 0 },
            extended: if budget.extended_present {
                Some(RegionBudget { capacity: budget.extended_bytes, used: 0 })
            } else {
                None
            },
            extended_dma: budget.extended_dma,
        }
    }

    /// Pool with effectively unlimited memory in both regions.
    pub fn unbounded() -> Self {
        MemoryPool::new(&MemoryBudget {
            fast_bytes: usize::MAX / 2,
            extended_bytes: usize::MAX / 2,
            extended_present: true,
            extended_dma: true,
        })
    }

    pub fn has_extended(&self) -> bool {
        self.extended.is_some()
    }

    pub fn free_bytes(&self, region: Region) -> usize {
        match region {
            Region::Fast => self.fast.free(),
            Region::Extended => self.extended.map_or(0, |r| r.free()),
        }
    }

    /// Allocate `len` elements initialised to `fill`.
    ///
    /// Returns `None` when no permitted region has room, or when the host
    /// allocator itself refuses the reservation.
    pub fn alloc<T: Clone>(&mut self, len: usize, fill: T, placement: Placement) -> Option<Block<T>> {
        let bytes = len.checked_mul(std::mem::size_of::<T>())?;
        let order: &[Region] = match placement {
            Placement::PreferFast => &[Region::Fast, Region::Extended],
            Placement::PreferExtended => &[Region::Extended, Region::Fast],
            Placement::ExtendedOnly => &[Region::Extended],
        };
        let region = order.iter().copied().find(|&r| self.free_bytes(r) >= bytes)?;

        let mut data = Vec::new();
        if data.try_reserve_exact(len).is_err() {
            log::warn!("host allocator refused {} bytes", bytes);
            return None;
        }
        data.resize(len, fill);

        match region {
            Region::Fast => self.fast.used += bytes,
            Region::Extended => {
                if let Some(ext) = self.extended.as_mut() {
                    ext.used += bytes;
                }
            }
        }
        let dma_capable = region == Region::Fast || self.extended_dma;
        Some(Block { data, region, dma_capable })
    }

    /// Return a block's bytes to its region.
    pub fn free<T>(&mut self, block: Block<T>) {
        let bytes = block.bytes();
        match block.region {
            Region::Fast => self.fast.used = self.fast.used.saturating_sub(bytes),
            Region::Extended => {
                if let Some(ext) = self.extended.as_mut() {
                    ext.used = ext.used.saturating_sub(bytes);
                }
            }
        }
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new(&MemoryBudget::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(fast: usize, ext: Option<usize>) -> MemoryBudget {
        MemoryBudget {
            fast_bytes: fast,
            extended_bytes: ext.unwrap_or(0),
            extended_present: ext.is_some(),
            extended_dma: false,
        }
    }

    #[test]
    fn test_prefer_fast_falls_back() {
        let mut pool = MemoryPool::new(&budget(100, Some(1000)));
        let a = pool.alloc(80, 0u8, Placement::PreferFast).unwrap();
        assert_eq!(a.region(), Region::Fast);
        assert!(a.dma_capable());
        let b = pool.alloc(80, 0u8, Placement::PreferFast).unwrap();
        assert_eq!(b.region(), Region::Extended);
        assert!(!b.dma_capable());
        assert_eq!(pool.free_bytes(Region::Fast), 20);
    }

    #[test]
    fn test_extended_only_without_extended() {
        let mut pool = MemoryPool::new(&budget(1 << 20, None));
        assert!(pool.alloc(16, 0u16, Placement::ExtendedOnly).is_none());
        assert!(!pool.has_extended());
    }

    #[test]
    fn test_free_returns_budget() {
        let mut pool = MemoryPool::new(&budget(64, None));
        let a = pool.alloc(32, 0xFFFFu16, Placement::PreferExtended).unwrap();
        assert_eq!(a[31], 0xFFFF);
        assert!(pool.alloc(1, 0u8, Placement::PreferFast).is_none());
        pool.free(a);
        assert_eq!(pool.free_bytes(Region::Fast), 64);
    }
}
