//! Block allocation of rays.
//!
//! Rays are handed out from fixed size blocks and addressed by a [RayId]
//! instead of a pointer. Released rays go onto a free list and are handed out
//! again before any new block is reserved.

use crate::{
    constants::{RAYS_PER_BLOCK, VARIABLE_LIMIT},
    error::{RenderError, Result},
    ray::{Ray, RayMut, RayRef, SlotData, SlotDataMut},
};

/// Stable handle of a ray inside a [RayPool].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RayId {
    block: u32,
    slot: u32,
}

impl RayId {
    /// Index of the block holding the ray.
    pub fn block(&self) -> usize {
        self.block as usize
    }

    /// Slot of the ray within its block.
    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

/// A block of equally shaped ray slots.
///
/// The values and validity flags of all slots live in two buffers that are
/// allocated once, when the block is created. Slots are filled front to back.
/// A block never shrinks, it is only dropped as a whole.
pub struct RayMemoryBlock {
    samples: Vec<f64>,
    valid: Vec<bool>,
    num_valid: Vec<usize>,
    len: usize,
    capacity: usize,
    num_samples: usize,
    num_variables: usize,
}

impl RayMemoryBlock {
    /// Create an empty block with room for `capacity` rays of the given shape.
    pub fn new(capacity: usize, num_samples: usize, num_variables: usize) -> Self {
        Self {
            samples: vec![0.0; capacity * num_samples * num_variables],
            valid: vec![false; capacity * num_samples],
            num_valid: vec![0; capacity],
            len: 0,
            capacity,
            num_samples,
            num_variables,
        }
    }

    /// Return true if no slot is left.
    pub fn full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Number of slots in use.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Return true if no slot is in use.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn reserve(&mut self) -> usize {
        debug_assert!(!self.full());
        self.len += 1;
        self.len - 1
    }

    /// The ray in `slot`.
    pub fn ray(&self, slot: usize) -> RayRef<'_> {
        assert!(slot < self.len);
        let stride = self.num_samples * self.num_variables;
        let samples = &self.samples[slot * stride..(slot + 1) * stride];
        let valid = &self.valid[slot * self.num_samples..(slot + 1) * self.num_samples];
        Ray::from_data(
            SlotData::new(samples, valid, self.num_valid[slot]),
            self.num_samples,
            self.num_variables,
        )
    }

    /// The ray in `slot`, mutably.
    pub fn ray_mut(&mut self, slot: usize) -> RayMut<'_> {
        assert!(slot < self.len);
        let stride = self.num_samples * self.num_variables;
        let samples = &mut self.samples[slot * stride..(slot + 1) * stride];
        let valid = &mut self.valid[slot * self.num_samples..(slot + 1) * self.num_samples];
        Ray::from_data(
            SlotDataMut::new(samples, valid, &mut self.num_valid[slot]),
            self.num_samples,
            self.num_variables,
        )
    }
}

/// Arena of rays of a fixed shape.
pub struct RayPool {
    blocks: Vec<RayMemoryBlock>,
    free: Vec<RayId>,
    num_samples: usize,
    num_variables: usize,
    rays_per_block: usize,
}

impl RayPool {
    /// Create an empty pool for rays of `num_samples` samples and `num_variables` variables.
    pub fn new(num_samples: usize, num_variables: usize) -> Result<Self> {
        Self::with_block_size(num_samples, num_variables, RAYS_PER_BLOCK)
    }

    /// Create an empty pool with a custom number of rays per block.
    pub fn with_block_size(
        num_samples: usize,
        num_variables: usize,
        rays_per_block: usize,
    ) -> Result<Self> {
        assert!(rays_per_block > 0);
        if num_variables > VARIABLE_LIMIT {
            return Err(RenderError::TooManyVariables(num_variables));
        }
        Ok(Self {
            blocks: Vec::new(),
            free: Vec::new(),
            num_samples,
            num_variables,
            rays_per_block,
        })
    }

    /// Hand out a ray with all samples invalid.
    ///
    /// Recycled rays take priority over fresh slots.
    pub fn acquire(&mut self) -> RayId {
        if let Some(id) = self.free.pop() {
            return id;
        }

        if self.blocks.last().map_or(true, |block| block.full()) {
            self.blocks.push(RayMemoryBlock::new(
                self.rays_per_block,
                self.num_samples,
                self.num_variables,
            ));
        }

        let block = self.blocks.len() - 1;
        let slot = self.blocks[block].reserve();

        RayId {
            block: block as u32,
            slot: slot as u32,
        }
    }

    /// Return a ray to the pool. Its samples are invalidated immediately.
    pub fn release(&mut self, id: RayId) {
        self.get_mut(id).reset();
        self.free.push(id);
    }

    /// Access a ray.
    pub fn get(&self, id: RayId) -> RayRef<'_> {
        self.blocks[id.block()].ray(id.slot())
    }

    /// Mutably access a ray.
    pub fn get_mut(&mut self, id: RayId) -> RayMut<'_> {
        self.blocks[id.block()].ray_mut(id.slot())
    }

    /// Drop all blocks and the free list.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.free.clear();
    }

    /// Number of reserved blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of rays currently waiting on the free list.
    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    /// Number of rays that were ever reserved and are still owned by the pool.
    pub fn num_reserved(&self) -> usize {
        self.blocks.iter().map(|block| block.len()).sum()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::RayPool;
    use crate::{constants::VARIABLE_LIMIT, context::RenderContext, error::RenderError};

    #[test]
    fn test_blocks_are_appended() {
        let mut pool = RayPool::with_block_size(4, 1, 3).unwrap();
        let ids = (0..7).map(|_| pool.acquire()).collect::<Vec<_>>();

        assert_eq!(pool.num_blocks(), 3);
        assert_eq!(pool.num_reserved(), 7);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 7);
        assert_eq!(ids[6].block(), 2);
        assert_eq!(ids[6].slot(), 0);
    }

    #[test]
    fn test_recycling_before_new_blocks() {
        let context = RenderContext::new();
        let mut pool = RayPool::with_block_size(4, 1, 2).unwrap();
        let first = pool.acquire();
        let second = pool.acquire();

        pool.get_mut(first).set_sample(2, &[1.0], &context).unwrap();
        pool.release(first);

        let third = pool.acquire();
        assert_eq!(third, first);
        assert_ne!(third, second);
        assert_eq!(pool.num_blocks(), 1);
        assert_eq!(pool.get(third).num_valid_samples(), 0);
    }

    #[test]
    fn test_clear() {
        let mut pool = RayPool::new(8, 2).unwrap();
        let id = pool.acquire();
        pool.release(id);
        pool.clear();
        assert_eq!(pool.num_blocks(), 0);
        assert_eq!(pool.num_free(), 0);
    }

    #[test]
    fn test_slots_share_the_block_buffers() {
        let context = RenderContext::new();
        let mut pool = RayPool::with_block_size(5, 2, 4).unwrap();

        let first = pool.acquire();
        let samples = (
            pool.blocks[0].samples.as_ptr(),
            pool.blocks[0].samples.capacity(),
        );
        let valid = (pool.blocks[0].valid.as_ptr(), pool.blocks[0].valid.capacity());
        assert_eq!(samples.1, 4 * 5 * 2);
        assert_eq!(valid.1, 4 * 5);

        let rest = (0..3).map(|_| pool.acquire()).collect::<Vec<_>>();
        assert_eq!(pool.num_blocks(), 1);
        assert_eq!(pool.blocks[0].samples.as_ptr(), samples.0);
        assert_eq!(pool.blocks[0].samples.capacity(), samples.1);
        assert_eq!(pool.blocks[0].valid.as_ptr(), valid.0);
        assert_eq!(pool.blocks[0].valid.capacity(), valid.1);

        // Neighbouring slots do not overlap.
        pool.get_mut(first).set_sample(4, &[1.0, 2.0], &context).unwrap();
        pool.get_mut(rest[0]).set_sample(0, &[3.0, 4.0], &context).unwrap();
        assert_eq!(pool.get(first).value(1, 4), 2.0);
        assert_eq!(pool.get(first).num_valid_samples(), 1);
        assert_eq!(pool.get(rest[0]).value(0, 0), 3.0);
        assert!(!pool.get(rest[0]).is_valid(4));
        assert!(!pool.get(rest[1]).is_valid(0));
    }

    #[test]
    fn test_too_many_variables() {
        assert!(matches!(
            RayPool::new(4, VARIABLE_LIMIT + 1),
            Err(RenderError::TooManyVariables(_))
        ));
    }
}
