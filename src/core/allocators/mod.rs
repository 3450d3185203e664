mod block_allocator;

use crate::core::slot_pool::{Handle, HandleError};

pub use block_allocator::{
    Block, BlockAllocator, BlockAllocatorError, Occupation, Region, MAX_ALLOCATOR_HEIGHT, MAX_ALLOCATOR_SIZE,
};

/// A strategy for carving blocks out of a fixed range of memory.
pub trait AllocationStrategy {
    /// Allocates a block of at least `size` bytes, or returns the null handle if no free block is big enough.
    fn allocate(&mut self, size: u64) -> Handle<Block>;

    /// Returns a block to the strategy. Releasing a handle twice fails.
    fn release(&mut self, block: Handle<Block>) -> Result<(), HandleError>;

    /// Human-readable description of a block, for logs.
    fn describe_allocation(&self, block: Handle<Block>) -> String;
}

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub fn align(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    (value + (alignment - 1)) & !(alignment - 1)
}

/// Rounds `value` up to the next multiple of `multiple`, which may be any non-zero number.
pub fn round_up(value: u64, multiple: u64) -> u64 {
    if multiple <= 1 {
        return value;
    }
    ((value + multiple - 1) / multiple) * multiple
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn align_to_powers_of_two() {
        assert_eq!(align(0, 16), 0);
        assert_eq!(align(1, 16), 16);
        assert_eq!(align(16, 16), 16);
        assert_eq!(align(17, 16), 32);
        assert_eq!(align(17, 1), 17);
    }

    #[test]
    fn round_up_to_arbitrary_multiples() {
        assert_eq!(round_up(50, 48), 96);
        assert_eq!(round_up(48, 48), 48);
        assert_eq!(round_up(7, 0), 7);
    }
}
