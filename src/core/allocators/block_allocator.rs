use crate::core::allocators::{round_up, AllocationStrategy};
use crate::core::slot_pool::{Handle, HandleError, SlotPool};
use failure::Fail;
use log::trace;

/// Largest range a single block allocator may manage.
pub const MAX_ALLOCATOR_SIZE: u64 = 1 << 32;

/// Deepest tree a single block allocator may build.
pub const MAX_ALLOCATOR_HEIGHT: u32 = 20;

/// Failure type for block allocator construction.
#[derive(Fail, Debug, Clone, Copy, Eq, PartialEq)]
pub enum BlockAllocatorError {
    /// The requested range is bigger than a single allocator may manage.
    #[fail(display = "Requested allocator size {} exceeds the limit of {} bytes.", requested, limit)]
    TooLarge {
        /// Requested total size, or `u64::MAX` if computing it overflowed.
        requested: u64,
        /// The size ceiling.
        limit: u64,
    },

    /// The requested tree height is deeper than the allocator supports.
    #[fail(display = "Allocator height {} exceeds the limit of {}.", height, limit)]
    InvalidHeight {
        /// Requested tree height.
        height: u32,
        /// The height ceiling.
        limit: u32,
    },
}

/// How much of a tree node is in use.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Occupation {
    /// Nothing inside the node is allocated.
    Free,

    /// Some, but not all, of the node is allocated.
    Partial,

    /// The node is allocated, or both of its children are.
    Full,
}

/// One allocation made by a [`BlockAllocator`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Block {
    /// Unique (per allocator) id of this block.
    pub id: u64,

    /// Offset of the block from the start of the managed range.
    pub address: u64,

    /// Size of the block, in bytes. Always a power-of-two multiple of the partition size.
    pub size: u64,

    node: usize,
}

/// A maximal free or allocated stretch of the managed range, as reported by [`BlockAllocator::regions`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Region {
    /// Offset of the region from the start of the managed range.
    pub address: u64,

    /// Size of the region, in bytes.
    pub size: u64,

    /// Either `Free` or `Full`. Partially occupied nodes are split into their children.
    pub occupation: Occupation,
}

#[derive(Debug, Clone, Copy)]
struct TreeNode {
    largest_free_block_size: u64,
    occupation: Occupation,
}

/// Buddy allocator over a range of `partition_size * 2^height` bytes
///
/// The range is described by a complete binary tree stored in an array. Node 1 is the root and spans the whole range,
/// node `i` has children `2i` and `2i + 1`, and each level halves the block size until the leaves, which are one
/// partition each. Every node knows the largest free block underneath it, so checking whether a request can possibly
/// fit is a look at the root, and finding a spot is a single walk down the tree.
///
/// Blocks are never moved. When both halves of a node are free again, the node reads as free: coalescing is a property
/// of the recomputed ancestor state rather than an explicit merge.
///
/// This block allocator must be externally synchronized
#[derive(Debug)]
pub struct BlockAllocator {
    alignment: u64,
    partition_size: u64,
    height: u32,
    size: u64,

    /// Indexed by node index, so slot 0 is unused.
    nodes: Vec<TreeNode>,

    blocks: SlotPool<Block>,
    allocated: u64,
    next_block_id: u64,
}

impl BlockAllocator {
    /// Creates a new block allocator
    ///
    /// # Parameters
    ///
    /// * `alignment` - Alignment, in bytes, of every block. If this is zero or 1, blocks should be considered
    /// unaligned
    /// * `partition_size` - Size of the smallest block. Rounded up to a multiple of `alignment`
    /// * `height` - Number of times the whole range is halved to reach a single partition
    pub fn new(alignment: u64, partition_size: u64, height: u32) -> Result<Self, BlockAllocatorError> {
        if height > MAX_ALLOCATOR_HEIGHT {
            return Err(BlockAllocatorError::InvalidHeight {
                height,
                limit: MAX_ALLOCATOR_HEIGHT,
            });
        }

        let partition_size = round_up(partition_size.max(1), alignment.max(1));
        let size = partition_size
            .checked_mul(1 << height)
            .ok_or(BlockAllocatorError::TooLarge {
                requested: u64::MAX,
                limit: MAX_ALLOCATOR_SIZE,
            })?;
        if size > MAX_ALLOCATOR_SIZE {
            return Err(BlockAllocatorError::TooLarge {
                requested: size,
                limit: MAX_ALLOCATOR_SIZE,
            });
        }

        let node_count = 2usize << height;
        let mut allocator = BlockAllocator {
            alignment,
            partition_size,
            height,
            size,
            nodes: Vec::with_capacity(node_count),
            blocks: SlotPool::growable(16),
            allocated: 0,
            next_block_id: 0,
        };
        let nodes = (0..node_count)
            .map(|index| TreeNode {
                largest_free_block_size: if index == 0 { 0 } else { allocator.node_size(index) },
                occupation: Occupation::Free,
            })
            .collect();
        allocator.nodes = nodes;

        Ok(allocator)
    }

    fn node_depth(index: usize) -> u32 {
        (usize::BITS - 1) - index.leading_zeros()
    }

    fn node_size(&self, index: usize) -> u64 {
        self.partition_size << (self.height - Self::node_depth(index))
    }

    fn node_address(&self, index: usize) -> u64 {
        let depth = Self::node_depth(index);
        (self.size >> depth) * (index as u64 - (1 << depth))
    }

    /// Smallest block size able to hold `request`, or `None` if nothing in this allocator ever could.
    fn fit_size(&self, request: u64) -> Option<u64> {
        if request > self.size {
            return None;
        }

        let mut fit = self.partition_size;
        while fit < request {
            fit <<= 1;
        }

        Some(fit)
    }

    /// Recomputes the state of every ancestor of `index`
    fn propagate_up(&mut self, mut index: usize) {
        while index > 1 {
            index /= 2;
            let left = self.nodes[2 * index];
            let right = self.nodes[2 * index + 1];

            self.nodes[index] = match (left.occupation, right.occupation) {
                (Occupation::Full, Occupation::Full) => TreeNode {
                    largest_free_block_size: 0,
                    occupation: Occupation::Full,
                },
                (Occupation::Free, Occupation::Free) => TreeNode {
                    largest_free_block_size: self.node_size(index),
                    occupation: Occupation::Free,
                },
                _ => TreeNode {
                    largest_free_block_size: left.largest_free_block_size.max(right.largest_free_block_size),
                    occupation: Occupation::Partial,
                },
            };
        }
    }

    /// Looks up a live block.
    pub fn block(&self, block: Handle<Block>) -> Result<&Block, HandleError> {
        self.blocks.try_get(block)
    }

    /// Number of bytes not covered by any block.
    pub fn free_space(&self) -> u64 {
        self.size - self.allocated
    }

    /// Number of bytes covered by blocks.
    pub fn occupied_space(&self) -> u64 {
        self.allocated
    }

    /// Size of the largest block that an allocation could currently get.
    pub fn get_largest_free_block_size(&self) -> u64 {
        self.nodes[1].largest_free_block_size
    }

    /// Size of the smallest block this allocator hands out.
    pub fn get_partition_size(&self) -> u64 {
        self.partition_size
    }

    /// Total number of bytes this allocator manages.
    pub fn get_size(&self) -> u64 {
        self.size
    }

    pub fn get_alignment(&self) -> u64 {
        self.alignment
    }

    pub fn get_height(&self) -> u32 {
        self.height
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Lists the current tiling of the managed range, in address order.
    ///
    /// Allocated nodes and free nodes are reported whole; partially used nodes are broken down into their children.
    /// The returned regions never overlap and together cover the entire range.
    pub fn regions(&self) -> Vec<Region> {
        let mut regions = vec![];
        let mut stack = vec![1usize];

        while let Some(index) = stack.pop() {
            let node = self.nodes[index];
            match node.occupation {
                Occupation::Partial => {
                    stack.push(2 * index + 1);
                    stack.push(2 * index);
                }
                occupation => regions.push(Region {
                    address: self.node_address(index),
                    size: self.node_size(index),
                    occupation,
                }),
            }
        }

        regions
    }
}

impl AllocationStrategy for BlockAllocator {
    fn allocate(&mut self, size: u64) -> Handle<Block> {
        let fit = match self.fit_size(size) {
            Some(fit) if self.get_largest_free_block_size() >= fit => fit,
            _ => return Handle::null(),
        };

        // Walk down, always taking the leftmost child that can still hold the request. A node whose largest free
        // block is at least `fit` is either free or has a child which can hold it.
        let mut index = 1;
        while self.node_size(index) > fit {
            let left = 2 * index;
            index = if self.nodes[left].largest_free_block_size >= fit {
                left
            } else {
                left + 1
            };
        }

        let block = Block {
            id: self.next_block_id,
            address: self.node_address(index),
            size: fit,
            node: index,
        };
        let handle = self.blocks.set(block);
        if handle.is_null() {
            return handle;
        }

        self.next_block_id += 1;
        self.allocated += fit;
        self.nodes[index] = TreeNode {
            largest_free_block_size: 0,
            occupation: Occupation::Full,
        };
        self.propagate_up(index);

        trace!("Allocated {} for a request of {} bytes", self.describe_allocation(handle), size);

        handle
    }

    fn release(&mut self, block: Handle<Block>) -> Result<(), HandleError> {
        let block = self.blocks.clear(block)?;

        self.allocated -= block.size;
        self.nodes[block.node] = TreeNode {
            largest_free_block_size: block.size,
            occupation: Occupation::Free,
        };
        self.propagate_up(block.node);

        Ok(())
    }

    fn describe_allocation(&self, block: Handle<Block>) -> String {
        match self.blocks.try_get(block) {
            Ok(block) => format!(
                "block {} at [{:#x}, {:#x}) ({} bytes, node {})",
                block.id,
                block.address,
                block.address + block.size,
                block.size,
                block.node
            ),
            Err(err) => format!("{:?} ({})", block, err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use matches::assert_matches;

    /// Checks the occupation invariant on every internal node.
    fn check_tree(allocator: &BlockAllocator) {
        for index in 1..(1usize << allocator.height) {
            let node = allocator.nodes[index];
            let left = allocator.nodes[2 * index];
            let right = allocator.nodes[2 * index + 1];

            // Nodes below a directly allocated node keep their free state, so only check what a walk could reach.
            if node.occupation == Occupation::Full && !(left.occupation == Occupation::Full && right.occupation == Occupation::Full)
            {
                assert_eq!(node.largest_free_block_size, 0);
                continue;
            }
            if node.occupation == Occupation::Free {
                assert_eq!(node.largest_free_block_size, allocator.node_size(index));
                continue;
            }

            let expected = match (left.occupation, right.occupation) {
                (Occupation::Full, Occupation::Full) => Occupation::Full,
                (Occupation::Free, Occupation::Free) => Occupation::Free,
                _ => Occupation::Partial,
            };
            assert_eq!(node.occupation, expected, "node {}", index);
            if expected == Occupation::Partial {
                assert_eq!(
                    node.largest_free_block_size,
                    left.largest_free_block_size.max(right.largest_free_block_size),
                    "node {}",
                    index
                );
            }
        }
    }

    /// Checks that the reported regions tile the range and agree with the live blocks.
    fn check_tiling(allocator: &BlockAllocator) {
        let regions = allocator.regions();
        let mut cursor = 0;
        let mut full = 0;
        for region in &regions {
            assert_eq!(region.address, cursor);
            assert_ne!(region.occupation, Occupation::Partial);
            if region.occupation == Occupation::Full {
                full += region.size;
            }
            cursor += region.size;
        }
        assert_eq!(cursor, allocator.get_size());
        assert_eq!(full, allocator.occupied_space());
    }

    #[test]
    fn scenario_small_then_larger() {
        let mut allocator = BlockAllocator::new(1, 64, 4).unwrap();
        assert_eq!(allocator.get_size(), 1024);

        let first = allocator.allocate(50);
        let second = allocator.allocate(100);

        let a = allocator.block(first).unwrap().clone();
        let b = allocator.block(second).unwrap().clone();
        assert_eq!(a.size, 64);
        assert_eq!(b.size, 128);
        assert!(a.address + a.size <= b.address || b.address + b.size <= a.address);

        allocator.release(first).unwrap();
        let again = allocator.allocate(50);
        assert_eq!(allocator.block(again).unwrap().address, a.address);
        check_tree(&allocator);
        check_tiling(&allocator);
    }

    #[test]
    fn node_geometry() {
        let allocator = BlockAllocator::new(1, 64, 4).unwrap();
        assert_eq!(allocator.node_size(1), 1024);
        assert_eq!(allocator.node_address(1), 0);
        assert_eq!(allocator.node_size(3), 512);
        assert_eq!(allocator.node_address(3), 512);
        assert_eq!(allocator.node_size(16), 64);
        assert_eq!(allocator.node_address(31), 960);
    }

    #[test]
    fn zero_and_whole_requests() {
        let mut allocator = BlockAllocator::new(1, 64, 4).unwrap();

        let tiny = allocator.allocate(0);
        assert_eq!(allocator.block(tiny).unwrap().size, 64);

        // The root is no longer free, so nothing of the full size fits.
        assert!(allocator.allocate(1024).is_null());
        allocator.release(tiny).unwrap();

        let whole = allocator.allocate(1000);
        let block = allocator.block(whole).unwrap();
        assert_eq!((block.address, block.size), (0, 1024));
        assert_eq!(allocator.get_largest_free_block_size(), 0);
        assert!(allocator.allocate(0).is_null());

        assert!(allocator.allocate(1025).is_null());
    }

    #[test]
    fn exhaustion_returns_null() {
        let mut allocator = BlockAllocator::new(1, 64, 2).unwrap();
        let blocks: Vec<_> = (0..4).map(|_| allocator.allocate(64)).collect();
        assert!(blocks.iter().all(|block| !block.is_null()));
        assert_eq!(allocator.free_space(), 0);
        assert!(allocator.allocate(1).is_null());
    }

    #[test]
    fn fragmentation_blocks_large_requests() {
        let mut allocator = BlockAllocator::new(1, 64, 2).unwrap();
        let blocks: Vec<_> = (0..4).map(|_| allocator.allocate(64)).collect();
        allocator.release(blocks[0]).unwrap();
        allocator.release(blocks[2]).unwrap();

        // 128 bytes are free, but not contiguously.
        assert_eq!(allocator.free_space(), 128);
        assert_eq!(allocator.get_largest_free_block_size(), 64);
        assert!(allocator.allocate(128).is_null());

        allocator.release(blocks[1]).unwrap();
        assert_eq!(allocator.get_largest_free_block_size(), 128);
        assert!(!allocator.allocate(128).is_null());
    }

    #[test]
    fn release_coalesces_to_root() {
        let mut allocator = BlockAllocator::new(1, 32, 5).unwrap();
        let blocks: Vec<_> = [10, 70, 32, 200, 1].iter().map(|size| allocator.allocate(*size)).collect();
        for block in blocks {
            allocator.release(block).unwrap();
        }

        assert_eq!(allocator.nodes[1].occupation, Occupation::Free);
        assert_eq!(allocator.get_largest_free_block_size(), allocator.get_size());
        assert_eq!(allocator.regions().len(), 1);
    }

    #[test]
    fn double_release_fails_cleanly() {
        let mut allocator = BlockAllocator::new(1, 64, 3).unwrap();
        let a = allocator.allocate(64);
        let b = allocator.allocate(64);
        allocator.release(a).unwrap();

        assert_matches!(allocator.release(a), Err(HandleError::Stale { .. }));
        assert_eq!(allocator.occupied_space(), 64);
        assert!(allocator.block(b).is_ok());
        check_tree(&allocator);
        check_tiling(&allocator);
    }

    #[test]
    fn partition_size_rounds_to_alignment() {
        let allocator = BlockAllocator::new(48, 50, 3).unwrap();
        assert_eq!(allocator.get_partition_size(), 96);
        assert_eq!(allocator.get_size(), 96 * 8);
    }

    #[test]
    fn oversized_allocators_are_rejected() {
        assert_matches!(
            BlockAllocator::new(1, MAX_ALLOCATOR_SIZE, 1),
            Err(BlockAllocatorError::TooLarge { .. })
        );
        assert_matches!(
            BlockAllocator::new(1, 1, MAX_ALLOCATOR_HEIGHT + 1),
            Err(BlockAllocatorError::InvalidHeight {
                height: 21,
                limit: MAX_ALLOCATOR_HEIGHT
            })
        );
        if let Err(err) = BlockAllocator::new(1, 1, 25) {
            assert_eq!(err.to_string(), "Allocator height 25 exceeds the limit of 20.");
        }
        assert_matches!(
            BlockAllocator::new(1, u64::MAX / 2, 4),
            Err(BlockAllocatorError::TooLarge { .. })
        );
    }

    #[test]
    fn random_sequences_keep_invariants() {
        let mut allocator = BlockAllocator::new(16, 16, 8).unwrap();
        let mut live: Vec<Handle<Block>> = vec![];
        let mut state = 0x2545_f491_u64;

        for _ in 0..2000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;

            if state % 3 == 0 && !live.is_empty() {
                let victim = live.swap_remove((state as usize / 3) % live.len());
                allocator.release(victim).unwrap();
            } else {
                let request = (state >> 8) % 600;
                let handle = allocator.allocate(request);
                if !handle.is_null() {
                    let block = allocator.block(handle).unwrap();
                    assert!(block.size >= request);
                    assert_eq!(block.address % block.size, 0);
                    live.push(handle);
                }
            }

            check_tree(&allocator);
            check_tiling(&allocator);
        }

        // Live blocks are pairwise disjoint.
        let mut ranges: Vec<_> = live
            .iter()
            .map(|handle| {
                let block = allocator.block(*handle).unwrap();
                (block.address, block.address + block.size)
            })
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }
    }
}
