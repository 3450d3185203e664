#![allow(unsafe_code)]

use crate::core::allocators::{AllocationStrategy, Block, BlockAllocator, BlockAllocatorError};
use crate::core::slot_pool::{Handle, HandleError, SlotPool};
use crate::rhi::{
    AllocationError, BufferCreateInfo, BufferUsage, Device, MappingError, Memory, MemoryError, MemoryUsage, ObjectType,
    SharingMode,
};
use failure::Fail;
use log::{debug, error, trace};
use std::fmt;
use std::ptr::{self, NonNull};

/// A sub-allocation inside a [`Buffer`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Reservation {
    /// Offset of the reservation from the start of its buffer.
    pub offset: u64,

    /// Bytes actually set aside. At least `requested_size`, rounded up to a block size.
    pub size: u64,

    /// Bytes the caller asked for.
    pub requested_size: u64,

    block: Handle<Block>,
}

/// How a new [`Buffer`] should be laid out.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BufferLayout {
    /// Estimated size of one element. Becomes the size of the smallest block.
    pub partition_size: u64,

    /// Number of smallest blocks the buffer holds. Must be a power of two.
    pub partition_count: u64,

    /// What the buffer may be used for.
    pub usage: BufferUsage,

    /// Who may access the buffer's memory.
    pub sharing: SharingMode,
}

/// Failure type for buffer operations.
#[derive(Fail, Debug)]
pub enum BufferError {
    #[fail(display = "Partition count {} is not a power of two.", _0)]
    InvalidPartitionCount(u64),

    #[fail(display = "Could not build the buffer's block allocator: {}", sub_error)]
    Allocator {
        #[fail(cause)]
        sub_error: BlockAllocatorError,
    },

    #[fail(display = "The device could not allocate memory for the buffer: {}", sub_error)]
    DeviceAllocation {
        #[fail(cause)]
        sub_error: AllocationError,
    },

    #[fail(display = "The device could not create the buffer: {}", sub_error)]
    Memory {
        #[fail(cause)]
        sub_error: MemoryError,
    },

    #[fail(display = "Could not map the buffer's memory: {}", sub_error)]
    Mapping {
        #[fail(cause)]
        sub_error: MappingError,
    },

    /// The reservation was already released.
    #[fail(display = "Double release of a buffer reservation.")]
    DoubleRelease,

    #[fail(display = "Stale reservation: {}", sub_error)]
    StaleReservation {
        #[fail(cause)]
        sub_error: HandleError,
    },
}

impl From<BlockAllocatorError> for BufferError {
    fn from(sub_error: BlockAllocatorError) -> Self {
        BufferError::Allocator { sub_error }
    }
}

impl From<AllocationError> for BufferError {
    fn from(sub_error: AllocationError) -> Self {
        BufferError::DeviceAllocation { sub_error }
    }
}

impl From<MemoryError> for BufferError {
    fn from(sub_error: MemoryError) -> Self {
        BufferError::Memory { sub_error }
    }
}

impl From<MappingError> for BufferError {
    fn from(sub_error: MappingError) -> Self {
        BufferError::Mapping { sub_error }
    }
}

impl From<HandleError> for BufferError {
    fn from(sub_error: HandleError) -> Self {
        BufferError::StaleReservation { sub_error }
    }
}

/// One device buffer, and the bookkeeping to serve many reservations out of it
///
/// The buffer owns a single memory allocation and a [`BlockAllocator`] spanning it. Host-visible buffers are mapped
/// once, when they're created, and stay mapped until they're destroyed.
///
/// Buffers can't release their device objects on drop since they don't hold on to the device. Call
/// [`destroy`](#method.destroy) instead.
pub struct Buffer<D: Device> {
    id: u64,
    usage: BufferUsage,
    sharing: SharingMode,
    memory_usage: MemoryUsage,

    allocator: BlockAllocator,
    reservations: SlotPool<Reservation>,

    memory: D::Memory,
    buffer: D::Buffer,

    /// Start of the mapped memory, for host-visible buffers.
    mapped: Option<NonNull<u8>>,
}

impl<D: Device> Buffer<D> {
    /// Creates a buffer and the memory backing it
    ///
    /// # Parameters
    ///
    /// * `device` - The device to allocate from.
    /// * `id` - Id of the buffer, used in logs.
    /// * `layout` - How big the buffer is and what it's for.
    pub fn new(device: &D, id: u64, layout: BufferLayout) -> Result<Self, BufferError> {
        if !layout.partition_count.is_power_of_two() {
            return Err(BufferError::InvalidPartitionCount(layout.partition_count));
        }
        let height = layout.partition_count.trailing_zeros();

        let requirements = device.get_buffer_requirements(
            layout.partition_size.saturating_mul(layout.partition_count),
            layout.usage,
            layout.sharing,
        );
        let allocator = BlockAllocator::new(requirements.alignment, layout.partition_size, height)?;
        let size = allocator.get_size();

        let memory_usage = if layout.usage == BufferUsage::STAGING {
            MemoryUsage::StagingBuffer
        } else {
            layout.sharing.memory_usage()
        };
        let memory = device.allocate_memory(size, memory_usage, ObjectType::Buffer)?;
        let buffer = match memory.create_buffer(BufferCreateInfo {
            size,
            offset: 0,
            buffer_usage: layout.usage,
            sharing: layout.sharing,
        }) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.free_memory(memory);
                return Err(err.into());
            }
        };

        let mapped = match layout.sharing {
            SharingMode::Exclusive => None,
            SharingMode::HostVisible => match memory.map() {
                Ok(pointer) => Some(pointer),
                Err(err) => {
                    device.destroy_buffer(buffer);
                    device.free_memory(memory);
                    return Err(err.into());
                }
            },
        };

        debug!(
            "Created buffer {} ({} bytes, {} byte partitions, {:?}, {:?})",
            id,
            size,
            allocator.get_partition_size(),
            layout.usage,
            layout.sharing
        );

        Ok(Buffer {
            id,
            usage: layout.usage,
            sharing: layout.sharing,
            memory_usage,
            allocator,
            reservations: SlotPool::growable(64),
            memory,
            buffer,
            mapped,
        })
    }

    /// Sets aside at least `size` bytes of this buffer. Returns the null handle if there's no room.
    pub fn reserve(&mut self, size: u64) -> Handle<Reservation> {
        let block_handle = self.allocator.allocate(size);
        let block = match self.allocator.block(block_handle) {
            Ok(block) => block,
            Err(_) => {
                trace!("Buffer {} has no room for {} bytes", self.id, size);
                return Handle::null();
            }
        };

        let reservation = Reservation {
            offset: block.address,
            size: block.size,
            requested_size: size,
            block: block_handle,
        };
        let handle = self.reservations.set(reservation);
        if handle.is_null() {
            // Can't happen with a growable pool, but don't leak the block if it ever does.
            let _ = self.allocator.release(block_handle);
        }

        handle
    }

    /// Gives a reservation's bytes back to the buffer.
    ///
    /// Releasing the same reservation twice is an error and leaves the buffer untouched.
    pub fn unreserve(&mut self, reservation: Handle<Reservation>) -> Result<(), BufferError> {
        let reservation = match self.reservations.clear(reservation) {
            Ok(reservation) => reservation,
            Err(err) => {
                error!("Double release of {:?} in buffer {}: {}", reservation, self.id, err);
                return Err(BufferError::DoubleRelease);
            }
        };

        self.allocator.release(reservation.block).map_err(|err| {
            error!("Reservation's block in buffer {} was already released: {}", self.id, err);
            BufferError::DoubleRelease
        })
    }

    /// Looks up a live reservation.
    pub fn reservation(&self, reservation: Handle<Reservation>) -> Result<&Reservation, HandleError> {
        self.reservations.try_get(reservation)
    }

    /// Writes `data` to the start of a reservation
    ///
    /// Host-visible buffers are written directly, clamped to the size of the reservation. Exclusive buffers can't be
    /// written from the CPU, so nothing happens here: their data arrives through a copy from a staging buffer.
    ///
    /// Returns the number of bytes written.
    pub fn copy_data(&mut self, reservation: Handle<Reservation>, data: &[u8]) -> Result<u64, BufferError> {
        let reservation = self.reservations.try_get(reservation)?;

        match self.mapped {
            None => {
                trace!("Buffer {} is exclusive, copy of {} bytes deferred", self.id, data.len());
                Ok(0)
            }
            Some(pointer) => {
                let len = reservation.size.min(data.len() as u64);
                // The reservation lies inside the mapped range, and `len` never exceeds the reservation.
                unsafe {
                    ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        pointer.as_ptr().add(reservation.offset as usize),
                        len as usize,
                    );
                }

                Ok(len)
            }
        }
    }

    /// Reads back the requested bytes of a reservation in a host-visible buffer.
    pub fn read_data(&self, reservation: Handle<Reservation>) -> Result<Vec<u8>, BufferError> {
        let reservation = self.reservations.try_get(reservation)?;
        let pointer = self.mapped.ok_or(MappingError::ResourceInDeviceMemory)?;

        let mut data = vec![0; reservation.requested_size as usize];
        unsafe {
            ptr::copy_nonoverlapping(
                pointer.as_ptr().add(reservation.offset as usize),
                data.as_mut_ptr(),
                data.len(),
            );
        }

        Ok(data)
    }

    /// Whether a request could be served by this buffer right now.
    pub fn check_compatibility(&self, usage: BufferUsage, sharing: SharingMode, requested_size: u64) -> bool {
        self.usage == usage && self.sharing == sharing && self.allocator.get_largest_free_block_size() >= requested_size
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn sharing(&self) -> SharingMode {
        self.sharing
    }

    /// Kind of memory the buffer was allocated from.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.memory_usage
    }

    /// Total size of the buffer, in bytes.
    pub fn size(&self) -> u64 {
        self.allocator.get_size()
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Number of live reservations.
    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    /// The device's buffer object, for recording commands against.
    pub fn raw(&self) -> &D::Buffer {
        &self.buffer
    }

    /// Unmaps the buffer if it was mapped, then frees its device objects.
    pub fn destroy(self, device: &D) {
        if self.mapped.is_some() {
            self.memory.unmap();
        }

        debug!(
            "Destroying buffer {} with {} live reservations",
            self.id,
            self.reservations.len()
        );
        device.destroy_buffer(self.buffer);
        device.free_memory(self.memory);
    }
}

impl<D: Device> fmt::Debug for Buffer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("usage", &self.usage)
            .field("sharing", &self.sharing)
            .field("memory_usage", &self.memory_usage)
            .field("size", &self.size())
            .field("reservations", &self.reservations.len())
            .field("largest_free_block_size", &self.allocator.get_largest_free_block_size())
            .finish()
    }
}
