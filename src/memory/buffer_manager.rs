use crate::core::slot_pool::{Handle, HandleError, SlotPool};
use crate::memory::buffer::{Buffer, BufferError, BufferLayout, Reservation};
use crate::rhi::{BufferUsage, CommandList, Device, MemoryError, QueueType, SharingMode};
use crate::settings::{MemorySettings, SettingsError};
use failure::Fail;
use log::{debug, trace};
use std::fmt;
use std::mem;

/// Where some reserved bytes live: which buffer, and which reservation inside it
///
/// Callers hold handles to addresses rather than to buffers, so they don't need to care which physical buffer ended
/// up backing their data.
pub struct BufferAddress<D: Device> {
    /// The buffer holding the bytes.
    pub buffer: Handle<Buffer<D>>,

    /// The reservation inside `buffer`.
    pub reservation: Handle<Reservation>,

    /// Number of bytes that were asked for.
    pub size: u64,
}

impl<D: Device> Clone for BufferAddress<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: Device> Copy for BufferAddress<D> {}

impl<D: Device> PartialEq for BufferAddress<D> {
    fn eq(&self, other: &Self) -> bool {
        self.buffer == other.buffer && self.reservation == other.reservation && self.size == other.size
    }
}

impl<D: Device> Eq for BufferAddress<D> {}

impl<D: Device> fmt::Debug for BufferAddress<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferAddress")
            .field("buffer", &self.buffer)
            .field("reservation", &self.reservation)
            .field("size", &self.size)
            .finish()
    }
}

/// Everything needed to point a command at an address.
pub struct BufferAccessData<'a, D: Device> {
    /// The device buffer holding the bytes.
    pub buffer: &'a D::Buffer,

    /// Handle of the buffer holding the bytes.
    pub buffer_handle: Handle<Buffer<D>>,

    /// Offset of the bytes from the start of `buffer`.
    pub offset: u64,

    /// Number of bytes that were asked for.
    pub size: u64,

    /// Number of bytes actually set aside, at least `size`.
    pub reserved_size: u64,
}

impl<'a, D: Device> fmt::Debug for BufferAccessData<'a, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferAccessData")
            .field("buffer_handle", &self.buffer_handle)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("reserved_size", &self.reserved_size)
            .finish()
    }
}

/// Failure type for the buffer manager.
#[derive(Fail, Debug)]
pub enum ManagerError {
    #[fail(display = "Buffer operation failed: {}", sub_error)]
    Buffer {
        #[fail(cause)]
        sub_error: BufferError,
    },

    #[fail(display = "Invalid buffer or address handle: {}", sub_error)]
    InvalidHandle {
        #[fail(cause)]
        sub_error: HandleError,
    },

    #[fail(display = "Buffer {} still has {} live reservations.", buffer, live)]
    BufferInUse { buffer: u64, live: usize },

    #[fail(display = "A new buffer could not hold a reservation of {} bytes.", size)]
    ReservationFailed { size: u64 },

    #[fail(display = "Could not create the transfer command list or fence: {}", sub_error)]
    TransferSetup {
        #[fail(cause)]
        sub_error: MemoryError,
    },

    #[fail(display = "Invalid memory settings: {}", sub_error)]
    Settings {
        #[fail(cause)]
        sub_error: SettingsError,
    },
}

impl From<BufferError> for ManagerError {
    fn from(sub_error: BufferError) -> Self {
        ManagerError::Buffer { sub_error }
    }
}

impl From<HandleError> for ManagerError {
    fn from(sub_error: HandleError) -> Self {
        ManagerError::InvalidHandle { sub_error }
    }
}

impl From<MemoryError> for ManagerError {
    fn from(sub_error: MemoryError) -> Self {
        ManagerError::TransferSetup { sub_error }
    }
}

impl From<SettingsError> for ManagerError {
    fn from(sub_error: SettingsError) -> Self {
        ManagerError::Settings { sub_error }
    }
}

fn resolve<'a, D: Device>(
    buffers: &'a SlotPool<Buffer<D>>,
    addresses: &SlotPool<BufferAddress<D>>,
    address: Handle<BufferAddress<D>>,
) -> Result<BufferAccessData<'a, D>, ManagerError> {
    let address = addresses.try_get(address)?;
    let buffer = buffers.try_get(address.buffer)?;
    let reservation = buffer.reservation(address.reservation)?;

    Ok(BufferAccessData {
        buffer: buffer.raw(),
        buffer_handle: address.buffer,
        offset: reservation.offset,
        size: address.size,
        reserved_size: reservation.size,
    })
}

/// Owns every buffer, and decides which one each request lands in
///
/// A request is served by the first buffer with the same usage and sharing mode that still has a big enough free block.
/// When there's none, a new buffer is created for it, so running out of space in existing buffers is never an error.
/// Only the device refusing to hand out more memory is.
///
/// Exclusive buffers can't be written by the CPU. Data for them goes into a staging reservation first, and a copy is
/// recorded into the manager's transfer command list. Nothing reaches the exclusive buffer until
/// [`flush_transfers`](#method.flush_transfers) submits that list and waits for it.
///
/// Destroying a buffer while addresses still point into it is refused: see
/// [`release_buffer`](#method.release_buffer).
pub struct BufferManager<D: Device> {
    device: D,
    settings: MemorySettings,

    buffers: SlotPool<Buffer<D>>,
    addresses: SlotPool<BufferAddress<D>>,

    /// Number of buffers ever created. Doubles as the id of the next buffer.
    buffers_created: u64,

    transfer_list: D::CommandList,
    transfer_fence: D::Fence,
    pending_transfers: usize,
    pending_staging: Vec<Handle<BufferAddress<D>>>,
}

impl<D: Device> BufferManager<D> {
    /// Creates a buffer manager with no buffers yet
    ///
    /// # Parameters
    ///
    /// * `device` - The device every buffer is created from.
    /// * `settings` - How new buffers get laid out.
    pub fn new(device: D, settings: MemorySettings) -> Result<Self, ManagerError> {
        settings.validate()?;

        let transfer_list = device.create_command_list(QueueType::Copy)?;
        let transfer_fence = device.create_fence(true)?;

        Ok(BufferManager {
            device,
            settings,
            buffers: SlotPool::growable(8),
            addresses: SlotPool::growable(256),
            buffers_created: 0,
            transfer_list,
            transfer_fence,
            pending_transfers: 0,
            pending_staging: vec![],
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    /// Reserves `size` bytes in a buffer with exactly the given usage and sharing mode
    ///
    /// Existing buffers are tried in order; a new buffer is created if none of them has room.
    pub fn reserve_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
        sharing: SharingMode,
    ) -> Result<Handle<BufferAddress<D>>, ManagerError> {
        let compatible = self
            .buffers
            .iter()
            .find(|(_, buffer)| buffer.check_compatibility(usage, sharing, size))
            .map(|(handle, _)| handle);
        let buffer_handle = match compatible {
            Some(handle) => handle,
            None => self.create_buffer(size, usage, sharing)?,
        };

        let buffer = self.buffers.try_get_mut(buffer_handle)?;
        let reservation = buffer.reserve(size);
        if reservation.is_null() {
            return Err(ManagerError::ReservationFailed { size });
        }
        trace!("Reserved {} bytes in buffer {}", size, buffer.id());

        Ok(self.addresses.set(BufferAddress {
            buffer: buffer_handle,
            reservation,
            size,
        }))
    }

    fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
        sharing: SharingMode,
    ) -> Result<Handle<Buffer<D>>, ManagerError> {
        let (partition_size, partition_count) = if usage == BufferUsage::STAGING {
            (self.settings.staging_partition_size, self.settings.staging_partition_count)
        } else {
            (self.settings.partition_size, self.settings.partition_count)
        };
        // Grow the partitions until the whole buffer can hold the request.
        let partition_size = partition_size.max(size / partition_count + u64::from(size % partition_count != 0));

        let buffer = Buffer::new(
            &self.device,
            self.buffers_created,
            BufferLayout {
                partition_size,
                partition_count,
                usage,
                sharing,
            },
        )?;
        self.buffers_created += 1;

        Ok(self.buffers.set(buffer))
    }

    /// Resolves an address to the buffer, offset and size that commands need.
    pub fn get_buffer_access_data(
        &self,
        address: Handle<BufferAddress<D>>,
    ) -> Result<BufferAccessData<'_, D>, ManagerError> {
        resolve(&self.buffers, &self.addresses, address)
    }

    /// Writes `data` straight into an address's memory
    ///
    /// The write is clamped to the reserved size. Exclusive addresses can't be written this way and nothing happens;
    /// use [`copy_to_buffer`](#method.copy_to_buffer) for them.
    ///
    /// Returns the number of bytes written.
    pub fn memory_copy(&mut self, address: Handle<BufferAddress<D>>, data: &[u8]) -> Result<u64, ManagerError> {
        let address = *self.addresses.try_get(address)?;
        let buffer = self.buffers.try_get_mut(address.buffer)?;

        Ok(buffer.copy_data(address.reservation, data)?)
    }

    /// Writes `data` to an address, whatever its sharing mode
    ///
    /// Host-visible addresses are written immediately. Exclusive addresses get a staging reservation and a copy
    /// recorded into the transfer list, which lands once [`flush_transfers`](#method.flush_transfers) runs.
    pub fn copy_to_buffer(&mut self, address: Handle<BufferAddress<D>>, data: &[u8]) -> Result<(), ManagerError> {
        let access = self.get_buffer_access_data(address)?;
        let sharing = self.buffers.try_get(access.buffer_handle)?.sharing();
        let len = (data.len() as u64).min(access.reserved_size);

        match sharing {
            SharingMode::HostVisible => {
                self.memory_copy(address, data)?;
            }
            SharingMode::Exclusive if len > 0 => {
                let staging = self.reserve_buffer(len, BufferUsage::STAGING, SharingMode::HostVisible)?;
                self.memory_copy(staging, &data[..len as usize])?;
                self.record_copy(staging, address, len)?;
                self.pending_staging.push(staging);
            }
            SharingMode::Exclusive => {}
        }

        Ok(())
    }

    /// Records a copy of `num_bytes` between two addresses into the transfer list.
    fn record_copy(
        &mut self,
        source: Handle<BufferAddress<D>>,
        destination: Handle<BufferAddress<D>>,
        num_bytes: u64,
    ) -> Result<(), ManagerError> {
        let source = resolve(&self.buffers, &self.addresses, source)?;
        let destination = resolve(&self.buffers, &self.addresses, destination)?;
        self.transfer_list.copy_buffer(
            destination.buffer,
            destination.offset,
            source.buffer,
            source.offset,
            num_bytes,
        );
        self.pending_transfers += 1;

        Ok(())
    }

    /// Number of copies recorded into the transfer list and not yet flushed.
    pub fn pending_transfer_count(&self) -> usize {
        self.pending_transfers
    }

    /// Submits the transfer list, waits for it to finish, and releases the staging memory it used
    ///
    /// Returns the number of copies that were flushed.
    pub fn flush_transfers(&mut self) -> Result<usize, ManagerError> {
        if self.pending_transfers == 0 {
            return Ok(0);
        }

        self.transfer_list.end();
        self.device.reset_fences(&[&self.transfer_fence]);
        self.device
            .submit_commands(&mut self.transfer_list, Some(&self.transfer_fence));
        self.device.wait_for_fences(&[&self.transfer_fence]);
        self.transfer_list.begin();

        let flushed = mem::replace(&mut self.pending_transfers, 0);
        for staging in mem::take(&mut self.pending_staging) {
            self.release_address(staging)?;
        }
        debug!("Flushed {} buffer transfers", flushed);

        Ok(flushed)
    }

    /// Reads back the bytes at an address
    ///
    /// Exclusive addresses are copied to a staging reservation first, which flushes the transfer list.
    pub fn read_buffer(&mut self, address: Handle<BufferAddress<D>>) -> Result<Vec<u8>, ManagerError> {
        let target = *self.addresses.try_get(address)?;
        let sharing = self.buffers.try_get(target.buffer)?.sharing();

        match sharing {
            SharingMode::HostVisible => Ok(self.buffers.try_get(target.buffer)?.read_data(target.reservation)?),
            SharingMode::Exclusive => {
                let staging = self.reserve_buffer(target.size, BufferUsage::STAGING, SharingMode::HostVisible)?;
                self.record_copy(address, staging, target.size)?;
                self.flush_transfers()?;

                let staged = *self.addresses.try_get(staging)?;
                let data = self.buffers.try_get(staged.buffer)?.read_data(staged.reservation)?;
                self.release_address(staging)?;

                Ok(data)
            }
        }
    }

    /// Gives an address's bytes back to its buffer and invalidates the address.
    ///
    /// Releasing an address twice fails.
    pub fn release_address(&mut self, address: Handle<BufferAddress<D>>) -> Result<(), ManagerError> {
        let address = self.addresses.clear(address)?;
        let buffer = self.buffers.try_get_mut(address.buffer)?;

        Ok(buffer.unreserve(address.reservation)?)
    }

    /// Destroys a buffer
    ///
    /// The buffer must be empty. Every address owns a reservation, so an empty buffer has no addresses pointing into
    /// it.
    pub fn release_buffer(&mut self, buffer: Handle<Buffer<D>>) -> Result<(), ManagerError> {
        let (id, live) = {
            let buffer = self.buffers.try_get(buffer)?;
            (buffer.id(), buffer.reservation_count())
        };
        if live > 0 {
            return Err(ManagerError::BufferInUse { buffer: id, live });
        }

        let buffer = self.buffers.clear(buffer)?;
        buffer.destroy(&self.device);

        Ok(())
    }

    /// Looks up a live buffer.
    pub fn buffer(&self, buffer: Handle<Buffer<D>>) -> Result<&Buffer<D>, HandleError> {
        self.buffers.try_get(buffer)
    }

    /// Looks up a live address.
    pub fn address(&self, address: Handle<BufferAddress<D>>) -> Result<&BufferAddress<D>, HandleError> {
        self.addresses.try_get(address)
    }

    /// All live buffers, in creation slot order.
    pub fn buffers(&self) -> impl Iterator<Item = (Handle<Buffer<D>>, &Buffer<D>)> + '_ {
        self.buffers.iter()
    }

    /// Number of live buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of buffers created over the manager's lifetime.
    pub fn buffers_created(&self) -> u64 {
        self.buffers_created
    }

    /// Number of live addresses.
    pub fn address_count(&self) -> usize {
        self.addresses.len()
    }
}

impl<D: Device> fmt::Debug for BufferManager<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("settings", &self.settings)
            .field("buffers", &self.buffers.len())
            .field("addresses", &self.addresses.len())
            .field("buffers_created", &self.buffers_created)
            .field("pending_transfers", &self.pending_transfers)
            .finish()
    }
}

impl<D: Device> Drop for BufferManager<D> {
    fn drop(&mut self) {
        for buffer in self.buffers.drain() {
            buffer.destroy(&self.device);
        }
    }
}
