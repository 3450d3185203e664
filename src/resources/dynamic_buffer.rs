use crate::core::slot_pool::Handle;
use crate::memory::{Buffer, BufferAddress, BufferManager};
use crate::resources::{FrameReplicated, FrameResource, ResourceError};
use crate::rhi::{BufferUsage, CommandList, Device, SharingMode};
use bytemuck::Pod;
use log::trace;
use std::fmt;

/// CPU-side bytes of a [`DynamicBuffer`].
#[derive(Debug, Clone)]
pub struct DynamicBufferData {
    data: Vec<u8>,
    usage: BufferUsage,
    sharing: SharingMode,
}

impl DynamicBufferData {
    pub fn new(usage: BufferUsage, sharing: SharingMode, data: Vec<u8>) -> Self {
        DynamicBufferData { data, usage, sharing }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn sharing(&self) -> SharingMode {
        self.sharing
    }
}

/// One frame's copy of a [`DynamicBuffer`].
pub struct DynamicBufferSlot<D: Device> {
    /// Where the copy lives.
    pub address: Handle<BufferAddress<D>>,

    /// Bytes reserved at `address`.
    pub capacity: u64,

    /// Bytes of the copy in use.
    pub size: u64,

    /// Staging reservation of the last upload. Exclusive buffers only.
    ///
    /// The GPU may still be copying out of it until this slot comes around again.
    pub staging: Option<Handle<BufferAddress<D>>>,
}

impl<D: Device> fmt::Debug for DynamicBufferSlot<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicBufferSlot")
            .field("address", &self.address)
            .field("capacity", &self.capacity)
            .field("size", &self.size)
            .field("staging", &self.staging)
            .finish()
    }
}

/// The range a shader should bind for one frame's copy of a [`DynamicBuffer`].
pub struct BufferRange<D: Device> {
    pub buffer: Handle<Buffer<D>>,
    pub offset: u64,
    pub size: u64,
}

impl<D: Device> Clone for BufferRange<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: Device> Copy for BufferRange<D> {}

impl<D: Device> PartialEq for BufferRange<D> {
    fn eq(&self, other: &Self) -> bool {
        self.buffer == other.buffer && self.offset == other.offset && self.size == other.size
    }
}

impl<D: Device> fmt::Debug for BufferRange<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRange")
            .field("buffer", &self.buffer)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// A buffer the CPU rewrites every now and then, like a uniform buffer of per-frame constants
///
/// Each frame in flight gets its own copy, so writing the buffer never stomps on data the GPU is still reading.
pub type DynamicBuffer<D, const COPIES: usize> = FrameReplicated<D, DynamicBufferData, COPIES>;

impl<D: Device, const COPIES: usize> FrameReplicated<D, DynamicBufferData, COPIES> {
    /// Creates a dynamic buffer holding `data`.
    pub fn from_bytes(usage: BufferUsage, sharing: SharingMode, data: Vec<u8>) -> Self {
        FrameReplicated::new(DynamicBufferData::new(usage, sharing, data))
    }

    /// Replaces the buffer's contents. Every copy is rewritten on its next commit.
    pub fn copy_data(&mut self, data: &[u8]) {
        self.update(|buffer| {
            buffer.data.clear();
            buffer.data.extend_from_slice(data);
        });
    }

    /// Replaces the buffer's contents with the bytes of `value`.
    pub fn copy_value<T: Pod>(&mut self, value: &T) {
        self.copy_data(bytemuck::bytes_of(value));
    }

    pub fn data(&self) -> &[u8] {
        self.resource().data()
    }
}

impl<D: Device> FrameResource<D> for DynamicBufferData {
    type Content = DynamicBufferSlot<D>;
    type RenderData = BufferRange<D>;

    fn create_gpu_data(&mut self, manager: &mut BufferManager<D>) -> Result<DynamicBufferSlot<D>, ResourceError> {
        let address = manager.reserve_buffer(self.data.len() as u64, self.usage, self.sharing)?;
        let capacity = manager.get_buffer_access_data(address)?.reserved_size;

        Ok(DynamicBufferSlot {
            address,
            capacity,
            size: 0,
            staging: None,
        })
    }

    fn write_transfer(
        &mut self,
        content: &mut DynamicBufferSlot<D>,
        manager: &mut BufferManager<D>,
        writer: &mut D::CommandList,
    ) -> Result<(), ResourceError> {
        let size = self.data.len() as u64;

        if size > content.capacity {
            let address = manager.reserve_buffer(size, self.usage, self.sharing)?;
            let old_address = std::mem::replace(&mut content.address, address);
            content.capacity = manager.get_buffer_access_data(address)?.reserved_size;
            manager.release_address(old_address)?;
            trace!("Dynamic buffer grew to {} bytes", content.capacity);
        }

        // The copy out of the last staging reservation was submitted with this slot's previous frame.
        if let Some(staging) = content.staging.take() {
            manager.release_address(staging)?;
        }

        match self.sharing {
            SharingMode::HostVisible => {
                manager.memory_copy(content.address, &self.data)?;
            }
            SharingMode::Exclusive if size > 0 => {
                let staging = manager.reserve_buffer(size, BufferUsage::STAGING, SharingMode::HostVisible)?;
                content.staging = Some(staging);
                manager.memory_copy(staging, &self.data)?;

                let source = manager.get_buffer_access_data(staging)?;
                let destination = manager.get_buffer_access_data(content.address)?;
                writer.copy_buffer(destination.buffer, destination.offset, source.buffer, source.offset, size);
            }
            SharingMode::Exclusive => {}
        }
        content.size = size;

        Ok(())
    }

    fn release_data(
        &mut self,
        content: DynamicBufferSlot<D>,
        manager: &mut BufferManager<D>,
    ) -> Result<(), ResourceError> {
        if let Some(staging) = content.staging {
            manager.release_address(staging)?;
        }

        Ok(manager.release_address(content.address)?)
    }

    fn render_data(
        &self,
        content: &DynamicBufferSlot<D>,
        manager: &BufferManager<D>,
    ) -> Result<BufferRange<D>, ResourceError> {
        let access = manager.get_buffer_access_data(content.address)?;

        Ok(BufferRange {
            buffer: access.buffer_handle,
            offset: access.offset,
            size: content.size,
        })
    }
}
