use crate::rhi::*;
use cgmath::Vector2;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

/// Bytes shared between a memory, its mapping and everything created from it.
///
/// `Cell<u8>` has the layout of `u8`, so the mapped pointer may write these bytes while buffers read and copy them.
pub(super) type Storage = Rc<[Cell<u8>]>;

/// Memory allocated from a [`HeadlessDevice`](super::HeadlessDevice). Lives on the heap.
#[derive(Debug)]
pub struct HeadlessMemory {
    pub(super) storage: Storage,
    memory_usage: MemoryUsage,
    mapped: Cell<bool>,
}

impl HeadlessMemory {
    pub(super) fn new(size: u64, memory_usage: MemoryUsage) -> Self {
        HeadlessMemory {
            storage: (0..size).map(|_| Cell::new(0)).collect(),
            memory_usage,
            mapped: Cell::new(false),
        }
    }

    /// Whether the memory is currently mapped.
    pub fn is_mapped(&self) -> bool {
        self.mapped.get()
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.memory_usage
    }
}

impl Memory for HeadlessMemory {
    type Buffer = HeadlessBuffer;

    fn size(&self) -> u64 {
        self.storage.len() as u64
    }

    fn create_buffer(&self, data: BufferCreateInfo) -> Result<Self::Buffer, MemoryError> {
        match data.offset.checked_add(data.size) {
            Some(end) if end <= self.size() => Ok(HeadlessBuffer {
                storage: self.storage.clone(),
                offset: data.offset,
                size: data.size,
                usage: data.buffer_usage,
            }),
            _ => Err(MemoryError::OutOfBounds),
        }
    }

    fn map(&self) -> Result<NonNull<u8>, MappingError> {
        if self.memory_usage == MemoryUsage::DeviceOnly {
            return Err(MappingError::ResourceInDeviceMemory);
        }

        let pointer = NonNull::new(self.storage.as_ptr() as *mut u8).ok_or(MappingError::MappingFailed)?;
        self.mapped.set(true);

        Ok(pointer)
    }

    fn unmap(&self) {
        self.mapped.set(false);
    }
}

/// A buffer placed in a [`HeadlessMemory`]. Cloning it makes another view of the same bytes.
#[derive(Debug, Clone)]
pub struct HeadlessBuffer {
    pub(super) storage: Storage,
    pub(super) offset: u64,
    size: u64,
    usage: BufferUsage,
}

impl HeadlessBuffer {
    /// Reads `len` bytes starting `offset` bytes into the buffer, whatever memory it lives in.
    ///
    /// The read is clamped to the end of the buffer.
    pub fn read(&self, offset: u64, len: u64) -> Vec<u8> {
        let start = (self.offset + offset.min(self.size)) as usize;
        let end = (self.offset + offset.saturating_add(len).min(self.size)) as usize;

        self.storage[start..end].iter().map(Cell::get).collect()
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

impl Buffer for HeadlessBuffer {
    fn size(&self) -> u64 {
        self.size
    }
}

/// An image with its own heap allocation.
#[derive(Debug, Clone)]
pub struct HeadlessImage {
    pub(super) pixels: Rc<RefCell<Vec<u8>>>,
    pub(super) id: u64,
    extent: Vector2<u32>,
    format: TextureFormat,
}

impl HeadlessImage {
    pub(super) fn new(id: u64, create_info: ImageCreateInfo) -> Self {
        HeadlessImage {
            pixels: Rc::new(RefCell::new(vec![0; create_info.byte_size() as usize])),
            id,
            extent: create_info.extent,
            format: create_info.format,
        }
    }

    /// Copy of the image's tightly packed pixel data.
    pub fn pixels(&self) -> Vec<u8> {
        self.pixels.borrow().clone()
    }

    /// Device-unique id of the image.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Image for HeadlessImage {
    fn extent(&self) -> Vector2<u32> {
        self.extent
    }

    fn format(&self) -> TextureFormat {
        self.format
    }
}
