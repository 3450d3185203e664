//! Nova's Render Hardware Interface, as far as memory is concerned
//!
//! This is the slice of the GPU interface that buffer sub-allocation and resource uploads need: raw memory, buffers
//! placed in that memory, images, copy commands and fences. Like the rest of the RHI it's split into two parts. The
//! synchronous part is where your calls happen immediately on the GPU, while the asynchronous part is where your calls
//! get recorded into command lists, which are later executed on the GPU.

use super::{rhi_enums::*, rhi_structs::*};
use cgmath::Vector2;
use std::ptr::NonNull;

/// An implementation of the rendering API for a specific device.
///
/// This will probably be a physical GPU, but a software implementation like [`HeadlessDevice`] is possible.
///
/// [`HeadlessDevice`]: crate::rhi::headless::HeadlessDevice
pub trait Device {
    /// Device's memory type.
    type Memory: Memory<Buffer = Self::Buffer>;

    /// Device's buffer type.
    type Buffer: Buffer;

    /// Device's image type.
    type Image: Image;

    /// Device's command list type.
    type CommandList: CommandList<Buffer = Self::Buffer, Image = Self::Image>;

    /// Device's fence type.
    type Fence: Fence;

    /// Asks the device what memory a buffer with the given properties would need.
    ///
    /// # Parameters
    ///
    /// * `size` - The size, in bytes, of the buffer.
    /// * `usage` - What the buffer will be used for.
    /// * `sharing` - Who will access the buffer's memory.
    fn get_buffer_requirements(&self, size: u64, usage: BufferUsage, sharing: SharingMode) -> MemoryRequirements;

    /// Allocates memory from the graphics API.
    ///
    /// This memory may be on the device or on the host, depending on its usage and allowed objects.
    ///
    /// # Parameters
    ///
    /// * `size` - The size, in bytes, of the memory you want to allocate.
    /// * `memory_usage` - The usage you want the memory to be usable for.
    /// * `allowed_objects` - The types of objects you want to allow from this memory. Enforcing
    /// this is up to the caller.
    fn allocate_memory(
        &self,
        size: u64,
        memory_usage: MemoryUsage,
        allowed_objects: ObjectType,
    ) -> Result<Self::Memory, AllocationError>;

    /// Returns memory to the graphics API. Every object created from it must already be destroyed.
    fn free_memory(&self, memory: Self::Memory);

    /// Destroys a buffer created from one of this device's memories.
    fn destroy_buffer(&self, buffer: Self::Buffer);

    /// Creates an Image with a dedicated allocation.
    fn create_image(&self, create_info: ImageCreateInfo) -> Result<Self::Image, MemoryError>;

    /// Destroys an image and its dedicated allocation.
    fn destroy_image(&self, image: Self::Image);

    /// Creates a command list that records commands for the given kind of queue.
    ///
    /// The new list is already recording.
    fn create_command_list(&self, queue_type: QueueType) -> Result<Self::CommandList, MemoryError>;

    /// Submits a command list for execution.
    ///
    /// # Parameters
    ///
    /// * `commands` - The CommandList to submit. It must have been ended.
    /// * `fence_to_signal` - The Fence to signal after the CommandList has finished executing.
    fn submit_commands(&self, commands: &mut Self::CommandList, fence_to_signal: Option<&Self::Fence>);

    /// Creates a new fence.
    fn create_fence(&self, start_signalled: bool) -> Result<Self::Fence, MemoryError>;

    /// Waits for all the provided fences to be signalled.
    fn wait_for_fences(&self, fences: &[&Self::Fence]);

    /// Resets all the provided fences to an unsignalled state.
    fn reset_fences(&self, fences: &[&Self::Fence]);
}

/// A region of memory allocated from a device.
pub trait Memory {
    /// Memory's underlying buffer type.
    type Buffer: Buffer;

    /// Size of this memory, in bytes.
    fn size(&self) -> u64;

    /// Creates a buffer from this memory.
    ///
    /// It's the caller's responsibility to make sure that this memory is allowed to create buffers.
    fn create_buffer(&self, data: BufferCreateInfo) -> Result<Self::Buffer, MemoryError>;

    /// Maps this memory so that you can write data directly to it
    ///
    /// The returned pointer is valid for [`size`](#tymethod.size) bytes until [`unmap`](#tymethod.unmap) is called or
    /// the memory is freed. This method will fail if the memory is device-local, or has otherwise been allocated in a
    /// heap with no CPU access.
    fn map(&self) -> Result<NonNull<u8>, MappingError>;

    /// Unmaps this memory
    ///
    /// This method doesn't do anything interesting if the memory isn't CPU-addressable
    fn unmap(&self);
}

/// A data buffer.
pub trait Buffer {
    /// Size of the buffer, in bytes.
    fn size(&self) -> u64;
}

/// An raw image with no sampler.
pub trait Image {
    /// Size of the image, in pixels.
    fn extent(&self) -> Vector2<u32>;

    /// Format of the image's pixels.
    fn format(&self) -> TextureFormat;
}

/// Represents a fence in an API-agnostic way
///
/// Fences are used for GPU -> CPU synchronization. When you submit a command list you may pass in a fence. The GPU will
/// signal the fence when the command list has finished executing, so the CPU can wait on the fence to know when it can
/// reuse the resources used by that command list
pub trait Fence {
    /// Waits for this fence to become signalled
    fn wait_for_signal(&self);

    /// Resets this fence from a signalled to an unsignalled state
    fn reset(&self);

    /// Whether the fence is currently signalled
    fn is_signalled(&self) -> bool;
}

/// A CommandList is a sequence of commands which can be submitted to the GPU.
pub trait CommandList {
    /// CommandList's buffer type.
    type Buffer: Buffer;

    /// CommandList's image type.
    type Image: Image;

    /// Starts recording, discarding anything recorded before.
    fn begin(&mut self);

    /// Stops recording. The list may be submitted afterwards.
    fn end(&mut self);

    /// Whether commands may currently be recorded.
    fn is_recording(&self) -> bool;

    /// Records a command to copy data from one buffer to another.
    ///
    /// # Parameters
    ///
    /// * `destination_buffer` - The buffer to write data to.
    /// * `destination_offset` - The number of bytes from the start of `destination_buffer` to write to.
    /// * `source_buffer` - The buffer to read data from.
    /// * `source_offset` - The number of bytes from the start of `source_buffer` to read data from.
    /// * `num_bytes` - The number of bytes to copy.
    fn copy_buffer(
        &mut self,
        destination_buffer: &Self::Buffer,
        destination_offset: u64,
        source_buffer: &Self::Buffer,
        source_offset: u64,
        num_bytes: u64,
    );

    /// Records a command to copy tightly packed pixel data from a buffer into the whole of an image.
    ///
    /// # Parameters
    ///
    /// * `destination_image` - The image to write pixels to.
    /// * `source_buffer` - The buffer to read pixels from.
    /// * `source_offset` - The number of bytes from the start of `source_buffer` to read data from.
    fn copy_buffer_to_image(&mut self, destination_image: &Self::Image, source_buffer: &Self::Buffer, source_offset: u64);
}
