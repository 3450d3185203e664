use crate::rhi::headless::{HeadlessBuffer, HeadlessCommandList, HeadlessFence, HeadlessImage, HeadlessMemory};
use crate::rhi::*;
use log::{debug, warn};
use std::cell::Cell;

/// Alignment the headless device asks of buffers unless told otherwise.
pub const DEFAULT_HEADLESS_ALIGNMENT: u64 = 16;

/// A device that keeps all of its memory on the CPU heap
///
/// Host-visible memory can be mapped, device-only memory can't, exactly like on a discrete GPU, so code that works
/// against this device exercises the same upload paths it would on real hardware. Recorded commands run in order when
/// their command list is submitted, and fences are signalled right after.
///
/// An optional memory budget makes allocations fail once it's exhausted, standing in for a GPU that's out of memory.
#[derive(Debug)]
pub struct HeadlessDevice {
    alignment: u64,
    memory_budget: Option<u64>,

    allocated: Cell<u64>,
    live_allocations: Cell<usize>,
    submissions: Cell<u64>,
    next_image_id: Cell<u64>,
}

impl HeadlessDevice {
    /// Creates a device with the default alignment and no memory budget.
    pub fn new() -> Self {
        Self::with_alignment(DEFAULT_HEADLESS_ALIGNMENT)
    }

    /// Creates a device which aligns every buffer to `alignment` bytes.
    pub fn with_alignment(alignment: u64) -> Self {
        HeadlessDevice {
            alignment: alignment.max(1),
            memory_budget: None,
            allocated: Cell::new(0),
            live_allocations: Cell::new(0),
            submissions: Cell::new(0),
            next_image_id: Cell::new(0),
        }
    }

    /// Limits the total amount of memory the device will hand out.
    pub fn with_memory_budget(mut self, budget: u64) -> Self {
        self.memory_budget = Some(budget);
        self
    }

    /// Bytes currently allocated, images included.
    pub fn allocated_memory(&self) -> u64 {
        self.allocated.get()
    }

    /// Number of memory allocations and images currently alive.
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.get()
    }

    /// Number of command lists submitted so far.
    pub fn submission_count(&self) -> u64 {
        self.submissions.get()
    }

    fn reserve_budget(&self, size: u64) -> bool {
        let total = self.allocated.get().saturating_add(size);
        if let Some(budget) = self.memory_budget {
            if total > budget {
                return false;
            }
        }

        self.allocated.set(total);
        self.live_allocations.set(self.live_allocations.get() + 1);
        true
    }

    fn return_budget(&self, size: u64) {
        self.allocated.set(self.allocated.get().saturating_sub(size));
        self.live_allocations.set(self.live_allocations.get().saturating_sub(1));
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HeadlessDevice {
    type Memory = HeadlessMemory;
    type Buffer = HeadlessBuffer;
    type Image = HeadlessImage;
    type CommandList = HeadlessCommandList;
    type Fence = HeadlessFence;

    fn get_buffer_requirements(&self, _size: u64, _usage: BufferUsage, _sharing: SharingMode) -> MemoryRequirements {
        MemoryRequirements {
            alignment: self.alignment,
        }
    }

    fn allocate_memory(
        &self,
        size: u64,
        memory_usage: MemoryUsage,
        _allowed_objects: ObjectType,
    ) -> Result<Self::Memory, AllocationError> {
        if !self.reserve_budget(size) {
            warn!(
                "Headless device out of memory: {} bytes requested, {} of {:?} in use",
                size,
                self.allocated.get(),
                self.memory_budget
            );
            return Err(AllocationError::OutOfDeviceMemory);
        }

        debug!("Allocated {} bytes of {:?} memory", size, memory_usage);
        Ok(HeadlessMemory::new(size, memory_usage))
    }

    fn free_memory(&self, memory: Self::Memory) {
        self.return_budget(memory.size());
    }

    fn destroy_buffer(&self, _buffer: Self::Buffer) {}

    fn create_image(&self, create_info: ImageCreateInfo) -> Result<Self::Image, MemoryError> {
        if !self.reserve_budget(create_info.byte_size()) {
            return Err(MemoryError::OutOfDeviceMemory);
        }

        let id = self.next_image_id.get();
        self.next_image_id.set(id + 1);

        Ok(HeadlessImage::new(id, create_info))
    }

    fn destroy_image(&self, image: Self::Image) {
        self.return_budget(image.pixels.borrow().len() as u64);
    }

    fn create_command_list(&self, queue_type: QueueType) -> Result<Self::CommandList, MemoryError> {
        Ok(HeadlessCommandList::new(queue_type))
    }

    fn submit_commands(&self, commands: &mut Self::CommandList, fence_to_signal: Option<&Self::Fence>) {
        if commands.is_recording() {
            warn!("Submitting a command list that is still recording");
        }

        commands.execute();
        self.submissions.set(self.submissions.get() + 1);

        if let Some(fence) = fence_to_signal {
            fence.signal();
        }
    }

    fn create_fence(&self, start_signalled: bool) -> Result<Self::Fence, MemoryError> {
        Ok(HeadlessFence::new(start_signalled))
    }

    fn wait_for_fences(&self, fences: &[&Self::Fence]) {
        for fence in fences {
            fence.wait_for_signal();
        }
    }

    fn reset_fences(&self, fences: &[&Self::Fence]) {
        for fence in fences {
            fence.reset();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn device_only_memory_cannot_be_mapped() {
        let device = HeadlessDevice::new();
        let memory = device
            .allocate_memory(64, MemoryUsage::DeviceOnly, ObjectType::Buffer)
            .unwrap();

        assert_matches!(memory.map(), Err(MappingError::ResourceInDeviceMemory));
    }

    #[test]
    fn staging_memory_can_be_mapped() {
        let device = HeadlessDevice::new();
        let memory = device
            .allocate_memory(64, MemoryUsage::StagingBuffer, ObjectType::Buffer)
            .unwrap();

        assert!(memory.map().is_ok());
        assert!(memory.is_mapped());
        assert_eq!(memory.memory_usage(), MemoryUsage::StagingBuffer);
    }

    #[test]
    fn budget_limits_allocations() {
        let device = HeadlessDevice::new().with_memory_budget(100);
        let memory = device
            .allocate_memory(64, MemoryUsage::LowFrequencyUpload, ObjectType::Buffer)
            .unwrap();

        assert_matches!(
            device.allocate_memory(64, MemoryUsage::LowFrequencyUpload, ObjectType::Buffer),
            Err(AllocationError::OutOfDeviceMemory)
        );

        device.free_memory(memory);
        assert_eq!(device.allocated_memory(), 0);
        assert!(device
            .allocate_memory(64, MemoryUsage::LowFrequencyUpload, ObjectType::Buffer)
            .is_ok());
    }

    #[test]
    fn submitted_copies_run_in_order() {
        let device = HeadlessDevice::new();
        let memory = device
            .allocate_memory(64, MemoryUsage::DeviceOnly, ObjectType::Buffer)
            .unwrap();
        let buffer = memory
            .create_buffer(BufferCreateInfo {
                size: 64,
                offset: 0,
                buffer_usage: BufferUsage::STAGING,
                sharing: SharingMode::Exclusive,
            })
            .unwrap();
        for (cell, byte) in buffer.storage.iter().zip(&[1, 2, 3, 4]) {
            cell.set(*byte);
        }

        let fence = device.create_fence(false).unwrap();
        let mut commands = device.create_command_list(QueueType::Copy).unwrap();
        commands.copy_buffer(&buffer, 16, &buffer, 0, 4);
        commands.copy_buffer(&buffer, 32, &buffer, 16, 4);
        commands.end();
        device.submit_commands(&mut commands, Some(&fence));

        assert!(fence.is_signalled());
        assert_eq!(commands.command_count(), 0);
        assert_eq!(buffer.read(32, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn buffers_must_fit_their_memory() {
        let device = HeadlessDevice::new();
        let memory = device
            .allocate_memory(64, MemoryUsage::DeviceOnly, ObjectType::Buffer)
            .unwrap();

        let result = memory.create_buffer(BufferCreateInfo {
            size: 64,
            offset: 16,
            buffer_usage: BufferUsage::VERTEX,
            sharing: SharingMode::Exclusive,
        });
        assert_matches!(result, Err(MemoryError::OutOfBounds));
    }
}
