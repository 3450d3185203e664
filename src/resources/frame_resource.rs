use crate::memory::{BufferManager, ManagerError};
use crate::rhi::{Device, MemoryError};
use failure::Fail;
use log::{error, trace};
use std::marker::PhantomData;
use std::{array, fmt};

/// Most frames that can be in flight at once. Dirtiness is one bit per frame in a `u32`.
pub const MAX_FRAMES_IN_FLIGHT: usize = 32;

/// Failure type for frame-replicated resources.
#[derive(Fail, Debug)]
pub enum ResourceError {
    #[fail(display = "Could not reserve memory for the resource: {}", sub_error)]
    Allocation {
        #[fail(cause)]
        sub_error: ManagerError,
    },

    #[fail(display = "The device could not create the resource: {}", sub_error)]
    Memory {
        #[fail(cause)]
        sub_error: MemoryError,
    },

    #[fail(display = "Frame slot {} has never been committed.", slot)]
    NotCommitted { slot: usize },

    #[fail(display = "Expected {} bytes of pixel data, got {}.", expected, actual)]
    InvalidPixelData { expected: u64, actual: u64 },
}

impl From<ManagerError> for ResourceError {
    fn from(sub_error: ManagerError) -> Self {
        ResourceError::Allocation { sub_error }
    }
}

impl From<MemoryError> for ResourceError {
    fn from(sub_error: MemoryError) -> Self {
        ResourceError::Memory { sub_error }
    }
}

/// The per-type half of a frame-replicated resource
///
/// A type implementing this holds the CPU-side state of a resource. [`FrameReplicated`] keeps one `Content` per frame
/// in flight and decides when each of them needs to be brought up to date.
pub trait FrameResource<D: Device> {
    /// One frame's copy of the GPU-side data.
    type Content;

    /// What the renderer needs to bind one frame's copy.
    type RenderData;

    /// Allocates the GPU storage for one frame's copy. Doesn't need to fill it.
    fn create_gpu_data(&mut self, manager: &mut BufferManager<D>) -> Result<Self::Content, ResourceError>;

    /// Brings one frame's copy up to date with the CPU-side state
    ///
    /// # Parameters
    ///
    /// * `content` - The copy to update.
    /// * `manager` - Where any memory the update needs comes from.
    /// * `writer` - The frame's command list. Must be recording.
    fn write_transfer(
        &mut self,
        content: &mut Self::Content,
        manager: &mut BufferManager<D>,
        writer: &mut D::CommandList,
    ) -> Result<(), ResourceError>;

    /// Frees the GPU storage of one frame's copy.
    fn release_data(&mut self, content: Self::Content, manager: &mut BufferManager<D>) -> Result<(), ResourceError>;

    /// Frees anything shared between the copies. Called once, after every copy is released.
    fn release(&mut self, _manager: &mut BufferManager<D>) -> Result<(), ResourceError> {
        Ok(())
    }

    /// Whether a copy still matches the CPU-side state, for checks beyond dirtiness.
    fn ready_for_use(&self, _content: &Self::Content) -> bool {
        true
    }

    fn render_data(
        &self,
        content: &Self::Content,
        manager: &BufferManager<D>,
    ) -> Result<Self::RenderData, ResourceError>;
}

/// What a call to [`FrameReplicated::commit`] did.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CommitOutcome {
    /// The slot was brought up to date.
    Transferred,

    /// The slot was already up to date. Nothing was recorded.
    AlreadyCurrent,
}

/// A resource with one GPU-side copy per frame in flight
///
/// Frame `f` uses slot `f % COPIES`, so the GPU can keep reading the copies of older frames while a newer one is
/// written. Every slot starts dirty. Changing the resource through [`update`](#method.update) dirties every slot
/// again, and each slot is brought up to date lazily by [`commit`](#method.commit), at most once per change.
///
/// Commits for a frame must be recorded while that frame's command list is recording, and before it's submitted.
///
/// Dropping a `FrameReplicated` doesn't free its GPU storage. Call [`release`](#method.release).
pub struct FrameReplicated<D: Device, R: FrameResource<D>, const COPIES: usize> {
    resource: R,
    contents: [Option<R::Content>; COPIES],

    /// Bit `i` is set while slot `i` needs a transfer.
    dirty: u32,

    last_updated_frame: Option<u64>,

    _device: PhantomData<fn() -> D>,
}

impl<D: Device, R: FrameResource<D>, const COPIES: usize> FrameReplicated<D, R, COPIES> {
    /// Wraps a resource. No GPU storage is allocated until the first commit.
    ///
    /// Panics unless `COPIES` is between 1 and [`MAX_FRAMES_IN_FLIGHT`].
    pub fn new(resource: R) -> Self {
        assert!(
            COPIES >= 1 && COPIES <= MAX_FRAMES_IN_FLIGHT,
            "Frame-replicated resources need between 1 and {} copies, not {}",
            MAX_FRAMES_IN_FLIGHT,
            COPIES
        );

        FrameReplicated {
            resource,
            contents: array::from_fn(|_| None),
            dirty: Self::all_dirty(),
            last_updated_frame: None,
            _device: PhantomData,
        }
    }

    fn all_dirty() -> u32 {
        if COPIES == MAX_FRAMES_IN_FLIGHT {
            u32::MAX
        } else {
            (1 << COPIES) - 1
        }
    }

    fn slot(frame: u64) -> usize {
        (frame % COPIES as u64) as usize
    }

    /// Number of copies.
    pub fn copies(&self) -> usize {
        COPIES
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// Changes the resource and marks every copy dirty.
    pub fn update<T>(&mut self, change: impl FnOnce(&mut R) -> T) -> T {
        self.mark_dirty();
        change(&mut self.resource)
    }

    /// Marks every copy dirty.
    pub fn mark_dirty(&mut self) {
        self.dirty = Self::all_dirty();
    }

    /// Whether the slot used by `frame` needs a transfer.
    pub fn is_dirty(&self, frame: u64) -> bool {
        self.dirty & (1 << Self::slot(frame)) != 0
    }

    /// One bit per slot, set while the slot needs a transfer.
    pub fn dirty_mask(&self) -> u32 {
        self.dirty
    }

    /// The last frame a commit transferred anything for.
    pub fn last_updated_frame(&self) -> Option<u64> {
        self.last_updated_frame
    }

    /// Whether the slot used by `frame` can be bound as is.
    pub fn ready_for_use(&self, frame: u64) -> bool {
        let slot = Self::slot(frame);
        match &self.contents[slot] {
            Some(content) => self.dirty & (1 << slot) == 0 && self.resource.ready_for_use(content),
            None => false,
        }
    }

    /// Brings the slot used by `frame` up to date, recording any copies into `writer`
    ///
    /// Whether anything happens depends only on [`ready_for_use`](#method.ready_for_use). A clean slot is left alone.
    /// A slot dirtied by a change made after it was committed is transferred again, even for the same frame index.
    /// [`last_updated_frame`](#method.last_updated_frame) only reports the last transfer and never gates one. If
    /// creating or updating the slot fails, it stays dirty and the next commit tries again.
    pub fn commit(
        &mut self,
        frame: u64,
        manager: &mut BufferManager<D>,
        writer: &mut D::CommandList,
    ) -> Result<CommitOutcome, ResourceError> {
        if self.ready_for_use(frame) {
            return Ok(CommitOutcome::AlreadyCurrent);
        }

        let slot = Self::slot(frame);
        let mut content = match self.contents[slot].take() {
            Some(content) => content,
            None => self.resource.create_gpu_data(manager)?,
        };
        let result = self.resource.write_transfer(&mut content, manager, writer);
        self.contents[slot] = Some(content);
        result?;

        self.dirty &= !(1 << slot);
        self.last_updated_frame = Some(frame);
        trace!("Committed slot {} for frame {}", slot, frame);

        Ok(CommitOutcome::Transferred)
    }

    /// Commits the slot used by `frame` if needed, then returns its content.
    pub fn get_content_commit_update(
        &mut self,
        frame: u64,
        manager: &mut BufferManager<D>,
        writer: &mut D::CommandList,
    ) -> Result<&R::Content, ResourceError> {
        self.commit(frame, manager, writer)?;
        self.content(frame)
    }

    /// Commits the slot used by `frame` if needed, then returns what the renderer needs to bind it.
    pub fn get_render_data_commit_update(
        &mut self,
        frame: u64,
        manager: &mut BufferManager<D>,
        writer: &mut D::CommandList,
    ) -> Result<R::RenderData, ResourceError> {
        self.commit(frame, manager, writer)?;
        let content = self.content(frame)?;

        self.resource.render_data(content, manager)
    }

    /// The content of the slot used by `frame`, whether or not it's up to date.
    pub fn content(&self, frame: u64) -> Result<&R::Content, ResourceError> {
        let slot = Self::slot(frame);
        self.contents[slot]
            .as_ref()
            .ok_or(ResourceError::NotCommitted { slot })
    }

    /// Frees every copy, then whatever the resource shares between them, and hands back the CPU-side resource
    ///
    /// Every copy is released even if some fail. The first failure is returned.
    pub fn release(mut self, manager: &mut BufferManager<D>) -> Result<R, ResourceError> {
        let mut first_error = None;

        for (slot, content) in self.contents.iter_mut().enumerate() {
            if let Some(content) = content.take() {
                if let Err(err) = self.resource.release_data(content, manager) {
                    error!("Could not release frame slot {}: {}", slot, err);
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Err(err) = self.resource.release(manager) {
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(self.resource),
        }
    }
}

impl<D: Device, R: FrameResource<D> + fmt::Debug, const COPIES: usize> fmt::Debug for FrameReplicated<D, R, COPIES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReplicated")
            .field("resource", &self.resource)
            .field("dirty", &format_args!("{:#b}", self.dirty))
            .field("last_updated_frame", &self.last_updated_frame)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rhi::headless::{HeadlessCommandList, HeadlessDevice};
    use crate::rhi::QueueType;
    use crate::settings::MemorySettings;
    use matches::assert_matches;

    /// Counts what the frame-replicated base asks of it.
    #[derive(Debug, Default)]
    struct Counter {
        value: u32,
        created: usize,
        transfers: usize,
        released: usize,
        fail_creation: bool,
    }

    impl FrameResource<HeadlessDevice> for Counter {
        type Content = u32;
        type RenderData = u32;

        fn create_gpu_data(&mut self, _manager: &mut BufferManager<HeadlessDevice>) -> Result<u32, ResourceError> {
            if self.fail_creation {
                return Err(ManagerError::ReservationFailed { size: 4 }.into());
            }
            self.created += 1;
            Ok(0)
        }

        fn write_transfer(
            &mut self,
            content: &mut u32,
            _manager: &mut BufferManager<HeadlessDevice>,
            _writer: &mut HeadlessCommandList,
        ) -> Result<(), ResourceError> {
            self.transfers += 1;
            *content = self.value;
            Ok(())
        }

        fn release_data(
            &mut self,
            _content: u32,
            _manager: &mut BufferManager<HeadlessDevice>,
        ) -> Result<(), ResourceError> {
            self.released += 1;
            Ok(())
        }

        fn render_data(&self, content: &u32, _manager: &BufferManager<HeadlessDevice>) -> Result<u32, ResourceError> {
            Ok(*content)
        }
    }

    fn setup() -> (BufferManager<HeadlessDevice>, HeadlessCommandList) {
        let manager = BufferManager::new(HeadlessDevice::new(), MemorySettings::default()).unwrap();
        let writer = manager.device().create_command_list(QueueType::Graphics).unwrap();
        (manager, writer)
    }

    #[test]
    fn copies_start_dirty_and_become_ready() {
        let (mut manager, mut writer) = setup();
        let mut counter = FrameReplicated::<_, _, 2>::new(Counter::default());

        assert!(!counter.ready_for_use(0));
        assert!(!counter.ready_for_use(1));
        assert_eq!(counter.dirty_mask(), 0b11);

        counter.commit(0, &mut manager, &mut writer).unwrap();
        counter.commit(1, &mut manager, &mut writer).unwrap();
        assert!(counter.ready_for_use(0));
        assert!(counter.ready_for_use(1));

        counter.update(|counter| counter.value = 7);
        assert!(!counter.ready_for_use(0));
        assert!(!counter.ready_for_use(1));
    }

    #[test]
    fn repeated_commits_transfer_once() {
        let (mut manager, mut writer) = setup();
        let mut counter = FrameReplicated::<_, _, 3>::new(Counter::default());

        assert_eq!(
            counter.commit(4, &mut manager, &mut writer).unwrap(),
            CommitOutcome::Transferred
        );
        assert_eq!(
            counter.commit(4, &mut manager, &mut writer).unwrap(),
            CommitOutcome::AlreadyCurrent
        );
        assert_eq!(counter.resource().transfers, 1);
        assert_eq!(counter.resource().created, 1);
        assert_eq!(counter.last_updated_frame(), Some(4));

        // Frame 7 shares frame 4's slot.
        assert!(counter.ready_for_use(7));
        assert!(!counter.is_dirty(7));
        assert!(counter.is_dirty(5));
    }

    #[test]
    fn changes_mid_frame_transfer_again() {
        let (mut manager, mut writer) = setup();
        let mut counter = FrameReplicated::<_, _, 2>::new(Counter::default());

        counter.commit(0, &mut manager, &mut writer).unwrap();
        counter.update(|counter| counter.value = 9);
        assert_eq!(
            counter.commit(0, &mut manager, &mut writer).unwrap(),
            CommitOutcome::Transferred
        );
        assert_eq!(counter.resource().transfers, 2);
        assert_eq!(*counter.content(0).unwrap(), 9);
        assert_eq!(counter.last_updated_frame(), Some(0));
    }

    #[test]
    fn slots_are_reused_across_changes() {
        let (mut manager, mut writer) = setup();
        let mut counter = FrameReplicated::<_, _, 2>::new(Counter::default());

        counter.commit(0, &mut manager, &mut writer).unwrap();
        counter.update(|counter| counter.value = 3);
        let render_data = counter
            .get_render_data_commit_update(2, &mut manager, &mut writer)
            .unwrap();

        assert_eq!(render_data, 3);
        assert_eq!(counter.resource().created, 1);
        assert_eq!(counter.resource().transfers, 2);
        assert_eq!(*counter.content(0).unwrap(), 3);
        assert_matches!(counter.content(1), Err(ResourceError::NotCommitted { slot: 1 }));
    }

    #[test]
    fn failed_creation_keeps_the_slot_dirty() {
        let (mut manager, mut writer) = setup();
        let mut counter = FrameReplicated::<_, _, 2>::new(Counter {
            fail_creation: true,
            ..Counter::default()
        });

        assert_matches!(
            counter.commit(0, &mut manager, &mut writer),
            Err(ResourceError::Allocation { .. })
        );
        assert!(counter.is_dirty(0));
        assert_eq!(counter.last_updated_frame(), None);

        counter.update(|counter| counter.fail_creation = false);
        assert_eq!(
            counter.commit(0, &mut manager, &mut writer).unwrap(),
            CommitOutcome::Transferred
        );
        assert!(counter.ready_for_use(0));
    }

    #[test]
    fn release_visits_every_created_slot() {
        let (mut manager, mut writer) = setup();
        let mut counter = FrameReplicated::<_, _, 3>::new(Counter::default());
        counter.commit(0, &mut manager, &mut writer).unwrap();
        counter.commit(1, &mut manager, &mut writer).unwrap();

        let counter = counter.release(&mut manager).unwrap();
        assert_eq!(counter.released, 2);
    }

    #[test]
    fn all_copies_fit_in_the_mask() {
        let counter = FrameReplicated::<HeadlessDevice, _, 32>::new(Counter::default());
        assert_eq!(counter.dirty_mask(), u32::MAX);
        assert_eq!(counter.copies(), 32);
    }

    #[test]
    #[should_panic]
    fn zero_copies_are_rejected() {
        FrameReplicated::<HeadlessDevice, _, 0>::new(Counter::default());
    }
}
