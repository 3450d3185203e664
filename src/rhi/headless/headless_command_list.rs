use crate::rhi::headless::{HeadlessBuffer, HeadlessImage};
use crate::rhi::*;
use log::{error, warn};
use std::cell::Cell;
use std::rc::Rc;

#[derive(Debug)]
enum HeadlessCommand {
    CopyBuffer {
        destination: HeadlessBuffer,
        destination_offset: u64,
        source: HeadlessBuffer,
        source_offset: u64,
        num_bytes: u64,
    },
    CopyBufferToImage {
        destination: HeadlessImage,
        source: HeadlessBuffer,
        source_offset: u64,
    },
}

/// Records commands and replays them on the CPU when submitted.
#[derive(Debug)]
pub struct HeadlessCommandList {
    queue_type: QueueType,
    commands: Vec<HeadlessCommand>,
    recording: bool,
}

impl HeadlessCommandList {
    pub(super) fn new(queue_type: QueueType) -> Self {
        HeadlessCommandList {
            queue_type,
            commands: vec![],
            recording: true,
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Number of commands recorded and not yet executed.
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    fn record(&mut self, command: HeadlessCommand) {
        if !self.recording {
            warn!("Recording into a {:?} command list which isn't recording", self.queue_type);
        }
        self.commands.push(command);
    }

    /// Executes and forgets every recorded command, in recording order.
    pub(super) fn execute(&mut self) {
        for command in self.commands.drain(..) {
            match command {
                HeadlessCommand::CopyBuffer {
                    destination,
                    destination_offset,
                    source,
                    source_offset,
                    num_bytes,
                } => {
                    if destination_offset.saturating_add(num_bytes) > destination.size()
                        || source_offset.saturating_add(num_bytes) > source.size()
                    {
                        error!("Out of bounds buffer copy of {} bytes skipped", num_bytes);
                        continue;
                    }

                    // Read everything first so that overlapping ranges in one memory copy like memmove.
                    let bytes = source.read(source_offset, num_bytes);
                    let to = (destination.offset + destination_offset) as usize;
                    for (cell, byte) in destination.storage[to..to + bytes.len()].iter().zip(bytes) {
                        cell.set(byte);
                    }
                }
                HeadlessCommand::CopyBufferToImage {
                    destination,
                    source,
                    source_offset,
                } => {
                    let mut pixels = destination.pixels.borrow_mut();
                    let len = pixels.len() as u64;
                    if source_offset.saturating_add(len) > source.size() {
                        error!("Out of bounds copy to image {} skipped", destination.id());
                        continue;
                    }

                    pixels.copy_from_slice(&source.read(source_offset, len));
                }
            }
        }
    }
}

impl CommandList for HeadlessCommandList {
    type Buffer = HeadlessBuffer;
    type Image = HeadlessImage;

    fn begin(&mut self) {
        self.commands.clear();
        self.recording = true;
    }

    fn end(&mut self) {
        self.recording = false;
    }

    fn is_recording(&self) -> bool {
        self.recording
    }

    fn copy_buffer(
        &mut self,
        destination_buffer: &Self::Buffer,
        destination_offset: u64,
        source_buffer: &Self::Buffer,
        source_offset: u64,
        num_bytes: u64,
    ) {
        self.record(HeadlessCommand::CopyBuffer {
            destination: destination_buffer.clone(),
            destination_offset,
            source: source_buffer.clone(),
            source_offset,
            num_bytes,
        });
    }

    fn copy_buffer_to_image(&mut self, destination_image: &Self::Image, source_buffer: &Self::Buffer, source_offset: u64) {
        self.record(HeadlessCommand::CopyBufferToImage {
            destination: destination_image.clone(),
            source: source_buffer.clone(),
            source_offset,
        });
    }
}

/// A fence which is signalled as soon as the work it guards is submitted.
#[derive(Debug, Clone)]
pub struct HeadlessFence {
    signalled: Rc<Cell<bool>>,
}

impl HeadlessFence {
    pub(super) fn new(start_signalled: bool) -> Self {
        HeadlessFence {
            signalled: Rc::new(Cell::new(start_signalled)),
        }
    }

    pub(super) fn signal(&self) {
        self.signalled.set(true);
    }
}

impl Fence for HeadlessFence {
    fn wait_for_signal(&self) {
        if !self.signalled.get() {
            // Nothing will ever signal it: submission is the only thing that does.
            warn!("Waiting on a headless fence that was never submitted");
        }
    }

    fn reset(&self) {
        self.signalled.set(false);
    }

    fn is_signalled(&self) -> bool {
        self.signalled.get()
    }
}
