//! Resources with one GPU-side copy per frame in flight

mod dynamic_buffer;
mod frame_resource;
mod texture;

pub use dynamic_buffer::{BufferRange, DynamicBuffer, DynamicBufferData, DynamicBufferSlot};
pub use frame_resource::{CommitOutcome, FrameReplicated, FrameResource, ResourceError, MAX_FRAMES_IN_FLIGHT};
pub use texture::{Texture, TextureData, TextureSlot, TextureView};
