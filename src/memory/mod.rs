//! GPU buffers and the sub-allocation of memory inside them
//!
//! Every [`Buffer`] owns one device allocation, carved up by a buddy allocator. The [`BufferManager`] owns every
//! buffer and hands out [`BufferAddress`]es, so callers never pick a buffer themselves.

mod buffer;
mod buffer_manager;

pub use buffer::{Buffer, BufferError, BufferLayout, Reservation};
pub use buffer_manager::{BufferAccessData, BufferAddress, BufferManager, ManagerError};
