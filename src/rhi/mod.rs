//! The device boundary: everything the memory core asks of a graphics API.

mod rhi_enums;
mod rhi_structs;
mod rhi_traits;

pub mod headless;

pub use rhi_enums::*;
pub use rhi_structs::*;
pub use rhi_traits::*;
