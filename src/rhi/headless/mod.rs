//! A CPU-only implementation of the RHI, for tests and for tools that run without a GPU.

mod headless_command_list;
mod headless_device;
mod headless_memory;

pub use headless_command_list::{HeadlessCommandList, HeadlessFence};
pub use headless_device::{HeadlessDevice, DEFAULT_HEADLESS_ALIGNMENT};
pub use headless_memory::{HeadlessBuffer, HeadlessImage, HeadlessMemory};
