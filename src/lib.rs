//! GPU memory for the Nova renderer
//!
//! Nova never gives each buffer its own allocation. Big buffers are allocated once and carved up with a buddy
//! allocator, and everything the renderer uploads lives in a reservation inside one of them. On top of that, resources
//! the CPU keeps changing are replicated once per frame in flight, so a write never races the GPU reading an older
//! frame's data.
//!
//! The crate is split the same way as the rest of Nova:
//!
//! * [`core`] has the generic pieces: generation-checked slot pools and the buddy block allocator.
//! * [`rhi`] is the slice of the render hardware interface that memory needs, plus a headless device that keeps
//! everything on the CPU.
//! * [`memory`] has buffers and the buffer manager that decides where each reservation goes.
//! * [`resources`] has frame-replicated resources: dynamic buffers and textures.

// Rust warnings
#![warn(unused)]
#![deny(future_incompatible)]
#![deny(nonstandard_style)]
#![deny(rust_2018_idioms)]
#![deny(unsafe_code)] // Most is safe, but mapped buffer memory needs unsafe
// Clippy warnings
#![warn(clippy::cargo)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
// Annoying regular clippy warnings
#![allow(clippy::cast_possible_truncation)] // Annoying
#![allow(clippy::cast_possible_wrap)] // Annoying
#![allow(clippy::cast_precision_loss)] // Annoying
#![allow(clippy::cast_sign_loss)] // Annoying
#![allow(clippy::doc_markdown)] // Too picky
#![allow(clippy::module_name_repetitions)] // Causes name conflicts
#![allow(clippy::missing_errors_doc)]

pub mod core;
pub mod logging;
pub mod memory;
pub mod resources;
pub mod rhi;
pub mod settings;
