//! Core primitives used by Nova. These are generic abstractions over a problem that may show
//! up in multiple parts of the codebase.

pub mod allocators;
pub mod slot_pool;
