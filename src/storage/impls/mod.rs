//! Module providing different storage backend implementations.

pub mod in_mem;
pub mod tokio;
