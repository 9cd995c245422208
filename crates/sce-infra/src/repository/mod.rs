//! Repository implementations of the sce-core storage ports.

pub mod memory;

pub use memory::InMemoryServiceRepository;
