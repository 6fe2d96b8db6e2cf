//! Repository layer
//!
//! Repositories abstract the document store the engine persists job
//! bookkeeping to. They read and patch raw JSON documents; typed views and
//! business rules live in the service layer.
//!
//! The store is trait-based so the services can run against the in-memory
//! implementation in tests.

mod documents;
#[cfg(test)]
mod memory;

// Re-export traits
pub use documents::{DocumentStore, StoreError};

// Re-export implementations
pub use documents::HttpDocumentStore;
#[cfg(test)]
pub use memory::MemoryDocumentStore;
