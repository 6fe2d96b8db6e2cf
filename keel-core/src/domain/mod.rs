//! Core domain types
//!
//! These types mirror the documents kept by the persistence service. The runner
//! only reads and writes the fields it needs; everything else belongs to the
//! API layer.

pub mod activity;
pub mod ansible;
pub mod collection;
pub mod credential;
pub mod job;
pub mod project;
pub mod template;
pub mod terraform;
pub mod user;
