//! Keel Core
//!
//! Core types shared by the Keel job-execution engine.
//!
//! This crate contains:
//! - Domain types: the records the engine reads and writes (Job, Credential, Template, etc.)
//! - DTOs: the queue payloads handed from the API layer to the runner

pub mod domain;
pub mod dto;
