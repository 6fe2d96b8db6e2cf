//! Data Transfer Objects
//!
//! Payloads handed from the API layer to the runner through the job queues.

pub mod job;
