//! Service layer
//!
//! Services contain the business logic of a job run. They use the document
//! store through the repository layer and know nothing about the queue.
//!
//! The SSH agent is trait-based so the pipeline can be tested without a real
//! `ssh-agent` binary.

pub mod agent;
pub mod cancel;
pub mod credentials;
pub mod dependency;
pub mod pipeline;
pub mod process;
pub mod state;

// Re-export traits
pub use agent::{AgentService, AgentSession};

// Re-export implementations
pub use agent::StandardAgentService;
pub use pipeline::JobPipeline;
pub use state::JobStateMachine;
