//! Coding-agent process control.
//!
//! - [`backend`]: `AgentBackend` and the built-in command lines
//! - [`supervisor`]: one supervised session, deadline and kill handling
//! - [`signal`]: process-group signals

pub mod backend;
pub mod signal;
pub mod supervisor;

pub use backend::{backend_for, AgentBackend, AgentCommand, CopilotCli, ExternalCommand, LaunchContext};
pub use supervisor::{AgentSupervisor, SupervisorConfig};
