//! Control plane for a private cloud
//!
//! Tracks physical hosts and the guests running on them, allocates
//! network identity (addresses, MACs), drives provisioning through a
//! guarded build/deploy lifecycle, executes privileged commands on
//! hosts over SSH, and compiles declarative network-exposure policy
//! into firewall scripts pushed to each host.

pub mod allocator;
pub mod config;
pub mod domain;
pub mod errors;
pub mod executor;
pub mod firewall;
pub mod jobs;
pub mod orchestrator;
pub mod state_machine;
pub mod store;

// Re-export commonly used types
pub use config::CloudConfig;
pub use domain::{Guest, GuestId, Host, HostId, HostTemplate, TemplateId};
pub use errors::{Error, Result};
pub use executor::{ExecOutcome, RemoteSession, SshSession};
pub use firewall::FirewallCompiler;
pub use jobs::{JobQueue, NatsJobQueue};
pub use orchestrator::Orchestrator;
pub use state_machine::{LifecycleState, StateMachine};
pub use store::{MemoryStore, Store};
