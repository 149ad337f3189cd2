//! Lifecycle of test topologies.
//!
//! A [`TopologyEngine`] takes the compiled configuration of a topology and
//! drives its instances through a backend: prepare, start, provision,
//! stop, destroy and package. Every state a backend confirmed is written
//! to the workspace status file before the next step begins, so a crashed
//! or interrupted run can be picked up by `detect` and `resume`.
//!
//! Backends form a closed set, see [`Backend`]. Both shell out to their
//! command line tools through a [`CommandRunner`].

pub mod backend;
pub mod engine;
pub mod error;
pub mod podman;
pub mod runner;
pub mod state;
pub mod store;
pub mod template;
pub mod vagrant;

pub use backend::{
    Backend, BackendDriver, BackendHandle, BackendKind, ImageArtifact, InstanceRecord,
    ObservedInstance, Settings, StageOutcome, StartInfo, TARGET_PORT, target_for,
};
pub use engine::{CreateOptions, NodeOutcome, Progress, ProvisionReport, Reconciliation, TopologyEngine};
pub use error::{BackendError, BackendResult, TopologyError, TopologyResult};
pub use podman::PodmanBackend;
pub use runner::{CommandOutput, CommandRunner, HostCommand, ProcessRunner, shell_quote};
pub use state::{Checkpoint, InstanceState, Operation};
pub use store::{
    AddressFamily, Bom, NetworkInterface, NodeStatus, TopologyStatus, Workspace, WorkspaceLock,
};
pub use template::{DEFAULT_VAGRANTFILE, TemplateVars};
pub use vagrant::VagrantBackend;
