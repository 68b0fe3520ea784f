//! Docker execution layer for sandboxed agent runs.
//!
//! Wraps the bollard crate for container lifecycle management and resource
//! control. One container is created per run, bound to a throwaway host
//! workspace, and force-removed at teardown.

pub mod docker_client;
pub mod resources;

pub use docker_client::{ContainerSpec, ContainerState, DockerClient};
pub use resources::ExecutionLimits;
