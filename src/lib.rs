//! agent-harbor: sandboxed execution service for third-party coding agents.
//!
//! Accepts a problem statement plus optional file context, runs a catalog
//! agent inside a resource-bounded Docker container, and mediates all model
//! inference through a credential-injecting proxy.

// Core modules
pub mod api;
pub mod catalog;
pub mod cli;
pub mod error;
pub mod execution;
pub mod proxy;
pub mod registry;
pub mod runner;

// Re-export commonly used error types
pub use error::{
    CatalogError, DockerError, ProxyError, RegistryError, SandboxError, UploadError,
};
