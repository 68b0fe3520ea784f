//! Submission API: HTTP surface for creating, inspecting, and deleting runs.

mod routes;
pub mod upload;

pub use routes::{router, AppState};
pub use upload::extract_zip;
