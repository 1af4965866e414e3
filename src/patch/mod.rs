//! Patches and the registry that orders them.

pub mod registry;
pub mod schema;

pub use registry::{PatchId, PatchRegistry};
pub use schema::{Patch, PatchApplication, PatchError};
