pub mod forwarder;
pub mod router;

pub use forwarder::Forwarder;
pub use router::{MeshRouter, ResolvedPath};
