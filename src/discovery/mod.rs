pub mod cache;
pub mod directory;
pub mod registry;

pub use cache::InstanceCache;
pub use directory::{InstanceDirectory, StaticDirectory};
pub use registry::{ConnectionGuard, RegistryStats, ServiceRegistry};
