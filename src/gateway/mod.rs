pub mod server;

pub use server::{MeshServer, MeshState};
