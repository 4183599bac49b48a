//! Server connections: saved configuration, authenticated clients, and the
//! cache-or-create registry the manager and reconcilers resolve clients from.

mod client;
mod error;
pub(crate) mod registry;

pub use client::{ServerClient, SyncKind};
pub use error::{RegistryError, RemoteError};
pub use registry::{ServerConfig, ServerRegistry};
