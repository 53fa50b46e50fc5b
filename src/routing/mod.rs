//! Request routing: normalizing paths and resolving them to a backend service.

pub mod registry;

pub use registry::{normalize_path, RegistryError, RegistryEvent, RouteTable, ServiceRegistry};
