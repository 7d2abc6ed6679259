//! Service descriptor store for the relay gateway.
//!
//! Maps service identifiers to the command lines that launch their stdio
//! backends. The mapping is loaded once from a JSON file and rewritten
//! atomically on every change.

pub mod atomic_io;
pub mod registry_store;
pub mod service_descriptor;

pub use atomic_io::write_json_atomic;
pub use registry_store::{RegistryError, ServiceRegistry};
pub use service_descriptor::{
    validate_command, validate_service_id, CommandValidationError, ReadinessProbe,
    ServiceDescriptor, UNSAFE_COMMAND_SEQUENCES,
};
