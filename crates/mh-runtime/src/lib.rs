mod bridge;
mod builder;
mod environment;
mod loader;
mod pool;
mod registry;
mod runner;
mod store;

pub use builder::{BuildOptions, Builder, CompiledUnit};
pub use environment::{Environment, InvocationSlot};
pub use pool::{PooledRunner, RunnerPool};
pub use registry::{Capability, CapabilityRegistry, CryptoCapability, HttpCapability};
pub use runner::{Method, Runner};
pub use store::{DirStore, FileStore, MemoryFileStore};

/// Reserved import namespace for builtin capabilities. `require("host")` and
/// `require("host/...")` never consult the filesystem, even when a
/// same-named file exists.
pub const BUILTIN_NAMESPACE: &str = "host";

/// Payload placed into the engine's interruption signal when the host cuts a
/// call off. Anything else found in an interruption is a value the script
/// (or another host hook) raised on purpose and is preserved as-is.
pub(crate) const INTERRUPT_SENTINEL: &str = "context cancelled";
