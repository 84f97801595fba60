pub mod context;
pub mod error;
pub mod mode;
pub mod value;

pub use context::{CookieJar, InvocationContext};
pub use error::HostError;
pub use mode::CompatibilityMode;
pub use value::HostValue;
