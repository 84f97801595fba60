use thiserror::Error;

/// Error taxonomy for the whole host. Build and compile failures are fatal to
/// the Runner under construction; module errors raised while a script is
/// executing are rethrown into the script so `try`/`catch` can observe them,
/// and unwrap back to these variants when uncaught.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HostError {
    #[error("compile error in {filename}: {message}")]
    Compile {
        filename: String,
        message: String,
        line: Option<usize>,
        column: Option<usize>,
    },

    #[error("exports must be an object ({filename})")]
    InvalidExports { filename: String },
    #[error("script must export a default function ({filename})")]
    MissingDefault { filename: String },
    #[error("default export must be a function ({filename})")]
    DefaultNotCallable { filename: String },
    #[error("script must export a meta description ({filename})")]
    MissingMeta { filename: String },
    #[error("\"{field}\" is missing in the meta description ({filename})")]
    MissingIdentifier { filename: String, field: String },
    #[error("duplicate method identifier \"{id}\" ({filename})")]
    DuplicateIdentifier { filename: String, id: String },

    #[error("unknown builtin module: {0}")]
    UnknownModule(String),
    #[error(
        "The moduleSpecifier \"{0}\" couldn't be found on local disk. \
         Make sure that you've specified the right path to the file."
    )]
    FileNotFound(String),
    #[error("open() can't be used with an empty filename")]
    EmptyFilename,
    #[error("not found: {0}")]
    RemoteNotFound(String),
    #[error("wrong status code ({status}) for: {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("runtime error: {message}")]
    Runtime { message: String },
    #[error("method \"{0}\" has timed out")]
    Timeout(String),
    #[error("method is missing: {0}")]
    MethodMissing(String),
    #[error("{capability} can only be used inside a method invocation")]
    UsedOutsideInvocation { capability: String },

    #[error("invalid compatibility mode: {0}")]
    InvalidCompatibilityMode(String),
}

impl HostError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// True for the module errors that must surface host-level when a script
    /// leaves them uncaught.
    pub fn is_module_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownModule(_)
                | Self::FileNotFound(_)
                | Self::EmptyFilename
                | Self::RemoteNotFound(_)
                | Self::UnexpectedStatus { .. }
        )
    }
}
