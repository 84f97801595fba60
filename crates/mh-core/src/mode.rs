use crate::error::HostError;

/// Grammar/polyfill axis for compiled scripts. `Base` disables dynamic
/// evaluation and loads nothing extra; `Extended` loads the standard polyfill
/// module into every environment at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompatibilityMode {
    Base,
    #[default]
    Extended,
}

impl CompatibilityMode {
    /// Validates a mode string before any compilation is attempted. The empty
    /// string selects the default mode.
    pub fn parse(mode: &str) -> Result<Self, HostError> {
        match mode {
            "" => Ok(Self::default()),
            "base" => Ok(Self::Base),
            "extended" => Ok(Self::Extended),
            other => Err(HostError::InvalidCompatibilityMode(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Extended => "extended",
        }
    }
}
