use core::fmt;

/// Crate-wide error type.
///
/// - Variants are the error *kinds* surfaced at component boundaries; each
///   carries just enough context to be actionable in a log line.
/// - Internal APIs return `Fallible<T>` (alias for `Result<T, FlagError>`)
///   and propagate with `?`.
/// - At API boundaries that return `Result<T, String>`, `?` works via
///   `From<FlagError> for String`.
/// - Evaluation itself never produces one of these: illegal evaluation
///   inputs degrade to the flag default with an explanatory reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagError {
    /// No flag stored under the requested key.
    NotFound(String),
    /// A value's type tag does not line up with what the operation expects.
    InvalidType {
        expected: &'static str,
        found: &'static str,
    },
    /// An evaluation request was malformed beyond what degradation covers.
    Evaluation(String),
    /// The backing store failed to read or write.
    Storage(String),
    /// A remote fetch or sync exchange failed.
    Network(String),
    /// The addressed entry exists but its lifetime has passed.
    Expired(String),
    /// A write clashed with existing local or replicated state.
    Conflict(String),
    /// A serialized form did not have the expected shape.
    Parse(String),
}

/// Convenience alias for `Result<T, FlagError>` used in internal APIs.
pub type Fallible<T> = Result<T, FlagError>;

impl FlagError {
    pub fn not_found(key: impl Into<String>) -> Self {
        FlagError::NotFound(key.into())
    }

    pub fn invalid_type(expected: &'static str, found: &'static str) -> Self {
        FlagError::InvalidType { expected, found }
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        FlagError::Evaluation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        FlagError::Storage(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        FlagError::Network(msg.into())
    }

    pub fn expired(key: impl Into<String>) -> Self {
        FlagError::Expired(key.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        FlagError::Conflict(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        FlagError::Parse(msg.into())
    }

    /// Stable kind label used in log lines and error strings.
    pub fn kind(&self) -> &'static str {
        match self {
            FlagError::NotFound(_) => "not_found",
            FlagError::InvalidType { .. } => "invalid_type",
            FlagError::Evaluation(_) => "evaluation_error",
            FlagError::Storage(_) => "storage_error",
            FlagError::Network(_) => "network_error",
            FlagError::Expired(_) => "expired",
            FlagError::Conflict(_) => "conflict",
            FlagError::Parse(_) => "parse_error",
        }
    }
}

impl fmt::Display for FlagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagError::NotFound(key) => write!(f, "not_found: no flag under key '{}'", key),
            FlagError::InvalidType { expected, found } => {
                write!(f, "invalid_type: expected {}, found {}", expected, found)
            }
            FlagError::Evaluation(msg) => write!(f, "evaluation_error: {}", msg),
            FlagError::Storage(msg) => write!(f, "storage_error: {}", msg),
            FlagError::Network(msg) => write!(f, "network_error: {}", msg),
            FlagError::Expired(key) => write!(f, "expired: '{}'", key),
            FlagError::Conflict(msg) => write!(f, "conflict: {}", msg),
            FlagError::Parse(msg) => write!(f, "parse_error: {}", msg),
        }
    }
}

impl From<FlagError> for String {
    fn from(e: FlagError) -> String {
        e.to_string()
    }
}

impl From<std::io::Error> for FlagError {
    fn from(e: std::io::Error) -> Self {
        FlagError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for FlagError {
    fn from(e: serde_json::Error) -> Self {
        FlagError::Parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_and_context() {
        let e = FlagError::not_found("dark_mode");
        assert_eq!(e.to_string(), "not_found: no flag under key 'dark_mode'");
        assert_eq!(e.kind(), "not_found");

        let e = FlagError::invalid_type("bool", "string");
        assert_eq!(e.to_string(), "invalid_type: expected bool, found string");
    }

    #[test]
    fn converts_to_string_at_boundaries() {
        fn boundary() -> Result<(), String> {
            let failed: Fallible<()> = Err(FlagError::storage("disk full"));
            failed?;
            Ok(())
        }
        assert_eq!(boundary().unwrap_err(), "storage_error: disk full");
    }
}
