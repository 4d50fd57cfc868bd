/// Errors raised by the RPC core.
///
/// Failures that originate while executing an inbound Command never show up
/// here; they travel back to the peer as error Responses. Everything in this
/// enum is reported to local calling code.
#[derive(Debug, thiserror::Error)]
pub enum EelError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("already exposed function: {0}")]
    DuplicateExposure(String),
    #[error("function name is reserved by the protocol: {0}")]
    ReservedName(String),
    #[error("no open connection")]
    NoOpenConnection,
    #[error("could not find function: {0}")]
    FunctionNotFound(String),
    /// An exposed function failed when invoked in-process, e.g. through
    /// `Session::call_local`.
    #[error("{0}")]
    HandlerExecution(#[from] HandlerError),
    #[error("call to '{function}' timed out after {attempts} poll attempts")]
    CallTimeout { function: String, attempts: u32 },
    #[error("remote '{function}' failed: {message}")]
    Remote { function: String, message: String },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EelError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::DuplicateExposure(_) => "duplicate_exposure",
            Self::ReservedName(_) => "reserved_name",
            Self::NoOpenConnection => "no_open_connection",
            Self::FunctionNotFound(_) => "function_not_found",
            Self::HandlerExecution(_) => "handler_execution",
            Self::CallTimeout { .. } => "call_timeout",
            Self::Remote { .. } => "remote",
            Self::ConnectionClosed => "connection_closed",
            Self::Json(_) => "json",
        }
    }
}

/// Failure reported by an exposed function.
///
/// The display text is what the peer sees in `ErrorMessage`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid argument {index}: {message}")]
    InvalidArgument { index: usize, message: String },
    #[error("missing argument {0}")]
    MissingArgument(usize),
    #[error("{0}")]
    Failed(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::Failed(message.to_owned())
    }
}

pub type Result<T> = std::result::Result<T, EelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_function() {
        let err = EelError::FunctionNotFound("greet".into());
        assert_eq!(err.to_string(), "could not find function: greet");

        let err = EelError::DuplicateExposure("add".into());
        assert!(err.to_string().contains("add"));
    }

    #[test]
    fn timeout_display_includes_attempts() {
        let err = EelError::CallTimeout {
            function: "greet".into(),
            attempts: 10_000,
        };
        let text = err.to_string();
        assert!(text.contains("greet"));
        assert!(text.contains("10000"));
    }

    #[test]
    fn handler_error_is_transparent() {
        let err: EelError = HandlerError::failed("division by zero").into();
        assert_eq!(err.to_string(), "division by zero");
        assert_eq!(err.error_kind(), "handler_execution");
    }

    #[test]
    fn handler_error_from_strings() {
        assert_eq!(HandlerError::from("boom"), HandlerError::Failed("boom".into()));
        assert_eq!(
            HandlerError::from(String::from("bang")),
            HandlerError::Failed("bang".into())
        );
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(EelError::NoOpenConnection.error_kind(), "no_open_connection");
        assert_eq!(EelError::ConnectionClosed.error_kind(), "connection_closed");
        assert_eq!(EelError::Parse("x".into()).error_kind(), "parse");
    }
}
