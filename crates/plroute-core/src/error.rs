use std::fmt;

use thiserror::Error;

/// SQLSTATE reported when a node error arrives without one.
pub const CONNECTION_FAILURE: &str = "08006";

/// Error fields reported by a node, passed through verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteError {
    pub code: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub context: Option<String>,
}

impl RemoteError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.to_string()),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn sqlstate(&self) -> &str {
        self.code.as_deref().unwrap_or(CONNECTION_FAILURE)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (SQLSTATE {})", self.message, self.sqlstate())?;
        if let Some(detail) = &self.detail {
            write!(f, "; detail: {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "; hint: {hint}")?;
        }
        if let Some(context) = &self.context {
            write!(f, "; context: {context}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("routing function {function}(): {message}")]
    Syntax { function: String, message: String },
    #[error("routing function {function}(): {message}")]
    Policy { function: String, message: String },
    #[error("{0}")]
    NodeResolution(String),
    #[error("{0}")]
    Connection(String),
    #[error("remote error: {0}")]
    Remote(RemoteError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("canceling statement due to user request")]
    Interrupted,
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl RouteError {
    pub(crate) fn syntax(function: &str, message: impl Into<String>) -> Self {
        Self::Syntax {
            function: function.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn policy(function: &str, message: impl Into<String>) -> Self {
        Self::Policy {
            function: function.to_string(),
            message: message.into(),
        }
    }

    /// True when the connection that produced this error is no longer usable.
    ///
    /// An interrupted call drains its results before returning, so the
    /// connection stays pooled.
    pub fn purges_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Remote(_) | Self::Protocol(_) | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RouteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_errors_carry_function_prefix() {
        let err = RouteError::syntax("public.get_user", "'run' keyword not found");
        assert_eq!(
            err.to_string(),
            "routing function public.get_user(): 'run' keyword not found"
        );
    }

    #[test]
    fn remote_error_display_keeps_every_field() {
        let err = RemoteError {
            code: Some("23505".into()),
            message: "duplicate key".into(),
            detail: Some("Key (id)=(1) already exists.".into()),
            hint: None,
            context: Some("PL/pgSQL function f()".into()),
        };
        let text = RouteError::Remote(err).to_string();
        assert!(text.contains("duplicate key (SQLSTATE 23505)"));
        assert!(text.contains("detail: Key (id)=(1) already exists."));
        assert!(text.contains("context: PL/pgSQL function f()"));
    }

    #[test]
    fn missing_sqlstate_reads_as_connection_failure() {
        let err = RemoteError {
            message: "server closed the connection".into(),
            ..RemoteError::default()
        };
        assert_eq!(err.sqlstate(), CONNECTION_FAILURE);
    }

    #[test]
    fn interrupt_keeps_connection() {
        assert!(!RouteError::Interrupted.purges_connection());
        assert!(RouteError::Connection("gone".into()).purges_connection());
        assert!(RouteError::Remote(RemoteError::default()).purges_connection());
        assert!(!RouteError::Type("bad".into()).purges_connection());
    }
}
