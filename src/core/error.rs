use thiserror::Error;

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("database error: {message}")]
    Database {
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("sync error: {message}")]
    Sync {
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        cause: Option<Cause>,
    },
}

impl AppError {
    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::NotFound(what.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn database(message: impl Into<String>, cause: impl Into<Cause>) -> Self {
        AppError::Database {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn sync(message: impl Into<String>) -> Self {
        AppError::Sync {
            message: message.into(),
            cause: None,
        }
    }

    pub fn sync_with(message: impl Into<String>, cause: impl Into<Cause>) -> Self {
        AppError::Sync {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        AppError::Internal {
            message: message.into(),
            cause: None,
        }
    }

    pub fn configuration(message: impl Into<String>, cause: impl Into<Cause>) -> Self {
        AppError::Configuration {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database {
            message: err.to_string(),
            cause: Some(Box::new(err)),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
            cause: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_taxonomy_prefix_and_message() {
        let error = AppError::not_found("node msg_9");
        assert_eq!(error.to_string(), "not found: node msg_9");

        let error = AppError::sync("default folder missing");
        assert_eq!(error.to_string(), "sync error: default folder missing");
    }

    #[test]
    fn chained_cause_is_reachable_through_source() {
        use std::error::Error;

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let error = AppError::sync_with("failed to enumerate sessions", io);
        let source = error.source().expect("cause is attached");
        assert!(source.to_string().contains("disk on fire"));
    }
}
