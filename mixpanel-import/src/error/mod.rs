use std::fmt;

use thiserror::Error;

// Use .user_error() to inject a user facing error message into the error chain
// Our main thread can extract this from an error chain and display it to the user
#[derive(Error, Debug, Clone)]
#[error("User Error: {msg}")]
pub struct UserError {
    pub msg: String,
}

impl UserError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

pub trait ToUserError<T> {
    fn user_error(self, msg: impl Into<String>) -> anyhow::Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ToUserError<T> for Result<T, E> {
    fn user_error(self, msg: impl Into<String>) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::Error::from(e).context(UserError::new(msg)))
    }
}

pub fn get_user_message(error: &anyhow::Error) -> &str {
    // Context added with .context() is only visible through anyhow's own downcast, the chain
    // hands out the wrapper type instead
    if let Some(user_error) = error.downcast_ref::<UserError>() {
        return &user_error.msg;
    }
    for cause in error.chain() {
        if let Some(user_error) = cause.downcast_ref::<UserError>() {
            return &user_error.msg;
        }
    }
    "An unknown error occurred"
}

// Tag the error with something we can show the user, keeping the full chain for debugging
pub fn with_user_message<T>(result: Result<T, ImportError>) -> anyhow::Result<T> {
    result.or_else(|err| {
        let friendly_msg = err.user_message();
        Err(err).user_error(friendly_msg)
    })
}

/// A single problem found while validating an ingestion config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    /// Name of the offending config property, e.g. `fromDate`
    pub property: &'static str,
    pub message: String,
    pub correction: String,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", self.property, self.message, self.correction)
    }
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Invalid config: {}", join_failures(.0))]
    ConfigValidation(Vec<ValidationFailure>),

    #[error("{context} code: {status}, output: {body}")]
    RemoteApi {
        context: String,
        status: u16,
        body: String,
    },

    #[error("{context}, response was not a json object: {source}")]
    MalformedResponse {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("'{raw}' escaped to '{escaped}', but '{previous}' was previously escaped to same value")]
    SchemaConflict {
        raw: String,
        escaped: String,
        previous: String,
    },

    #[error("'{raw}' escaped to an empty field name")]
    EmptyFieldName { raw: String },

    #[error("Malformed event line '{line}': {source}")]
    MalformedEvent {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("No more lines in event stream")]
    StreamExhausted,
}

impl ImportError {
    // Both collision kinds mean the configured events can't be mapped onto one schema
    pub fn is_schema_conflict(&self) -> bool {
        matches!(
            self,
            ImportError::SchemaConflict { .. } | ImportError::EmptyFieldName { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ImportError::RemoteApi { status, .. } => Some(*status),
            _ => None,
        }
    }

    // Extract a user friendly error message, mirroring what we show for other export sources
    pub fn user_message(&self) -> String {
        match self {
            ImportError::ConfigValidation(failures) => failures
                .iter()
                .map(|f| format!("{} {}", f.message, f.correction))
                .collect::<Vec<_>>()
                .join(" "),
            ImportError::RemoteApi { status, .. } => match status {
                400 => "Export endpoint returned 400 -- check the date range, events and filter expression".to_string(),
                401 => "Authentication failed, check your API secret".to_string(),
                403 => "Access denied -- check your API secret".to_string(),
                429 => "Rate limit exceeded -- try the import again later".to_string(),
                500..=599 => "Remote server error".to_string(),
                _ => "Unknown error -- try the import again".to_string(),
            },
            ImportError::MalformedResponse { .. } => {
                "Mixpanel returned an unexpected response for event properties".to_string()
            }
            ImportError::Transport { source, .. } if source.is_timeout() => {
                "Request timed out -- try a smaller date range".to_string()
            }
            ImportError::Transport { .. } => {
                "Could not reach Mixpanel -- check the configured urls".to_string()
            }
            ImportError::SchemaConflict { .. } | ImportError::EmptyFieldName { .. } => {
                format!("{self} -- remove one of the events from the schema")
            }
            ImportError::MalformedEvent { .. } => {
                "Mixpanel export contained a line that is not a valid event".to_string()
            }
            ImportError::StreamExhausted => "An unknown error occurred".to_string(),
        }
    }
}

fn join_failures(failures: &[ValidationFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
