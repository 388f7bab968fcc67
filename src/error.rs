//! Typed failure classes.
//!
//! Functions return `anyhow::Result`; when the caller needs to react to the
//! kind of failure (retry it, surface it, count it) the error carries one of
//! these values and is recovered with [`classify`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed URL, empty question, missing field. Never retried.
    #[error("invalid input: {0}")]
    Input(String),

    #[error("{0} not found")]
    NotFound(String),

    /// A call to the hosting, embedding or generation service failed.
    #[error("{service} request failed{}: {message}", status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Upstream {
        service: &'static str,
        status: Option<u16>,
        message: String,
    },

    /// The artifact row exists but has no usable vector yet.
    #[error("artifact '{path}' was stored without an embedding: {reason}")]
    PartialWrite { path: String, reason: String },

    /// Generation failed after the answer stream started.
    #[error("answer stream failed: {0}")]
    Stream(String),

    #[error("could not answer the question, please try again")]
    AskFailed,
}

impl Error {
    pub fn upstream(service: &'static str, status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Upstream {
            service,
            status,
            message: message.into(),
        }
    }

    /// Rate limits, server errors and transport failures are worth another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Upstream { status: None, .. } => true,
            Error::Upstream {
                status: Some(code), ..
            } => *code == 429 || *code >= 500,
            Error::AskFailed => true,
            _ => false,
        }
    }
}

/// Find the typed error inside an `anyhow` chain, if any. An [`Error`]
/// attached as context wins over one further down the chain.
pub fn classify(err: &anyhow::Error) -> Option<&Error> {
    err.downcast_ref::<Error>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<Error>()))
}

/// Whether an arbitrary failure should be retried.
///
/// Typed errors decide for themselves; raw transport errors from `reqwest`
/// are retryable unless they carry a client-error status.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(typed) = classify(err) {
        return typed.is_retryable();
    }
    for cause in err.chain() {
        if let Some(req) = cause.downcast_ref::<reqwest::Error>() {
            return match req.status() {
                Some(status) => status.as_u16() == 429 || status.is_server_error(),
                None => true,
            };
        }
    }
    false
}
