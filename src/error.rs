//! Error types for the dongle core.
//!
//! Typed, recoverable errors via `thiserror` for the loader and transport
//! layers; `anyhow` at the binary boundary.

use thiserror::Error;

/// Errors raised while parsing a token-definition file into a `KeyDefinition`.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("cannot read key file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse key file {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("key file {path} has no \"HASP Key\" object")]
    MissingKeyObject { path: String },
}

/// Errors raised by the TCP adapter while framing requests/responses.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed before a full request was read")]
    Truncated,

    #[error("requested port {port} has no emulated token loaded")]
    UnknownPort { port: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
