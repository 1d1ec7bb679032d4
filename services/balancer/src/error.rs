//! Error types for the load-balancing engine.

use std::io;

use tcplb_upstream::UpstreamError;
use thiserror::Error;

/// Errors returned by the engine, its routes and per-connection dispatch.
#[derive(Debug, Error)]
pub enum LbError {
    /// The engine could not be built.
    #[error("failed to construct load balancer: {0}")]
    Construction(String),

    /// `add_route` input was rejected; the route was not registered.
    #[error("invalid route '{listen}': {reason}")]
    InvalidRoute { listen: String, reason: String },

    /// The listener could not be established.
    #[error("failed to bind '{listen}': {source}")]
    Bind {
        listen: String,
        #[source]
        source: io::Error,
    },

    /// The operation is not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The engine has been closed.
    #[error("load balancer is closed")]
    Closed,

    /// Pool error, such as no member being healthy at dispatch time.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Connecting to the selected upstream failed.
    #[error("failed to dispatch to upstream '{upstream}': {source}")]
    Dispatch {
        upstream: String,
        #[source]
        source: io::Error,
    },

    /// Connections were still open when the drain timeout elapsed.
    #[error("route '{listen}' drain timed out with {remaining} connection(s) open")]
    DrainTimeout { listen: String, remaining: usize },

    /// The accept loop ended abnormally.
    #[error("accept loop for '{listen}' panicked")]
    AcceptLoopPanicked { listen: String },

    /// One or more routes failed to close.
    #[error("failed to close {} route(s): {}", .0.len(), join_errors(.0))]
    Close(Vec<LbError>),
}

impl LbError {
    pub(crate) fn invalid_route(listen: &str, reason: impl Into<String>) -> Self {
        LbError::InvalidRoute {
            listen: listen.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true for per-connection failures that are logged and
    /// contained rather than escalated.
    pub fn is_per_connection(&self) -> bool {
        match self {
            LbError::Upstream(e) => e.is_no_healthy_upstream(),
            LbError::Dispatch { .. } => true,
            _ => false,
        }
    }

    /// Returns true for shutdown races that are not reported as failures.
    pub fn is_benign_close(&self) -> bool {
        match self {
            LbError::Closed => true,
            LbError::Close(errors) => errors.iter().all(LbError::is_benign_close),
            _ => false,
        }
    }
}

/// Socket errors seen while tearing down a relay whose peer already went
/// away. These end the relay but are not failures.
pub(crate) fn is_benign_close_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

fn join_errors(errors: &[LbError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
