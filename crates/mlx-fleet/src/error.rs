//! Error taxonomy for the dispatcher and supervisor.
//!
//! Recoverable I/O failures are values, not panics: each is caught at the
//! task boundary, recorded into metrics, and surfaced as an HTTP status or a
//! log entry.

use thiserror::Error;

/// Failures while dispatching a client request to a worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No instance is `Running` with a permitting circuit breaker.
    /// Surfaced to the client as 503.
    #[error("No healthy MLX instances available")]
    NoHealthyInstances,

    /// The worker answered with a non-2xx status.
    #[error("instance {id} returned status {status}")]
    Upstream { id: usize, status: u16 },

    /// The proxy request exceeded its deadline.
    #[error("request to instance {id} timed out")]
    UpstreamTimeout { id: usize },

    /// Connection-level failure talking to the worker.
    #[error("transport error for instance {id}: {source}")]
    Transport {
        id: usize,
        #[source]
        source: reqwest::Error,
    },

    /// The worker returned a body that is not valid JSON.
    #[error("instance {id} returned a malformed response: {source}")]
    Decode {
        id: usize,
        #[source]
        source: reqwest::Error,
    },

    /// The client sent a body that is not valid JSON.
    #[error("invalid request body: {0}")]
    InvalidBody(#[from] serde_json::Error),
}

impl DispatchError {
    /// HTTP status the controller should answer the client with.
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::NoHealthyInstances => 503,
            _ => 500,
        }
    }
}

/// Failures while managing a worker process's lifetime.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The worker binary could not be spawned. Not retried automatically.
    #[error("failed to spawn worker for instance {id}: {source}")]
    Spawn {
        id: usize,
        #[source]
        source: std::io::Error,
    },

    /// The worker never became healthy within the startup deadline.
    #[error("instance {id} failed to become healthy within {deadline_secs} seconds")]
    StartupTimeout { id: usize, deadline_secs: u64 },

    /// The restart budget is spent; the instance is terminally failed until
    /// the controller restarts.
    #[error("instance {id} exceeded max restart attempts ({attempts})")]
    BudgetExceeded { id: usize, attempts: u32 },
}
