/// Fatal failure kinds surfaced by the replay engine.
///
/// Recoverable conditions (an unknown collective kind, a process group the
/// local rank is not a member of, an unrecognized rebalance policy) are
/// handled in place by the scheduler and never become error values.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// A record is missing required fields or carries inconsistent values.
    #[error("malformed trace record at seq {seq}: {reason}")]
    BadTraceFormat { seq: usize, reason: String },

    /// The trace bytes could not be decoded at all.
    #[error("trace is not decodable: {0}")]
    TraceDecode(#[from] serde_json::Error),

    /// A location used a URL scheme no registered transport handles.
    #[error("unrecognized transport scheme `{0}`")]
    UnknownTransport(String),

    /// The requested communication backend is not available in this build.
    #[error("unsupported backend `{0}`")]
    UnsupportedBackend(String),

    /// A runtime parameter is unusable, e.g. a trace path that neither
    /// exists locally nor names a URL.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The backend failed while dispatching or completing an operation.
    #[error("backend failure at seq {seq}")]
    Backend {
        seq: usize,
        #[source]
        source: anyhow::Error,
    },
}
