use thiserror::Error;

/// An error produced by a memoized computation.
///
/// The error is shared by every caller joined on the same in-flight
/// computation, so it is `Clone` and carries rendered messages rather than
/// error sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    /// The underlying computation failed, for example a downstream call or
    /// a token exchange.
    ///
    /// The attached string contains the rendered failure.
    #[error("computation failed: {0}")]
    Upstream(String),
    /// The computation task was dropped before it settled.
    #[error("computation channel dropped")]
    ChannelDropped,
    /// An unexpected error in the coalescing core itself.
    #[error("internal error")]
    Internal,
}

impl From<std::io::Error> for ComputeError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl ComputeError {
    /// Logs an unexpected error and collapses it into [`Internal`](Self::Internal).
    ///
    /// Unexpected errors are not meant to be replayed to callers verbatim.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::Internal
    }
}

/// The outcome of a memoized computation, either `Ok(T)` or the error that
/// is replayed to every caller of the failed computation.
pub type ComputeResult<T> = Result<T, ComputeError>;
