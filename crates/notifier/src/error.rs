use thiserror::Error;

/// Failure of a single delivery attempt.
///
/// Never propagated past the pipeline: the display text is what lands in the log
/// entry's `error` column, so the prefix tells operators which side broke.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Network, authentication or SMTP rejection.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Missing sender, bad template or otherwise misconfigured service.
    #[error("Configuration error: {0}")]
    Configuration(String),
}
