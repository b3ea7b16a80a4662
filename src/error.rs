use thiserror::Error;

/// Failures surfaced by the exploitation core.
///
/// Value absence (a character position past the end of a row, a row past the
/// end of a table) is not an error; it is reported in-band as `Option::None`
/// by the fetch operations.
#[derive(Debug, Error)]
pub enum AttackError {
    /// The target answered with a non-success status, or the request failed
    /// at the transport level (DNS, connect, read).
    #[error("target '{url}' was unavailable ('{status}') during request '{request}'")]
    TargetUnavailable {
        url: String,
        request: String,
        status: String,
    },

    /// No payload family made the target sleep for this parameter.
    #[error("parameter '{0}' doesn't seem to be exploitable")]
    UnexploitableParameter(String),

    /// The oracle threshold must stay strictly greater than 1.
    #[error("the threshold must be greater than 1 (got {0})")]
    InvalidThreshold(f64),
}

pub type Result<T> = std::result::Result<T, AttackError>;
