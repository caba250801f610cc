use thiserror::Error;

/// Error kinds shared by every engine in this workspace.
///
/// Only [`RefDataError::ConfigurationMissing`] is meant to surface to a
/// caller as an `Err`; every other variant is caught at the engine boundary
/// and converted into a degraded artifact (minimal factor/map file, `NaN`
/// fundamental, or a preserved prior file) per the propagation policy.
#[derive(Error, Debug)]
pub enum RefDataError {
    #[error("not applicable: {0}")]
    NotApplicable(String),

    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("disk corruption: {0}")]
    DiskCorruption(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RefDataError {
    fn from(e: std::io::Error) -> Self {
        RefDataError::Io(e.to_string())
    }
}
