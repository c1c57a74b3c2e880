use hearth_core::envelope::EnvelopeError;
use hearth_store::StoreError;

/// Failures scoped to a single operation. Nothing here is fatal to the
/// process; handlers answer with an error envelope and the connection stays
/// open.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("bad envelope: {0}")]
    BadEnvelope(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Wire error code carried inside the error envelope.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Busy(_) => "BUSY",
            Self::BadEnvelope(_) => "BAD_ENVELOPE",
            Self::Store(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<EnvelopeError> for EngineError {
    fn from(e: EnvelopeError) -> Self {
        EngineError::BadEnvelope(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        assert_eq!(EngineError::Forbidden("x".into()).wire_code(), "FORBIDDEN");
        assert_eq!(EngineError::NotFound("x".into()).wire_code(), "NOT_FOUND");
        assert_eq!(EngineError::Busy("x".into()).wire_code(), "BUSY");
        assert_eq!(
            EngineError::BadEnvelope("x".into()).wire_code(),
            "BAD_ENVELOPE"
        );
        assert_eq!(
            EngineError::Store(StoreError::Database("x".into())).wire_code(),
            "INTERNAL_ERROR"
        );
    }
}
