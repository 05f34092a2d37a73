use thiserror::Error;

/// Outcome bucket a finished submission folds into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareResult {
    Valid,
    Stale,
    Invalid,
}

/// Errors a work source can return from a share/block submission.
///
/// Classification is fixed: `StaleWork` and `SameWork` count as stale,
/// every other error counts as invalid, success counts as valid.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("stale work: job {0} was superseded")]
    StaleWork(String),

    #[error("same work: block already submitted")]
    SameWork,

    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("transport failure: {0}")]
    Connection(String),
}

impl SubmitError {
    pub fn classify(&self) -> ShareResult {
        match self {
            SubmitError::StaleWork(_) | SubmitError::SameWork => ShareResult::Stale,
            _ => ShareResult::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        assert_eq!(
            SubmitError::StaleWork("job-7".into()).classify(),
            ShareResult::Stale
        );
        assert_eq!(SubmitError::SameWork.classify(), ShareResult::Stale);
        assert_eq!(
            SubmitError::Rejected("low difficulty".into()).classify(),
            ShareResult::Invalid
        );
        assert_eq!(
            SubmitError::Connection("broken pipe".into()).classify(),
            ShareResult::Invalid
        );
    }
}
