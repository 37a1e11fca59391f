#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Connection to the presence store was lost")]
    ConnectionLost,
    #[error("Concurrent write conflict")]
    Conflict,
    #[error("Transaction gave up after {attempts} conflicting attempts")]
    RetryExhausted { attempts: u32 },
}

impl StoreError {
    /// Transient failures the caller may retry as a whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict | StoreError::RetryExhausted { .. })
    }
}
