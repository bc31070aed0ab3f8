/// Error surfaced to workflow code through rejected futures.
///
/// This is the only error class workflow code ever observes; infrastructure
/// failures (lease loss, backend errors, replay mismatches) are handled at
/// the worker layer and never reach user code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    /// An activity, sub-workflow or the workflow itself returned an error.
    #[error("{0}")]
    Failure(String),
    /// The awaited operation was canceled before it produced a result.
    #[error("canceled")]
    Canceled,
}

impl WorkflowError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
