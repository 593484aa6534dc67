use std::sync::Arc;

/// Failure to bring an engine up. Fatal: nothing should be served without a
/// loaded engine.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("failed to set up device: {0:#}")]
    Device(anyhow::Error),

    #[error("failed to load weights for {model}: {source:#}")]
    Weights {
        model: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Failure of a single `generate` call. Scoped to the job that caused it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("invalid generation parameters: {0}")]
    InvalidParams(String),

    #[error("engine failure: {0:#}")]
    Engine(Arc<anyhow::Error>),

    #[error("engine panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for GenerationError {
    fn from(err: anyhow::Error) -> Self {
        GenerationError::Engine(Arc::new(err))
    }
}

/// Outcome delivered to a waiting caller when its job did not produce an image.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// The dispatcher stopped before the job was dequeued.
    #[error("job abandoned: dispatcher is shutting down")]
    Abandoned,
}

/// Returned by `Dispatcher::try_submit` when the configured queue limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue is full ({limit} jobs waiting)")]
pub struct QueueFull {
    pub limit: usize,
}
