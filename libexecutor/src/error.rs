use common::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The execution could not begin; no pack work ran.
    #[error("start failed: {0}")]
    StartFailed(String),
    #[error("pack runtime {0} is not supported by this agent")]
    RuntimeIncompatible(String),
    #[error("pod {0} already has a live execution")]
    AlreadyRunning(String),
    #[error("executor queue is full")]
    QueueFull,
    #[error("bundle acquisition failed: {0}")]
    Bundle(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ExecutorError::StartFailed(_) => ErrorCode::Internal,
            ExecutorError::RuntimeIncompatible(_) => ErrorCode::RuntimeIncompatible,
            ExecutorError::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
            ExecutorError::QueueFull => ErrorCode::RateLimit,
            ExecutorError::Bundle(_) => ErrorCode::TransientIo,
            ExecutorError::Io(_) => ErrorCode::TransientIo,
        }
    }
}
