use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation failed: {}", .messages.join("; "))]
    Validation { messages: Vec<String> },
}
