//! Common error types for IMEX

use thiserror::Error;

/// Common result type for IMEX operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across IMEX microservices
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Message body serialization or deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker operation failed (closed channel, missing queue, ...)
    #[error("Broker error: {0}")]
    Broker(String),

    /// Publish targeted an exchange that has not been declared
    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    /// A published message could not be routed to any queue
    #[error("Message unroutable: exchange={exchange} routing_key={routing_key}")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    /// Publisher confirms did not arrive within the configured attempts
    #[error("Timed out waiting for publish confirms after {attempts} attempts")]
    ConfirmTimeout { attempts: u32 },

    /// The broker negatively acknowledged a publish
    #[error("Broker nacked publish seq {publish_seq}")]
    PublishNacked { publish_seq: u64 },

    /// A delivery was acked or nacked a second time
    #[error("Delivery {delivery_tag} was already acked or nacked")]
    DeliveryAlreadyFinalized { delivery_tag: u64 },

    /// Message envelope headers were missing or malformed
    #[error("Malformed message header: {0}")]
    MalformedHeader(String),

    /// A component has already raised a fatal error and refuses further work
    #[error("Component has faulted fatally: {0}")]
    Faulted(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
