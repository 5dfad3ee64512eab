/// Structured error types for the broker node
///
/// Errors are grouped by how the caller is expected to react:
/// - `ServiceError`: fatal construction errors, startup aborts
/// - `ClusterError`: membership transport failures, usually logged and survived
/// - `EventError`: per-event protocol failures, reported and skipped
/// - `LicenseError` / `ConfigError`: collaborator failures surfaced through `ServiceError`
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid license: {0}")]
    InvalidLicense(#[source] LicenseError),

    #[error("Invalid cipher: {0}")]
    InvalidCipher(#[source] LicenseError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Service is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Failed to bind gossip transport on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to join any seed: {0}")]
    JoinFailed(String),

    #[error("User event exceeds limit of {limit} bytes (size {size})")]
    EventTooLarge { size: usize, limit: usize },

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Decoding error: {0}")]
    Decode(String),

    #[error("Message authentication failed")]
    Unauthenticated,

    #[error("Membership transport is shut down")]
    Shutdown,
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Failed to decode event payload: {0}")]
    Decode(String),

    #[error("Failed to encode event payload: {0}")]
    Encode(String),

    #[error("Received unknown event name: {0}")]
    UnknownEvent(String),

    #[error("Broadcast failed: {0}")]
    Broadcast(#[from] ClusterError),
}

#[derive(Error, Debug)]
pub enum LicenseError {
    #[error("License is empty")]
    Empty,

    #[error("License is not valid base64: {0}")]
    Encoding(String),

    #[error("License payload is malformed: {0}")]
    Malformed(String),

    #[error("License expired at {0}")]
    Expired(chrono::DateTime<chrono::Utc>),

    #[error("License carries no key material")]
    InvalidCipher,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("Invalid config field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
}

pub type ServiceResult<T> = Result<T, ServiceError>;
pub type ClusterResult<T> = Result<T, ClusterError>;
