//! Crossbar core library
//!
//! The client-facing connection factory of the crossbar coordination server:
//! one accept thread feeding 1-N selector threads over lock-free queues, an
//! optional pool of I/O worker threads, a bucketed expiry wheel reaping
//! sessionless connections, and a facade that wires the lifecycle together
//! (configure, start, join, shutdown, reconfigure).
//!
//! The factory treats the connection behind each socket as an opaque
//! capability (the [`Connection`] trait); the wire protocol lives entirely in
//! the trait implementation supplied through a [`ConnectionBuilder`].

use std::fmt;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for core operations
#[derive(Debug)]
pub enum Error {
    /// I/O errors from the socket or selector layer
    Io(std::io::Error),

    /// Configuration errors (fatal at configure time)
    Config(String),

    /// Operation not supported by this listener
    Unsupported(String),

    /// Operation invalid in the current lifecycle state
    State(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Config(msg) => write!(f, "Configuration error: {msg}"),
            Error::Unsupported(msg) => write!(f, "Unsupported operation: {msg}"),
            Error::State(msg) => write!(f, "Invalid lifecycle state: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<crossbar_transport::Error> for Error {
    fn from(err: crossbar_transport::Error) -> Self {
        match err {
            crossbar_transport::Error::Io(e) => Error::Io(e),
            crossbar_transport::Error::Other(msg) => Error::Config(msg),
        }
    }
}

pub mod accept;
pub mod config;
pub mod connection;
pub mod expiry;
pub mod factory;
pub mod ratelog;
pub mod selector;
pub mod timing;
pub mod worker;

pub use config::FactoryConfig;
pub use connection::{CnxnContext, ConnId, Connection, ConnectionBuilder};
pub use crossbar_transport::{Interest, Multiplexer, Waker};
pub use expiry::ExpiryQueue;
pub use factory::ConnectionFactory;
pub use worker::{WorkRequest, WorkerService};
