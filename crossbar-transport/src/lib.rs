//! Crossbar transport primitives
//!
//! This crate provides the low-level I/O machinery shared by the crossbar
//! server threads: a readiness selector (`Multiplexer`) with a cross-thread
//! wakeup primitive, socket helpers for the listen/accept path, and the
//! per-thread reusable I/O buffer used by connection implementations.
//!
//! The selector is strictly single-owner: one thread creates it, registers
//! sockets on it and waits on it. Other threads may only hold a [`mux::Waker`]
//! cloned from it, which is safe to invoke from anywhere.

use std::fmt;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport layer error types
#[derive(Debug)]
pub enum Error {
    /// I/O errors from the selector or socket layer
    Io(std::io::Error),

    /// Other errors
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Other(msg) => write!(f, "Error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(target_os = "linux")]
impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

pub mod iobuf;
pub mod mux;
pub mod sock;

pub use mux::{Event, Interest, Multiplexer, Waker, WAKE_TOKEN};
