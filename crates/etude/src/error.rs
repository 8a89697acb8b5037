// src/error.rs
use std::fmt;
use std::io;

use thiserror::Error;

/// Central error type for server setup and the reactor loop.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A synchronization primitive could not be created or used.
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// The worker pool could not be built.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type EtudeResult<T> = Result<T, EtudeError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to initialise {primitive}: {source}")]
    Init {
        primitive: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("lock operation failed: {source}")]
    Lock {
        #[source]
        source: io::Error,
    },
    #[error("signal operation failed: {source}")]
    Signal {
        #[source]
        source: io::Error,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool needs at least one thread")]
    InvalidThreadCount,
    #[error("worker pool needs a queue capacity of at least one")]
    InvalidQueueCapacity,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Failure of a single exchange on one connection. Every variant ends in teardown.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("read buffer is full")]
    ReadBufferFull,
    #[error("response header does not fit the write buffer")]
    ResponseOverflow,
    #[error("slot has no socket attached")]
    NotConnected,
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A task the pool refused because its queue was at capacity.
///
/// The task is handed back so the caller can retry it later.
pub struct QueueFull<T>(pub T);

impl<T> QueueFull<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

impl<T> fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("worker queue is full")
    }
}

impl<T> std::error::Error for QueueFull<T> {}
