// src/lib.rs
//! A static-file HTTP/1.1 server built on an edge-triggered, one-shot epoll
//! reactor and a bounded worker pool.
//!
//! ```no_run
//! use etude::{Server, ServerConfig};
//! use std::net::Ipv4Addr;
//!
//! let config = ServerConfig::new(Ipv4Addr::UNSPECIFIED, 8080, "./public").workers(8);
//! let mut server = Server::bind(config)?;
//! std::process::exit(server.serve_forever());
//! # Ok::<(), etude::EtudeError>(())
//! ```

pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod mapped;
pub mod pool;
pub mod server;
pub mod slab;
pub mod sync;
pub mod syscalls;

// Re-exports for users
pub use config::ServerConfig;
pub use error::{EtudeError, EtudeResult};
pub use logging::init_logging;
pub use pool::{Task, WorkerPool};
pub use server::{Server, ServerContext};
