// src/config.rs
use crate::error::{EtudeError, EtudeResult};
use std::net::Ipv4Addr;
use std::path::PathBuf;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_MAX_QUEUED_TASKS: usize = 1000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 65536;
pub const DEFAULT_MAX_EVENTS: usize = 8192;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: Ipv4Addr,
    pub port: u16,
    /// Prepended verbatim to every request target.
    pub doc_root: PathBuf,
    pub workers: usize,
    pub max_queued_tasks: usize,
    pub max_connections: usize,
    pub max_events: usize,
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: Ipv4Addr::LOCALHOST,
            port: 8080,
            doc_root: PathBuf::from("./"),
            workers: DEFAULT_WORKERS,
            max_queued_tasks: DEFAULT_MAX_QUEUED_TASKS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_events: DEFAULT_MAX_EVENTS,
            backlog: libc::SOMAXCONN,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: Ipv4Addr, port: u16, doc_root: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr,
            port,
            doc_root: doc_root.into(),
            ..Self::default()
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn max_queued_tasks(mut self, max: usize) -> Self {
        self.max_queued_tasks = max;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn max_events(mut self, max: usize) -> Self {
        self.max_events = max;
        self
    }

    pub fn validate(&self) -> EtudeResult<()> {
        let checks = [
            (self.workers, "workers"),
            (self.max_queued_tasks, "max_queued_tasks"),
            (self.max_connections, "max_connections"),
            (self.max_events, "max_events"),
        ];
        if let Some((_, name)) = checks.iter().find(|(value, _)| *value == 0) {
            return Err(EtudeError::InvalidConfig(format!("{} must be at least 1", name)));
        }
        if self.doc_root.as_os_str().is_empty() {
            return Err(EtudeError::InvalidConfig("doc_root must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_queued_tasks, 1000);
        assert_eq!(config.max_connections, 65536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_counts_are_rejected() {
        let config = ServerConfig::default().workers(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("workers"));

        assert!(ServerConfig::default().max_queued_tasks(0).validate().is_err());
        assert!(ServerConfig::default().max_connections(0).validate().is_err());
        assert!(ServerConfig::default().max_events(0).validate().is_err());
    }

    #[test]
    fn empty_doc_root_is_rejected() {
        let config = ServerConfig::new(Ipv4Addr::LOCALHOST, 0, "");
        assert!(matches!(config.validate(), Err(EtudeError::InvalidConfig(_))));
    }
}
