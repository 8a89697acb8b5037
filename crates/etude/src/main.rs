use anyhow::Context;
use clap::Parser;
use etude::config::{
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_EVENTS, DEFAULT_MAX_QUEUED_TASKS, DEFAULT_WORKERS,
};
use etude::{Server, ServerConfig, init_logging, syscalls};
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Serve static files over HTTP/1.1 from an epoll reactor")]
#[command(version)]
struct Cli {
    /// IPv4 address to listen on
    host: Ipv4Addr,
    /// TCP port to listen on
    port: u16,
    /// Directory prepended to every request path
    #[arg(default_value = "./")]
    doc_root: PathBuf,
    /// Worker threads that parse requests
    #[arg(long, env = "ETUDE_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,
    /// Hand-offs that may wait for a worker before the reactor backs off
    #[arg(long, env = "ETUDE_MAX_QUEUED", default_value_t = DEFAULT_MAX_QUEUED_TASKS)]
    max_queued: usize,
    /// Simultaneous connections; extra clients get a busy notice
    #[arg(long, env = "ETUDE_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,
    /// Events fetched per epoll wait
    #[arg(long, env = "ETUDE_MAX_EVENTS", default_value_t = DEFAULT_MAX_EVENTS)]
    max_events: usize,
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = ServerConfig::new(cli.host, cli.port, cli.doc_root)
        .workers(cli.workers)
        .max_queued_tasks(cli.max_queued)
        .max_connections(cli.max_connections)
        .max_events(cli.max_events);

    let mut server = Server::bind(config)
        .with_context(|| format!("failed to start server on {}:{}", cli.host, cli.port))?;
    Ok(server.serve_forever())
}

fn main() {
    let cli = Cli::parse();
    init_logging();
    syscalls::ignore_sigpipe();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}
