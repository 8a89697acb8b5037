// src/server.rs
//! The reactor: one thread waiting on epoll, handing parsed work to the pool.
//!
//! Every connection is registered one-shot, so at most one readiness event
//! is outstanding per socket. Whoever receives that event owns the slot until
//! it re-arms or tears the connection down, and the claim on the slot is
//! always dropped before the re-arm that hands ownership back.

use crate::config::ServerConfig;
use crate::conn::Flush;
use crate::error::EtudeResult;
use crate::http::BUSY_BODY;
use crate::pool::{Task, WorkerPool};
use crate::slab::{ConnectionTable, SlotGuard};
use crate::syscalls::{self, Epoll, Interest};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: u64 = u64::MAX;
/// Wait timeout while rejected hand-offs are queued for retry.
const RETRY_TIMEOUT_MS: i32 = 5;

/// State shared by the reactor and every queued task.
pub struct ServerContext {
    epoll: Epoll,
    table: ConnectionTable,
    doc_root: PathBuf,
}

impl ServerContext {
    pub fn live_connections(&self) -> usize {
        self.table.live()
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    /// Drop the claim, then hand the socket back to epoll for one more event.
    fn rearm(&self, index: usize, conn: SlotGuard<'_>, interest: Interest) {
        let Some(fd) = conn.raw_fd() else {
            self.teardown(index, conn);
            return;
        };
        drop(conn);
        if let Err(e) = self.epoll.rearm(fd, index as u64, interest) {
            warn!(slot = index, "re-arm failed: {}", e);
            // Still disarmed, so nobody else can have claimed it.
            if let Some(conn) = self.table.claim(index) {
                self.teardown(index, conn);
            }
        }
    }

    /// Deregister, close the socket and return the slot to the free list.
    fn teardown(&self, index: usize, mut conn: SlotGuard<'_>) {
        if let Some(fd) = conn.raw_fd() {
            if let Err(e) = self.epoll.delete(fd) {
                debug!(slot = index, "epoll delete failed: {}", e);
            }
        }
        debug!(slot = index, peer = ?conn.peer(), "connection closed");
        conn.close();
        drop(conn);
        self.table.release(index);
    }
}

/// Parse and respond for one slot on a pool thread.
pub struct ConnTask {
    ctx: Arc<ServerContext>,
    index: usize,
}

impl Task for ConnTask {
    fn process(&mut self) {
        let Some(mut conn) = self.ctx.table.claim(self.index) else {
            warn!(slot = self.index, "worker found slot already owned");
            return;
        };
        match conn.process(&self.ctx.doc_root) {
            Some(interest) => self.ctx.rearm(self.index, conn, interest),
            None => self.ctx.teardown(self.index, conn),
        }
    }
}

pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl Server {
    /// Bind the listening socket and set up epoll and the connection table.
    pub fn bind(config: ServerConfig) -> EtudeResult<Self> {
        config.validate()?;

        let listener = syscalls::create_listen_socket(config.bind_addr, config.port, config.backlog)?;
        let epoll = Epoll::new()?;
        epoll.add_listener(listener.as_raw_fd(), LISTENER_TOKEN)?;
        let table = ConnectionTable::new(config.max_connections)?;

        let ctx = Arc::new(ServerContext {
            epoll,
            table,
            doc_root: config.doc_root.clone(),
        });
        info!(
            addr = %listener.local_addr()?,
            doc_root = %config.doc_root.display(),
            workers = config.workers,
            "listening"
        );

        Ok(Self { config, listener, ctx })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Run the event loop. Returns 1 if the worker pool cannot start and 0
    /// once epoll fails.
    pub fn serve_forever(&mut self) -> i32 {
        let pool = match WorkerPool::new(self.config.workers, self.config.max_queued_tasks) {
            Ok(pool) => pool,
            Err(e) => {
                error!("failed to start worker pool: {}", e);
                return 1;
            }
        };

        let mut events = syscalls::empty_events(self.config.max_events);
        let mut deferred = VecDeque::new();

        loop {
            self.retry_deferred(&pool, &mut deferred);
            let timeout = if deferred.is_empty() { -1 } else { RETRY_TIMEOUT_MS };

            let n = match self.ctx.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(e) => {
                    error!("epoll wait failed: {}", e);
                    break;
                }
            };

            for ev in &events[..n] {
                let token = ev.u64;
                let flags = ev.events;

                if token == LISTENER_TOKEN {
                    self.accept_all();
                    continue;
                }

                let index = token as usize;
                if syscalls::is_hangup(flags) {
                    self.close_slot(index);
                } else if syscalls::is_readable(flags) {
                    self.on_readable(index, &pool, &mut deferred);
                } else if syscalls::is_writable(flags) {
                    self.on_writable(index);
                }
            }
        }

        0
    }

    fn accept_all(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.register(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn register(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(%peer, "set_nonblocking failed: {}", e);
            return;
        }
        if let Err(e) = syscalls::set_reuse_addr(stream.as_raw_fd()) {
            debug!(%peer, "SO_REUSEADDR failed: {}", e);
        }

        let Some(index) = self.ctx.table.allocate() else {
            warn!(%peer, live = self.ctx.table.live(), "connection table full");
            reject_busy(stream);
            return;
        };
        let Some(mut conn) = self.ctx.table.claim(index) else {
            error!(slot = index, "freshly allocated slot is already owned");
            self.ctx.table.release(index);
            return;
        };

        let fd = stream.as_raw_fd();
        conn.init(stream, peer);
        drop(conn);

        if let Err(e) = self.ctx.epoll.add_oneshot(fd, index as u64, Interest::Read) {
            warn!(slot = index, %peer, "epoll add failed: {}", e);
            if let Some(conn) = self.ctx.table.claim(index) {
                self.ctx.teardown(index, conn);
            }
        }
    }

    fn on_readable(
        &self,
        index: usize,
        pool: &WorkerPool<ConnTask>,
        deferred: &mut VecDeque<usize>,
    ) {
        let Some(mut conn) = self.ctx.table.claim(index) else {
            warn!(slot = index, "read readiness for an owned or vacant slot");
            return;
        };
        match conn.read() {
            Ok(_) => {
                drop(conn);
                self.dispatch(index, pool, deferred);
            }
            Err(e) => {
                debug!(slot = index, "read ended: {}", e);
                self.ctx.teardown(index, conn);
            }
        }
    }

    fn on_writable(&self, index: usize) {
        let Some(mut conn) = self.ctx.table.claim(index) else {
            warn!(slot = index, "write readiness for an owned or vacant slot");
            return;
        };
        match conn.write() {
            Ok(Flush::Pending) => self.ctx.rearm(index, conn, Interest::Write),
            Ok(Flush::Done { keep_alive: true }) | Ok(Flush::Idle) => {
                self.ctx.rearm(index, conn, Interest::Read)
            }
            Ok(Flush::Done { keep_alive: false }) => self.ctx.teardown(index, conn),
            Err(e) => {
                debug!(slot = index, "write failed: {}", e);
                self.ctx.teardown(index, conn);
            }
        }
    }

    fn close_slot(&self, index: usize) {
        match self.ctx.table.claim(index) {
            Some(conn) => self.ctx.teardown(index, conn),
            None => warn!(slot = index, "hang-up for an owned or vacant slot"),
        }
    }

    /// Queue the slot for a worker. A full queue parks it in `deferred`; the
    /// slot stays disarmed so nothing else can touch it meanwhile.
    fn dispatch(&self, index: usize, pool: &WorkerPool<ConnTask>, deferred: &mut VecDeque<usize>) {
        let task = ConnTask {
            ctx: Arc::clone(&self.ctx),
            index,
        };
        if pool.append(task).is_err() {
            warn!(slot = index, "worker queue full, deferring hand-off");
            deferred.push_back(index);
        }
    }

    fn retry_deferred(&self, pool: &WorkerPool<ConnTask>, deferred: &mut VecDeque<usize>) {
        while let Some(index) = deferred.pop_front() {
            let task = ConnTask {
                ctx: Arc::clone(&self.ctx),
                index,
            };
            if pool.append(task).is_err() {
                deferred.push_front(index);
                break;
            }
        }
    }
}

fn reject_busy(mut stream: TcpStream) {
    if let Err(e) = stream.write(BUSY_BODY) {
        debug!("busy notice not delivered: {}", e);
    }
}
