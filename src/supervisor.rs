// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Connection supervisor: accepts sockets and runs one session per socket
//!
//! Thread per connection; each session owns its socket and context
//! exclusively, so nothing inside a session needs locking. The supervisor
//! enforces the global connection cap, keeps a registry for introspection
//! and drains sessions on shutdown.

use super::config::ServerConfig;
use super::error::Error;
use super::journal::TransferJournal;
use super::observer::TransferObserver;
use super::server::{serve_connection, PartnerSlots, Shared};
use super::stream::FileStore;
use super::tcp::{TcpChannel, TIMEOUT};
use super::tls::TlsAcceptor;
use super::transport::Channel;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// Registry row for one live session.
pub struct SessionInfo {
    pub id: u64,
    pub peer: String,
}

struct SessionHandle {
    peer: String,
    thread: thread::JoinHandle<()>,
}

struct Inner {
    config: RwLock<Arc<ServerConfig>>,
    store: Arc<dyn FileStore>,
    journal: Arc<dyn TransferJournal>,
    observer: Arc<dyn TransferObserver>,
    slots: Arc<PartnerSlots>,
    stop: Arc<AtomicBool>,
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    next_session_id: AtomicU64,
    tls: Option<TlsAcceptor>,
}

pub struct Supervisor {
    inner: Arc<Inner>,
    accept_thread: Option<thread::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Supervisor {
    /// Binds the configured address and starts accepting. TLS material is
    /// loaded once here; every accepted socket reuses it.
    pub fn start(
        config: ServerConfig,
        store: Arc<dyn FileStore>,
        journal: Arc<dyn TransferJournal>,
        observer: Arc<dyn TransferObserver>,
    ) -> Result<Supervisor, Error> {
        let tls = match &config.tls {
            Some(tls) => Some(TlsAcceptor::from_pem(
                &tls.cert_pem,
                &tls.key_pem,
                tls.ca_pem.as_deref(),
            )?),
            None => None,
        };
        let listener = TcpListener::bind((config.bind_address.as_str(), config.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        log::info!("listening on {}", local_addr);

        let inner = Arc::new(Inner {
            config: RwLock::new(Arc::new(config)),
            store,
            journal,
            observer,
            slots: Arc::new(PartnerSlots::new()),
            stop: Arc::new(AtomicBool::new(false)),
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            tls,
        });

        let accept_inner = inner.clone();
        let accept_thread = thread::Builder::new()
            .name("pesit-accept".to_string())
            .spawn(move || accept_loop(accept_inner, listener))?;

        Ok(Supervisor {
            inner,
            accept_thread: Some(accept_thread),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Swaps the configuration snapshot. Sessions already validating keep
    /// the snapshot they started with.
    pub fn reload(&self, config: ServerConfig) {
        *self.inner.config.write().unwrap() = Arc::new(config);
        log::info!("configuration reloaded");
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions = self.inner.sessions.lock().unwrap();
        sessions.retain(|_, h| !h.thread.is_finished());
        sessions
            .iter()
            .map(|(id, h)| SessionInfo {
                id: *id,
                peer: h.peer.clone(),
            })
            .collect()
    }

    /// Stops accepting, asks every session to finish its current round and
    /// waits up to `grace` before abandoning the stragglers.
    pub fn shutdown(mut self, grace: Duration) {
        self.inner.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let deadline = Instant::now() + grace;
        loop {
            let pending = {
                let mut sessions = self.inner.sessions.lock().unwrap();
                sessions.retain(|_, h| !h.thread.is_finished());
                sessions.len()
            };
            if pending == 0 {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!("shutdown grace expired with {} sessions live", pending);
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        log::info!("supervisor stopped");
    }
}

fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    while !inner.stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = admit(&inner, stream, addr) {
                    log::warn!("connection from {} not admitted: {}", addr, e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::error!("accept failed: {}", e);
                thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn admit(inner: &Arc<Inner>, stream: TcpStream, addr: SocketAddr) -> Result<(), Error> {
    // the listener is non-blocking; its sockets must not be
    stream.set_nonblocking(false)?;
    let config = inner.config.read().unwrap().clone();
    {
        let mut sessions = inner.sessions.lock().unwrap();
        sessions.retain(|_, h| !h.thread.is_finished());
        if sessions.len() >= config.max_connections {
            log::warn!(
                "refusing {}: {} connections already live",
                addr,
                sessions.len()
            );
            return Ok(()); // dropping the stream closes it
        }
    }

    let session_id = inner.next_session_id.fetch_add(1, Ordering::Relaxed);
    let channel: Box<dyn Channel> = match &inner.tls {
        Some(acceptor) => {
            stream.set_read_timeout(Some(TIMEOUT))?;
            stream.set_write_timeout(Some(TIMEOUT))?;
            Box::new(acceptor.accept(stream)?)
        }
        None => Box::new(TcpChannel::accepted(stream)?),
    };

    let shared = Shared {
        config,
        store: inner.store.clone(),
        journal: inner.journal.clone(),
        observer: inner.observer.clone(),
        slots: inner.slots.clone(),
        stop: inner.stop.clone(),
    };
    let peer = addr.to_string();
    let thread = thread::Builder::new()
        .name(format!("pesit-session-{}", session_id))
        .spawn(move || {
            log::debug!("session {} accepted from {}", session_id, peer);
            if let Err(e) = serve_connection(channel, session_id, shared) {
                log::warn!("session {} ended with error: {}", session_id, e);
            } else {
                log::debug!("session {} finished", session_id);
            }
        })?;

    inner.sessions.lock().unwrap().insert(
        session_id,
        SessionHandle {
            peer: addr.to_string(),
            thread,
        },
    );
    Ok(())
}
