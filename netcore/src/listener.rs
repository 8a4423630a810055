//! The accept loop: owns a bound TCP socket and turns each inbound
//! connection into a [`Session`] with its own worker pair.
//!
//! Grounded on `VListenerThread::_runListening`: bind once, loop accepting
//! with a bounded timeout so `stop()` stays responsive, treat a timed-out
//! accept as routine, and never let one connection's session-creation
//! failure crash the loop. `std::net::TcpListener` has no native accept
//! timeout, so the bounded wait is emulated with a short nonblocking-accept
//! poll against `should_listen` rather than a true blocking timeout; this
//! still satisfies (and in fact beats) the "`stop()` responds within the
//! accept timeout" property, since the loop rechecks the flag far more
//! often than once per timeout window. The bind itself goes through
//! `socket2` so `config.backlog` (spec.md §6) reaches the real kernel listen
//! queue, which `std::net::TcpListener::bind` has no way to configure.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};
use wire::{MessageCodec, TcpByteStream};

use crate::config::{ListenerConfig, QueueLimits, StandbyLimits};
use crate::registry::HandlerRegistry;
use crate::server::Server;
use crate::session::{NoHandlerHook, Session};
use crate::worker::spawn_session_workers;

/// How often the accept loop re-polls a nonblocking accept while waiting
/// for either a connection or `should_listen` to flip.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything a [`Listener`] needs to turn a fresh socket into a fully
/// wired session: the codec, handler registry, and per-session limits. One
/// bundle is shared by every connection this listener accepts.
pub struct SessionFactory {
    pub client_type: String,
    pub codec: Arc<dyn MessageCodec>,
    pub registry: Arc<HandlerRegistry>,
    pub no_handler: Arc<dyn NoHandlerHook>,
    pub queue_limits: QueueLimits,
    pub standby_limits: StandbyLimits,
    /// Whether a newly accepted session starts already "online" (eligible
    /// for immediate broadcast delivery) or must be moved online explicitly
    /// via [`Session::go_online`] by application code.
    pub initially_online: bool,
}

struct ListenerState {
    accept_thread: Option<JoinHandle<()>>,
}

/// `Idle ↔ Listening` state machine (spec.md §4.6). Stopping and restarting
/// are both allowed.
pub struct Listener {
    config: ListenerConfig,
    server: Arc<Server>,
    factory: Arc<SessionFactory>,
    should_listen: Arc<AtomicBool>,
    state: Mutex<ListenerState>,
}

impl Listener {
    pub fn new(config: ListenerConfig, server: Arc<Server>, factory: SessionFactory) -> Arc<Self> {
        Arc::new(Self {
            config,
            server,
            factory: Arc::new(factory),
            should_listen: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(ListenerState { accept_thread: None }),
        })
    }

    pub fn is_listening(&self) -> bool {
        self.should_listen.load(Ordering::SeqCst)
    }

    /// Binds and starts the dedicated accept thread. A no-op if already
    /// listening.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.accept_thread.is_some() {
            return;
        }
        self.should_listen.store(true, Ordering::SeqCst);

        let listener = self.clone();
        let handle = thread::Builder::new()
            .name("listener-accept".to_string())
            .spawn(move || listener.accept_loop())
            .expect("failed to spawn listener accept thread");
        state.accept_thread = Some(handle);
    }

    /// Clears `should_listen` and waits for the accept thread to observe it
    /// and return. Responsive within one accept-poll window even if the
    /// thread is mid-accept, since the accept socket itself is nonblocking.
    pub fn stop(self: &Arc<Self>) {
        self.should_listen.store(false, Ordering::SeqCst);
        let handle = self.state.lock().unwrap().accept_thread.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn bind_address(&self) -> String {
        let host = if self.config.bind_address.is_empty() {
            "0.0.0.0"
        } else {
            &self.config.bind_address
        };
        format!("{host}:{}", self.config.port)
    }

    /// Resolves the configured bind address, then binds and listens through
    /// `socket2` so `config.backlog` actually reaches the kernel's listen
    /// queue depth — `std::net::TcpListener::bind` has no backlog parameter
    /// and always uses a fixed default.
    fn bind_listening_socket(&self, bind_addr: &str) -> std::io::Result<StdTcpListener> {
        let addr: SocketAddr = bind_addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "no resolvable bind address"))?;

        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.config.backlog as i32)?;
        Ok(socket.into())
    }

    fn accept_loop(self: Arc<Self>) {
        let bind_addr = self.bind_address();
        let std_listener = match self.bind_listening_socket(&bind_addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(address = %bind_addr, error = %e, "listener failed to bind; not starting accept loop");
                self.should_listen.store(false, Ordering::SeqCst);
                return;
            }
        };
        if let Err(e) = std_listener.set_nonblocking(true) {
            tracing::error!(error = %e, "listener failed to set nonblocking mode");
            self.should_listen.store(false, Ordering::SeqCst);
            return;
        }

        tracing::debug!(address = %bind_addr, "listener bound, accept loop starting");
        let deadline_window = self.config.accept_timeout.max(ACCEPT_POLL_INTERVAL);

        while self.should_listen.load(Ordering::SeqCst) {
            let window_start = Instant::now();
            loop {
                if !self.should_listen.load(Ordering::SeqCst) {
                    return;
                }
                match std_listener.accept() {
                    Ok((socket, addr)) => {
                        self.handle_accepted(socket, addr.to_string());
                        break;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        if window_start.elapsed() >= deadline_window {
                            // Accept timeout elapsed with nothing pending;
                            // normal, loop continues (spec.md §4.6).
                            break;
                        }
                        thread::sleep(ACCEPT_POLL_INTERVAL.min(deadline_window));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "listener accept failed; backing off");
                        self.should_listen.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
        }
        tracing::debug!(address = %bind_addr, "listener accept loop stopped");
    }

    fn handle_accepted(&self, socket: std::net::TcpStream, peer_addr: String) {
        if let Err(e) = socket.set_nonblocking(false) {
            tracing::error!(peer = %peer_addr, error = %e, "failed to set accepted socket blocking; dropping connection");
            return;
        }

        let session = Session::new(
            peer_addr.clone(),
            self.factory.client_type.clone(),
            peer_addr.clone(),
            Box::new(TcpByteStream::new(socket)),
            self.server.clone(),
            self.factory.codec.clone(),
            self.factory.no_handler.clone(),
            self.factory.queue_limits.clone(),
            self.factory.standby_limits.clone(),
            self.factory.initially_online,
        );

        match spawn_session_workers(&session, self.factory.registry.clone()) {
            Ok(()) => {
                self.server.add_session(session);
            }
            Err(e) => {
                tracing::error!(peer = %peer_addr, error = %e, "session creation failed; closing accepted socket");
                // Session::new already owns the socket; dropping it closes
                // the underlying fd, so there is nothing further to release
                // here. The accept loop continues regardless.
            }
        }
    }
}
