//! Dispatch registry: message id → handler factory.
//!
//! Grounded on `VMessageHandler::get`/`VMessageHandlerFactory`: a process-
//! wide map populated during bootstrap, then read-only, plus the optional
//! "factory declares a shared mutex, acquired around message processing"
//! discipline so handlers don't each reimplement locking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use wire::Message;

use crate::error::NetResult;
use crate::server::Server;
use crate::session::SessionRef;

/// Everything a handler needs to do its work, assembled by the input
/// worker for each dispatched message.
pub struct HandlerContext {
    pub message: Message,
    pub server: Arc<Server>,
    pub session: SessionRef,
}

/// A per-message unit of application logic. Constructed fresh for each
/// dispatched message by a [`HandlerFactory`] and dropped immediately after
/// `process` returns.
pub trait Handler: Send {
    fn process(&mut self, ctx: &HandlerContext) -> NetResult<()>;
}

type HandlerFactory = dyn Fn(&HandlerContext) -> Box<dyn Handler> + Send + Sync;

struct Entry {
    factory: Box<HandlerFactory>,
    /// A mutex some factories opt into: acquired immediately before
    /// `process` and released immediately after, giving handlers mutual
    /// exclusion without each one re-implementing it.
    shared_mutex: Option<Arc<Mutex<()>>>,
}

/// Maps message id to handler factory. Populated once during bootstrap
/// (before the listener starts); after that, reads never mutate it, so no
/// lock is needed to consult it concurrently from many input workers.
pub struct HandlerRegistry {
    factories: HashMap<i32, Entry>,
    mutex_wait_warn_threshold: Duration,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            mutex_wait_warn_threshold: Duration::from_millis(500),
        }
    }

    pub fn with_mutex_wait_warn_threshold(mut self, threshold: Duration) -> Self {
        self.mutex_wait_warn_threshold = threshold;
        self
    }

    /// Registers a factory with no shared-mutex discipline.
    pub fn register<F>(&mut self, id: i32, factory: F)
    where
        F: Fn(&HandlerContext) -> Box<dyn Handler> + Send + Sync + 'static,
    {
        self.factories.insert(
            id,
            Entry {
                factory: Box::new(factory),
                shared_mutex: None,
            },
        );
    }

    /// Registers a factory whose handlers must hold `mutex` while processing.
    pub fn register_with_mutex<F>(&mut self, id: i32, mutex: Arc<Mutex<()>>, factory: F)
    where
        F: Fn(&HandlerContext) -> Box<dyn Handler> + Send + Sync + 'static,
    {
        self.factories.insert(
            id,
            Entry {
                factory: Box::new(factory),
                shared_mutex: Some(mutex),
            },
        );
    }

    /// Looks up the factory for `ctx.message`'s id, constructs a handler,
    /// runs it (under the factory's mutex if it declared one), and returns
    /// its result. Returns `None` if no factory is registered for that id.
    pub fn dispatch(&self, ctx: &HandlerContext) -> Option<NetResult<()>> {
        let entry = self.factories.get(&ctx.message.id())?;
        let mut handler = (entry.factory)(ctx);

        let result = match &entry.shared_mutex {
            Some(mutex) => {
                let wait_start = Instant::now();
                let _guard = mutex.lock().unwrap();
                let waited = wait_start.elapsed();
                if waited > self.mutex_wait_warn_threshold {
                    tracing::warn!(
                        wait_ms = waited.as_millis() as u64,
                        id = ctx.message.id(),
                        "handler mutex wait exceeded threshold"
                    );
                }
                handler.process(ctx)
            }
            None => handler.process(ctx),
        };

        Some(result)
    }

    pub fn is_registered(&self, id: i32) -> bool {
        self.factories.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use wire::{DefaultCodec, TcpByteStream};

    struct CountingHandler(Arc<AtomicUsize>);
    impl Handler for CountingHandler {
        fn process(&mut self, _ctx: &HandlerContext) -> NetResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_session() -> Arc<Session> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server_sock, _) = listener.accept().unwrap();
        let _client = client.join().unwrap();
        Session::for_test(TcpByteStream::new(server_sock), Arc::new(DefaultCodec))
    }

    #[test]
    fn dispatch_returns_none_for_unregistered_id() {
        let registry = HandlerRegistry::new();
        let ctx = HandlerContext {
            message: Message::with_payload(999, vec![]),
            server: Server::new(),
            session: SessionRef::acquire(test_session()),
        };
        assert!(registry.dispatch(&ctx).is_none());
    }

    #[test]
    fn dispatch_invokes_registered_factory() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let count_clone = count.clone();
        registry.register(1, move |_ctx| {
            Box::new(CountingHandler(count_clone.clone())) as Box<dyn Handler>
        });

        let ctx = HandlerContext {
            message: Message::with_payload(1, vec![]),
            server: Server::new(),
            session: SessionRef::acquire(test_session()),
        };
        assert!(registry.dispatch(&ctx).unwrap().is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mutex_discipline_serializes_concurrent_dispatch() {
        let mutex = Arc::new(Mutex::new(()));
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let count_clone = count.clone();
        registry.register_with_mutex(1, mutex, move |_ctx| {
            Box::new(CountingHandler(count_clone.clone())) as Box<dyn Handler>
        });

        let ctx = HandlerContext {
            message: Message::with_payload(1, vec![]),
            server: Server::new(),
            session: SessionRef::acquire(test_session()),
        };
        registry.dispatch(&ctx).unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
