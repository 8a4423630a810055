//! Input and output worker run loops, one pair per session, each on its own
//! OS thread.
//!
//! Grounded on `VMessageInputThread::run`/`_dispatchMessage` for the input
//! side (error taxonomy, the post-shutdown spin-wait for the output worker)
//! and `VMessageOutputThread::run`/`postOutputMessage` for the output side
//! (queue-limit/grace-period enforcement lives on [`crate::session::Session`]
//! itself, since posting and dequeuing both need it). Per spec.md §9
//! ("move ownership of the worker into the spawned task"), neither thread is
//! joined by its spawner; each owns its own `Arc<Session>` clone and the
//! thread's natural exit is what drops it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use wire::WireError;

use crate::error::NetError;
use crate::queue::MessageQueue;
use crate::registry::{HandlerContext, HandlerRegistry};
use crate::session::{Outbound, OutputWorkerHandle, Session, SessionRef, ShutdownCaller, WorkerHandle};

/// How long the post-shutdown spin-wait sleeps between checks of "has
/// output worker". Grounded on `vmessageinputthread.cpp`'s 50ms poll.
const SPIN_WAIT_POLL: Duration = Duration::from_millis(50);

/// How long the spin-wait may run before it starts logging a warning.
/// Grounded on `vmessageinputthread.cpp`'s 15-second threshold.
const SPIN_WAIT_WARN_THRESHOLD: Duration = Duration::from_secs(15);

/// Spawns the input/output worker pair for `session` and attaches their
/// control handles to it. Returns `ResourceExhaustion` (without leaving a
/// half-started pair running) if the OS refuses either thread.
pub(crate) fn spawn_session_workers(
    session: &Arc<Session>,
    registry: Arc<HandlerRegistry>,
) -> Result<(), NetError> {
    let output_running = Arc::new(AtomicBool::new(true));
    let queue: Arc<MessageQueue<Outbound>> = Arc::new(MessageQueue::new());
    let input_running = Arc::new(AtomicBool::new(true));

    session.attach_workers(
        WorkerHandle::new(input_running.clone()),
        OutputWorkerHandle::new(output_running.clone(), queue.clone()),
    );

    let output_spawn = {
        let session = session.clone();
        let running = output_running.clone();
        let queue = queue.clone();
        thread::Builder::new()
            .name(format!("{}-output", session.name()))
            .spawn(move || output_worker_loop(session, queue, running))
    };
    if let Err(e) = output_spawn {
        return Err(NetError::ResourceExhaustion {
            reason: format!("failed to spawn output worker thread: {e}"),
        });
    }

    let input_spawn = {
        let session = session.clone();
        let running = input_running.clone();
        thread::Builder::new()
            .name(format!("{}-input", session.name()))
            .spawn(move || input_worker_loop(session, registry, running))
    };
    if let Err(e) = input_spawn {
        // The output worker is already running; stop it rather than leaking
        // a half-formed session.
        output_running.store(false, Ordering::SeqCst);
        queue.wake();
        return Err(NetError::ResourceExhaustion {
            reason: format!("failed to spawn input worker thread: {e}"),
        });
    }

    Ok(())
}

fn input_worker_loop(session: Arc<Session>, registry: Arc<HandlerRegistry>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let decoded = {
            let mut stream = session.lock_stream();
            session.codec().decode_message(&mut **stream)
        };

        match decoded {
            Ok(message) => {
                let id = message.id();
                let ctx = HandlerContext {
                    message,
                    server: session.server().clone(),
                    session: SessionRef::acquire(session.clone()),
                };
                match registry.dispatch(&ctx) {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        tracing::warn!(session = %session.name(), id, error = %e, "handler failed; connection stays open");
                    }
                    None => {
                        tracing::debug!(session = %session.name(), id, "no handler registered for message id");
                        if let Some(reply) = session.no_handler_hook().handle(&ctx.message) {
                            session.post(reply);
                        }
                    }
                }
            }
            Err(WireError::Closed) => {
                tracing::debug!(session = %session.name(), "peer closed connection");
                break;
            }
            Err(e) => {
                tracing::error!(session = %session.name(), error = %e, "input worker terminating on transport error");
                break;
            }
        }
    }

    session.shutdown(ShutdownCaller::Input);
    wait_for_output_worker_to_clear(&session);
}

/// Grounded on `vmessageinputthread.cpp`'s post-shutdown wait: the input
/// worker cannot finish until the output worker has observably cleared
/// itself, since external code reads "has output worker" without the
/// session mutex on the assumption it is set once and cleared once.
fn wait_for_output_worker_to_clear(session: &Arc<Session>) {
    let start = Instant::now();
    let mut warned = false;
    while session.has_output_worker_flag().load(Ordering::SeqCst) {
        thread::sleep(SPIN_WAIT_POLL);
        if !warned && start.elapsed() > SPIN_WAIT_WARN_THRESHOLD {
            warned = true;
            tracing::warn!(
                session = %session.name(),
                waited_secs = start.elapsed().as_secs(),
                "input worker still waiting for output worker to clear"
            );
        }
    }
}

fn output_worker_loop(session: Arc<Session>, queue: Arc<MessageQueue<Outbound>>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let item = match queue.blocking_next() {
            Some(item) => item,
            None => continue,
        };
        if let Err(e) = session.send_to_peer(&item) {
            tracing::error!(session = %session.name(), error = %e, "output worker terminating on transport error");
            break;
        }
    }

    session.shutdown(ShutdownCaller::Output);
    session.clear_output_worker();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueLimits, StandbyLimits};
    use crate::registry::Handler;
    use crate::server::Server;
    use crate::session::DefaultNoHandlerHook;
    use std::net::TcpListener;
    use wire::{DefaultCodec, Message, MessageCodec, TcpByteStream};

    struct EchoHandler;

    impl Handler for EchoHandler {
        fn process(&mut self, ctx: &HandlerContext) -> crate::error::NetResult<()> {
            let mut reply = ctx.message.clone();
            reply.recycle_for_send(2);
            ctx.session.post(reply);
            Ok(())
        }
    }

    fn loopback_pair() -> (TcpByteStream, TcpByteStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || std::net::TcpStream::connect(addr).unwrap());
        let (server_sock, _) = listener.accept().unwrap();
        (TcpByteStream::new(server_sock), TcpByteStream::new(client.join().unwrap()))
    }

    /// Exercises `spawn_session_workers` end to end over a real loopback
    /// socket: the input worker decodes a request, dispatches it to a
    /// registered handler, the handler posts a reply, and the output worker
    /// writes it back out. Covers spec.md §8 scenario 1 (echo) and, via the
    /// registry's `None` branch in `input_worker_loop`, sets up scenario 2's
    /// path for unregistered ids even though this test only exercises id 1.
    #[test]
    fn spawned_workers_echo_a_message_round_trip() {
        let (server_stream, mut client) = loopback_pair();

        let mut registry = HandlerRegistry::new();
        registry.register(1, |_ctx: &HandlerContext| Box::new(EchoHandler) as Box<dyn Handler>);

        let session = Session::new(
            "t".into(),
            "t".into(),
            "127.0.0.1:0".into(),
            Box::new(server_stream),
            Server::new(),
            Arc::new(DefaultCodec),
            Arc::new(DefaultNoHandlerHook::new(-1)),
            QueueLimits::default(),
            StandbyLimits::default(),
            true,
        );

        spawn_session_workers(&session, Arc::new(registry)).unwrap();

        DefaultCodec
            .encode_message(&mut client, &Message::with_payload(1, b"ping".to_vec()))
            .unwrap();

        let reply = DefaultCodec.decode_message(&mut client).unwrap();
        assert_eq!(reply.id(), 2);
        assert_eq!(reply.payload(), b"ping");

        session.shutdown(ShutdownCaller::External);
    }
}
