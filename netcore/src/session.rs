//! The per-connection coordination object: owns the socket, binds the
//! input/output worker pair, and serializes all outbound posting and
//! teardown decisions through one mutex.
//!
//! Grounded on `VClientSession`: `postOutputMessage`'s branch table (§4.9),
//! `shutdown`'s clear-or-stop-per-worker protocol and its "release the
//! session mutex before touching the server" lock-ordering rule, and
//! `VClientSessionReference`'s ref-counting (reimplemented here as an RAII
//! guard instead of a manually incremented/decremented counter).

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use wire::{BroadcastMessage, ByteStream, FramedWriter, MemoryByteStream, Message, MessageCodec};

use crate::config::{QueueLimits, StandbyLimits};
use crate::error::{NetError, NetResult};
use crate::queue::{MessageQueue, QueuedBytes};
use crate::server::Server;

/// An item waiting in an output worker's queue: either a plainly-owned
/// message or a handle shared across a broadcast fan-out.
pub enum Outbound {
    Owned(Message),
    Shared(BroadcastMessage),
}

impl Outbound {
    pub fn as_message(&self) -> &Message {
        match self {
            Outbound::Owned(m) => m,
            Outbound::Shared(b) => b.as_message(),
        }
    }
}

impl QueuedBytes for Outbound {
    fn byte_len(&self) -> u64 {
        self.as_message().payload().len() as u64
    }
}

/// A protocol's hook for replying when no handler is registered for an
/// incoming message id (spec.md §7 `NoHandler`, §8 scenario 2). The default
/// implementation is grounded on `VBentoMessageInputThread::
/// _handleNoMessageHandler`: a structured reply carrying an integer `-1`
/// and a string naming the bad id, without adopting the original's Bento
/// tree encoding (out of scope per spec.md §1).
pub trait NoHandlerHook: Send + Sync {
    /// Builds the reply to send back, or `None` to send nothing.
    fn handle(&self, message: &Message) -> Option<Message>;
}

/// The default `NoHandlerHook`: an `i32` of `-1` followed by a dynamic-count
/// string, carried in a message with the given reply id.
pub struct DefaultNoHandlerHook {
    reply_id: i32,
}

impl DefaultNoHandlerHook {
    pub fn new(reply_id: i32) -> Self {
        Self { reply_id }
    }
}

impl NoHandlerHook for DefaultNoHandlerHook {
    fn handle(&self, message: &Message) -> Option<Message> {
        let mut mem = MemoryByteStream::new();
        let mut w = FramedWriter::new(&mut mem);
        let _ = w.write_i32(-1);
        let _ = w.write_string_dynamic(&format!(
            "Invalid message ID {}. No handler defined.",
            message.id()
        ));
        Some(Message::with_payload(self.reply_id, mem.into_written()))
    }
}

/// A non-owning control handle to a worker thread: lets `Session` signal
/// `stop()` without owning (or joining) the thread itself. The thread owns
/// its own `Arc<Session>` clone and drops it naturally on exit (see
/// spec.md §9 "self-delete at thread end").
pub(crate) struct WorkerHandle {
    running: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub(crate) fn new(running: Arc<AtomicBool>) -> Self {
        Self { running }
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct OutputWorkerHandle {
    running: Arc<AtomicBool>,
    pub(crate) queue: Arc<MessageQueue<Outbound>>,
}

impl OutputWorkerHandle {
    pub(crate) fn new(running: Arc<AtomicBool>, queue: Arc<MessageQueue<Outbound>>) -> Self {
        Self { running, queue }
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.wake();
    }

    /// Enqueues bypassing queue-limit enforcement, for moving standby
    /// messages onto the real output queue (spec.md §4.9
    /// `move_standby_to_output`: "bypassing the queue limits").
    pub(crate) fn post_unchecked(&self, item: Outbound) {
        self.queue.post(item);
    }
}

struct SessionState {
    input_worker: Option<WorkerHandle>,
    output_worker: Option<OutputWorkerHandle>,
    standby_queue: MessageQueue<BroadcastMessage>,
    standby_start_time: Option<Instant>,
    over_limit_since: Option<Instant>,
    last_warned: Option<Instant>,
}

/// A diagnostic snapshot of a session's externally observable state
/// (spec.md §6 "Session externally observable state").
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub name: String,
    pub client_type: String,
    pub client_address: String,
    pub shutting_down: bool,
    pub standby_queue_size: Option<usize>,
    pub standby_queue_bytes: Option<u64>,
    pub output_queue_size: Option<usize>,
}

/// Which worker (if any) is reporting its own termination, per spec.md
/// §4.9's shutdown algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCaller {
    Input,
    Output,
    /// The server or another external caller initiated shutdown.
    External,
}

/// The per-connection session. See the module documentation for the
/// grounding of its `post`/`post_broadcast`/`shutdown` behavior.
pub struct Session {
    name: String,
    client_type: String,
    client_address: String,
    stream: Mutex<Box<dyn ByteStream>>,
    server: Arc<Server>,
    codec: Arc<dyn MessageCodec>,
    no_handler: Arc<dyn NoHandlerHook>,
    queue_limits: QueueLimits,
    standby_limits: StandbyLimits,
    state: Mutex<SessionState>,
    ref_count: AtomicUsize,
    shutting_down: AtomicBool,
    online: AtomicBool,
    going_offline: AtomicBool,
    /// Set once, at construction, to whether this session has a paired
    /// output worker; cleared only by that worker on its own exit. Per
    /// spec.md §9's open question, reading this without the session mutex
    /// is sound precisely because of that set-once/clear-once-on-exit
    /// discipline.
    has_output_worker: AtomicBool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        client_type: String,
        client_address: String,
        stream: Box<dyn ByteStream>,
        server: Arc<Server>,
        codec: Arc<dyn MessageCodec>,
        no_handler: Arc<dyn NoHandlerHook>,
        queue_limits: QueueLimits,
        standby_limits: StandbyLimits,
        initially_online: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            client_type,
            client_address,
            stream: Mutex::new(stream),
            server,
            codec,
            no_handler,
            queue_limits,
            standby_limits,
            state: Mutex::new(SessionState {
                input_worker: None,
                output_worker: None,
                standby_queue: MessageQueue::new(),
                standby_start_time: None,
                over_limit_since: None,
                last_warned: None,
            }),
            ref_count: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            online: AtomicBool::new(initially_online),
            going_offline: AtomicBool::new(false),
            has_output_worker: AtomicBool::new(false),
        })
    }

    /// A minimal session suitable for unit tests that only need something
    /// to hand a `SessionRef`/`HandlerContext` to, not a full worker pair.
    #[cfg(test)]
    pub(crate) fn for_test(stream: impl ByteStream + 'static, codec: Arc<dyn MessageCodec>) -> Arc<Self> {
        Self::new(
            "test".to_string(),
            "test".to_string(),
            "127.0.0.1:0".to_string(),
            Box::new(stream),
            Server::new(),
            codec,
            Arc::new(DefaultNoHandlerHook::new(-1)),
            QueueLimits::default(),
            StandbyLimits::default(),
            true,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client_type(&self) -> &str {
        &self.client_type
    }

    pub fn client_address(&self) -> &str {
        &self.client_address
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn no_handler_hook(&self) -> &Arc<dyn NoHandlerHook> {
        &self.no_handler
    }

    pub(crate) fn codec(&self) -> &Arc<dyn MessageCodec> {
        &self.codec
    }

    pub(crate) fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub(crate) fn lock_stream(&self) -> std::sync::MutexGuard<'_, Box<dyn ByteStream>> {
        self.stream.lock().unwrap()
    }

    /// Marks the session online per the application's own predicate, then
    /// drains anything waiting in standby onto the real output queue.
    pub fn go_online(&self) {
        let mut state = self.state.lock().unwrap();
        self.online.store(true, Ordering::SeqCst);
        self.move_standby_to_output_locked(&mut state);
    }

    pub fn set_going_offline(&self, value: bool) {
        self.going_offline.store(value, Ordering::SeqCst);
    }

    fn move_standby_to_output_locked(&self, state: &mut SessionState) {
        if let Some(ow) = &state.output_worker {
            for bm in state.standby_queue.drain_all() {
                ow.post_unchecked(Outbound::Shared(bm));
            }
        }
        state.standby_start_time = None;
    }

    pub(crate) fn attach_workers(
        &self,
        input: WorkerHandle,
        output: OutputWorkerHandle,
    ) {
        let mut state = self.state.lock().unwrap();
        state.input_worker = Some(input);
        state.output_worker = Some(output);
        self.has_output_worker.store(true, Ordering::SeqCst);
    }

    pub(crate) fn has_output_worker_flag(&self) -> &AtomicBool {
        &self.has_output_worker
    }

    pub(crate) fn clear_output_worker(&self) {
        self.has_output_worker.store(false, Ordering::SeqCst);
    }

    /// Writes `outbound`'s frame to the peer, re-checking session state
    /// first. Used both by `post` for sessions with no output worker and by
    /// `OutputWorker` after dequeuing (spec.md §4.8 `send_to_peer`).
    pub(crate) fn send_to_peer(&self, outbound: &Outbound) -> NetResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) || self.going_offline.load(Ordering::SeqCst) {
            tracing::warn!(session = %self.name, "not sending to session going offline");
            return Ok(());
        }
        let mut stream = self.stream.lock().unwrap();
        self.codec
            .encode_message(&mut **stream, outbound.as_message())
            .map_err(NetError::from)
    }

    /// Posts a non-broadcast message. See the branch table in spec.md
    /// §4.9: delegates to the output worker if one exists, otherwise writes
    /// synchronously on the calling thread.
    pub fn post(&self, message: Message) {
        if self.shutting_down.load(Ordering::SeqCst) || self.going_offline.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if self.shutting_down.load(Ordering::SeqCst) || self.going_offline.load(Ordering::SeqCst) {
            return;
        }
        if state.output_worker.is_some() {
            self.try_post_to_output(&mut state, move || Outbound::Owned(message));
        } else {
            let outbound = Outbound::Owned(message);
            if let Err(e) = self.send_to_peer(&outbound) {
                tracing::debug!(session = %self.name, error = %e, "synchronous post failed");
            }
        }
    }

    /// Posts a broadcast message. `message` is a shared handle the caller
    /// (typically `Server::broadcast`) still owns; a fresh clone is taken
    /// only on the branches that actually enqueue, so the broadcast target
    /// count increases by exactly the number of successful posts, never by
    /// attempts.
    pub fn post_broadcast(&self, message: &BroadcastMessage) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) || self.going_offline.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        if self.shutting_down.load(Ordering::SeqCst) || self.going_offline.load(Ordering::SeqCst) {
            return false;
        }

        if !self.online.load(Ordering::SeqCst) {
            return self.post_to_standby_locked(&mut state, message);
        }

        if state.output_worker.is_none() {
            tracing::error!(session = %self.name, "broadcast to online session with no output worker; closing socket");
            let _ = self.stream.lock().unwrap().close();
            return false;
        }

        self.try_post_to_output(&mut state, || Outbound::Shared(message.add_broadcast_target()))
    }

    fn post_to_standby_locked(&self, state: &mut SessionState, message: &BroadcastMessage) -> bool {
        let now = Instant::now();
        if state.standby_start_time.is_none() {
            state.standby_start_time = Some(now);
        }

        let current_bytes = state.standby_queue.byte_size();
        if self.standby_limits.max_queue_bytes > 0 && current_bytes >= self.standby_limits.max_queue_bytes {
            tracing::error!(session = %self.name, bytes = current_bytes, "standby queue byte limit exceeded; closing socket");
            let _ = self.stream.lock().unwrap().close();
            return false;
        }

        let time_limit_exceeded = self.standby_limits.time_limit > Duration::ZERO
            && now.duration_since(state.standby_start_time.unwrap()) > self.standby_limits.time_limit;
        if time_limit_exceeded {
            tracing::error!(session = %self.name, "standby time limit exceeded; closing socket");
            let _ = self.stream.lock().unwrap().close();
            return false;
        }

        state.standby_queue.post(message.add_broadcast_target());
        true
    }

    /// The queue-limit/grace-period decision table, grounded on
    /// `VMessageOutputThread::postOutputMessage`. `make_item` is only
    /// invoked once the post is actually going to be enqueued, so a
    /// broadcast clone is only taken on success.
    fn try_post_to_output(
        &self,
        state: &mut SessionState,
        make_item: impl FnOnce() -> Outbound,
    ) -> bool {
        let ow = state
            .output_worker
            .as_ref()
            .expect("caller checked output_worker is Some");

        let size = ow.queue.size();
        let bytes = ow.queue.byte_size();
        let over_limit = (self.queue_limits.max_count > 0 && size >= self.queue_limits.max_count)
            || (self.queue_limits.max_bytes > 0 && bytes >= self.queue_limits.max_bytes);
        let now = Instant::now();

        if !over_limit {
            state.over_limit_since = None;
        } else {
            let grace_exceeded = match state.over_limit_since {
                Some(since) => now.duration_since(since) > self.queue_limits.grace_period,
                None => {
                    if self.queue_limits.grace_period == Duration::ZERO {
                        true
                    } else {
                        state.over_limit_since = Some(now);
                        false
                    }
                }
            };

            if grace_exceeded {
                tracing::error!(
                    session = %self.name,
                    size,
                    bytes,
                    "output queue over limit past grace period; closing session"
                );
                ow.stop();
                let _ = self.stream.lock().unwrap().close();
                return false;
            }

            let should_warn = state
                .last_warned
                .map_or(true, |w| now.duration_since(w) > self.queue_limits.warning_interval);
            if should_warn {
                state.last_warned = Some(now);
                tracing::warn!(
                    session = %self.name,
                    size,
                    bytes,
                    "posting to output queue over limit; still within grace period"
                );
            }
        }

        ow.queue.post(make_item());
        true
    }

    /// Step 1-4 of spec.md §4.9: mark shutting down, clear-or-stop each
    /// worker depending on who called, then release the session mutex
    /// before touching the server (to avoid a lock-order inversion with a
    /// concurrent broadcast, which takes the server lock before a
    /// session's).
    pub fn shutdown(self: &Arc<Self>, caller: ShutdownCaller) {
        self.shutting_down.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap();
            match caller {
                ShutdownCaller::Input => state.input_worker = None,
                _ => {
                    if let Some(w) = &state.input_worker {
                        w.stop();
                    }
                }
            }
            match caller {
                ShutdownCaller::Output => state.output_worker = None,
                _ => {
                    if let Some(w) = &state.output_worker {
                        w.stop();
                    }
                }
            }
        }
        self.server.remove_session(self);
        self.server.client_session_terminating(self);
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock().unwrap();
        let standby_size = state.standby_queue.size();
        SessionInfo {
            name: self.name.clone(),
            client_type: self.client_type.clone(),
            client_address: self.client_address.clone(),
            shutting_down: self.is_shutting_down(),
            standby_queue_size: (standby_size != 0).then_some(standby_size),
            standby_queue_bytes: (standby_size != 0).then_some(state.standby_queue.byte_size()),
            output_queue_size: state.output_worker.as_ref().map(|ow| ow.queue.size()),
        }
    }
}

/// A reference token that keeps a [`Session`] alive across a handler's
/// execution. Acquiring increments the session's reference count;
/// dropping decrements it. This replaces `VClientSessionReference`'s
/// manually incremented/decremented counter with RAII.
pub struct SessionRef {
    session: Arc<Session>,
}

impl SessionRef {
    pub fn acquire(session: Arc<Session>) -> Self {
        session.ref_count.fetch_add(1, Ordering::SeqCst);
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Clone for SessionRef {
    fn clone(&self) -> Self {
        Self::acquire(self.session.clone())
    }
}

impl Drop for SessionRef {
    fn drop(&mut self) {
        self.session.ref_count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Deref for SessionRef {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use wire::{DefaultCodec, TcpByteStream};

    fn loopback() -> TcpByteStream {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server_sock, _) = listener.accept().unwrap();
        let _client = client.join().unwrap();
        TcpByteStream::new(server_sock)
    }

    fn test_session() -> Arc<Session> {
        Session::for_test(loopback(), Arc::new(DefaultCodec))
    }

    #[test]
    fn shutting_down_session_drops_posted_message() {
        let session = test_session();
        session.shutting_down.store(true, Ordering::SeqCst);
        // No output worker attached and shutting down: post is a silent no-op.
        session.post(Message::with_payload(1, vec![1, 2, 3]));
    }

    #[test]
    fn ref_token_increments_and_decrements_count() {
        let session = test_session();
        assert_eq!(session.ref_count(), 0);
        {
            let r1 = SessionRef::acquire(session.clone());
            assert_eq!(session.ref_count(), 1);
            let r2 = r1.clone();
            assert_eq!(session.ref_count(), 2);
            drop(r2);
            assert_eq!(session.ref_count(), 1);
        }
        assert_eq!(session.ref_count(), 0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let session = test_session();
        session.shutdown(ShutdownCaller::External);
        session.shutdown(ShutdownCaller::External);
        assert!(session.is_shutting_down());
    }

    #[test]
    fn standby_post_closes_socket_past_byte_limit() {
        let session = Session::new(
            "t".into(),
            "t".into(),
            "127.0.0.1:0".into(),
            Box::new(loopback()),
            Server::new(),
            Arc::new(DefaultCodec),
            Arc::new(DefaultNoHandlerHook::new(-1)),
            QueueLimits::default(),
            StandbyLimits {
                max_queue_bytes: 2,
                time_limit: Duration::ZERO,
            },
            false,
        );
        // No output worker attached; this session is offline, so broadcast
        // posts go to standby. First post starts from 0 bytes queued, under
        // the 2-byte cap, and brings standby to exactly the cap.
        let bc = BroadcastMessage::mark_broadcast(Message::with_payload(1, vec![1, 2]), 1);
        assert!(session.post_broadcast(&bc));
        // Standby bytes are now at the cap, so the next post is refused.
        let bc2 = BroadcastMessage::mark_broadcast(Message::with_payload(1, vec![3, 4]), 1);
        assert!(!session.post_broadcast(&bc2));
    }
}
