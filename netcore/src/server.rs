//! The session directory: tracks every live session and fans broadcasts out
//! to them.
//!
//! Grounded on `VServer::addClientSession`/`removeClientSession`, which is
//! all the concrete C++ implementation in the reference material provides;
//! `broadcast`'s fan-out loop is synthesized from the textual algorithm
//! (standby-queue-on-success semantics for target counting), since
//! `VServer::postBroadcastMessage` is declared pure virtual there with no
//! concrete body to adapt.

use std::sync::{Arc, Mutex};

use wire::{BroadcastMessage, Message};

use crate::session::Session;

/// Tracks every session currently attached to this server. Lock ordering
/// (spec.md §5): the server's mutex is always acquired before a session's,
/// never the reverse — `Session::shutdown` releases its own session lock
/// before calling back into `Server` for exactly this reason.
pub struct Server {
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl Server {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn add_session(&self, session: Arc<Session>) {
        self.sessions.lock().unwrap().push(session);
    }

    /// Removes `session` from the directory by identity. A no-op if it was
    /// already removed (shutdown may race a GC sweep).
    pub fn remove_session(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|s| !Arc::ptr_eq(s, session));
    }

    /// Hook called by a session as the last step of its own shutdown, for a
    /// server that wants to react to session loss (metrics, reconnection
    /// policy). The default directory has nothing further to do here beyond
    /// what `remove_session` already handled.
    pub fn client_session_terminating(&self, _session: &Arc<Session>) {}

    /// Sends `message` to every session whose client type matches
    /// `client_type_filter` (`None` matches all), except `omit` if given.
    /// The message is marked for broadcast once; each session that
    /// successfully enqueues it takes one more reference, so the original
    /// handle dropped at the end of this function reflects exactly how many
    /// sessions actually got a copy (spec.md §8, broadcast scenario).
    pub fn broadcast(&self, client_type_filter: Option<&str>, message: Message, omit: Option<&Arc<Session>>) {
        let sessions: Vec<Arc<Session>> = {
            let guard = self.sessions.lock().unwrap();
            guard
                .iter()
                .filter(|s| client_type_filter.map_or(true, |ct| s.client_type() == ct))
                .filter(|s| omit.map_or(true, |o| !Arc::ptr_eq(s, o)))
                .cloned()
                .collect()
        };

        if sessions.is_empty() {
            return;
        }

        let bc = BroadcastMessage::mark_broadcast(message, sessions.len());
        let mut delivered = 0usize;
        for session in &sessions {
            if session.post_broadcast(&bc) {
                delivered += 1;
            }
        }
        tracing::debug!(
            candidates = sessions.len(),
            delivered,
            "broadcast fan-out complete"
        );
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueLimits, StandbyLimits};
    use crate::session::DefaultNoHandlerHook;
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use wire::{DefaultCodec, TcpByteStream};

    fn test_session(server: Arc<Server>, client_type: &str) -> Arc<Session> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server_sock, _) = listener.accept().unwrap();
        let _client = client.join().unwrap();
        Session::new(
            "t".into(),
            client_type.into(),
            "127.0.0.1:0".into(),
            Box::new(TcpByteStream::new(server_sock)),
            server,
            Arc::new(DefaultCodec),
            Arc::new(DefaultNoHandlerHook::new(-1)),
            QueueLimits::default(),
            StandbyLimits::default(),
            false,
        )
    }

    #[test]
    fn add_then_remove_session_shrinks_directory() {
        let server = Server::new();
        let session = test_session(server.clone(), "widget");
        server.add_session(session.clone());
        assert_eq!(server.session_count(), 1);
        server.remove_session(&session);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn remove_session_is_idempotent() {
        let server = Server::new();
        let session = test_session(server.clone(), "widget");
        server.add_session(session.clone());
        server.remove_session(&session);
        server.remove_session(&session);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn broadcast_filters_by_client_type_and_omit() {
        let server = Server::new();
        let widget = test_session(server.clone(), "widget");
        let gadget = test_session(server.clone(), "gadget");
        let other_widget = test_session(server.clone(), "widget");
        server.add_session(widget.clone());
        server.add_session(gadget.clone());
        server.add_session(other_widget.clone());

        server.broadcast(Some("widget"), Message::with_payload(1, vec![1]), Some(&widget));

        // other_widget (offline) should have exactly one standby entry; the
        // omitted widget and the non-matching gadget should have none.
        assert_eq!(other_widget.info().standby_queue_size, Some(1));
        assert_eq!(widget.info().standby_queue_size, None);
        assert_eq!(gadget.info().standby_queue_size, None);
    }
}
