//! The application message: a protocol verb plus a mutable payload buffer,
//! with broadcast fan-out lifetime handled by sharing rather than manual
//! reference counting.

use std::sync::Arc;

/// A single protocol message: a 32-bit verb (`id`) and a byte payload.
///
/// `Message` itself is an exclusively-owned, mutable buffer — the shape
/// handlers and input workers build and mutate while constructing a reply.
/// Once a message needs to be shared across more than one outbound queue
/// (broadcast), it is wrapped in [`BroadcastMessage`], which hands out
/// `Arc` clones instead of copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: i32,
    payload: Vec<u8>,
    cursor: usize,
}

impl Message {
    /// Creates an empty message ready to be written into (a handler
    /// building a reply, or an input worker about to `receive` into it).
    pub fn new(id: i32, initial_capacity: usize) -> Self {
        Self {
            id,
            payload: Vec::with_capacity(initial_capacity),
            cursor: 0,
        }
    }

    /// Creates a message with a payload already in hand (typically produced
    /// by a [`crate::codec::MessageCodec`] decode).
    pub fn with_payload(id: i32, payload: Vec<u8>) -> Self {
        Self {
            id,
            payload,
            cursor: 0,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn set_cursor(&mut self, pos: usize) {
        self.cursor = pos;
    }

    pub fn is_eof(&self) -> bool {
        self.cursor >= self.payload.len()
    }

    /// Resets the cursor to zero and applies a new id, leaving the payload
    /// bytes intact. Used when forwarding a received message back out
    /// unmodified (or nearly so) under a different id.
    ///
    /// Calling this twice in a row is equivalent to calling it once with
    /// the second id: the first call's effects (cursor reset, id swap) are
    /// fully overwritten by the second.
    pub fn recycle_for_send(&mut self, new_id: i32) {
        self.id = new_id;
        self.cursor = 0;
    }

    /// Resets id and payload to empty while keeping the buffer's allocated
    /// capacity, for reuse by an input loop that decodes many messages into
    /// one long-lived `Message`.
    pub fn recycle_for_receive(&mut self) {
        self.id = 0;
        self.payload.clear();
        self.cursor = 0;
    }

    /// Copies this message's full payload into `other`, without disturbing
    /// this message's own cursor position on return.
    pub fn copy_payload_into(&self, other: &mut Message) {
        other.payload.clear();
        other.payload.extend_from_slice(&self.payload);
    }
}

/// A message shared across multiple outbound queues for broadcast.
///
/// The spec's manual `broadcast_target_count` becomes, in Rust, the strong
/// reference count of an `Arc`: [`mark_broadcast`](Self::mark_broadcast)
/// wraps the message once, [`add_broadcast_target`](Self::add_broadcast_target)
/// clones the handle for each successful `post`, and dropping the last clone
/// is what frees the underlying buffer. This gives the same guarantee the
/// spec requires — freed after exactly as many releases as successful posts,
/// never before — using an atomic primitive instead of a hand-rolled counter.
#[derive(Clone)]
pub struct BroadcastMessage {
    inner: Arc<Message>,
}

impl BroadcastMessage {
    /// Marks `message` for broadcast, producing the first handle. `n` is the
    /// number of consumers the caller intends to fan out to; it is advisory
    /// (used for logging/assertions) since the actual lifetime is governed
    /// by how many handles end up alive, not by this count.
    pub fn mark_broadcast(message: Message, n: usize) -> Self {
        debug_assert!(n > 0, "mark_broadcast called with a target count of zero");
        Self {
            inner: Arc::new(message),
        }
    }

    /// Produces another strong handle to the same message, to be handed to
    /// one more outbound queue. Call this exactly once per successful post.
    pub fn add_broadcast_target(&self) -> Self {
        self.clone()
    }

    /// The number of live handles to this message right now (this one
    /// included). When it reaches zero the underlying buffer is freed; there
    /// is no explicit `release()` call to make since dropping a
    /// `BroadcastMessage` is the release.
    pub fn target_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn id(&self) -> i32 {
        self.inner.id()
    }

    pub fn payload(&self) -> &[u8] {
        self.inner.payload()
    }

    pub fn as_message(&self) -> &Message {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycle_for_send_twice_matches_single_call_with_second_id() {
        let mut a = Message::new(1, 16);
        a.payload_mut().extend_from_slice(b"payload");
        a.set_cursor(3);
        a.recycle_for_send(2);
        a.recycle_for_send(3);

        let mut b = Message::new(1, 16);
        b.payload_mut().extend_from_slice(b"payload");
        b.set_cursor(3);
        b.recycle_for_send(3);

        assert_eq!(a, b);
    }

    #[test]
    fn copy_payload_into_does_not_disturb_source_cursor() {
        let mut src = Message::with_payload(7, b"hello".to_vec());
        src.set_cursor(2);
        let mut dst = Message::new(0, 0);
        src.copy_payload_into(&mut dst);
        assert_eq!(dst.payload(), b"hello");
        assert_eq!(src.cursor(), 2);
    }

    #[test]
    fn broadcast_message_frees_after_exactly_n_releases() {
        let msg = Message::with_payload(1, b"x".to_vec());
        let first = BroadcastMessage::mark_broadcast(msg, 3);
        let second = first.add_broadcast_target();
        let third = first.add_broadcast_target();
        assert_eq!(first.target_count(), 3);

        drop(second);
        assert_eq!(first.target_count(), 2);
        drop(third);
        assert_eq!(first.target_count(), 1);
        drop(first);
        // No handle remains to query target_count() on; the message is gone.
    }
}
