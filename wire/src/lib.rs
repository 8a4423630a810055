//! Transport-level building blocks: a blocking byte stream abstraction,
//! big-endian framing primitives, a pluggable message codec, and the
//! message type itself.
//!
//! This crate has no notion of sessions, queues, or servers — that's
//! [`netcore`](../netcore/index.html). `wire` only knows how to turn bytes
//! on a socket into [`Message`] values and back.

pub mod codec;
pub mod error;
pub mod message;
pub mod stream;

pub use codec::{DefaultCodec, FramedReader, FramedWriter, MessageCodec};
pub use error::{WireError, WireResult};
pub use message::{BroadcastMessage, Message};
pub use stream::{ByteStream, MemoryByteStream, TcpByteStream};
