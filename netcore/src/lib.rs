//! The session engine: a thread-per-connection TCP server with framed
//! message dispatch, broadcast, and per-session backpressure, built on top
//! of [`wire`].
//!
//! See the module-level docs of [`session`], [`server`], [`listener`], and
//! [`connect`] for the concurrency model and the grounding of each piece.

pub mod config;
pub mod connect;
pub mod error;
pub mod listener;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
mod worker;

pub use config::{ConnectSettings, ListenerConfig, QueueLimits, StandbyLimits};
pub use connect::ConnectStrategy;
pub use error::{NetError, NetResult};
pub use listener::{Listener, SessionFactory};
pub use queue::{MessageQueue, QueuedBytes};
pub use registry::{Handler, HandlerContext, HandlerRegistry};
pub use server::Server;
pub use session::{DefaultNoHandlerHook, NoHandlerHook, Outbound, Session, SessionInfo, SessionRef, ShutdownCaller};
