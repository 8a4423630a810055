//! A minimal runnable server exercising `netcore`: registers a single
//! handler (message id 1) that echoes its payload back under id 2, and logs
//! every connection/backpressure/shutdown event `netcore` emits through
//! `tracing`.
//!
//! Unknown message ids fall through to the default no-handler reply
//! automatically; nothing in this binary needs to opt into that behavior.

use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netcore::{
    DefaultNoHandlerHook, Handler, HandlerContext, HandlerRegistry, Listener, ListenerConfig,
    NetResult, QueueLimits, Server, SessionFactory, StandbyLimits,
};
use wire::DefaultCodec;

struct EchoHandler;

impl Handler for EchoHandler {
    fn process(&mut self, ctx: &HandlerContext) -> NetResult<()> {
        let mut reply = ctx.message.clone();
        reply.recycle_for_send(2);
        tracing::info!(
            session = ctx.session.name(),
            bytes = reply.payload().len(),
            "echoing message back under id 2"
        );
        ctx.session.post(reply);
        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port: u16 = env::var("ECHO_DEMO_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7878);

    let mut registry = HandlerRegistry::new();
    registry.register(1, |_ctx: &HandlerContext| Box::new(EchoHandler) as Box<dyn Handler>);

    let server = Server::new();
    let factory = SessionFactory {
        client_type: "echo-client".to_string(),
        codec: Arc::new(DefaultCodec),
        registry: Arc::new(registry),
        no_handler: Arc::new(DefaultNoHandlerHook::new(-1)),
        queue_limits: QueueLimits::default(),
        standby_limits: StandbyLimits::default(),
        initially_online: true,
    };

    let config = ListenerConfig {
        bind_address: "127.0.0.1".to_string(),
        port,
        backlog: 50,
        accept_timeout: Duration::from_secs(5),
    };

    let listener = Listener::new(config, server.clone(), factory);
    listener.start();
    tracing::info!(port, "echo demo listening");

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
