//! Assembles a server from a configuration and its handlers.

use super::access::{AccessPolicy, IpAccessList};
use super::dispatcher::WriteGate;
use super::event_loop::{EventLoop, WAKER};
use super::registry::Registry;
use super::{Server, ServerContext, ServerState, ShutdownHook};
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{Result, ServerError};
use crate::handler::{
    Authenticator, BinaryHandler, ClientData, ClientDataFactory, ClientEventHandler,
    CommandHandler, ExtendedEventHandler, Handlers, ObjectHandler, WriteHandler,
};
use crate::pool::{BufferPool, ObjectPool, WorkerPool};
use crate::reaper::Reaper;
use crate::stats::ServerStats;
use crate::tls;
use mio::{Poll, Waker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::info;

/// Collects handlers and options, then starts a [`Server`].
///
/// # Example
///
/// ```ignore
/// use berth::{ServerBuilder, ServerConfig};
///
/// let server = ServerBuilder::new(ServerConfig::default())
///     .command_handler(Echo)
///     .start()?;
/// println!("listening on {}", server.local_addr());
/// ```
pub struct ServerBuilder {
    config: ServerConfig,
    handlers: Handlers,
    client_data: Option<ClientDataFactory>,
    access: Option<Arc<dyn AccessPolicy>>,
    tls: Option<(Arc<rustls::ServerConfig>, bool)>,
    hooks: Vec<ShutdownHook>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            handlers: Handlers::default(),
            client_data: None,
            access: None,
            tls: None,
            hooks: Vec::new(),
        }
    }

    /// Handles LINE and RAW_BYTES input.
    pub fn command_handler(mut self, handler: impl CommandHandler + 'static) -> Self {
        self.handlers.command = Some(Arc::new(handler));
        self
    }

    pub fn authenticator(mut self, handler: impl Authenticator + 'static) -> Self {
        self.handlers.authenticator = Some(Arc::new(handler));
        self
    }

    pub fn event_handler(mut self, handler: impl ClientEventHandler + 'static) -> Self {
        self.handlers.events = Some(Arc::new(handler));
        self
    }

    /// Replaces the default timeout / max-auth / max-connection responses.
    pub fn extended_handler(mut self, handler: impl ExtendedEventHandler + 'static) -> Self {
        self.handlers.extended = Arc::new(handler);
        self
    }

    pub fn object_handler(mut self, handler: impl ObjectHandler + 'static) -> Self {
        self.handlers.object = Some(Arc::new(handler));
        self
    }

    pub fn binary_handler(mut self, handler: impl BinaryHandler + 'static) -> Self {
        self.handlers.binary = Some(Arc::new(handler));
        self
    }

    pub fn write_handler(mut self, handler: impl WriteHandler + 'static) -> Self {
        self.handlers.write = Some(Arc::new(handler));
        self
    }

    /// Attaches pooled per-connection data built by `factory`.
    pub fn client_data<T, F>(mut self, factory: F) -> Self
    where
        T: ClientData + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.client_data = Some(Arc::new(move || Box::new(factory()) as Box<dyn ClientData>));
        self
    }

    /// Replaces the IP lists from the configuration.
    pub fn access_policy(mut self, policy: impl AccessPolicy + 'static) -> Self {
        self.access = Some(Arc::new(policy));
        self
    }

    /// Enables TLS. With `start_secure`, every connection opens with a
    /// handshake; otherwise TLS is only used after `Session::make_secure`.
    pub fn tls(mut self, config: Arc<rustls::ServerConfig>, start_secure: bool) -> Self {
        self.tls = Some((config, start_secure));
        self
    }

    /// Runs `hook` once the listener has closed.
    pub fn on_shutdown(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Binds the listener and starts the engine threads.
    pub fn start(self) -> Result<Server> {
        let ServerBuilder {
            config,
            handlers,
            client_data,
            access,
            tls,
            hooks,
        } = self;

        config.validate()?;
        handlers.validate(&config.data_modes)?;

        let (tls, start_secure) = match (tls, &config.tls) {
            (Some((tls, start_secure)), _) => (Some(tls), start_secure),
            (None, Some(settings)) => (
                Some(tls::load_server_config(settings)?),
                settings.start_secure,
            ),
            (None, None) => (None, false),
        };

        let access =
            access.unwrap_or_else(|| Arc::new(IpAccessList::from_settings(&config.access)));

        let capacity = config.pools.max_active_handlers;
        let epoch = Instant::now();
        let conn_config = config.clone();
        let connections = ObjectPool::new("connection", capacity, move |slot| {
            Arc::new(Connection::new(slot, epoch, &conn_config))
        });
        let client_data = client_data
            .map(|factory| ObjectPool::new("client data", capacity, move |_| factory()));
        let workers = WorkerPool::new(&config.name, config.worker_threads())?;

        let addr = config.bind_address()?;
        let listener = super::socket::bind_listener(addr, config.socket.backlog)?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let ctx = Arc::new(ServerContext {
            buffers: BufferPool::new(config.pools.buffer_size, config.pools.max_buffers),
            registry: Registry::new(capacity),
            write_gate: WriteGate::new(config.max_concurrent_writers()),
            stats: Arc::new(ServerStats::new()),
            registrations: Mutex::new(VecDeque::new()),
            state: AtomicU8::new(ServerState::Running as u8),
            pools_released: AtomicBool::new(false),
            shutdown_hooks: Mutex::new(hooks),
            config,
            handlers,
            tls,
            start_secure,
            access,
            connections,
            client_data,
            workers,
            waker,
            epoch,
        });

        let event_loop = EventLoop::new(Arc::clone(&ctx), poll, listener)?;
        let reaper = Reaper::start(Arc::clone(&ctx))?;
        let handle = thread::Builder::new()
            .name(format!("{}-loop", ctx.config.name))
            .spawn(move || event_loop.run())
            .map_err(ServerError::Io)?;

        info!(
            server = %ctx.config.name,
            addr = %local_addr,
            mode = ?ctx.config.mode,
            tls = ctx.tls.is_some(),
            start_secure = ctx.start_secure,
            "Server started"
        );

        Ok(Server {
            ctx,
            local_addr,
            event_loop: Some(handle),
            reaper,
        })
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("client_data", &self.client_data.is_some())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}
