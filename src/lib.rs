//! # Berth - A Connection Lifecycle Engine for Multi-Client TCP Servers
//!
//! Berth owns everything between `accept()` and `close()` for a TCP server:
//! I/O multiplexing, per-connection protocol state, authentication retries,
//! optional TLS (from the first byte or upgraded in-band), and the reuse of
//! connections, buffers and threads under load. The application protocol
//! stays in your handlers.
//!
//! ## Features
//!
//! - **Two personalities**: thread-per-connection (blocking) or event-driven
//!   on a shared worker pool, picked by configuration
//! - **Data modes**: LINE, OBJECT (length-prefixed JSON), RAW_BYTES and
//!   BINARY, switchable per direction at runtime
//! - **TLS**: a `rustls` record adapter that never owns the socket
//! - **Pooling**: connection slots, client data, buffers and workers are all
//!   borrowed and returned, never leaked or shared by two clients
//! - **Idle reaper**: background sweep that reclaims quiet connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                Berth                                    │
//! │                                                                         │
//! │  ┌─────────────┐  READ/WRITE   ┌─────────────┐   frames   ┌───────────┐ │
//! │  │ Event Loop  │──────────────>│ Dispatcher  │───────────>│ Handlers  │ │
//! │  │ (mio Poll)  │  ACCEPT ...   │ (workers)   │            │ (yours)   │ │
//! │  └──────┬──────┘               └──────┬──────┘            └───────────┘ │
//! │         │ borrow                      │ state lock                      │
//! │         ▼                             ▼                                 │
//! │  ┌──────────────────────────────────────────────┐   ┌────────────────┐  │
//! │  │                   Pools                      │   │  TLS Adapter   │  │
//! │  │  ┌────────────┐ ┌────────────┐ ┌──────────┐  │   │  (rustls)      │  │
//! │  │  │Connections │ │ ClientData │ │ Buffers  │  │   └────────────────┘  │
//! │  │  └────────────┘ └────────────┘ └──────────┘  │                       │
//! │  └──────────────────────────────────────────────┘                       │
//! │                              ▲                                          │
//! │                              │ TIMEOUT                                  │
//! │                     ┌────────┴────────┐                                 │
//! │                     │   Idle Reaper   │                                 │
//! │                     └─────────────────┘                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use berth::{CommandHandler, HandlerResult, ServerBuilder, ServerConfig, Session};
//!
//! struct Echo;
//!
//! impl CommandHandler for Echo {
//!     fn handle_command(&self, session: &mut Session<'_>, line: &str) -> HandlerResult {
//!         session.send_line(&format!("ECHO: {line}"))?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let server = ServerBuilder::new(ServerConfig::default())
//!         .command_handler(Echo)
//!         .start()?;
//!     println!("listening on {}", server.local_addr());
//!     server.wait();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`server`]: builder, event loop, dispatcher, registry, access control
//! - [`connection`]: connection slots, sessions, both drivers, close path
//! - [`codec`]: data mode decoders and encoders
//! - [`tls`]: handshake and record adapter, PEM loading
//! - [`pool`]: buffer, object and worker pools
//! - [`handler`]: the callback traits your protocol implements
//! - [`config`], [`error`], [`stats`]: configuration, errors, counters
//!
//! ## Design Highlights
//!
//! ### Generations
//!
//! A connection slot is reused for many clients. Every binding bumps its
//! generation, and every handle (registry entry, queued job, interest
//! request) carries the generation it was made for, so work meant for one
//! client can never land on the next.
//!
//! ### Exactly-Once Close
//!
//! However a connection ends (peer EOF, timeout, handler request, TLS
//! failure, shutdown) it runs one ordered close path, fires one lifecycle
//! callback, and goes back to its pool once, when the last holder lets go.

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod pool;
mod reaper;
pub mod server;
pub mod stats;
pub mod tls;

// Re-export commonly used types for convenience
pub use codec::{DataMode, DataModes, Direction, Frame};
pub use config::{ExecutionMode, ServerConfig};
pub use connection::{AuthState, ConnectionId, ConnectionInfo, Session, SessionError};
pub use error::{CloseReason, Result, ServerError};
pub use handler::{
    AuthStatus, Authenticator, BinaryHandler, ClientData, ClientEventHandler, CommandHandler,
    ExtendedEventHandler, HandlerError, HandlerResult, ObjectHandler, WriteHandler,
};
pub use server::{Access, AccessPolicy, IpAccessList, Server, ServerBuilder, ServerState};
pub use stats::{ServerStats, StatsSnapshot};

/// The default port Berth listens on
pub const DEFAULT_PORT: u16 = 4123;

/// The default host Berth binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of Berth
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
