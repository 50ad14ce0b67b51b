//! Berth demo server
//!
//! A line-based echo server built on the Berth engine. It answers every
//! line with `ECHO: <line>`, understands `QUIT` and (when TLS is
//! configured) `STARTTLS`, and can require a password first.

use anyhow::Context;
use berth::{
    AuthStatus, Authenticator, ClientEventHandler, CloseReason, CommandHandler, ExecutionMode,
    Frame, HandlerResult, ServerBuilder, ServerConfig, Session,
};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Command-line options. Flags override the config file.
#[derive(Debug, Parser)]
#[command(name = "berth", version = berth::VERSION, about = "Berth echo server")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Connection personality
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Idle timeout in milliseconds (0 disables)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Maximum live connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Require this password before echoing
    #[arg(long)]
    password: Option<String>,

    /// PEM certificate chain (enables STARTTLS)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Blocking,
    EventDriven,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(ServerConfig, Option<String>)> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(mode) = self.mode {
            config.mode = match mode {
                Mode::Blocking => ExecutionMode::Blocking,
                Mode::EventDriven => ExecutionMode::EventDriven,
            };
        }
        if let Some(timeout) = self.timeout_ms {
            config.timeout_ms = timeout;
        }
        if self.max_connections.is_some() {
            config.max_connections = self.max_connections;
        }
        if let (Some(cert_chain), Some(private_key)) = (self.cert, self.key) {
            config.tls = Some(berth::config::TlsSettings {
                cert_chain,
                private_key,
                start_secure: false,
            });
        }
        Ok((config, self.password))
    }
}

/// Echoes lines back.
struct EchoHandler;

impl CommandHandler for EchoHandler {
    fn handle_command(&self, session: &mut Session<'_>, line: &str) -> HandlerResult {
        match line.trim().to_ascii_uppercase().as_str() {
            "QUIT" => {
                session.send_line("+OK Bye")?;
                session.close();
            }
            "STARTTLS" => {
                session.send_line("+OK Begin TLS negotiation")?;
                session.make_secure()?;
            }
            _ => session.send_line(&format!("ECHO: {line}"))?,
        }
        Ok(())
    }
}

impl ClientEventHandler for EchoHandler {
    fn on_connect(&self, session: &mut Session<'_>) -> HandlerResult {
        session.send_line(&format!("+OK Berth v{} ready", berth::VERSION))?;
        Ok(())
    }

    fn on_closing(&self, session: &mut Session<'_>, reason: CloseReason) {
        info!(id = %session.id(), %reason, "Session ended");
    }
}

/// Accepts a single shared password.
struct PasswordAuth {
    password: String,
}

impl Authenticator for PasswordAuth {
    fn ask_authentication(&self, session: &mut Session<'_>) -> HandlerResult {
        session.send_line("+AUTH Password:")?;
        Ok(())
    }

    fn handle_authentication(
        &self,
        session: &mut Session<'_>,
        frame: &Frame,
    ) -> HandlerResult<AuthStatus> {
        if frame.as_text().map(str::trim) == Some(self.password.as_str()) {
            session.send_line("+OK Authenticated")?;
            Ok(AuthStatus::Accepted)
        } else {
            session.send_line("-ERR Bad password")?;
            Ok(AuthStatus::Rejected)
        }
    }
}

fn print_banner(config: &ServerConfig, addr: std::net::SocketAddr) {
    println!(
        r#"
  ██████  ███████ ██████  ████████ ██   ██
  ██   ██ ██      ██   ██    ██    ██   ██
  ██████  █████   ██████     ██    ███████
  ██   ██ ██      ██   ██    ██    ██   ██
  ██████  ███████ ██   ██    ██    ██   ██

Berth v{} - Connection Lifecycle Engine (echo demo)
──────────────────────────────────────────────────────────────
Server started on {} ({:?})
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        berth::VERSION,
        addr,
        config.mode,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, password) = Args::parse().into_config()?;

    // Set up logging
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let mut builder = ServerBuilder::new(config.clone())
        .command_handler(EchoHandler)
        .event_handler(EchoHandler)
        .on_shutdown(|| info!("Listener closed, draining connections"));
    if let Some(password) = password {
        builder = builder.authenticator(PasswordAuth { password });
    }
    let server = builder.start().context("starting server")?;

    print_banner(&config, server.local_addr());

    signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("Shutdown signal received, stopping server...");

    server.shutdown();
    tokio::task::spawn_blocking(move || server.wait()).await?;

    info!("Server shutdown complete");
    Ok(())
}
