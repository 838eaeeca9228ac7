use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::auth::AuthConfig;
use crate::fanout::DEFAULT_FANOUT_TOPIC;
use crate::state::ServiceSettings;

#[derive(Debug, Parser)]
#[command(
    name = "beach-dispatch",
    author,
    version,
    about = "Pair remote agents with users and fan commands out to them"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP + websocket server.
    Serve(ServeArgs),
    /// Connect to a server as a device agent.
    Agent(AgentArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    #[default]
    Redis,
    /// Process-local store; only meaningful for a single instance.
    Memory,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "BEACH_DISPATCH_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    #[arg(long, env = "BEACH_DISPATCH_STORE", value_enum, default_value_t = StoreKind::Redis)]
    pub store: StoreKind,

    #[arg(
        long,
        env = "BEACH_DISPATCH_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub redis_url: String,

    /// Identifier reported on /debug/stats; random when omitted.
    #[arg(long, env = "BEACH_DISPATCH_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// HS256 secret used to verify caller tokens.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Treat the presented token as the user id (development mode only).
    #[arg(long, env = "BEACH_DISPATCH_AUTH_BYPASS", default_value_t = false)]
    pub auth_bypass: bool,

    #[arg(long, env = "BEACH_DISPATCH_COMMAND_TIMEOUT_SECS", default_value_t = 30)]
    pub command_timeout_secs: u64,

    #[arg(long, env = "BEACH_DISPATCH_PAIRING_TTL_SECS", default_value_t = 180)]
    pub pairing_ttl_secs: u64,

    #[arg(long, env = "BEACH_DISPATCH_FANOUT_TOPIC", default_value = DEFAULT_FANOUT_TOPIC)]
    pub fanout_topic: String,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_DISPATCH_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct AgentArgs {
    /// Websocket endpoint, e.g. ws://127.0.0.1:8080/ws
    #[arg(long, env = "BEACH_DISPATCH_AGENT_URL")]
    pub url: String,

    #[arg(long, env = "BEACH_DISPATCH_DEVICE_ID")]
    pub device_id: String,

    /// Code obtained from GET /pairing-code.
    #[arg(long, env = "BEACH_DISPATCH_PAIRING_CODE")]
    pub pairing_code: String,

    #[arg(long, default_value = "sh")]
    pub shell: String,
}

#[derive(Debug, Clone)]
pub enum StoreBackend {
    Redis { url: String },
    Memory,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreBackend,
    pub instance_id: String,
    pub auth: AuthConfig,
    pub service: ServiceSettings,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;

        let jwt_secret = args.jwt_secret.filter(|secret| !secret.trim().is_empty());
        if jwt_secret.is_none() && !args.auth_bypass {
            bail!("JWT_SECRET must be set unless auth bypass is enabled");
        }
        if args.command_timeout_secs == 0 {
            bail!("command timeout must be at least one second");
        }
        if args.pairing_ttl_secs == 0 {
            bail!("pairing code ttl must be at least one second");
        }
        if args.fanout_topic.trim().is_empty() {
            bail!("fanout topic must not be empty");
        }

        let store = match args.store {
            StoreKind::Redis => StoreBackend::Redis {
                url: args.redis_url,
            },
            StoreKind::Memory => StoreBackend::Memory,
        };

        Ok(ServerConfig {
            listen_addr,
            store,
            instance_id: args
                .instance_id
                .unwrap_or_else(|| format!("dispatch-{}", Uuid::new_v4().simple())),
            auth: AuthConfig {
                jwt_secret,
                bypass: args.auth_bypass,
            },
            service: ServiceSettings {
                command_timeout: Duration::from_secs(args.command_timeout_secs),
                pairing_ttl: Duration::from_secs(args.pairing_ttl_secs),
                fanout_topic: args.fanout_topic,
            },
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
