use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error};

use tether_proto::{now_millis, ClientMessage, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "tether-relay", version)]
#[command(about = "Tether end-to-end encrypted terminal relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ping a running relay and report the round trip
    Probe {
        /// Relay websocket URL
        #[arg(short, long, default_value = "ws://localhost:8080/ws")]
        url: String,

        /// Bearer token presented as `?token=`
        #[arg(long)]
        token: Option<String>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "TETHER_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Redis connection URI; the in-memory registry is used when absent.
    #[arg(long, env = "TETHER_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Websocket URL advertised to endpoints after registration.
    #[arg(long, env = "TETHER_PUBLIC_WS_URL", default_value = "ws://localhost:8080/ws")]
    pub public_ws_url: String,

    #[arg(long, env = "TETHER_SESSION_TTL", default_value_t = 86_400)]
    pub session_ttl_secs: u64,

    #[arg(long, env = "TETHER_CONNECTION_TTL", default_value_t = 7_200)]
    pub connection_ttl_secs: u64,

    #[arg(long, env = "TETHER_MESSAGE_TTL", default_value_t = 3_600)]
    pub message_ttl_secs: u64,

    /// Cached envelopes kept per session for late joiners.
    #[arg(long, env = "TETHER_MESSAGE_CACHE_LIMIT", default_value_t = 200)]
    pub message_cache_limit: usize,

    #[arg(long, env = "TETHER_JWKS_URL")]
    pub jwks_url: Option<String>,

    #[arg(long, env = "TETHER_JWT_ISSUER")]
    pub jwt_issuer: Option<String>,

    #[arg(long, env = "TETHER_JWT_AUDIENCE")]
    pub jwt_audience: Option<String>,

    #[arg(long, env = "TETHER_JWKS_CACHE_TTL", default_value_t = 3_600)]
    pub jwks_cache_ttl_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TETHER_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

pub async fn run_probe(url: String, token: Option<String>) -> Result<()> {
    let ws_url = match token {
        Some(token) => format!("{url}?token={token}"),
        None => url,
    };
    debug!("Connecting to {}", ws_url);

    let connect = connect_async(ws_url.as_str());
    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => bail!("Connection timeout - is the relay running?"),
    };
    let (mut write, mut read) = ws_stream.split();

    let started = Instant::now();
    let ping = serde_json::to_string(&ClientMessage::Ping {
        timestamp: Some(now_millis()),
    })?;
    write.send(Message::Text(ping.into())).await?;

    let pong = timeout(Duration::from_secs(5), wait_for_pong(&mut read))
        .await
        .map_err(|_| anyhow!("Timed out waiting for PONG"))??;

    let target = ws_url.split('?').next().unwrap_or_default();
    println!(
        "PONG from {} (relay clock {}, round trip {} ms)",
        target,
        pong,
        started.elapsed().as_millis()
    );
    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

async fn wait_for_pong<S>(read: &mut S) -> Result<u64>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = read.next().await {
        if let Message::Text(text) = msg? {
            match serde_json::from_str::<ServerMessage>(text.as_str())? {
                ServerMessage::Pong { timestamp } => return Ok(timestamp),
                ServerMessage::Error { code, message } => bail!("relay error {code}: {message}"),
                other => debug!("ignoring {:?}", other),
            }
        }
    }
    bail!("connection closed before PONG")
}
