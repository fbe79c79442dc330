use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::authorizer::AuthorizerConfig;
use crate::cli::ServeArgs;
use crate::storage::RegistryTtl;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// In-memory registry when unset.
    pub redis_url: Option<String>,
    pub public_ws_url: String,
    pub ttl: RegistryTtl,
    pub authorizer: AuthorizerConfig,
    pub shutdown_grace: Duration,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.message_cache_limit == 0 {
            bail!("message cache limit must be at least 1");
        }
        for (name, secs) in [
            ("session ttl", args.session_ttl_secs),
            ("connection ttl", args.connection_ttl_secs),
            ("message ttl", args.message_ttl_secs),
        ] {
            if secs == 0 {
                bail!("{name} must be greater than zero");
            }
        }

        let authorizer = AuthorizerConfig {
            jwks_url: non_empty(args.jwks_url),
            issuer: non_empty(args.jwt_issuer),
            audience: non_empty(args.jwt_audience),
            cache_ttl: Duration::from_secs(args.jwks_cache_ttl_secs),
        };
        if authorizer.jwks_url.is_some() {
            if authorizer.issuer.is_none() {
                bail!("--jwks-url requires --jwt-issuer");
            }
            if authorizer.audience.is_none() {
                bail!("--jwks-url requires --jwt-audience");
            }
        }

        Ok(RelayConfig {
            listen_addr,
            redis_url: non_empty(args.redis_url),
            public_ws_url: args.public_ws_url,
            ttl: RegistryTtl {
                session: Duration::from_secs(args.session_ttl_secs),
                connection: Duration::from_secs(args.connection_ttl_secs),
                message: Duration::from_secs(args.message_ttl_secs),
                message_limit: args.message_cache_limit,
            },
            authorizer,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
