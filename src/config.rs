use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::handler::{HandlerKind, RouteTarget};
use crate::outbound::{OverflowPolicy, MIN_OUTBOUND_CAPACITY};

pub const DEFAULT_CONFIG_PATH: &str = "channel-gateway.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Request header carrying the subject the client claims to be.
    #[serde(default = "default_subject_header")]
    pub subject_header: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_outbound_overflow")]
    pub outbound_overflow: OverflowPolicy,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_handler")]
    pub handler: HandlerKind,
    /// Channel id (as a string key) to route target, used by `handler = "route"`.
    #[serde(default)]
    pub routes: BTreeMap<String, RouteTarget>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            subject_header: default_subject_header(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            outbound_overflow: default_outbound_overflow(),
            max_connections: default_max_connections(),
            max_frame_bytes: default_max_frame_bytes(),
            handler: default_handler(),
            routes: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    pub fn route_table(&self) -> Result<BTreeMap<u8, RouteTarget>> {
        self.routes
            .iter()
            .map(|(channel_id, target)| {
                let id = channel_id.trim().parse::<u8>().with_context(|| {
                    format!("gateway.routes key `{channel_id}` is not a channel id (0-255)")
                })?;
                Ok((id, *target))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            secret: None,
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_cli_overrides(&mut self, bind: Option<&str>, secret: Option<&str>) {
        if let Some(bind) = bind {
            self.gateway.bind = bind.to_owned();
        }
        if let Some(secret) = secret {
            self.identity.secret = Some(secret.to_owned());
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("CHANNEL_GATEWAY_BIND") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.gateway.bind = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("CHANNEL_GATEWAY_SUBJECT_HEADER") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.gateway.subject_header = trimmed.to_ascii_lowercase();
            }
        }
        if let Ok(v) = env::var("CHANNEL_GATEWAY_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.gateway.handshake_timeout_ms = n.max(100);
            }
        }
        if let Ok(v) = env::var("CHANNEL_GATEWAY_OUTBOUND_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                self.gateway.outbound_queue_capacity = n.max(MIN_OUTBOUND_CAPACITY);
            }
        }
        if let Ok(v) = env::var("CHANNEL_GATEWAY_OUTBOUND_OVERFLOW") {
            if let Some(policy) = parse_overflow_policy(&v) {
                self.gateway.outbound_overflow = policy;
            }
        }
        if let Ok(v) = env::var("CHANNEL_GATEWAY_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse::<usize>() {
                self.gateway.max_connections = n;
            }
        }
        if let Ok(v) = env::var("CHANNEL_GATEWAY_MAX_FRAME_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                self.gateway.max_frame_bytes = n;
            }
        }
        if let Ok(v) = env::var("CHANNEL_GATEWAY_HANDLER") {
            if let Some(kind) = parse_handler_kind(&v) {
                self.gateway.handler = kind;
            }
        }
        if let Ok(v) = env::var("CHANNEL_GATEWAY_SECRET") {
            let trimmed = v.trim();
            self.identity.secret = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            };
        }
        if let Ok(v) = env::var("CHANNEL_GATEWAY_TOKEN_TTL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.identity.token_ttl_secs = n;
            }
        }
        if let Ok(v) = env::var("CHANNEL_GATEWAY_SESSION_STATE_PATH") {
            self.session.state_path = PathBuf::from(v.trim());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.bind.trim().is_empty() {
            anyhow::bail!("gateway.bind must not be empty");
        }
        if !is_header_name(&self.gateway.subject_header) {
            anyhow::bail!(
                "gateway.subject_header `{}` is not a valid lowercase header name",
                self.gateway.subject_header
            );
        }
        if self.gateway.subject_header == "authorization" {
            anyhow::bail!("gateway.subject_header must not be `authorization`");
        }
        if self.gateway.handshake_timeout_ms == 0 {
            anyhow::bail!("gateway.handshake_timeout_ms must be > 0");
        }
        if self.gateway.outbound_queue_capacity < MIN_OUTBOUND_CAPACITY {
            anyhow::bail!("gateway.outbound_queue_capacity must be >= {MIN_OUTBOUND_CAPACITY}");
        }
        if self.gateway.max_connections == 0 {
            anyhow::bail!("gateway.max_connections must be > 0");
        }
        if self.gateway.max_frame_bytes < crate::frame::MIN_FRAME_LEN {
            anyhow::bail!(
                "gateway.max_frame_bytes must be >= {}",
                crate::frame::MIN_FRAME_LEN
            );
        }
        let routes = self.gateway.route_table()?;
        if self.gateway.handler == HandlerKind::Route && routes.is_empty() {
            anyhow::bail!("gateway.routes must not be empty when gateway.handler = \"route\"");
        }
        match self.identity.secret.as_deref() {
            Some(secret) if !secret.trim().is_empty() => {}
            _ => anyhow::bail!("identity.secret must be set (or CHANNEL_GATEWAY_SECRET)"),
        }
        if self.identity.token_ttl_secs == 0 {
            anyhow::bail!("identity.token_ttl_secs must be > 0");
        }
        Ok(())
    }

    /// Effective settings with the identity secret redacted.
    pub fn summary(&self) -> Value {
        json!({
            "gateway": {
                "bind": self.gateway.bind,
                "subjectHeader": self.gateway.subject_header,
                "handshakeTimeoutMs": self.gateway.handshake_timeout_ms,
                "outboundQueueCapacity": self.gateway.outbound_queue_capacity,
                "outboundOverflow": self.gateway.outbound_overflow,
                "maxConnections": self.gateway.max_connections,
                "maxFrameBytes": self.gateway.max_frame_bytes,
                "handler": self.gateway.handler,
                "routes": self.gateway.routes,
            },
            "identity": {
                "secretConfigured": self.identity.secret.is_some(),
                "tokenTtlSecs": self.identity.token_ttl_secs,
            },
            "session": {
                "statePath": self.session.state_path.display().to_string(),
            }
        })
    }
}

fn is_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
}

fn parse_overflow_policy(raw: &str) -> Option<OverflowPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "block" => Some(OverflowPolicy::Block),
        "drop_newest" | "drop-newest" | "drop" => Some(OverflowPolicy::DropNewest),
        _ => None,
    }
}

fn parse_handler_kind(raw: &str) -> Option<HandlerKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "log" | "logging" => Some(HandlerKind::Log),
        "echo" => Some(HandlerKind::Echo),
        "route" | "routing" => Some(HandlerKind::Route),
        _ => None,
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_owned()
}

fn default_subject_header() -> String {
    "user".to_owned()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_outbound_overflow() -> OverflowPolicy {
    OverflowPolicy::Block
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_handler() -> HandlerKind {
    HandlerKind::Log
}

fn default_token_ttl_secs() -> u64 {
    3_600
}

fn default_state_path() -> PathBuf {
    PathBuf::from(".channel-gateway/sessions.json")
}
