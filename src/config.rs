use std::env;
use std::fs;
use std::net::SocketAddr;

use anyhow::{anyhow, Context, Result};

use crate::filter::HeaderEncoding;
use crate::filters::{parse_filter_order, FilterConfig};
use crate::server::ListenAddr;

const DEFAULT_GRPC_ADDR: &str = "0.0.0.0:8081";
const DEFAULT_ADMIN_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub grpc_addr: ListenAddr,
    /// `None` when the admin server is disabled.
    pub admin_addr: Option<SocketAddr>,
    pub filter_order: Vec<String>,
    pub filter_config: FilterConfig,
    pub header_encoding: HeaderEncoding,
    pub filter_warn_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let filter_config = if let Ok(path) = env::var("EXTPROC_FILTER_CONFIG") {
            let content = fs::read_to_string(&path).with_context(|| {
                format!(
                    "Failed to read EXTPROC_FILTER_CONFIG '{}': file unreadable",
                    path
                )
            })?;
            serde_json::from_str::<FilterConfig>(&content).with_context(|| {
                format!(
                    "Failed to parse EXTPROC_FILTER_CONFIG '{}': invalid JSON configuration",
                    path
                )
            })?
        } else {
            FilterConfig::default()
        };

        let filter_order = parse_filter_order();

        let grpc_addr = env_or("EXTPROC_GRPC_ADDR", DEFAULT_GRPC_ADDR)
            .parse::<ListenAddr>()
            .context("EXTPROC_GRPC_ADDR must be host:port or unix:/path")?;

        let admin_raw = env_or("EXTPROC_ADMIN_ADDR", DEFAULT_ADMIN_ADDR);
        let admin_addr = if admin_raw.eq_ignore_ascii_case("off") {
            None
        } else {
            Some(
                admin_raw
                    .parse::<SocketAddr>()
                    .map_err(|_| anyhow!("EXTPROC_ADMIN_ADDR must be host:port or 'off'"))?,
            )
        };

        let header_encoding = match env_or("EXTPROC_HEADER_ENCODING", "raw").to_ascii_lowercase().as_str() {
            "raw" | "raw_value" => HeaderEncoding::RawValue,
            "value" => HeaderEncoding::Value,
            _ => return Err(anyhow!("EXTPROC_HEADER_ENCODING must be 'raw' or 'value'")),
        };

        let filter_warn_ms = parse_optional_u64("EXTPROC_FILTER_WARN_MS")?.unwrap_or(100);
        let shutdown_grace_secs = parse_optional_u64("EXTPROC_SHUTDOWN_GRACE_SECS")?.unwrap_or(5);

        Ok(Self {
            grpc_addr,
            admin_addr,
            filter_order,
            filter_config,
            header_encoding,
            filter_warn_ms,
            shutdown_grace_secs,
        })
    }
}

fn env_or(var: &str, default: &str) -> String {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
