use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use pubsub_engine::BrokerConfig;

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "pubsub-server", about = "Persistent publish/subscribe broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open the data directory and serve the HTTP/WebSocket API
    Serve(ServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Path to the TOML config file; built-in defaults when omitted
    #[arg(long, env = "PUBSUB_CONFIG")]
    pub config: Option<String>,

    /// Overrides `broker.data_dir` from the config file
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Overrides `api_port` from the config file
    #[arg(long)]
    pub port: Option<u16>,
}

// ---- TOML Config ----

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Messages buffered per WebSocket subscriber before the reader stalls.
    #[serde(default = "default_ws_buffer")]
    pub ws_buffer: usize,
    #[serde(default)]
    pub broker: BrokerConfig,
}

fn default_api_port() -> u16 {
    9300
}
fn default_ws_buffer() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            ws_buffer: default_ws_buffer(),
            broker: BrokerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path).map_err(|e| ServerError::Config {
            context: "read",
            detail: format!("'{path}': {e}"),
        })?;
        Self::parse(&content).map_err(|e| match e {
            ServerError::Config { context, detail } => ServerError::Config {
                context,
                detail: format!("'{path}': {detail}"),
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ServerError> {
        let config: Self = toml::from_str(content).map_err(|e| ServerError::Config {
            context: "parse",
            detail: e.to_string(),
        })?;
        config.broker.validate().map_err(|e| ServerError::Config {
            context: "broker",
            detail: e.to_string(),
        })?;
        if config.ws_buffer == 0 {
            return Err(ServerError::Config {
                context: "validate",
                detail: "ws_buffer must be > 0".into(),
            });
        }
        Ok(config)
    }

    /// Config file (if any) with command-line overrides applied.
    pub fn resolve(args: &ServeArgs) -> Result<Self, ServerError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(dir) = &args.data_dir {
            config.broker.data_dir = dir.clone();
        }
        if let Some(port) = args.port {
            config.api_port = port;
        }
        Ok(config)
    }
}
