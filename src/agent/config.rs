//! Process configuration.
//!
//! Flags are `--key=value`; unrecognized flags are an error so typos
//! surface at startup rather than as silently-default behavior.

use std::fmt;

/// Dataplane encapsulation selected by the `tunnel_type` option.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelType {
    MplsGre,
    MplsUdp,
    Vxlan,
}

impl TunnelType {
    /// `"MPLSoUDP"` and `"VXLAN"` map to their types; anything else is
    /// MPLS-over-GRE.
    pub fn from_config(value: &str) -> Self {
        match value {
            "MPLSoUDP" => TunnelType::MplsUdp,
            "VXLAN" => TunnelType::Vxlan,
            _ => TunnelType::MplsGre,
        }
    }
}

/// Errors from flag parsing.
#[derive(Debug)]
#[non_exhaustive]
pub enum ConfigError {
    UnknownFlag(String),
    InvalidValue { flag: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFlag(flag) => write!(f, "unknown flag: {flag}"),
            Self::InvalidValue { flag, value } => {
                write!(f, "invalid value {value:?} for {flag}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub xmpp_server_1: Option<String>,
    pub xmpp_server_2: Option<String>,
    pub dns_server_1: Option<String>,
    pub dns_server_2: Option<String>,
    pub discovery_server: Option<String>,
    pub xmpp_instance_count: u32,
    pub vhost_name: String,
    pub eth_port: String,
    pub host_name: String,
    pub program_name: String,
    pub http_server_port: u16,
    pub tunnel_type: TunnelType,
    pub log_local: bool,
    pub log_category: String,
    pub log_level: String,
    pub collector: Option<String>,
    pub collector_port: u16,
    pub metadata_shared_secret: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            xmpp_server_1: None,
            xmpp_server_2: None,
            dns_server_1: None,
            dns_server_2: None,
            discovery_server: None,
            xmpp_instance_count: 2,
            vhost_name: "vhost0".to_string(),
            eth_port: "eth0".to_string(),
            host_name: String::new(),
            program_name: "vrouter-agent".to_string(),
            http_server_port: 8085,
            tunnel_type: TunnelType::MplsGre,
            log_local: false,
            log_category: String::new(),
            log_level: "info".to_string(),
            collector: None,
            collector_port: 0,
            metadata_shared_secret: None,
        }
    }
}

impl AgentConfig {
    /// Parses `--key=value` flags. `args` excludes the program name.
    pub fn parse_args(args: impl Iterator<Item = String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for arg in args {
            let Some(flag) = arg.strip_prefix("--") else {
                return Err(ConfigError::UnknownFlag(arg));
            };
            let (key, value) = flag.split_once('=').unwrap_or((flag, ""));
            match key {
                "xmpp_server_1" => config.xmpp_server_1 = some_nonempty(value),
                "xmpp_server_2" => config.xmpp_server_2 = some_nonempty(value),
                "dns_server_1" => config.dns_server_1 = some_nonempty(value),
                "dns_server_2" => config.dns_server_2 = some_nonempty(value),
                "discovery_server" => config.discovery_server = some_nonempty(value),
                "xmpp_instance_count" => {
                    config.xmpp_instance_count = parse_num(key, value)?;
                }
                "vhost_name" => config.vhost_name = value.to_string(),
                "eth_port" => config.eth_port = value.to_string(),
                "host_name" => config.host_name = value.to_string(),
                "program_name" => config.program_name = value.to_string(),
                "http_server_port" => config.http_server_port = parse_num(key, value)?,
                "tunnel_type" => config.tunnel_type = TunnelType::from_config(value),
                "log_local" => config.log_local = parse_bool(key, value)?,
                "log_category" => config.log_category = value.to_string(),
                "log_level" => config.log_level = value.to_string(),
                "collector" => config.collector = some_nonempty(value),
                "collector_port" => config.collector_port = parse_num(key, value)?,
                "metadata_shared_secret" => {
                    config.metadata_shared_secret = some_nonempty(value)
                }
                _ => return Err(ConfigError::UnknownFlag(arg)),
            }
        }
        Ok(config)
    }
}

fn some_nonempty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_num<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(flag: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "" | "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            flag: flag.to_string(),
            value: value.to_string(),
        }),
    }
}
