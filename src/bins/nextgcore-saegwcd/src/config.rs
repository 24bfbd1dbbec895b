//! SAEGW-C Configuration
//!
//! The `saegwc` section of the YAML configuration file. Every field has a
//! default so a missing file or section still yields a working node; a file
//! that exists but does not parse is a startup error.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{SaegwcError, SaegwcResult};
use crate::types::GatewayRole;

/// Largest supported partition count
pub const MAX_PARTITIONS: usize = 64;

/// What to do with a retransmitted request whose procedure already finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetransmissionPolicy {
    /// Silently drop the duplicate
    Drop,
    /// Re-send the cached response
    #[default]
    Resend,
}

/// Reaction to a failed Gx leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureHandling {
    /// Reject the procedure
    #[default]
    Terminate,
    /// Carry on without policy control
    Continue,
}

/// User plane node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpfConfig {
    /// PFCP node address
    pub node: IpAddr,
    /// GTP-U address on the access side (S1-U, or S5/S8-U at a PGW)
    pub access_addr: IpAddr,
    /// GTP-U address on the core side (S5/S8-U at an SGW)
    pub core_addr: IpAddr,
}

/// UE address pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UePoolConfig {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
}

impl Default for UePoolConfig {
    fn default() -> Self {
        Self {
            network: Ipv4Addr::new(10, 45, 0, 0),
            prefix_len: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GxConfig {
    pub enabled: bool,
    /// Diameter Origin-Host, prefix of every Gx Session-Id
    pub origin_host: String,
    pub failure_handling: FailureHandling,
}

impl Default for GxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            origin_host: "saegwc.localdomain".to_string(),
            failure_handling: FailureHandling::Terminate,
        }
    }
}

/// Timer values, durations in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    pub echo_interval: u64,
    pub t3_response: u64,
    pub n3_requests: u32,
    pub remove_after_cycles: u32,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            echo_interval: 60_000,
            t3_response: 3_000,
            n3_requests: 3,
            remove_after_cycles: 3,
        }
    }
}

/// `saegwc` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaegwcConfig {
    pub role: GatewayRole,
    pub partitions: usize,
    /// Own control plane address, used in F-TEIDs and FQ-CSIDs
    pub node_addr: IpAddr,
    pub gtpc_addr: SocketAddr,
    pub pfcp_addr: SocketAddr,
    pub upf: Vec<UpfConfig>,
    pub ue_pool: UePoolConfig,
    pub gx: GxConfig,
    pub timers: TimersConfig,
    pub retransmission: RetransmissionPolicy,
    pub restart_counter_path: PathBuf,
    pub max_pdn_per_ue: usize,
}

impl Default for SaegwcConfig {
    fn default() -> Self {
        let node_addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3));
        Self {
            role: GatewayRole::Saegwc,
            partitions: 4,
            node_addr,
            gtpc_addr: SocketAddr::new(node_addr, 2123),
            pfcp_addr: SocketAddr::new(node_addr, 8805),
            upf: vec![UpfConfig {
                node: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 7)),
                access_addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 7)),
                core_addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 7)),
            }],
            ue_pool: UePoolConfig::default(),
            gx: GxConfig::default(),
            timers: TimersConfig::default(),
            retransmission: RetransmissionPolicy::Resend,
            restart_counter_path: PathBuf::from("/var/lib/nextgcore/saegwc.restart"),
            max_pdn_per_ue: 8,
        }
    }
}

impl SaegwcConfig {
    /// Parse the `saegwc` section of a YAML document
    pub fn from_yaml_str(yaml: &str) -> SaegwcResult<Self> {
        let root: Value = serde_yaml::from_str(yaml)
            .map_err(|e| SaegwcError::Config(format!("Failed to parse YAML config: {e}")))?;
        let config = match root.get("saegwc") {
            Some(section) => serde_yaml::from_value(section.clone())
                .map_err(|e| SaegwcError::Config(format!("Invalid 'saegwc' section: {e}")))?,
            None => {
                log::warn!("No 'saegwc' section in config file");
                Self::default()
            }
        };
        Ok(config)
    }

    /// Load and validate the configuration file
    pub fn load(path: &Path) -> SaegwcResult<Self> {
        log::info!("Loading configuration from: {}", path.display());
        let config = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_yaml_str(&content)?,
            Err(e) => {
                log::warn!(
                    "Could not read config file '{}': {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject contradictory settings
    pub fn validate(&self) -> SaegwcResult<()> {
        if self.partitions == 0 || self.partitions > MAX_PARTITIONS {
            return Err(SaegwcError::Config(format!(
                "partitions must be within 1..={MAX_PARTITIONS}, got {}",
                self.partitions
            )));
        }
        if self.gx.enabled && !self.role.anchors_pdn() {
            return Err(SaegwcError::Config(format!(
                "Gx cannot be enabled on {}",
                self.role.name()
            )));
        }
        if self.upf.is_empty() {
            return Err(SaegwcError::Config("no UPF configured".to_string()));
        }
        if self.max_pdn_per_ue == 0 {
            return Err(SaegwcError::Config("max_pdn_per_ue must be positive".to_string()));
        }
        if self.role.anchors_pdn() && self.ue_pool.prefix_len > 30 {
            return Err(SaegwcError::Config(format!(
                "UE pool prefix /{} leaves no host addresses",
                self.ue_pool.prefix_len
            )));
        }
        Ok(())
    }

    /// Whether the node runs policy control
    pub fn gx_enabled(&self) -> bool {
        self.gx.enabled && self.role.anchors_pdn()
    }

    /// UPF configuration for a node address
    pub fn upf_by_node(&self, node: IpAddr) -> Option<&UpfConfig> {
        self.upf.iter().find(|u| u.node == node)
    }
}
