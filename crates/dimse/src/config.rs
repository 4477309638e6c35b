//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::DEFAULT_DIMSE_PORT;

/// Configuration for the local application entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local Application Entity Title
    #[serde(default = "default_local_aet")]
    pub local_aet: String,

    /// Bind address for the storage SCP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for the storage SCP listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// How long a stopping SCP waits for open associations to finish
    #[serde(default = "default_association_timeout")]
    pub association_timeout_ms: u64,

    /// Maximum number of concurrent inbound associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Maximum PDU size for this node (overrides global setting)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pdu: Option<u32>,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: default_local_aet(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            association_timeout_ms: default_association_timeout(),
            max_associations: default_max_associations(),
        }
    }
}

impl DimseConfig {
    /// Get association drain timeout as Duration
    pub fn association_timeout(&self) -> Duration {
        Duration::from_millis(self.association_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.local_aet, "Local")?;

        if self.max_pdu < 16384 || self.max_pdu > 131072 {
            return Err(crate::error::DimseError::config(
                "Max PDU size must be between 16384 and 131072 bytes",
            ));
        }

        if self.max_associations == 0 {
            return Err(crate::error::DimseError::config(
                "At least one concurrent association must be allowed",
            ));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            max_pdu: None,
        }
    }

    /// Set the maximum PDU size for this node
    pub fn with_max_pdu(mut self, max_pdu: u32) -> Self {
        self.max_pdu = Some(max_pdu);
        self
    }

    /// Socket address string understood by `ToSocketAddrs`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.ae_title, "Remote")?;

        if self.host.is_empty() {
            return Err(crate::error::DimseError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(crate::error::DimseError::config(
                "Remote port must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

fn validate_ae_title(aet: &str, which: &str) -> crate::error::Result<()> {
    if aet.trim().is_empty() || aet.len() > 16 {
        return Err(crate::error::DimseError::config(format!(
            "{} AE title must be 1-16 characters",
            which
        )));
    }
    if aet.contains('\\') || aet.chars().any(|c| c.is_control()) {
        return Err(crate::error::DimseError::config(format!(
            "{} AE title contains invalid characters",
            which
        )));
    }
    Ok(())
}

// Default value functions
fn default_local_aet() -> String {
    "DCMCAT".to_string()
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_max_pdu() -> u32 {
    16384
}

fn default_association_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_max_associations() -> u32 {
    16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DimseConfig::default();
        assert_eq!(config.local_aet, "DCMCAT");
        assert_eq!(config.port, DEFAULT_DIMSE_PORT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_remote_node_builder() {
        let node = RemoteNode::new("PACS", "localhost", 104).with_max_pdu(32768);

        assert_eq!(node.ae_title, "PACS");
        assert_eq!(node.address(), "localhost:104");
        assert_eq!(node.max_pdu, Some(32768));
        assert_eq!(node.to_string(), "PACS@localhost:104");
    }

    #[test]
    fn test_config_validation() {
        let mut config = DimseConfig::default();

        config.local_aet = "".to_string();
        assert!(config.validate().is_err());

        config.local_aet = "A".repeat(17);
        assert!(config.validate().is_err());

        config.local_aet = "OK".to_string();
        config.max_pdu = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_node_validation() {
        assert!(RemoteNode::new("PACS", "", 104).validate().is_err());
        assert!(RemoteNode::new("PACS", "host", 0).validate().is_err());
        assert!(RemoteNode::new("BAD\\AET", "host", 104).validate().is_err());
        assert!(RemoteNode::new("PACS", "host", 104).validate().is_ok());
    }
}
