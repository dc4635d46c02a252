use std::collections::HashMap;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::Deserialize;

use crate::error::ConfigError;

/// Raw deserialized form of `routing.config`: switch name -> per-port
/// gateway bindings.
#[derive(Debug, Deserialize)]
pub struct RoutingConfigSpec {
    #[serde(flatten)]
    pub switches: HashMap<String, Vec<PortGatewaySpec>>,
}

#[derive(Debug, Deserialize)]
pub struct PortGatewaySpec {
    pub port_no: u16,
    pub gw_ipv4: Option<String>,
    pub gw_ipv4_prefix: Option<u8>,
    pub gw_ipv6: Option<String>,
    pub gw_ipv6_prefix: Option<u8>,
}

impl RoutingConfigSpec {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_string(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Toml(path.to_string(), e))
    }
}

/// Raw deserialized form of `bgper_config`.
#[derive(Debug, Deserialize)]
pub struct BgperConfigSpec {
    pub local_ipv4: String,
    pub local_ipv6: String,
    #[serde(default)]
    pub neighbor: Vec<NeighborSpec>,
}

#[derive(Debug, Deserialize)]
pub struct NeighborSpec {
    pub neighbor_ipv4: Option<String>,
    pub neighbor_ipv6: Option<String>,
    pub neighbor_ipv6_sma: Option<String>,
    pub border_switch: String,
    pub outport_no: u16,
}

impl BgperConfigSpec {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_string(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Toml(path.to_string(), e))
    }
}

pub fn parse_ipv4(field: &str, value: &str) -> Result<Ipv4Addr, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(field.to_string(), value.to_string()))
}

pub fn parse_ipv6(field: &str, value: &str) -> Result<Ipv6Addr, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(field.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_routing_config() {
        let toml = r#"
            [[s1]]
            port_no = 2
            gw_ipv4 = "10.0.0.1"
            gw_ipv4_prefix = 24

            [[s1]]
            port_no = 3
            gw_ipv6 = "fd00::1"
            gw_ipv6_prefix = 64
        "#;
        let spec: RoutingConfigSpec = toml::from_str(toml).unwrap();
        let s1 = spec.switches.get("s1").unwrap();
        assert_eq!(s1.len(), 2);
        assert_eq!(s1[0].port_no, 2);
        assert_eq!(s1[0].gw_ipv4.as_deref(), Some("10.0.0.1"));
        assert_eq!(s1[1].gw_ipv6_prefix, Some(64));
    }

    #[test]
    fn test_parse_bgper_config() {
        let toml = r#"
            local_ipv4 = "192.0.2.1"
            local_ipv6 = "2001:db8::1"

            [[neighbor]]
            neighbor_ipv4 = "192.0.2.2"
            border_switch = "s1"
            outport_no = 4
        "#;
        let spec: BgperConfigSpec = toml::from_str(toml).unwrap();
        assert_eq!(spec.local_ipv4, "192.0.2.1");
        assert_eq!(spec.neighbor.len(), 1);
        assert_eq!(spec.neighbor[0].outport_no, 4);
    }
}
