mod file;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{Ipv4Network, Ipv6Network};

use crate::error::ConfigError;

/// Per-port gateway binding, validated from [`file::PortGatewaySpec`].
#[derive(Debug, Clone)]
pub struct PortGateway {
    pub port_no: u16,
    pub gw_ipv4: Option<Ipv4Addr>,
    pub gw_ipv4_network: Option<Ipv4Network>,
    pub gw_ipv6: Option<Ipv6Addr>,
    pub gw_ipv6_network: Option<Ipv6Network>,
}

/// Validated `routing.config`: switch name -> per-port gateway bindings.
#[derive(Debug, Clone, Default)]
pub struct RoutingConfig {
    pub switches: HashMap<String, Vec<PortGateway>>,
}

impl RoutingConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let spec = file::RoutingConfigSpec::from_file(path)?;
        let mut switches = HashMap::new();
        for (name, ports) in spec.switches {
            let mut gateways = Vec::with_capacity(ports.len());
            for p in ports {
                gateways.push(PortGateway::from_spec(p)?);
            }
            switches.insert(name, gateways);
        }
        Ok(RoutingConfig { switches })
    }

    pub fn ports_for(&self, switch_name: &str) -> &[PortGateway] {
        self.switches
            .get(switch_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl PortGateway {
    fn from_spec(spec: file::PortGatewaySpec) -> Result<Self, ConfigError> {
        let gw_ipv4 = spec
            .gw_ipv4
            .as_deref()
            .map(|v| file::parse_ipv4("gw_ipv4", v))
            .transpose()?;
        let gw_ipv4_network = match (gw_ipv4, spec.gw_ipv4_prefix) {
            (Some(ip), Some(prefix)) => Some(
                Ipv4Network::new(ip, prefix)
                    .map_err(|_| ConfigError::InvalidPrefix("gw_ipv4_prefix".into(), prefix))?,
            ),
            _ => None,
        };
        let gw_ipv6 = spec
            .gw_ipv6
            .as_deref()
            .map(|v| file::parse_ipv6("gw_ipv6", v))
            .transpose()?;
        let gw_ipv6_network = match (gw_ipv6, spec.gw_ipv6_prefix) {
            (Some(ip), Some(prefix)) => Some(
                Ipv6Network::new(ip, prefix)
                    .map_err(|_| ConfigError::InvalidPrefix("gw_ipv6_prefix".into(), prefix))?,
            ),
            _ => None,
        };
        Ok(PortGateway {
            port_no: spec.port_no,
            gw_ipv4,
            gw_ipv4_network,
            gw_ipv6,
            gw_ipv6_network,
        })
    }
}

/// A single BGP neighbor reachable through this AS's border switches.
#[derive(Debug, Clone)]
pub struct BgpNeighbor {
    pub neighbor_ipv4: Option<Ipv4Addr>,
    pub neighbor_ipv6: Option<Ipv6Addr>,
    pub neighbor_ipv6_sma: Option<Ipv6Addr>,
    pub border_switch: String,
    pub outport_no: u16,
}

impl BgpNeighbor {
    /// True if `ip` matches this neighbor's registered addresses, which is
    /// how the TAP dispatcher picks `(border_switch, outport_no)` for a
    /// frame coming out of the BGP speaker (§4.3).
    pub fn matches(&self, ip: std::net::IpAddr) -> bool {
        match ip {
            std::net::IpAddr::V4(v4) => self.neighbor_ipv4 == Some(v4),
            std::net::IpAddr::V6(v6) => {
                self.neighbor_ipv6 == Some(v6) || self.neighbor_ipv6_sma == Some(v6)
            }
        }
    }
}

/// Validated `bgper_config`.
#[derive(Debug, Clone)]
pub struct BgperConfig {
    pub local_ipv4: Ipv4Addr,
    pub local_ipv6: Ipv6Addr,
    pub neighbors: Vec<BgpNeighbor>,
}

impl BgperConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let spec = file::BgperConfigSpec::from_file(path)?;
        let local_ipv4 = file::parse_ipv4("local_ipv4", &spec.local_ipv4)?;
        let local_ipv6 = file::parse_ipv6("local_ipv6", &spec.local_ipv6)?;
        let mut neighbors = Vec::with_capacity(spec.neighbor.len());
        for n in spec.neighbor {
            neighbors.push(BgpNeighbor {
                neighbor_ipv4: n
                    .neighbor_ipv4
                    .as_deref()
                    .map(|v| file::parse_ipv4("neighbor_ipv4", v))
                    .transpose()?,
                neighbor_ipv6: n
                    .neighbor_ipv6
                    .as_deref()
                    .map(|v| file::parse_ipv6("neighbor_ipv6", v))
                    .transpose()?,
                neighbor_ipv6_sma: n
                    .neighbor_ipv6_sma
                    .as_deref()
                    .map(|v| file::parse_ipv6("neighbor_ipv6_sma", v))
                    .transpose()?,
                border_switch: n.border_switch,
                outport_no: n.outport_no,
            });
        }
        Ok(BgperConfig {
            local_ipv4,
            local_ipv6,
            neighbors,
        })
    }

    /// Find the neighbor registered under `ip`, used by the TAP dispatcher.
    pub fn neighbor_for(&self, ip: std::net::IpAddr) -> Option<&BgpNeighbor> {
        self.neighbors.iter().find(|n| n.matches(ip))
    }

    pub fn is_local_speaker(&self, ip: std::net::IpAddr) -> bool {
        match ip {
            std::net::IpAddr::V4(v4) => v4 == self.local_ipv4,
            std::net::IpAddr::V6(v6) => v6 == self.local_ipv6,
        }
    }
}
