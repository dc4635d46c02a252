//! Authoritative model of switches, ports, links and gateways, plus the
//! per-switch address resolution cache and deferred-packet buffer (§3,
//! §4.1). The graph is cyclic (mutual peer references) so it is kept as a
//! table keyed by dpid/port_no rather than an owning pointer graph.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnetwork::{Ipv4Network, Ipv6Network};
use log::{debug, info, warn};
use pnet::util::MacAddr;

use crate::config::RoutingConfig;
use crate::openflow::{cost_from_features, FeaturesReply, PortDesc, SwitchConnection, OFPP_LOCAL};
use crate::utils::is_fresh;

/// Per-switch cap on deferred packet-in contexts awaiting address
/// resolution, with oldest-first eviction (§5, §9).
pub const MSG_BUFFER_LIMIT: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct Gateway {
    pub gw_ipv4: Option<Ipv4Addr>,
    pub gw_ipv4_network: Option<Ipv4Network>,
    pub gw_ipv6: Option<Ipv6Addr>,
    pub gw_ipv6_network: Option<Ipv6Network>,
}

impl Gateway {
    pub fn covers(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.gw_ipv4_network.map(|n| n.contains(v4)).unwrap_or(false),
            IpAddr::V6(v6) => self.gw_ipv6_network.map(|n| n.contains(v6)).unwrap_or(false),
        }
    }

    pub fn is_self(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.gw_ipv4 == Some(v4),
            IpAddr::V6(v6) => self.gw_ipv6 == Some(v6),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Port {
    pub port_no: u16,
    pub hw_addr: MacAddr,
    pub name: Option<String>,
    pub cost: u32,
    pub peer: Option<(u64, u16)>,
    pub gateway: Option<Gateway>,
}

impl Port {
    fn from_desc(desc: &PortDesc) -> Self {
        Port {
            port_no: desc.port_no,
            hw_addr: desc.hw_addr,
            name: if desc.port_no == OFPP_LOCAL {
                Some(desc.name.clone())
            } else {
                None
            },
            cost: cost_from_features(desc.curr_features),
            peer: None,
            gateway: None,
        }
    }
}

/// Full packet-in context held while awaiting ARP/ND resolution (§3).
#[derive(Debug, Clone)]
pub struct DeferredPacket {
    pub packet_in: crate::openflow::PacketIn,
    pub dst_ip: IpAddr,
    pub outport_no: u16,
}

pub struct Switch {
    pub dpid: u64,
    pub name: Option<String>,
    pub connection: Arc<dyn SwitchConnection>,
    pub ports: HashMap<u16, Port>,
    pub peer_to_local_port: HashMap<u64, u16>,
    pub ip_to_mac: HashMap<IpAddr, (MacAddr, DateTime<Utc>)>,
    pub msg_buffer: VecDeque<DeferredPacket>,
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Switch")
            .field("dpid", &self.dpid)
            .field("name", &self.name)
            .field("ports", &self.ports.len())
            .finish()
    }
}

impl Switch {
    fn new(dpid: u64, connection: Arc<dyn SwitchConnection>) -> Self {
        Switch {
            dpid,
            name: None,
            connection,
            ports: HashMap::new(),
            peer_to_local_port: HashMap::new(),
            ip_to_mac: HashMap::new(),
            msg_buffer: VecDeque::new(),
        }
    }

    /// Refresh or install a neighbor cache entry (§3 NeighborCacheEntry).
    pub fn remember(&mut self, ip: IpAddr, mac: MacAddr) {
        self.ip_to_mac.insert(ip, (mac, Utc::now()));
    }

    /// Look up a fresh (within TTL) neighbor cache entry.
    pub fn lookup_mac(&self, ip: IpAddr) -> Option<MacAddr> {
        self.ip_to_mac
            .get(&ip)
            .filter(|(_, ts)| is_fresh(*ts))
            .map(|(mac, _)| *mac)
    }

    /// Append to `msg_buffer`, dropping the oldest entry on overflow (§4.3,
    /// §9).
    pub fn defer(&mut self, packet: DeferredPacket) {
        if self.msg_buffer.len() >= MSG_BUFFER_LIMIT {
            self.msg_buffer.pop_front();
        }
        self.msg_buffer.push_back(packet);
    }
}

pub struct TopologyStore {
    pub switches: HashMap<u64, Switch>,
    pub version: u64,
    pub routing_config: RoutingConfig,
}

impl TopologyStore {
    pub fn new(routing_config: RoutingConfig) -> Self {
        TopologyStore {
            switches: HashMap::new(),
            version: 0,
            routing_config,
        }
    }

    fn bump(&mut self) {
        self.version += 1;
    }

    /// Idempotent create of a Switch (§4.1). Returns true if this call
    /// actually created the switch (used by callers that pre-install
    /// control-plane capture flows only on first entry, §4.7).
    pub fn on_switch_enter(&mut self, dpid: u64, connection: Arc<dyn SwitchConnection>) -> bool {
        if self.switches.contains_key(&dpid) {
            return false;
        }
        info!("switch entered dpid={:#x}", dpid);
        self.switches.insert(dpid, Switch::new(dpid, connection));
        self.bump();
        true
    }

    pub fn on_switch_leave(&mut self, dpid: u64) {
        if self.switches.remove(&dpid).is_some() {
            info!("switch left dpid={:#x}", dpid);
            // Any port on a remaining switch that peered with this one is
            // now dangling; clear it so routing doesn't try to use it.
            for sw in self.switches.values_mut() {
                sw.peer_to_local_port.retain(|peer_dpid, _| *peer_dpid != dpid);
                for port in sw.ports.values_mut() {
                    if port.peer.map(|(d, _)| d) == Some(dpid) {
                        port.peer = None;
                    }
                }
            }
            self.bump();
        }
    }

    pub fn on_features(&mut self, reply: FeaturesReply) {
        let dpid = reply.dpid;
        let Some(sw) = self.switches.get_mut(&dpid) else {
            warn!("features reply for unknown switch dpid={:#x}", dpid);
            return;
        };
        for desc in &reply.ports {
            sw.ports.insert(desc.port_no, Port::from_desc(desc));
            if desc.port_no == OFPP_LOCAL {
                sw.name = Some(desc.name.clone());
            }
        }
        self.bump();
        self.apply_gateways(dpid);
    }

    pub fn on_port_add(&mut self, dpid: u64, desc: PortDesc) {
        let Some(sw) = self.switches.get_mut(&dpid) else {
            warn!("port-add for unknown switch dpid={:#x}", dpid);
            return;
        };
        let port_no = desc.port_no;
        if port_no == OFPP_LOCAL {
            sw.name = Some(desc.name.clone());
        }
        sw.ports.insert(port_no, Port::from_desc(&desc));
        self.bump();
        self.apply_gateways(dpid);
    }

    pub fn on_port_delete(&mut self, dpid: u64, port_no: u16) {
        let Some(sw) = self.switches.get_mut(&dpid) else {
            warn!("port-delete for unknown switch dpid={:#x}", dpid);
            return;
        };
        if let Some(port) = sw.ports.remove(&port_no) {
            if let Some((peer_dpid, _)) = port.peer {
                sw.peer_to_local_port.remove(&peer_dpid);
            }
        }
        self.bump();
    }

    /// Apply per-port gateway bindings from `routing.config` once a
    /// switch's name is known (§4.1 on_features/on_port_add).
    fn apply_gateways(&mut self, dpid: u64) {
        let Some(sw) = self.switches.get_mut(&dpid) else {
            return;
        };
        let Some(name) = sw.name.clone() else {
            return;
        };
        for binding in self.routing_config.ports_for(&name) {
            if let Some(port) = sw.ports.get_mut(&binding.port_no) {
                port.gateway = Some(Gateway {
                    gw_ipv4: binding.gw_ipv4,
                    gw_ipv4_network: binding.gw_ipv4_network,
                    gw_ipv6: binding.gw_ipv6,
                    gw_ipv6_network: binding.gw_ipv6_network,
                });
            }
        }
    }

    /// Set peer fields on both ports and both adjacency indexes (§4.1
    /// on_link_add).
    pub fn on_link_add(&mut self, src: (u64, u16), dst: (u64, u16)) {
        let (src_dpid, src_port) = src;
        let (dst_dpid, dst_port) = dst;
        if let Some(sw) = self.switches.get_mut(&src_dpid) {
            if let Some(port) = sw.ports.get_mut(&src_port) {
                port.peer = Some((dst_dpid, dst_port));
            }
            sw.peer_to_local_port.insert(dst_dpid, src_port);
        }
        if let Some(sw) = self.switches.get_mut(&dst_dpid) {
            if let Some(port) = sw.ports.get_mut(&dst_port) {
                port.peer = Some((src_dpid, src_port));
            }
            sw.peer_to_local_port.insert(src_dpid, dst_port);
        }
        self.bump();
    }

    /// Clear peer fields on both ports, tolerant of a missing endpoint
    /// (§4.1 on_link_delete).
    pub fn on_link_delete(&mut self, src: (u64, u16), dst: (u64, u16)) {
        let (src_dpid, src_port) = src;
        let (dst_dpid, dst_port) = dst;
        if let Some(sw) = self.switches.get_mut(&src_dpid) {
            if let Some(port) = sw.ports.get_mut(&src_port) {
                port.peer = None;
            }
            sw.peer_to_local_port.remove(&dst_dpid);
        }
        if let Some(sw) = self.switches.get_mut(&dst_dpid) {
            if let Some(port) = sw.ports.get_mut(&dst_port) {
                port.peer = None;
            }
            sw.peer_to_local_port.remove(&src_dpid);
        }
        self.bump();
    }

    pub fn resolve_switch_by_name(&self, name: &str) -> Option<&Switch> {
        self.switches.values().find(|sw| sw.name.as_deref() == Some(name))
    }

    /// Find the switch/port owning a gateway that covers `ip`. If `ip` is
    /// the gateway address itself, the port is `OFPP_LOCAL` (§4.1).
    pub fn find_gateway_for(&self, ip: IpAddr) -> Option<(u64, u16)> {
        for sw in self.switches.values() {
            for port in sw.ports.values() {
                let Some(gw) = &port.gateway else { continue };
                if gw.is_self(ip) {
                    return Some((sw.dpid, OFPP_LOCAL));
                }
                if gw.covers(ip) {
                    return Some((sw.dpid, port.port_no));
                }
            }
        }
        debug!("no gateway covers {}", ip);
        None
    }
}
