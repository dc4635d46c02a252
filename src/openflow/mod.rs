//! OpenFlow 1.0 message shapes used at the boundary between this crate and
//! a switch connection. The wire codec and the TCP connection lifecycle are
//! external collaborators (§6); this module only defines the typed values
//! that cross that boundary, plus the [`SwitchConnection`] trait a
//! connection implementation must satisfy.

use pnet::util::MacAddr;

use crate::error::OpenFlowError;

/// Sentinel meaning "no buffer_id", used when a synthesized frame carries
/// its own bytes rather than referencing one buffered on the switch.
pub const OFP_NO_BUFFER: u32 = 0xffff_ffff;

/// Port number sentinels from the OpenFlow 1.0 spec.
pub const OFPP_LOCAL: u16 = 0xfffe;
pub const OFPP_CONTROLLER: u16 = 0xfffd;
pub const OFPP_NONE: u16 = 0xffff;

/// Default link cost for a port whose advertised `curr` features carry no
/// recognizable speed bits (§3 Port).
pub const DEFAULT_PORT_COST: u32 = 100;

pub const FLOW_IDLE_TIMEOUT: u16 = 60;
pub const FLOW_HARD_TIMEOUT: u16 = 600;
pub const CAPTURE_FLOW_TIMEOUT: u16 = 0;

/// Ethernet types this crate classifies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherFamily {
    Arp,
    Ipv4,
    Ipv6,
    Other(u16),
}

/// A subset of an `ofp_match`: base (IPv4-capable) match fields plus an
/// `is_nicira` flag for the NXT extended match used to key on an IPv6
/// destination (§4.5 "IPv6 uses the Nicira extended match").
#[derive(Debug, Clone, Default)]
pub struct Match {
    pub in_port: Option<u16>,
    pub dl_type: Option<u16>,
    pub nw_dst_v4: Option<std::net::Ipv4Addr>,
    pub nw_proto: Option<u8>,
    pub tp_dst: Option<u16>,
    pub ipv6_dst: Option<std::net::Ipv6Addr>,
}

impl Match {
    pub fn is_nicira(&self) -> bool {
        self.ipv6_dst.is_some()
    }

    pub fn ipv4_dst(dl_type: u16, dst: std::net::Ipv4Addr) -> Self {
        Match {
            dl_type: Some(dl_type),
            nw_dst_v4: Some(dst),
            ..Default::default()
        }
    }

    pub fn ipv6_dst(dst: std::net::Ipv6Addr) -> Self {
        Match {
            dl_type: Some(0x86dd),
            ipv6_dst: Some(dst),
            ..Default::default()
        }
    }

    pub fn tcp_dst_port(dl_type: u16, nw_proto: u8, tp_dst: u16) -> Self {
        Match {
            dl_type: Some(dl_type),
            nw_proto: Some(nw_proto),
            tp_dst: Some(tp_dst),
            ..Default::default()
        }
    }
}

/// Action list entries. Order matters: §6 requires SetDlSrc, SetDlDst,
/// Output in that order whenever a flow rewrites MAC addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SetDlSrc(MacAddr),
    SetDlDst(MacAddr),
    Output { port: u16, max_len: u16 },
}

impl Action {
    pub fn output(port: u16) -> Self {
        Action::Output { port, max_len: 0 }
    }

    pub fn output_to_controller(max_len: u16) -> Self {
        Action::Output {
            port: OFPP_CONTROLLER,
            max_len,
        }
    }
}

/// Build the canonical rewrite-and-forward action list in the order
/// required by §6.
pub fn rewrite_and_output(src_mac: MacAddr, dst_mac: MacAddr, out_port: u16) -> Vec<Action> {
    vec![
        Action::SetDlSrc(src_mac),
        Action::SetDlDst(dst_mac),
        Action::output(out_port),
    ]
}

/// Only `OFPFC_MODIFY` is ever issued: every flow this crate installs
/// (path, last-hop, border, BGP capture) is keyed by an exact match that
/// either doesn't exist yet (acting as an add) or is being refreshed, so
/// `OFPFC_ADD`/`OFPFC_DELETE` have no caller and aren't modeled here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowModCommand {
    Modify,
}

#[derive(Debug, Clone)]
pub struct FlowMod {
    pub command: FlowModCommand,
    pub m: Match,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub priority: u16,
    pub buffer_id: u32,
    pub actions: Vec<Action>,
}

impl FlowMod {
    pub fn modify(m: Match, idle_timeout: u16, hard_timeout: u16, actions: Vec<Action>) -> Self {
        FlowMod {
            command: FlowModCommand::Modify,
            m,
            idle_timeout,
            hard_timeout,
            priority: 0,
            buffer_id: OFP_NO_BUFFER,
            actions,
        }
    }

    /// A permanent BGP-capture flow installed once per switch-enter (§4.7).
    pub fn bgp_capture(dl_type: u16, nw_proto: u8) -> Self {
        FlowMod::modify(
            Match::tcp_dst_port(dl_type, nw_proto, 179),
            CAPTURE_FLOW_TIMEOUT,
            CAPTURE_FLOW_TIMEOUT,
            vec![Action::output_to_controller(65535)],
        )
    }
}

#[derive(Debug, Clone)]
pub struct PacketOut {
    pub buffer_id: u32,
    pub in_port: u16,
    pub actions: Vec<Action>,
    /// Raw frame bytes, required when `buffer_id == OFP_NO_BUFFER`.
    pub data: Option<Vec<u8>>,
}

impl PacketOut {
    /// A synthesized frame emitted back out `in_port` (ARP/ND/ICMP
    /// responders always use `in_port = OFPP_NONE` per §4.4).
    pub fn synthesized(actions: Vec<Action>, data: Vec<u8>) -> Self {
        PacketOut {
            buffer_id: OFP_NO_BUFFER,
            in_port: OFPP_NONE,
            actions,
            data: Some(data),
        }
    }

    /// A drop: the original buffered packet, no actions, no flow.
    pub fn drop(buffer_id: u32, in_port: u16) -> Self {
        PacketOut {
            buffer_id,
            in_port,
            actions: Vec::new(),
            data: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PacketIn {
    pub dpid: u64,
    pub buffer_id: u32,
    pub in_port: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PortDesc {
    pub port_no: u16,
    pub name: String,
    pub hw_addr: MacAddr,
    /// Raw `curr` feature bitmap; bits 0-6 are the speed bits used to
    /// derive link cost (§3 Port: `cost = 64 / (features & 0x7f)`).
    pub curr_features: u32,
}

#[derive(Debug, Clone)]
pub struct FeaturesReply {
    pub dpid: u64,
    pub ports: Vec<PortDesc>,
}

/// The live connection to one switch. The connection lifecycle (dial,
/// handshake, reconnection) is out of scope (§1); this trait is the seam a
/// real OpenFlow client implements, and tests provide a recording fake.
pub trait SwitchConnection: std::fmt::Debug {
    fn dpid(&self) -> u64;
    fn send_flow_mod(&self, flow_mod: FlowMod) -> Result<(), OpenFlowError>;
    fn send_packet_out(&self, packet_out: PacketOut) -> Result<(), OpenFlowError>;
}

/// Derive link cost for a port from its advertised current features, per
/// §3: `cost = 64 / (features & 0x7f)`, falling back to a default when the
/// low 7 bits are zero (unknown/unspecified speed).
pub fn cost_from_features(curr_features: u32) -> u32 {
    let speed_bits = curr_features & 0x7f;
    if speed_bits == 0 {
        DEFAULT_PORT_COST
    } else {
        64 / speed_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_from_features() {
        assert_eq!(cost_from_features(0x01), 64);
        assert_eq!(cost_from_features(0x40), 1);
        assert_eq!(cost_from_features(0), DEFAULT_PORT_COST);
    }

    #[test]
    fn test_rewrite_action_order() {
        let src = MacAddr::new(1, 1, 1, 1, 1, 1);
        let dst = MacAddr::new(2, 2, 2, 2, 2, 2);
        let actions = rewrite_and_output(src, dst, 3);
        assert_eq!(
            actions,
            vec![
                Action::SetDlSrc(src),
                Action::SetDlDst(dst),
                Action::output(3),
            ]
        );
    }

    /// Invariant 7: path/last-hop/border flows carry idle=60/hard=600;
    /// BGP capture flows are permanent (both zero).
    #[test]
    fn test_flow_mod_timeouts() {
        let m = Match::ipv4_dst(0x0800, "10.0.0.1".parse().unwrap());
        let flow = FlowMod::modify(m, FLOW_IDLE_TIMEOUT, FLOW_HARD_TIMEOUT, vec![]);
        assert_eq!(flow.idle_timeout, 60);
        assert_eq!(flow.hard_timeout, 600);

        let capture = FlowMod::bgp_capture(0x0800, 6);
        assert_eq!(capture.idle_timeout, 0);
        assert_eq!(capture.hard_timeout, 0);
    }
}
