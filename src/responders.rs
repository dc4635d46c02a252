//! Gateway-local L3 responders: ARP, ICMPv4 echo, and ICMPv6 (echo plus
//! Neighbor Discovery) (§4.4). Each responder is a plain function over
//! `TopologyStore` state and the parsed frame; callers (the forwarding
//! engine, the TAP dispatcher) decide what to do with the synthesized
//! reply and whether to drain deferred packets afterward.

use std::net::IpAddr;

use log::debug;
use pnet::util::MacAddr;

use crate::openflow::{Action, PacketOut, SwitchConnection};
use crate::packet::{self, ArpFrame, IpFrame, L4};
use crate::topology::TopologyStore;

/// Seam for "mirror this raw frame to the BGP speaker over TAP" so the
/// responders don't depend on a live TAP device to be exercised in tests
/// (§4.4 ARP "unconditional mirror").
pub trait TapMirror {
    fn mirror(&self, frame: &[u8]);
    /// Mirror with the destination MAC rewritten to the TAP device's own
    /// address, used for BGP-capture and local-speaker traffic (§4.5
    /// steps 3-4) as opposed to the ARP responder's unconditional mirror.
    fn mirror_rewritten(&self, frame: &[u8]);
}

impl TapMirror for crate::tap::TapBridge {
    fn mirror(&self, frame: &[u8]) {
        if let Err(e) = self.write_frame(frame, false) {
            debug!("failed to mirror frame to TAP: {}", e);
        }
    }

    fn mirror_rewritten(&self, frame: &[u8]) {
        if let Err(e) = self.write_frame(frame, true) {
            debug!("failed to mirror frame to TAP: {}", e);
        }
    }
}

/// Outcome of handing a frame to a responder, used by the forwarding
/// engine to decide whether to drain `msg_buffer` for the learned address
/// (§4.4, §4.5 "drain on learn").
pub enum Outcome {
    NotHandled,
    Handled,
    Learned { dpid: u64, ip: IpAddr },
}

/// ARP handler (§4.4 ARP): every ARP frame arriving at a gateway port is
/// unconditionally mirrored to the BGP speaker over TAP, regardless of
/// whether it also triggers a REQUEST/REPLY branch below.
pub fn handle_arp(
    topology: &mut TopologyStore,
    tap: &impl TapMirror,
    dpid: u64,
    in_port: u16,
    arp: &ArpFrame,
    raw_frame: &[u8],
) -> Outcome {
    tap.mirror(raw_frame);

    let Some(sw) = topology.switches.get_mut(&dpid) else {
        return Outcome::NotHandled;
    };
    let Some(port) = sw.ports.get(&in_port) else {
        return Outcome::NotHandled;
    };
    let Some(gw) = &port.gateway else {
        return Outcome::NotHandled;
    };

    if arp.is_reply {
        sw.remember(IpAddr::V4(arp.sender_ip), arp.sender_mac);
        return Outcome::Learned {
            dpid,
            ip: IpAddr::V4(arp.sender_ip),
        };
    }

    if arp.is_request && gw.is_self(IpAddr::V4(arp.target_ip)) {
        let port_hw_addr = port.hw_addr;
        sw.remember(IpAddr::V4(arp.sender_ip), arp.sender_mac);
        let reply = packet::build_arp_reply(port_hw_addr, arp.target_ip, arp.sender_mac, arp.sender_ip);
        let out = PacketOut::synthesized(vec![Action::output(in_port)], reply);
        if let Err(e) = sw.connection.send_packet_out(out) {
            debug!("failed to send ARP reply: {}", e);
        }
        return Outcome::Learned {
            dpid,
            ip: IpAddr::V4(arp.sender_ip),
        };
    }

    Outcome::Handled
}

/// ICMPv4 echo handler (§4.4 E2): replies only when the destination is a
/// gateway's own address.
pub fn handle_icmpv4(
    topology: &mut TopologyStore,
    dpid: u64,
    in_port: u16,
    frame: &IpFrame<std::net::Ipv4Addr>,
) -> Outcome {
    let L4::IcmpEchoRequest { id, seq, ref data } = frame.l4 else {
        return Outcome::NotHandled;
    };
    let Some(sw) = topology.switches.get_mut(&dpid) else {
        return Outcome::NotHandled;
    };
    let Some(port) = sw.ports.get(&in_port) else {
        return Outcome::NotHandled;
    };
    let Some(gw) = &port.gateway else {
        return Outcome::NotHandled;
    };
    if !gw.is_self(IpAddr::V4(frame.dst)) {
        return Outcome::NotHandled;
    }
    let Some(requester_mac) = sw.lookup_mac(IpAddr::V4(frame.src)) else {
        return Outcome::NotHandled;
    };
    let reply =
        packet::build_icmpv4_echo_reply(port.hw_addr, frame.dst, requester_mac, frame.src, id, seq, data);
    let out = PacketOut::synthesized(vec![Action::output(in_port)], reply);
    if let Err(e) = sw.connection.send_packet_out(out) {
        debug!("failed to send ICMPv4 echo reply: {}", e);
    }
    Outcome::Handled
}

/// ICMPv6 handler (§4.4 ICMPv6): echo, Neighbor Solicit/Advert. Unlike the
/// ARP/ICMPv4 responders this does not early-return on a non-match — a
/// frame destined to `local_ipv6` falls through to the forwarding engine
/// rather than being swallowed.
pub fn handle_icmpv6(
    topology: &mut TopologyStore,
    dpid: u64,
    in_port: u16,
    frame: &IpFrame<std::net::Ipv6Addr>,
) -> Outcome {
    let Some(sw) = topology.switches.get_mut(&dpid) else {
        return Outcome::NotHandled;
    };
    let Some(port) = sw.ports.get(&in_port) else {
        return Outcome::NotHandled;
    };
    let Some(gw) = &port.gateway else {
        return Outcome::NotHandled;
    };
    let gw_mac = port.hw_addr;

    match frame.l4 {
        L4::Icmpv6EchoRequest { id, seq, ref data } if gw.is_self(IpAddr::V6(frame.dst)) => {
            let Some(requester_mac) = sw.lookup_mac(IpAddr::V6(frame.src)) else {
                return Outcome::NotHandled;
            };
            let reply = packet::build_icmpv6_echo_reply(
                gw_mac,
                frame.dst,
                requester_mac,
                frame.src,
                id,
                seq,
                data,
            );
            let out = PacketOut::synthesized(vec![Action::output(in_port)], reply);
            if let Err(e) = sw.connection.send_packet_out(out) {
                debug!("failed to send ICMPv6 echo reply: {}", e);
            }
            Outcome::Handled
        }
        L4::NeighborSolicit { target, lladdr } if gw.is_self(IpAddr::V6(target)) => {
            let Some(sender_mac) = lladdr else {
                return Outcome::NotHandled;
            };
            sw.remember(IpAddr::V6(frame.src), sender_mac);
            let advert = packet::build_neighbor_advert(gw_mac, target, sender_mac, frame.src);
            let out = PacketOut::synthesized(vec![Action::output(in_port)], advert);
            if let Err(e) = sw.connection.send_packet_out(out) {
                debug!("failed to send NA: {}", e);
            }
            Outcome::Learned {
                dpid,
                ip: IpAddr::V6(frame.src),
            }
        }
        L4::NeighborAdvert { lladdr: Some(mac), .. } => {
            sw.remember(IpAddr::V6(frame.src), mac);
            Outcome::Learned {
                dpid,
                ip: IpAddr::V6(frame.src),
            }
        }
        _ => Outcome::NotHandled,
    }
}
