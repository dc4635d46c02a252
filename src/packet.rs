//! Typed packet classification and synthesis built on `pnet`'s packet
//! types: a typed match over parsed layers rather than a dynamic
//! "find layer by name" lookup.

use std::net::{Ipv4Addr, Ipv6Addr};

use pnet::packet::arp::{ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::icmp::{IcmpPacket, IcmpTypes, MutableIcmpPacket};
use pnet::packet::icmpv6::{Icmpv6Packet, Icmpv6Types, MutableIcmpv6Packet};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet::packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use pnet::packet::tcp::TcpPacket;
use pnet::packet::{MutablePacket, Packet};
use pnet::util::MacAddr;

pub const ETHERNET_HEADER_LEN: usize = 14;

fn mac_octets(mac: MacAddr) -> [u8; 6] {
    [mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]
}

/// The outcome of classifying one Ethernet frame's payload, per the
/// protocol-presence order in §4.5 step 1: ARP, then IPv4, then IPv6.
pub enum Classified {
    Arp(ArpFrame),
    Ipv4(IpFrame<Ipv4Addr>),
    Ipv6(IpFrame<Ipv6Addr>),
    Other,
}

pub struct ArpFrame {
    pub is_request: bool,
    pub is_reply: bool,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

pub struct IpFrame<A> {
    pub src: A,
    pub dst: A,
    pub l4: L4,
}

/// Layer 4 payload, reduced to the fields the responders and forwarding
/// engine actually consult.
pub enum L4 {
    IcmpEchoRequest { id: u16, seq: u16, data: Vec<u8> },
    IcmpEchoReply,
    Icmpv6EchoRequest { id: u16, seq: u16, data: Vec<u8> },
    Icmpv6EchoReply,
    NeighborSolicit {
        target: Ipv6Addr,
        lladdr: Option<MacAddr>,
    },
    NeighborAdvert {
        target: Ipv6Addr,
        lladdr: Option<MacAddr>,
    },
    TcpDstPort(u16),
    Other,
}

/// Split a raw Ethernet frame into (dst, src, ethertype, payload).
pub fn parse_ethernet(data: &[u8]) -> Option<(MacAddr, MacAddr, u16, &[u8])> {
    let eth = EthernetPacket::new(data)?;
    if data.len() < ETHERNET_HEADER_LEN {
        return None;
    }
    Some((
        eth.get_destination(),
        eth.get_source(),
        eth.get_ethertype().0,
        &data[ETHERNET_HEADER_LEN..],
    ))
}

pub fn classify(ethertype: u16, payload: &[u8]) -> Classified {
    match ethertype {
        t if t == EtherTypes::Arp.0 => parse_arp(payload)
            .map(Classified::Arp)
            .unwrap_or(Classified::Other),
        t if t == EtherTypes::Ipv4.0 => parse_ipv4(payload)
            .map(Classified::Ipv4)
            .unwrap_or(Classified::Other),
        t if t == EtherTypes::Ipv6.0 => parse_ipv6(payload)
            .map(Classified::Ipv6)
            .unwrap_or(Classified::Other),
        _ => Classified::Other,
    }
}

fn parse_arp(payload: &[u8]) -> Option<ArpFrame> {
    let arp = ArpPacket::new(payload)?;
    Some(ArpFrame {
        is_request: arp.get_operation() == ArpOperations::Request,
        is_reply: arp.get_operation() == ArpOperations::Reply,
        sender_mac: arp.get_sender_hw_addr(),
        sender_ip: arp.get_sender_proto_addr(),
        target_mac: arp.get_target_hw_addr(),
        target_ip: arp.get_target_proto_addr(),
    })
}

fn parse_icmpv4_l4(payload: &[u8]) -> L4 {
    match IcmpPacket::new(payload) {
        Some(icmp) if icmp.get_icmp_type() == IcmpTypes::EchoRequest => {
            let body = icmp.payload();
            if body.len() >= 4 {
                L4::IcmpEchoRequest {
                    id: u16::from_be_bytes([body[0], body[1]]),
                    seq: u16::from_be_bytes([body[2], body[3]]),
                    data: body[4..].to_vec(),
                }
            } else {
                L4::Other
            }
        }
        Some(icmp) if icmp.get_icmp_type() == IcmpTypes::EchoReply => L4::IcmpEchoReply,
        _ => L4::Other,
    }
}

fn parse_ipv4(payload: &[u8]) -> Option<IpFrame<Ipv4Addr>> {
    let ip = Ipv4Packet::new(payload)?;
    let l4 = match ip.get_next_level_protocol() {
        IpNextHeaderProtocols::Icmp => parse_icmpv4_l4(ip.payload()),
        IpNextHeaderProtocols::Tcp => TcpPacket::new(ip.payload())
            .map(|tcp| L4::TcpDstPort(tcp.get_destination()))
            .unwrap_or(L4::Other),
        _ => L4::Other,
    };
    Some(IpFrame {
        src: ip.get_source(),
        dst: ip.get_destination(),
        l4,
    })
}

/// ICMPv6 and NDP payload layout (RFC 4443 / RFC 4861): the first four
/// bytes after type+code+checksum are reserved/flags, followed by the
/// 16-byte target address for NS/NA, or a 2-byte id + 2-byte seq for echo.
fn parse_icmpv6_l4(payload: &[u8]) -> L4 {
    match Icmpv6Packet::new(payload) {
        Some(icmp) if icmp.get_icmpv6_type() == Icmpv6Types::EchoRequest => {
            let body = icmp.payload();
            if body.len() >= 4 {
                L4::Icmpv6EchoRequest {
                    id: u16::from_be_bytes([body[0], body[1]]),
                    seq: u16::from_be_bytes([body[2], body[3]]),
                    data: body[4..].to_vec(),
                }
            } else {
                L4::Other
            }
        }
        Some(icmp) if icmp.get_icmpv6_type() == Icmpv6Types::EchoReply => L4::Icmpv6EchoReply,
        Some(icmp) if icmp.get_icmpv6_type() == Icmpv6Types::NeighborSolicit => {
            let body = icmp.payload();
            target_from_ndp_body(body)
                .map(|target| L4::NeighborSolicit {
                    target,
                    lladdr: lladdr_option_from_ndp_body(body),
                })
                .unwrap_or(L4::Other)
        }
        Some(icmp) if icmp.get_icmpv6_type() == Icmpv6Types::NeighborAdvert => {
            let body = icmp.payload();
            target_from_ndp_body(body)
                .map(|target| L4::NeighborAdvert {
                    target,
                    lladdr: lladdr_option_from_ndp_body(body),
                })
                .unwrap_or(L4::Other)
        }
        _ => L4::Other,
    }
}

fn target_from_ndp_body(body: &[u8]) -> Option<Ipv6Addr> {
    if body.len() < 20 {
        return None;
    }
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&body[4..20]);
    Some(Ipv6Addr::from(octets))
}

/// Decode the Source/Target Link-Layer Address option that follows the
/// 16-byte target field in an NS/NA body, if present (RFC 4861 §4.3/§4.4:
/// option type 1 or 2, length 1 unit of 8 bytes, 6 bytes of MAC).
fn lladdr_option_from_ndp_body(body: &[u8]) -> Option<MacAddr> {
    let opt = body.get(20..28)?;
    if (opt[0] == 1 || opt[0] == 2) && opt[1] == 1 {
        Some(MacAddr::new(opt[2], opt[3], opt[4], opt[5], opt[6], opt[7]))
    } else {
        None
    }
}

fn parse_ipv6(payload: &[u8]) -> Option<IpFrame<Ipv6Addr>> {
    let ip = Ipv6Packet::new(payload)?;
    let l4 = match ip.get_next_header() {
        IpNextHeaderProtocols::Icmpv6 => parse_icmpv6_l4(ip.payload()),
        IpNextHeaderProtocols::Tcp => TcpPacket::new(ip.payload())
            .map(|tcp| L4::TcpDstPort(tcp.get_destination()))
            .unwrap_or(L4::Other),
        _ => L4::Other,
    };
    Some(IpFrame {
        src: ip.get_source(),
        dst: ip.get_destination(),
        l4,
    })
}

/// Derive the IPv6 solicited-node multicast address and its corresponding
/// `33:33:ff:xx:xx:xx` multicast MAC for `target`, built from scratch from
/// the low 24 bits rather than by mutating an unpacked tuple (§9).
pub fn solicited_node_multicast(target: Ipv6Addr) -> (Ipv6Addr, MacAddr) {
    let octets = target.octets();
    let low24 = &octets[13..16];
    let mut mcast = [0u8; 16];
    mcast[0] = 0xff;
    mcast[1] = 0x02;
    mcast[11] = 0x01;
    mcast[12] = 0xff;
    mcast[13] = low24[0];
    mcast[14] = low24[1];
    mcast[15] = low24[2];
    let mac = MacAddr::new(0x33, 0x33, 0xff, low24[0], low24[1], low24[2]);
    (Ipv6Addr::from(mcast), mac)
}

/// Rewrite the destination MAC (first 6 bytes) of a raw Ethernet frame in
/// place, as `write_to_tap` does when `rewrite_dst_mac` is set (§4.3).
pub fn rewrite_dst_mac(frame: &mut [u8], mac: MacAddr) {
    if frame.len() < 6 {
        return;
    }
    frame[0..6].copy_from_slice(&mac_octets(mac));
}

/// Build an ARP reply frame: gateway responds to a REQUEST for its own IP
/// using the ingress port's hardware address (§4.4 E1).
pub fn build_arp_reply(
    gw_mac: MacAddr,
    gw_ip: Ipv4Addr,
    requester_mac: MacAddr,
    requester_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + 28];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf[0..ETHERNET_HEADER_LEN]).unwrap();
        eth.set_destination(requester_mac);
        eth.set_source(gw_mac);
        eth.set_ethertype(EtherTypes::Arp);
    }
    {
        let mut arp = MutableArpPacket::new(&mut buf[ETHERNET_HEADER_LEN..]).unwrap();
        arp.set_hardware_type(pnet::packet::arp::ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Reply);
        arp.set_sender_hw_addr(gw_mac);
        arp.set_sender_proto_addr(gw_ip);
        arp.set_target_hw_addr(requester_mac);
        arp.set_target_proto_addr(requester_ip);
    }
    buf
}

/// Build an ARP request frame for `target_ip`, emitted out the egress port
/// when the last-hop neighbor cache misses (§4.5 "Last-hop").
pub fn build_arp_request(src_mac: MacAddr, src_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + 28];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf[0..ETHERNET_HEADER_LEN]).unwrap();
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(src_mac);
        eth.set_ethertype(EtherTypes::Arp);
    }
    {
        let mut arp = MutableArpPacket::new(&mut buf[ETHERNET_HEADER_LEN..]).unwrap();
        arp.set_hardware_type(pnet::packet::arp::ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(src_mac);
        arp.set_sender_proto_addr(src_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target_ip);
    }
    buf
}

/// Build an ICMPv4 echo reply mirroring id/seq/data from the request
/// (§4.4 E2).
pub fn build_icmpv4_echo_reply(
    gw_mac: MacAddr,
    gw_ip: Ipv4Addr,
    requester_mac: MacAddr,
    requester_ip: Ipv4Addr,
    id: u16,
    seq: u16,
    data: &[u8],
) -> Vec<u8> {
    let icmp_len = 8 + data.len();
    let ip_len = 20 + icmp_len;
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ip_len];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf[0..ETHERNET_HEADER_LEN]).unwrap();
        eth.set_destination(requester_mac);
        eth.set_source(gw_mac);
        eth.set_ethertype(EtherTypes::Ipv4);
    }
    {
        let mut ip = MutableIpv4Packet::new(&mut buf[ETHERNET_HEADER_LEN..]).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(ip_len as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
        ip.set_source(gw_ip);
        ip.set_destination(requester_ip);
        let checksum = pnet::packet::ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }
    {
        let mut icmp =
            MutableIcmpPacket::new(&mut buf[ETHERNET_HEADER_LEN + 20..]).unwrap();
        icmp.set_icmp_type(IcmpTypes::EchoReply);
        icmp.set_icmp_code(pnet::packet::icmp::IcmpCode(0));
        let body = icmp.payload_mut();
        body[0..2].copy_from_slice(&id.to_be_bytes());
        body[2..4].copy_from_slice(&seq.to_be_bytes());
        body[4..].copy_from_slice(data);
        let checksum = pnet::packet::icmp::checksum(&icmp.to_immutable());
        icmp.set_checksum(checksum);
    }
    buf
}

/// Build an ICMPv6 echo reply mirroring id/seq/data (§4.4 ICMPv6).
pub fn build_icmpv6_echo_reply(
    gw_mac: MacAddr,
    gw_ip: Ipv6Addr,
    requester_mac: MacAddr,
    requester_ip: Ipv6Addr,
    id: u16,
    seq: u16,
    data: &[u8],
) -> Vec<u8> {
    let icmp_len = 8 + data.len();
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + 40 + icmp_len];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf[0..ETHERNET_HEADER_LEN]).unwrap();
        eth.set_destination(requester_mac);
        eth.set_source(gw_mac);
        eth.set_ethertype(EtherTypes::Ipv6);
    }
    {
        let mut ip = MutableIpv6Packet::new(&mut buf[ETHERNET_HEADER_LEN..]).unwrap();
        ip.set_version(6);
        ip.set_payload_length(icmp_len as u16);
        ip.set_next_header(IpNextHeaderProtocols::Icmpv6);
        ip.set_hop_limit(255);
        ip.set_source(gw_ip);
        ip.set_destination(requester_ip);
    }
    {
        let mut icmp =
            MutableIcmpv6Packet::new(&mut buf[ETHERNET_HEADER_LEN + 40..]).unwrap();
        icmp.set_icmpv6_type(Icmpv6Types::EchoReply);
        icmp.set_icmpv6_code(pnet::packet::icmpv6::Icmpv6Code(0));
        let body = icmp.payload_mut();
        body[0..2].copy_from_slice(&id.to_be_bytes());
        body[2..4].copy_from_slice(&seq.to_be_bytes());
        body[4..].copy_from_slice(data);
        let checksum = pnet::packet::icmpv6::checksum(&icmp.to_immutable(), &gw_ip, &requester_ip);
        icmp.set_checksum(checksum);
    }
    buf
}

/// Build an ND Neighbor Advertisement with flags `R|S|O = 0b111`, i.e. the
/// top three bits of the reserved/flags word (§4.4 ICMPv6).
pub fn build_neighbor_advert(
    gw_mac: MacAddr,
    gw_ip: Ipv6Addr,
    requester_mac: MacAddr,
    requester_ip: Ipv6Addr,
) -> Vec<u8> {
    let icmp_len = 8 + 16 + 8; // type/code/checksum/flags + target + SLLA option
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + 40 + icmp_len];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf[0..ETHERNET_HEADER_LEN]).unwrap();
        eth.set_destination(requester_mac);
        eth.set_source(gw_mac);
        eth.set_ethertype(EtherTypes::Ipv6);
    }
    {
        let mut ip = MutableIpv6Packet::new(&mut buf[ETHERNET_HEADER_LEN..]).unwrap();
        ip.set_version(6);
        ip.set_payload_length(icmp_len as u16);
        ip.set_next_header(IpNextHeaderProtocols::Icmpv6);
        ip.set_hop_limit(255);
        ip.set_source(gw_ip);
        ip.set_destination(requester_ip);
    }
    {
        let mut icmp =
            MutableIcmpv6Packet::new(&mut buf[ETHERNET_HEADER_LEN + 40..]).unwrap();
        icmp.set_icmpv6_type(Icmpv6Types::NeighborAdvert);
        icmp.set_icmpv6_code(pnet::packet::icmpv6::Icmpv6Code(0));
        let body = icmp.payload_mut();
        body[0] = 0b1110_0000; // R|S|O
        body[4..20].copy_from_slice(&gw_ip.octets());
        body[20] = 2; // Target Link-Layer Address option type
        body[21] = 1; // length in units of 8 bytes
        body[22..28].copy_from_slice(&mac_octets(gw_mac));
        let checksum = pnet::packet::icmpv6::checksum(&icmp.to_immutable(), &gw_ip, &requester_ip);
        icmp.set_checksum(checksum);
    }
    buf
}

/// Build an ND Neighbor Solicitation out the egress port for `target`,
/// addressed to the solicited-node multicast derived from it (§4.5
/// "Last-hop").
pub fn build_neighbor_solicit(src_mac: MacAddr, src_ip: Ipv6Addr, target: Ipv6Addr) -> Vec<u8> {
    let (mcast_addr, mcast_mac) = solicited_node_multicast(target);
    let icmp_len = 8 + 16 + 8;
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + 40 + icmp_len];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf[0..ETHERNET_HEADER_LEN]).unwrap();
        eth.set_destination(mcast_mac);
        eth.set_source(src_mac);
        eth.set_ethertype(EtherTypes::Ipv6);
    }
    {
        let mut ip = MutableIpv6Packet::new(&mut buf[ETHERNET_HEADER_LEN..]).unwrap();
        ip.set_version(6);
        ip.set_payload_length(icmp_len as u16);
        ip.set_next_header(IpNextHeaderProtocols::Icmpv6);
        ip.set_hop_limit(255);
        ip.set_source(src_ip);
        ip.set_destination(mcast_addr);
    }
    {
        let mut icmp =
            MutableIcmpv6Packet::new(&mut buf[ETHERNET_HEADER_LEN + 40..]).unwrap();
        icmp.set_icmpv6_type(Icmpv6Types::NeighborSolicit);
        icmp.set_icmpv6_code(pnet::packet::icmpv6::Icmpv6Code(0));
        let body = icmp.payload_mut();
        body[4..20].copy_from_slice(&target.octets());
        body[20] = 1; // Source Link-Layer Address option type
        body[21] = 1;
        body[22..28].copy_from_slice(&mac_octets(src_mac));
        let checksum = pnet::packet::icmpv6::checksum(&icmp.to_immutable(), &src_ip, &mcast_addr);
        icmp.set_checksum(checksum);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solicited_node_multicast() {
        let target: Ipv6Addr = "fd00::bb:cc".parse().unwrap();
        let (mcast, mac) = solicited_node_multicast(target);
        assert_eq!(mcast, "ff02::1:ffbb:cc".parse::<Ipv6Addr>().unwrap());
        assert_eq!(mac, MacAddr::new(0x33, 0x33, 0xff, 0xbb, 0x00, 0xcc));
    }

    #[test]
    fn test_arp_reply_roundtrip() {
        let gw_mac = MacAddr::new(0xaa, 0xbb, 0xcc, 0, 0, 1);
        let gw_ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let requester_mac = MacAddr::new(0, 0, 0, 0, 0, 2);
        let requester_ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let frame = build_arp_reply(gw_mac, gw_ip, requester_mac, requester_ip);
        let (dst, src, ethertype, payload) = parse_ethernet(&frame).unwrap();
        assert_eq!(dst, requester_mac);
        assert_eq!(src, gw_mac);
        assert_eq!(ethertype, EtherTypes::Arp.0);
        match classify(ethertype, payload) {
            Classified::Arp(arp) => {
                assert!(arp.is_reply);
                assert_eq!(arp.sender_ip, gw_ip);
                assert_eq!(arp.target_ip, requester_ip);
            }
            _ => panic!("expected ARP"),
        }
    }

    #[test]
    fn test_icmpv4_echo_reply_roundtrip() {
        let gw_mac = MacAddr::new(0xaa, 0xbb, 0xcc, 0, 0, 1);
        let gw_ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let requester_mac = MacAddr::new(0, 0, 0, 0, 0, 2);
        let requester_ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let frame =
            build_icmpv4_echo_reply(gw_mac, gw_ip, requester_mac, requester_ip, 7, 1, b"payload");
        let (_, _, ethertype, payload) = parse_ethernet(&frame).unwrap();
        match classify(ethertype, payload) {
            Classified::Ipv4(ip) => {
                assert_eq!(ip.src, gw_ip);
                assert_eq!(ip.dst, requester_ip);
                match ip.l4 {
                    L4::IcmpEchoReply => {}
                    _ => panic!("expected echo reply"),
                }
            }
            _ => panic!("expected IPv4"),
        }
    }
}
