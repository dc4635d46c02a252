//! Packet-in classifier and path programming (§4.5). Ties together the
//! topology store, the L3 responders, the routing algorithm, the TAP
//! bridge, and the external resolver into the single terminal-outcome
//! decision tree every packet-in goes through.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::debug;

use crate::config::BgperConfig;
use crate::openflow::{
    rewrite_and_output, Action, FlowMod, Match, PacketIn, PacketOut, OFPP_LOCAL, OFP_NO_BUFFER,
};
use crate::packet::{self, Classified, IpFrame, L4};
use crate::resolver::{ExternalDestinationRequest, Family, ResolverHandle};
use crate::responders::{self, Outcome, TapMirror};
use crate::routing::{self, PathCache};
use crate::topology::TopologyStore;

/// Entry point: classify one packet-in and drive it to exactly one
/// terminal outcome (§3 invariant 4, §8 invariant 3).
pub async fn on_packet_in(
    topology: &mut TopologyStore,
    path_cache: &mut PathCache,
    resolver: &ResolverHandle,
    tap: &impl TapMirror,
    bgper: &BgperConfig,
    pkt: PacketIn,
) {
    let dpid = pkt.dpid;
    let Some((_, src_mac, ethertype, payload)) = packet::parse_ethernet(&pkt.data) else {
        debug!("malformed frame on dpid={:#x}, dropping", dpid);
        drop_packet(topology, dpid, &pkt);
        return;
    };

    match packet::classify(ethertype, payload) {
        Classified::Arp(arp) => {
            let outcome = responders::handle_arp(topology, tap, dpid, pkt.in_port, &arp, &pkt.data);
            if let Outcome::Learned { dpid, ip } = outcome {
                drain_deferred(topology, dpid, ip);
            }
        }
        Classified::Ipv4(frame) => {
            handle_ipv4(topology, path_cache, resolver, tap, bgper, dpid, pkt.in_port, src_mac, &pkt, &frame).await;
        }
        Classified::Ipv6(frame) => {
            handle_ipv6(topology, path_cache, resolver, tap, bgper, dpid, pkt.in_port, src_mac, &pkt, &frame).await;
        }
        Classified::Other => {
            debug!("unclassified ethertype {:#06x} on dpid={:#x}, dropping", ethertype, dpid);
            drop_packet(topology, dpid, &pkt);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_ipv4(
    topology: &mut TopologyStore,
    path_cache: &mut PathCache,
    resolver: &ResolverHandle,
    tap: &impl TapMirror,
    bgper: &BgperConfig,
    dpid: u64,
    in_port: u16,
    src_mac: pnet::util::MacAddr,
    pkt: &PacketIn,
    frame: &IpFrame<Ipv4Addr>,
) {
    if let Some(sw) = topology.switches.get_mut(&dpid) {
        sw.remember(IpAddr::V4(frame.src), src_mac);
    }

    match responders::handle_icmpv4(topology, dpid, in_port, frame) {
        Outcome::Handled => return,
        Outcome::Learned { dpid, ip } => {
            drain_deferred(topology, dpid, ip);
            return;
        }
        Outcome::NotHandled => {}
    }

    if matches!(frame.l4, L4::TcpDstPort(179)) {
        tap.mirror_rewritten(&pkt.data);
    }

    let dst_ip = IpAddr::V4(frame.dst);
    if bgper.is_local_speaker(dst_ip) {
        tap.mirror_rewritten(&pkt.data);
        return;
    }

    let m = Match::ipv4_dst(0x0800, frame.dst);
    route_ip_packet(topology, path_cache, resolver, dpid, dst_ip, Family::V4, m, pkt).await;
}

#[allow(clippy::too_many_arguments)]
async fn handle_ipv6(
    topology: &mut TopologyStore,
    path_cache: &mut PathCache,
    resolver: &ResolverHandle,
    tap: &impl TapMirror,
    bgper: &BgperConfig,
    dpid: u64,
    in_port: u16,
    src_mac: pnet::util::MacAddr,
    pkt: &PacketIn,
    frame: &IpFrame<Ipv6Addr>,
) {
    if let Some(sw) = topology.switches.get_mut(&dpid) {
        sw.remember(IpAddr::V6(frame.src), src_mac);
    }

    match responders::handle_icmpv6(topology, dpid, in_port, frame) {
        Outcome::Handled => return,
        Outcome::Learned { dpid, ip } => {
            drain_deferred(topology, dpid, ip);
            return;
        }
        Outcome::NotHandled => {}
    }

    if matches!(frame.l4, L4::TcpDstPort(179)) {
        tap.mirror_rewritten(&pkt.data);
    }

    let dst_ip = IpAddr::V6(frame.dst);
    if bgper.is_local_speaker(dst_ip) {
        tap.mirror_rewritten(&pkt.data);
        return;
    }

    let m = Match::ipv6_dst(frame.dst);
    route_ip_packet(topology, path_cache, resolver, dpid, dst_ip, Family::V6, m, pkt).await;
}

/// Steps 5-8 of §4.5, shared between the IPv4 and IPv6 branches once the
/// destination IP, its `Match`, and an address family are known.
async fn route_ip_packet(
    topology: &mut TopologyStore,
    path_cache: &mut PathCache,
    resolver: &ResolverHandle,
    ingress_dpid: u64,
    dst_ip: IpAddr,
    family: Family,
    m: Match,
    pkt: &PacketIn,
) {
    let local_match = topology.find_gateway_for(dst_ip);
    let (dst_dpid, outport_no, is_border) = match local_match {
        Some((_, OFPP_LOCAL)) => return,
        Some((d, port)) => (d, port, false),
        None => {
            let reply = resolver
                .resolve(ExternalDestinationRequest { dst_ip, family })
                .await;
            match reply {
                Some(r) if !r.is_unresolvable() => {
                    let Some(d) = resolve_reply_dpid(topology, &r) else {
                        drop_packet(topology, ingress_dpid, pkt);
                        return;
                    };
                    (d, r.outport_no, true)
                }
                _ => {
                    debug!("no route to {}, dropping", dst_ip);
                    drop_packet(topology, ingress_dpid, pkt);
                    return;
                }
            }
        }
    };

    let out = if is_border {
        border_egress(topology, path_cache, ingress_dpid, dst_dpid, outport_no, dst_ip, m, pkt)
    } else if ingress_dpid == dst_dpid {
        last_hop(topology, ingress_dpid, outport_no, dst_ip, m, pkt)
    } else {
        program_path(topology, path_cache, ingress_dpid, dst_dpid, outport_no, dst_ip, m, pkt)
    };

    match out {
        Some(packet_out) => {
            if let Some(sw) = topology.switches.get(&ingress_dpid) {
                let _ = sw.connection.send_packet_out(packet_out);
            }
        }
        None => drop_packet(topology, ingress_dpid, pkt),
    }
}

fn resolve_reply_dpid(topology: &TopologyStore, reply: &crate::resolver::Reply) -> Option<u64> {
    if let Some(dpid) = reply.dpid {
        return Some(dpid);
    }
    let name = reply.switch_name.as_deref()?;
    topology.resolve_switch_by_name(name).map(|sw| sw.dpid)
}

/// Resolve destination MAC via the neighbor cache on `dpid`. If known,
/// install the delivery flow and return the triggering PacketOut's
/// actions; if not, synthesize an ARP request/Neighbor Solicitation and
/// defer the packet (§4.5 "Last-hop").
fn last_hop(
    topology: &mut TopologyStore,
    dpid: u64,
    outport_no: u16,
    dst_ip: IpAddr,
    m: Match,
    pkt: &PacketIn,
) -> Option<PacketOut> {
    let sw = topology.switches.get_mut(&dpid)?;
    if let Some(mac) = sw.lookup_mac(dst_ip) {
        let port = sw.ports.get(&outport_no)?;
        let actions = rewrite_and_output(port.hw_addr, mac, outport_no);
        let flow = FlowMod::modify(m, crate::openflow::FLOW_IDLE_TIMEOUT, crate::openflow::FLOW_HARD_TIMEOUT, actions.clone());
        let _ = sw.connection.send_flow_mod(flow);
        Some(triggering_packet_out(pkt, actions))
    } else {
        let port = sw.ports.get(&outport_no)?;
        if let Some(query) = synthesize_last_hop_query(port, dst_ip) {
            let out = PacketOut::synthesized(vec![Action::output(outport_no)], query);
            let _ = sw.connection.send_packet_out(out);
        }
        sw.defer(crate::topology::DeferredPacket {
            packet_in: pkt.clone(),
            dst_ip,
            outport_no,
        });
        None
    }
}

fn synthesize_last_hop_query(port: &crate::topology::Port, dst_ip: IpAddr) -> Option<Vec<u8>> {
    let gw = port.gateway.as_ref()?;
    match dst_ip {
        IpAddr::V4(target) => {
            let src_ip = gw.gw_ipv4?;
            Some(packet::build_arp_request(port.hw_addr, src_ip, target))
        }
        IpAddr::V6(target) => {
            let src_ip = gw.gw_ipv6?;
            Some(packet::build_neighbor_solicit(port.hw_addr, src_ip, target))
        }
    }
}

fn triggering_packet_out(pkt: &PacketIn, actions: Vec<Action>) -> PacketOut {
    PacketOut {
        buffer_id: pkt.buffer_id,
        in_port: pkt.in_port,
        actions,
        data: if pkt.buffer_id == OFP_NO_BUFFER {
            Some(pkt.data.clone())
        } else {
            None
        },
    }
}

/// Install the per-hop egress flow on each switch along `path` except the
/// last, returning the first hop's actions (used for the triggering
/// PacketOut, §4.5 "Path programming").
fn install_path_edges(topology: &mut TopologyStore, path: &[u64], m: &Match) -> Option<Vec<Action>> {
    let mut first_actions = None;
    for pair in path.windows(2) {
        let (s_i, s_next) = (pair[0], pair[1]);
        let local_port_no = topology
            .switches
            .get(&s_i)?
            .peer_to_local_port
            .get(&s_next)
            .copied()?;
        let local_port = topology.switches.get(&s_i)?.ports.get(&local_port_no)?.clone();
        let (_, peer_port_no) = local_port.peer?;
        let peer_mac = topology.switches.get(&s_next)?.ports.get(&peer_port_no)?.hw_addr;
        let actions = rewrite_and_output(local_port.hw_addr, peer_mac, local_port_no);
        let flow = FlowMod::modify(
            m.clone(),
            crate::openflow::FLOW_IDLE_TIMEOUT,
            crate::openflow::FLOW_HARD_TIMEOUT,
            actions.clone(),
        );
        let _ = topology.switches.get(&s_i)?.connection.send_flow_mod(flow);
        if first_actions.is_none() {
            first_actions = Some(actions);
        }
    }
    first_actions
}

/// If `dpid`'s neighbor cache already has a MAC for `dst_ip`, opportunistically
/// install the final delivery flow now rather than waiting for a later
/// packet-in to retrigger last-hop (§4.5 "Path programming", E3).
fn try_install_final_hop(topology: &mut TopologyStore, dpid: u64, outport_no: u16, dst_ip: IpAddr, m: Match) {
    let Some(sw) = topology.switches.get_mut(&dpid) else {
        return;
    };
    let Some(mac) = sw.lookup_mac(dst_ip) else {
        return;
    };
    let Some(port) = sw.ports.get(&outport_no) else {
        return;
    };
    let actions = rewrite_and_output(port.hw_addr, mac, outport_no);
    let flow = FlowMod::modify(m, crate::openflow::FLOW_IDLE_TIMEOUT, crate::openflow::FLOW_HARD_TIMEOUT, actions);
    let _ = sw.connection.send_flow_mod(flow);
}

#[allow(clippy::too_many_arguments)]
fn program_path(
    topology: &mut TopologyStore,
    path_cache: &mut PathCache,
    ingress_dpid: u64,
    dst_dpid: u64,
    outport_no: u16,
    dst_ip: IpAddr,
    m: Match,
    pkt: &PacketIn,
) -> Option<PacketOut> {
    let path = routing::find_route_cached(topology, path_cache, ingress_dpid, dst_dpid)?;
    let first_actions = install_path_edges(topology, &path, &m)?;
    try_install_final_hop(topology, dst_dpid, outport_no, dst_ip, m);
    Some(triggering_packet_out(pkt, first_actions))
}

/// Destination is outside the local AS; the resolver supplied
/// `(dst_dpid, outport_no)` and the next-hop MAC is assumed already
/// learned via BGP peering traffic (§4.5 "Border egress").
#[allow(clippy::too_many_arguments)]
fn border_egress(
    topology: &mut TopologyStore,
    path_cache: &mut PathCache,
    ingress_dpid: u64,
    dst_dpid: u64,
    outport_no: u16,
    dst_ip: IpAddr,
    m: Match,
    pkt: &PacketIn,
) -> Option<PacketOut> {
    let next_hop_mac = topology.switches.get(&dst_dpid)?.lookup_mac(dst_ip)?;
    let egress_port = topology.switches.get(&dst_dpid)?.ports.get(&outport_no)?.clone();
    let final_actions = rewrite_and_output(egress_port.hw_addr, next_hop_mac, outport_no);
    let flow = FlowMod::modify(
        m.clone(),
        crate::openflow::FLOW_IDLE_TIMEOUT,
        crate::openflow::FLOW_HARD_TIMEOUT,
        final_actions.clone(),
    );
    let _ = topology.switches.get(&dst_dpid)?.connection.send_flow_mod(flow);

    if ingress_dpid == dst_dpid {
        return Some(triggering_packet_out(pkt, final_actions));
    }

    let path = routing::find_route_cached(topology, path_cache, ingress_dpid, dst_dpid)?;
    let first_actions = install_path_edges(topology, &path, &m)?;
    Some(triggering_packet_out(pkt, first_actions))
}

fn drop_packet(topology: &TopologyStore, dpid: u64, pkt: &PacketIn) {
    let Some(sw) = topology.switches.get(&dpid) else {
        return;
    };
    let out = PacketOut::drop(pkt.buffer_id, pkt.in_port);
    let _ = sw.connection.send_packet_out(out);
}

/// Walk `msg_buffer` for `dpid` highest-index-first so a removal never
/// shifts an as-yet-unvisited index (§4.5 "Draining deferred packets").
fn drain_deferred(topology: &mut TopologyStore, dpid: u64, resolved_ip: IpAddr) {
    let Some(sw) = topology.switches.get_mut(&dpid) else {
        return;
    };
    let mut i = sw.msg_buffer.len();
    while i > 0 {
        i -= 1;
        if sw.msg_buffer[i].dst_ip != resolved_ip {
            continue;
        }
        let deferred = sw.msg_buffer.remove(i).expect("index just checked");
        let Some(mac) = sw.lookup_mac(resolved_ip) else {
            continue;
        };
        let Some(port) = sw.ports.get(&deferred.outport_no) else {
            continue;
        };
        let actions = rewrite_and_output(port.hw_addr, mac, deferred.outport_no);
        let m = match resolved_ip {
            IpAddr::V4(v4) => Match::ipv4_dst(0x0800, v4),
            IpAddr::V6(v6) => Match::ipv6_dst(v6),
        };
        let flow = FlowMod::modify(m, crate::openflow::FLOW_IDLE_TIMEOUT, crate::openflow::FLOW_HARD_TIMEOUT, actions.clone());
        let _ = sw.connection.send_flow_mod(flow);
        let out = triggering_packet_out(&deferred.packet_in, actions);
        let _ = sw.connection.send_packet_out(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::error::OpenFlowError;
    use crate::openflow::{FeaturesReply, PortDesc, SwitchConnection};
    use crate::topology::Gateway;
    use pnet::util::MacAddr;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct RecordingConnection {
        flow_mods: Mutex<Vec<FlowMod>>,
        packet_outs: Mutex<Vec<PacketOut>>,
    }
    impl SwitchConnection for RecordingConnection {
        fn dpid(&self) -> u64 {
            0
        }
        fn send_flow_mod(&self, flow_mod: FlowMod) -> Result<(), OpenFlowError> {
            self.flow_mods.lock().unwrap().push(flow_mod);
            Ok(())
        }
        fn send_packet_out(&self, packet_out: PacketOut) -> Result<(), OpenFlowError> {
            self.packet_outs.lock().unwrap().push(packet_out);
            Ok(())
        }
    }

    struct NullMirror;
    impl TapMirror for NullMirror {
        fn mirror(&self, _: &[u8]) {}
        fn mirror_rewritten(&self, _: &[u8]) {}
    }

    fn linear_topology_base() -> (TopologyStore, Vec<Arc<RecordingConnection>>) {
        let mut t = TopologyStore::new(RoutingConfig::default());
        let conns: Vec<_> = (0..3).map(|_| Arc::new(RecordingConnection::default())).collect();
        for (i, dpid) in [1u64, 2, 3].into_iter().enumerate() {
            t.on_switch_enter(*dpid, conns[i].clone());
        }
        t.on_features(FeaturesReply {
            dpid: 1,
            ports: vec![PortDesc {
                port_no: 10,
                name: "s1-eth10".into(),
                hw_addr: MacAddr::new(0, 0, 0, 1, 0, 10),
                curr_features: 0x40,
            }],
        });
        t.on_features(FeaturesReply {
            dpid: 2,
            ports: vec![
                PortDesc {
                    port_no: 20,
                    name: "s2-eth20".into(),
                    hw_addr: MacAddr::new(0, 0, 0, 2, 0, 20),
                    curr_features: 0x40,
                },
                PortDesc {
                    port_no: 21,
                    name: "s2-eth21".into(),
                    hw_addr: MacAddr::new(0, 0, 0, 2, 0, 21),
                    curr_features: 0x40,
                },
            ],
        });
        t.on_features(FeaturesReply {
            dpid: 3,
            ports: vec![PortDesc {
                port_no: 30,
                name: "s3-eth30".into(),
                hw_addr: MacAddr::new(0, 0, 0, 3, 0, 30),
                curr_features: 0x40,
            }],
        });
        t.on_link_add((1, 10), (2, 20));
        t.on_link_add((2, 21), (3, 30));

        let sw3 = t.switches.get_mut(&3).unwrap();
        sw3.ports.get_mut(&30).unwrap().gateway = Some(Gateway {
            gw_ipv4: Some("10.0.3.1".parse().unwrap()),
            gw_ipv4_network: Some("10.0.3.0/24".parse().unwrap()),
            gw_ipv6: None,
            gw_ipv6_network: None,
        });

        (t, conns)
    }

    fn linear_topology_with_host() -> (TopologyStore, Vec<Arc<RecordingConnection>>) {
        let (mut t, conns) = linear_topology_base();
        let host_ip: Ipv4Addr = "10.0.3.5".parse().unwrap();
        t.switches
            .get_mut(&3)
            .unwrap()
            .remember(IpAddr::V4(host_ip), MacAddr::new(0, 0, 0, 9, 9, 9));
        (t, conns)
    }

    fn packet_in(dpid: u64, in_port: u16, data: Vec<u8>) -> PacketIn {
        PacketIn {
            dpid,
            buffer_id: OFP_NO_BUFFER,
            in_port,
            data,
        }
    }

    #[tokio::test]
    async fn test_three_hop_path_installs_three_flows_and_one_packet_out() {
        let (mut t, conns) = linear_topology_with_host();
        let mut path_cache = PathCache::new();
        let (resolver, _inbox) = ResolverHandle::with_default_timeout();
        let bgper = crate::config::BgperConfig {
            local_ipv4: "192.0.2.1".parse().unwrap(),
            local_ipv6: "::1".parse().unwrap(),
            neighbors: vec![],
        };

        let frame = build_ipv4_udp_frame(
            MacAddr::new(0, 0, 0, 1, 1, 1),
            "10.0.1.9".parse().unwrap(),
            "10.0.3.5".parse().unwrap(),
        );
        let pkt = packet_in(1, 99, frame);
        on_packet_in(&mut t, &mut path_cache, &resolver, &NullMirror, &bgper, pkt).await;

        let total_flows: usize = conns.iter().map(|c| c.flow_mods.lock().unwrap().len()).sum();
        assert_eq!(total_flows, 3, "S1->S2, S2->S3 edges plus S3->host delivery");
        assert_eq!(conns[0].packet_outs.lock().unwrap().len(), 1);
    }

    fn build_ipv4_udp_frame(src_mac: MacAddr, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Vec<u8> {
        use pnet::packet::ip::IpNextHeaderProtocols;
        build_ipv4_frame(src_mac, src_ip, dst_ip, IpNextHeaderProtocols::Udp, None)
    }

    fn build_ipv4_frame(
        src_mac: MacAddr,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        proto: pnet::packet::ip::IpNextHeaderProtocol,
        tcp_dst_port: Option<u16>,
    ) -> Vec<u8> {
        use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
        use pnet::packet::ipv4::MutableIpv4Packet;
        use pnet::packet::tcp::MutableTcpPacket;
        use pnet::packet::MutablePacket;

        let tcp_len = if tcp_dst_port.is_some() { 20 } else { 0 };
        let mut buf = vec![0u8; 14 + 20 + tcp_len];
        {
            let mut eth = MutableEthernetPacket::new(&mut buf[0..14]).unwrap();
            eth.set_destination(MacAddr::new(0, 0, 0, 1, 0, 10));
            eth.set_source(src_mac);
            eth.set_ethertype(EtherTypes::Ipv4);
        }
        {
            let mut ip = MutableIpv4Packet::new(&mut buf[14..]).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length((20 + tcp_len) as u16);
            ip.set_ttl(64);
            ip.set_next_level_protocol(proto);
            ip.set_source(src_ip);
            ip.set_destination(dst_ip);
            let checksum = pnet::packet::ipv4::checksum(&ip.to_immutable());
            ip.set_checksum(checksum);
        }
        if let Some(port) = tcp_dst_port {
            let mut tcp = MutableTcpPacket::new(&mut buf[34..]).unwrap();
            tcp.set_destination(port);
            tcp.set_data_offset(5);
        }
        buf
    }

    /// E4 Last-hop ARP miss: packet-in on S3 for a host with no cached MAC
    /// synthesizes an ARP request and defers the packet; a later ARP reply
    /// on that port installs the delivery flow and re-emits the original.
    #[tokio::test]
    async fn test_last_hop_arp_miss_defers_then_drains_on_reply() {
        let (mut t, conns) = linear_topology_base();
        let mut path_cache = PathCache::new();
        let (resolver, _inbox) = ResolverHandle::with_default_timeout();
        let bgper = crate::config::BgperConfig {
            local_ipv4: "192.0.2.1".parse().unwrap(),
            local_ipv6: "::1".parse().unwrap(),
            neighbors: vec![],
        };

        let host_ip: Ipv4Addr = "10.0.3.5".parse().unwrap();
        let frame = build_ipv4_udp_frame(MacAddr::new(0, 0, 0, 1, 1, 1), "10.0.1.9".parse().unwrap(), host_ip);
        let pkt = packet_in(3, 30, frame);
        on_packet_in(&mut t, &mut path_cache, &resolver, &NullMirror, &bgper, pkt).await;

        // No delivery flow yet; an ARP request went out and the packet is
        // parked in S3's msg_buffer.
        assert_eq!(conns[2].flow_mods.lock().unwrap().len(), 0);
        assert_eq!(conns[2].packet_outs.lock().unwrap().len(), 1);
        assert_eq!(t.switches.get(&3).unwrap().msg_buffer.len(), 1);

        let arp = crate::packet::ArpFrame {
            is_request: false,
            is_reply: true,
            sender_mac: MacAddr::new(0, 0, 0, 9, 9, 9),
            sender_ip: host_ip,
            target_mac: MacAddr::new(0, 0, 0, 3, 0, 30),
            target_ip: "10.0.3.1".parse().unwrap(),
        };
        let reply_outcome = responders::handle_arp(&mut t, &NullMirror, 3, 30, &arp, &[0u8; 42]);
        if let Outcome::Learned { dpid, ip } = reply_outcome {
            drain_deferred(&mut t, dpid, ip);
        }

        assert_eq!(conns[2].flow_mods.lock().unwrap().len(), 1);
        assert_eq!(conns[2].packet_outs.lock().unwrap().len(), 2);
        assert!(t.switches.get(&3).unwrap().msg_buffer.is_empty());
    }

    /// E5 BGP capture: a TCP SYN to port 179 is mirrored to the BGP speaker
    /// with the destination MAC rewritten, but routing still proceeds
    /// normally afterward (§4.5 step 3 does not return early) — an
    /// intra-AS destination still gets its three-hop path programmed.
    #[tokio::test]
    async fn test_bgp_port_traffic_is_mirrored_and_still_routed() {
        let (mut t, conns) = linear_topology_with_host();
        let mut path_cache = PathCache::new();
        let (resolver, _inbox) = ResolverHandle::with_default_timeout();
        let bgper = crate::config::BgperConfig {
            local_ipv4: "192.0.2.1".parse().unwrap(),
            local_ipv6: "::1".parse().unwrap(),
            neighbors: vec![],
        };

        #[derive(Default)]
        struct RecordingMirror {
            rewritten: Mutex<Vec<Vec<u8>>>,
        }
        impl TapMirror for RecordingMirror {
            fn mirror(&self, _: &[u8]) {}
            fn mirror_rewritten(&self, frame: &[u8]) {
                self.rewritten.lock().unwrap().push(frame.to_vec());
            }
        }
        let mirror = RecordingMirror::default();

        use pnet::packet::ip::IpNextHeaderProtocols;
        let frame = build_ipv4_frame(
            MacAddr::new(0, 0, 0, 1, 1, 1),
            "10.0.1.9".parse().unwrap(),
            "10.0.3.5".parse().unwrap(),
            IpNextHeaderProtocols::Tcp,
            Some(179),
        );
        let pkt = packet_in(1, 99, frame);
        on_packet_in(&mut t, &mut path_cache, &resolver, &mirror, &bgper, pkt).await;

        assert_eq!(mirror.rewritten.lock().unwrap().len(), 1);
        let total_flows: usize = conns.iter().map(|c| c.flow_mods.lock().unwrap().len()).sum();
        assert_eq!(
            total_flows, 3,
            "BGP-port traffic is mirrored but routing still proceeds: S1->S2, S2->S3, S3->host"
        );
    }
}
