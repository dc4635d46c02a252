//! Full-duplex bridge between the kernel TAP interface and the cooperative
//! event loop (§4.3).
//!
//! A blocking-read OS thread pushes frames into a shared bounded deque and
//! wakes the dispatcher with a [`tokio::sync::Notify`], preserving a
//! bounded-FIFO, drop-oldest back-pressure contract (§5) that a plain
//! `mpsc` channel can't: a full `mpsc` blocks the reader thread instead of
//! dropping the oldest frame.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::IpAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use pnet::util::MacAddr;
use tokio::sync::Notify;

use crate::config::BgperConfig;
use crate::error::TapError;
use crate::openflow::{Action, PacketOut};
use crate::packet;
use crate::topology::TopologyStore;

/// Bound on the shared deque between the blocking reader thread and the
/// cooperative dispatcher; this is the "bounded FIFO" of §4.3, distinct
/// from the per-switch `msg_buffer` in §3.
const TAP_FIFO_CAPACITY: usize = 256;

const IFF_TAP: libc_short = 0x0002;
const IFF_NO_PI: libc_short = 0x1000;
const TUNSETIFF: nix::libc::Ioctl = 0x400454ca_u32 as nix::libc::Ioctl;

type libc_short = nix::libc::c_short;

#[repr(C)]
struct IfReq {
    ifr_name: [nix::libc::c_char; nix::libc::IFNAMSIZ],
    ifr_flags: libc_short,
    _padding: [u8; 22],
}

fn set_ifr_name(ifr: &mut IfReq, name: &str) {
    for (i, byte) in name.bytes().enumerate() {
        if i >= nix::libc::IFNAMSIZ - 1 {
            break;
        }
        ifr.ifr_name[i] = byte as nix::libc::c_char;
    }
}

/// Open `/dev/net/tun` as a TAP device named `name`, returning the open
/// file plus the device's own MAC address, queried once at startup (§6).
pub fn open_tap_device(name: &str) -> Result<(File, MacAddr), TapError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .map_err(TapError::Open)?;

    let mut ifr = IfReq {
        ifr_name: [0; nix::libc::IFNAMSIZ],
        ifr_flags: IFF_TAP | IFF_NO_PI,
        _padding: [0; 22],
    };
    set_ifr_name(&mut ifr, name);

    let result = unsafe { nix::libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) };
    if result < 0 {
        return Err(TapError::Ioctl(
            "TUNSETIFF".to_string(),
            std::io::Error::last_os_error(),
        ));
    }

    let mac = query_hw_addr(name)?;
    Ok((file, mac))
}

const SIOCGIFHWADDR: nix::libc::Ioctl = 0x8927_u32 as nix::libc::Ioctl;

#[repr(C)]
struct IfReqHwAddr {
    ifr_name: [nix::libc::c_char; nix::libc::IFNAMSIZ],
    ifr_hwaddr_family: nix::libc::c_short,
    ifr_hwaddr_data: [u8; 14],
}

fn query_hw_addr(name: &str) -> Result<MacAddr, TapError> {
    let sock = unsafe { nix::libc::socket(nix::libc::AF_INET, nix::libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(TapError::Ioctl(
            "socket".to_string(),
            std::io::Error::last_os_error(),
        ));
    }
    let mut ifr = IfReqHwAddr {
        ifr_name: [0; nix::libc::IFNAMSIZ],
        ifr_hwaddr_family: 0,
        ifr_hwaddr_data: [0; 14],
    };
    for (i, byte) in name.bytes().enumerate() {
        if i >= nix::libc::IFNAMSIZ - 1 {
            break;
        }
        ifr.ifr_name[i] = byte as nix::libc::c_char;
    }
    let result = unsafe { nix::libc::ioctl(sock, SIOCGIFHWADDR, &mut ifr) };
    unsafe { nix::libc::close(sock) };
    if result < 0 {
        return Err(TapError::Ioctl(
            "SIOCGIFHWADDR".to_string(),
            std::io::Error::last_os_error(),
        ));
    }
    let d = ifr.ifr_hwaddr_data;
    Ok(MacAddr::new(d[0], d[1], d[2], d[3], d[4], d[5]))
}

struct SharedFifo {
    queue: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl SharedFifo {
    fn new() -> Self {
        SharedFifo {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, frame: Vec<u8>) {
        let mut q = self.queue.lock().unwrap();
        if q.len() >= TAP_FIFO_CAPACITY {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(frame);
        drop(q);
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<Vec<u8>> {
        let mut q = self.queue.lock().unwrap();
        q.drain(..).collect()
    }
}

/// Spawns the dedicated blocking-read OS thread (the only native thread
/// besides the event loop, §5) and owns the write side used by the
/// cooperative writer.
pub struct TapBridge {
    write_file: Mutex<File>,
    pub mac: MacAddr,
    fifo: Arc<SharedFifo>,
    reader_handle: Option<std::thread::JoinHandle<()>>,
}

impl TapBridge {
    pub fn start(name: &str) -> Result<Self, TapError> {
        let (file, mac) = open_tap_device(name)?;
        let read_file = file.try_clone().map_err(TapError::Open)?;
        let fifo = Arc::new(SharedFifo::new());
        let reader_fifo = fifo.clone();
        let reader_handle = std::thread::spawn(move || read_loop(read_file, reader_fifo));
        Ok(TapBridge {
            write_file: Mutex::new(file),
            mac,
            fifo,
            reader_handle: Some(reader_handle),
        })
    }

    /// Blocks the cooperative task until at least one frame has arrived,
    /// then drains the FIFO fully (§4.3 "dispatcher drains the FIFO fully
    /// per wakeup").
    pub async fn recv_frames(&self) -> Vec<Vec<u8>> {
        loop {
            let notified = self.fifo.notify.notified();
            let drained = self.fifo.drain();
            if !drained.is_empty() {
                return drained;
            }
            notified.await;
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.fifo.dropped.load(Ordering::Relaxed)
    }

    /// Write a frame to TAP, optionally rewriting the destination MAC so
    /// the host stack accepts it (§4.3 Writer).
    pub fn write_frame(&self, frame: &[u8], rewrite_dst_mac: bool) -> Result<(), TapError> {
        let mut owned;
        let out = if rewrite_dst_mac {
            owned = frame.to_vec();
            packet::rewrite_dst_mac(&mut owned, self.mac);
            &owned[..]
        } else {
            frame
        };
        let mut f = self.write_file.lock().unwrap();
        f.write_all(out).map_err(TapError::Write)
    }
}

impl Drop for TapBridge {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_handle.take() {
            // The reader thread is blocked in a kernel read(); there is no
            // portable way to interrupt it short of closing the fd, which
            // happens when `write_file`/the cloned read fd are dropped.
            // We don't join here to avoid hanging process shutdown on a
            // thread that may be blocked indefinitely.
            drop(handle);
        }
    }
}

fn read_loop(mut file: File, fifo: Arc<SharedFifo>) {
    let mut buf = vec![0u8; 65536];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => fifo.push(buf[..n].to_vec()),
            Err(e) => {
                warn!("TAP read failed: {}", e);
                break;
            }
        }
    }
}

/// Cache of `(border_switch_dpid, outport_no)` keyed by destination IP, as
/// a micro-optimization over re-matching `bgper_config` on every frame.
/// Cleared on switch-leave and on a topology-version change for the
/// cached border switch (§4.3).
#[derive(Default)]
pub struct DispatchCache {
    entries: std::collections::HashMap<IpAddr, (u64, u16, u64)>,
}

impl DispatchCache {
    pub fn get(&self, ip: IpAddr, current_version: u64) -> Option<(u64, u16)> {
        self.entries.get(&ip).and_then(|(dpid, port, version)| {
            if *version == current_version {
                Some((*dpid, *port))
            } else {
                None
            }
        })
    }

    pub fn insert(&mut self, ip: IpAddr, dpid: u64, port: u16, version: u64) {
        self.entries.insert(ip, (dpid, port, version));
    }

    pub fn clear_for_switch(&mut self, dpid: u64) {
        self.entries.retain(|_, (d, _, _)| *d != dpid);
    }
}

/// Dispatch one frame read from TAP back into the network: identify the
/// destination, match it against `bgper_config.neighbor[*]`, and emit a
/// PacketOut on the matching border switch (§4.3).
pub fn dispatch_frame(
    topology: &TopologyStore,
    bgper: &BgperConfig,
    cache: &mut DispatchCache,
    frame: &[u8],
) {
    let Some((_, _, ethertype, payload)) = packet::parse_ethernet(frame) else {
        debug!("TAP frame too short to parse, dropping");
        return;
    };
    let dst_ip: Option<IpAddr> = match packet::classify(ethertype, payload) {
        packet::Classified::Ipv4(f) => Some(f.dst.into()),
        packet::Classified::Ipv6(f) => Some(f.dst.into()),
        _ => None,
    };
    let Some(dst_ip) = dst_ip else {
        debug!("TAP frame is neither IPv4 nor IPv6, dropping");
        return;
    };

    let (dpid, outport_no) = match cache.get(dst_ip, topology.version) {
        Some(hit) => hit,
        None => {
            let Some(neighbor) = bgper.neighbor_for(dst_ip) else {
                debug!("no BGP neighbor matches {}, dropping TAP frame", dst_ip);
                return;
            };
            let Some(sw) = topology.resolve_switch_by_name(&neighbor.border_switch) else {
                warn!("border switch {} not in topology", neighbor.border_switch);
                return;
            };
            cache.insert(dst_ip, sw.dpid, neighbor.outport_no, topology.version);
            (sw.dpid, neighbor.outport_no)
        }
    };

    let Some(sw) = topology.switches.get(&dpid) else {
        warn!("dispatch target switch dpid={:#x} not found", dpid);
        return;
    };
    let out = PacketOut::synthesized(vec![Action::output(outport_no)], frame.to_vec());
    if let Err(e) = sw.connection.send_packet_out(out) {
        warn!("failed to emit TAP->network PacketOut: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BgpNeighbor, RoutingConfig};
    use crate::error::OpenFlowError;
    use crate::openflow::{FeaturesReply, FlowMod, PortDesc, SwitchConnection, OFPP_NONE};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_shared_fifo_drops_oldest_on_overflow() {
        let fifo = SharedFifo::new();
        for i in 0..TAP_FIFO_CAPACITY + 5 {
            fifo.push(vec![i as u8]);
        }
        assert_eq!(fifo.dropped.load(Ordering::Relaxed), 5);
        let drained = fifo.drain();
        assert_eq!(drained.len(), TAP_FIFO_CAPACITY);
        assert_eq!(drained[0], vec![5u8]);
    }

    #[test]
    fn test_dispatch_cache_invalidated_by_version() {
        let mut cache = DispatchCache::default();
        let ip: IpAddr = "192.0.2.2".parse().unwrap();
        cache.insert(ip, 1, 4, 10);
        assert_eq!(cache.get(ip, 10), Some((1, 4)));
        assert_eq!(cache.get(ip, 11), None);
    }

    #[test]
    fn test_dispatch_cache_clear_for_switch() {
        let mut cache = DispatchCache::default();
        let ip: IpAddr = "192.0.2.2".parse().unwrap();
        cache.insert(ip, 1, 4, 10);
        cache.clear_for_switch(1);
        assert_eq!(cache.get(ip, 10), None);
    }

    #[derive(Debug, Default)]
    struct RecordingConnection {
        sent: Mutex<Vec<PacketOut>>,
    }
    impl SwitchConnection for RecordingConnection {
        fn dpid(&self) -> u64 {
            1
        }
        fn send_flow_mod(&self, _: FlowMod) -> Result<(), OpenFlowError> {
            Ok(())
        }
        fn send_packet_out(&self, packet_out: PacketOut) -> Result<(), OpenFlowError> {
            self.sent.lock().unwrap().push(packet_out);
            Ok(())
        }
    }

    /// E6 TAP->Network: a frame destined to a registered BGP neighbor is
    /// emitted on that neighbor's border switch/outport with the
    /// no-buffer/no-in-port sentinels.
    #[test]
    fn test_dispatch_frame_emits_packet_out_on_border_switch() {
        let mut t = TopologyStore::new(RoutingConfig::default());
        let conn = Arc::new(RecordingConnection::default());
        t.on_switch_enter(1, conn.clone());
        t.on_features(FeaturesReply {
            dpid: 1,
            ports: vec![PortDesc {
                port_no: 4,
                name: "border1".into(),
                hw_addr: MacAddr::new(0, 0, 0, 0, 0, 4),
                curr_features: 0x40,
            }],
        });

        let bgper = crate::config::BgperConfig {
            local_ipv4: "192.0.2.1".parse().unwrap(),
            local_ipv6: "::1".parse().unwrap(),
            neighbors: vec![BgpNeighbor {
                neighbor_ipv4: Some("203.0.113.9".parse().unwrap()),
                neighbor_ipv6: None,
                neighbor_ipv6_sma: None,
                border_switch: "border1".into(),
                outport_no: 4,
            }],
        };
        let mut cache = DispatchCache::default();

        let frame = build_ipv4_frame_to("203.0.113.9".parse().unwrap());
        dispatch_frame(&t, &bgper, &mut cache, &frame);

        let sent = conn.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].buffer_id, crate::openflow::OFP_NO_BUFFER);
        assert_eq!(sent[0].in_port, OFPP_NONE);
        assert_eq!(sent[0].actions, vec![Action::output(4)]);
    }

    fn build_ipv4_frame_to(dst: std::net::Ipv4Addr) -> Vec<u8> {
        use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
        use pnet::packet::ipv4::MutableIpv4Packet;
        use pnet::packet::MutablePacket;

        let mut buf = vec![0u8; 14 + 20];
        {
            let mut eth = MutableEthernetPacket::new(&mut buf[0..14]).unwrap();
            eth.set_destination(MacAddr::new(0, 0, 0, 0, 0, 4));
            eth.set_source(MacAddr::new(0, 0, 0, 9, 9, 9));
            eth.set_ethertype(EtherTypes::Ipv4);
        }
        {
            let mut ip = MutableIpv4Packet::new(&mut buf[14..]).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(20);
            ip.set_ttl(64);
            ip.set_source("192.0.2.1".parse().unwrap());
            ip.set_destination(dst);
            let checksum = pnet::packet::ipv4::checksum(&ip.to_immutable());
            ip.set_checksum(checksum);
        }
        buf
    }
}
