//! Owns all runtime state and drives the cooperative event loop (§5, §9
//! "replace global mutable configuration with explicit construction").
//! Topology/OpenFlow events arrive from an external collaborator (§1); the
//! TAP bridge is the one native thread this process runs.

use std::net::IpAddr;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::mpsc;

use crate::config::{BgperConfig, RoutingConfig};
use crate::error::ControllerError;
use crate::forwarding;
use crate::openflow::{FeaturesReply, FlowMod, PacketIn, PortDesc, SwitchConnection};
use crate::resolver::ResolverHandle;
use crate::routing::PathCache;
use crate::tap::{DispatchCache, TapBridge};
use crate::topology::TopologyStore;

/// Topology/OpenFlow events the external discovery and session layers
/// push into the controller (§6).
pub enum Event {
    SwitchEnter(u64, Arc<dyn SwitchConnection>),
    SwitchLeave(u64),
    Features(FeaturesReply),
    PortAdd(u64, PortDesc),
    PortDelete(u64, u16),
    LinkAdd((u64, u16), (u64, u16)),
    LinkDelete((u64, u16), (u64, u16)),
    PacketIn(PacketIn),
}

pub struct Controller {
    topology: TopologyStore,
    bgper: BgperConfig,
    path_cache: PathCache,
    dispatch_cache: DispatchCache,
    tap: TapBridge,
    resolver: ResolverHandle,
}

impl Controller {
    pub fn new(
        routing_config: RoutingConfig,
        bgper: BgperConfig,
        tap_device: &str,
        resolver: ResolverHandle,
    ) -> Result<Self, ControllerError> {
        let tap = TapBridge::start(tap_device)?;
        Ok(Controller {
            topology: TopologyStore::new(routing_config),
            bgper,
            path_cache: PathCache::new(),
            dispatch_cache: DispatchCache::default(),
            tap,
            resolver,
        })
    }

    /// Drive events and TAP frames cooperatively until the event channel
    /// closes (§5 "one event loop runs all handlers cooperatively").
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("event channel closed, shutting down controller loop");
                            break;
                        }
                    }
                }
                frames = self.tap.recv_frames() => {
                    for frame in frames {
                        crate::tap::dispatch_frame(&self.topology, &self.bgper, &mut self.dispatch_cache, &frame);
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::SwitchEnter(dpid, connection) => {
                let first_entry = self.topology.on_switch_enter(dpid, connection);
                if first_entry {
                    self.install_bgp_capture(dpid);
                }
            }
            Event::SwitchLeave(dpid) => {
                self.topology.on_switch_leave(dpid);
                self.dispatch_cache.clear_for_switch(dpid);
            }
            Event::Features(reply) => self.topology.on_features(reply),
            Event::PortAdd(dpid, desc) => self.topology.on_port_add(dpid, desc),
            Event::PortDelete(dpid, port_no) => self.topology.on_port_delete(dpid, port_no),
            Event::LinkAdd(src, dst) => self.topology.on_link_add(src, dst),
            Event::LinkDelete(src, dst) => self.topology.on_link_delete(src, dst),
            Event::PacketIn(pkt) => {
                forwarding::on_packet_in(
                    &mut self.topology,
                    &mut self.path_cache,
                    &self.resolver,
                    &self.tap,
                    &self.bgper,
                    pkt,
                )
                .await;
            }
        }
    }

    /// Pre-install the two permanent BGP-capture flows on first sight of a
    /// switch (§4.7).
    fn install_bgp_capture(&mut self, dpid: u64) {
        let Some(sw) = self.topology.switches.get(&dpid) else {
            return;
        };
        for flow in [
            FlowMod::bgp_capture(0x0800, 6),
            FlowMod::bgp_capture(0x86dd, 6),
        ] {
            if let Err(e) = sw.connection.send_flow_mod(flow) {
                warn!("failed to install BGP capture flow on dpid={:#x}: {}", dpid, e);
            }
        }
    }

    /// Current count of frames the TAP reader has dropped due to FIFO
    /// overflow, exposed for diagnostics (§5 back-pressure policy).
    pub fn tap_dropped_frames(&self) -> u64 {
        self.tap.dropped_count()
    }

    pub fn is_local_bgp_speaker(&self, ip: IpAddr) -> bool {
        self.bgper.is_local_speaker(ip)
    }
}
