//! External Destination Resolver Interface (§4.6): an in-process
//! request/reply channel to the out-of-scope module that maps a
//! destination outside the local AS to a `(switch, outport)` pair.

use std::net::IpAddr;
use std::time::Duration;

use log::warn;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

/// Default resolver wait before giving up on a pending request; made
/// configurable rather than unbounded (§4.6).
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

#[derive(Debug, Clone)]
pub struct ExternalDestinationRequest {
    pub dst_ip: IpAddr,
    pub family: Family,
}

/// Exactly one of `dpid`/`switch_name` must be set; a reply with neither
/// means the destination is undeliverable (§4.6, §7 UnresolvableDestination).
#[derive(Debug, Clone)]
pub struct Reply {
    pub dpid: Option<u64>,
    pub switch_name: Option<String>,
    pub outport_no: u16,
}

impl Reply {
    pub fn is_unresolvable(&self) -> bool {
        self.dpid.is_none() && self.switch_name.is_none()
    }
}

type PendingRequest = (ExternalDestinationRequest, oneshot::Sender<Reply>);

/// Handle held by the forwarding engine to submit resolution requests.
#[derive(Clone)]
pub struct ResolverHandle {
    tx: mpsc::Sender<PendingRequest>,
    timeout: Duration,
}

/// The other end, held by whatever drives the external resolver module.
pub struct ResolverInbox {
    rx: mpsc::Receiver<PendingRequest>,
}

pub fn channel(timeout: Duration) -> (ResolverHandle, ResolverInbox) {
    let (tx, rx) = mpsc::channel(32);
    (ResolverHandle { tx, timeout }, ResolverInbox { rx })
}

impl ResolverHandle {
    pub fn with_default_timeout() -> (Self, ResolverInbox) {
        channel(DEFAULT_RESOLVE_TIMEOUT)
    }

    /// Submit a request and cooperatively await the reply, bounded by this
    /// handle's configured timeout (§4.6 "the wait is cooperative").
    pub async fn resolve(&self, req: ExternalDestinationRequest) -> Option<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send((req, reply_tx)).await.is_err() {
            warn!("external resolver inbox closed");
            return None;
        }
        match timeout(self.timeout, reply_rx).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(_)) => {
                warn!("external resolver dropped a pending request");
                None
            }
            Err(_) => {
                warn!("external resolver timed out after {:?}", self.timeout);
                None
            }
        }
    }
}

impl ResolverInbox {
    pub async fn recv(&mut self) -> Option<(ExternalDestinationRequest, oneshot::Sender<Reply>)> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_resolve_round_trip() {
        let (handle, mut inbox) = ResolverHandle::with_default_timeout();
        tokio::spawn(async move {
            let (req, reply_tx) = inbox.recv().await.unwrap();
            assert_eq!(req.family, Family::V4);
            reply_tx
                .send(Reply {
                    dpid: Some(7),
                    switch_name: None,
                    outport_no: 3,
                })
                .unwrap();
        });
        let reply = handle
            .resolve(ExternalDestinationRequest {
                dst_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)),
                family: Family::V4,
            })
            .await
            .unwrap();
        assert_eq!(reply.dpid, Some(7));
        assert_eq!(reply.outport_no, 3);
    }

    #[tokio::test]
    async fn test_resolve_times_out_when_nobody_answers() {
        let (handle, _inbox) = channel(Duration::from_millis(20));
        let reply = handle
            .resolve(ExternalDestinationRequest {
                dst_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)),
                family: Family::V4,
            })
            .await;
        assert!(reply.is_none());
    }

    #[test]
    fn test_unresolvable_reply() {
        let r = Reply {
            dpid: None,
            switch_name: None,
            outport_no: 0,
        };
        assert!(r.is_unresolvable());
    }
}
