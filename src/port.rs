//! Downward seam to the lossless link-layer device.
//!
//! The device itself (queues, PFC, scheduling among ready QPs) is external;
//! the engine sees it through `QbbPort` and drives it with the hook bundle
//! `Setup` installs. Ports keep only weak references to QPs; the engine owns
//! them.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{
    error::Result,
    packet::{Packet, ParsedHeader},
    queue_pair::{QueuePair, SharedQp},
    rate::DataRate,
    sim::SimTime,
};

/// Callbacks a port calls up into the engine. Installed once by `Setup`;
/// closures hold a weak engine reference so a torn-down host leaves ports
/// with inert hooks instead of dangling ones.
pub struct PortHooks {
    /// A frame arrived for this host
    pub receive: Box<dyn Fn(Packet, ParsedHeader) -> Result<()> + Send + Sync>,
    /// A previously queued frame finished transmitting
    pub sent: Box<dyn Fn(Packet, ParsedHeader) -> Result<()> + Send + Sync>,
    /// The link went down. Bound to this port; the engine knows which.
    pub link_down: Box<dyn Fn() + Send + Sync>,
    /// A data packet of `qp` left the port; `ifg` is the interframe gap
    pub pkt_sent: Box<dyn Fn(&SharedQp, &Packet, SimTime) + Send + Sync>,
    /// Account bytes transmitted by this port
    pub update_tx_bytes: Box<dyn Fn(u64) + Send + Sync>,
    /// Synthesise the next segment of `qp`
    pub get_nxt_packet: Box<dyn Fn(&SharedQp) -> Packet + Send + Sync>,
}

/// The engine-facing surface of one physical NIC port.
///
/// The engine may call these from inside its own critical sections;
/// implementations must not reenter the engine synchronously (queue work
/// and use the hooks from the event loop instead).
pub trait QbbPort: Send + Sync {
    /// Line rate of the port.
    fn data_rate(&self) -> DataRate;

    /// Wires the shared QP group and the upward hooks. Called once by
    /// `Setup` after all ports are installed.
    fn setup(&self, qp_group: Arc<QpGroup>, hooks: PortHooks);

    /// A new QP became schedulable on this port.
    fn new_qp(&self, qp: &SharedQp);

    /// An existing QP was re-hashed onto this port.
    fn reassigned_qp(&self, qp: &SharedQp);

    /// Kick the transmit path; the port picks the next eligible QP.
    fn trigger_transmit(&self);

    /// Transmit variant used when this host is a switch acting as an NVLS
    /// host and the packet is locally destined.
    fn switch_as_host_send(&self);

    /// Queue a control packet (ACK/NACK) ahead of data traffic.
    fn rdma_enqueue_high_prio_q(&self, pkt: Packet);

    /// A QP's earliest eligible send time moved; gate scheduling on it.
    fn update_next_avail(&self, t: SimTime);
}

/// QPs currently assigned to one port, shared between the engine and the
/// port's scheduler.
#[derive(Default)]
pub struct QpGroup {
    qps: Mutex<Vec<Weak<Mutex<QueuePair>>>>,
}

impl QpGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_qp(&self, qp: &SharedQp) {
        self.qps.lock().push(Arc::downgrade(qp));
    }

    pub fn clear(&self) {
        self.qps.lock().clear();
    }

    /// Live QPs in the group; drops entries whose QP was destroyed.
    pub fn qps(&self) -> Vec<SharedQp> {
        let mut guard = self.qps.lock();
        guard.retain(|w| w.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.qps.lock().iter().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One NIC slot of the host: the device plus its QP group. A slot without a
/// device models a disabled port and never receives QPs.
pub struct NicEntry {
    pub dev: Option<Arc<dyn QbbPort>>,
    pub qp_grp: Arc<QpGroup>,
}

impl NicEntry {
    pub fn new(dev: Arc<dyn QbbPort>) -> Self {
        Self {
            dev: Some(dev),
            qp_grp: Arc::new(QpGroup::new()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            dev: None,
            qp_grp: Arc::new(QpGroup::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qp_group_drops_destroyed_qps() {
        let group = QpGroup::new();
        let qp: SharedQp = Arc::new(Mutex::new(QueuePair::new(0, 1, 2, 3, 4)));
        group.add_qp(&qp);
        assert_eq!(group.len(), 1);
        drop(qp);
        assert!(group.is_empty());
        assert!(group.qps().is_empty());
    }
}
