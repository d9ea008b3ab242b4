//! The RDMA host engine.
//!
//! One `RdmaHost` per simulated end host. It owns every transmit and receive
//! queue pair, multiplexes them over the installed NIC ports, implements the
//! reliable go-back-N transport, and drives the configured congestion
//! control state machine (the `cc` module holds the per-algorithm impl
//! blocks).

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use log::{error, trace, warn};
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    config::{CcMode, HostConfig},
    constants::{
        ETH_HEADER_LEN, IPV4_HEADER_LEN, MIN_FRAME_LEN, NODE_TYPE_NVSWITCH, PPP_PROTO_IPV4,
        PROTO_ACK, PROTO_CNP, PROTO_NACK, PROTO_UDP, TOS_NVLS,
    },
    error::{HostError, Result},
    packet::{
        ether_to_ppp, IntHeader, Ipv4Header, L4Header, Packet, ParsedHeader, PppHeader, QbbHeader,
        SeqTsHeader, UdpHeader,
    },
    port::{NicEntry, PortHooks, QbbPort, QpGroup},
    queue_pair::{
        qp_key, rx_qp_key, CcState, EcnAccount, QueuePair, QpKey, RxQueuePair, SharedQp,
        SharedRxQp,
    },
    rate::DataRate,
    sim::{EventScheduler, SimTime, TimerEvent},
    telemetry::TelemetryState,
};

/// Node id embedded in an address: bits 8..24.
pub fn ip_to_node_id(ip: u32) -> u32 {
    (ip >> 8) & 0xffff
}

/// Outcome of the receiver-side sequence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqDecision {
    /// In order and ACK-worthy
    Ack,
    /// A gap; answer with a NACK
    Nack,
    /// Below the expected sequence
    Duplicate,
    /// A gap already covered by a recent NACK
    NackSuppressed,
    /// In order, nothing to say
    Silent,
}

/// Flow parameters handed to `add_queue_pair`.
pub struct NewQueuePair {
    pub src_node: u32,
    pub dst_node: u32,
    pub tag: u64,
    pub size: u64,
    pub pg: u16,
    pub sip: u32,
    pub dip: u32,
    pub sport: u16,
    pub dport: u16,
    pub win: u64,
    pub base_rtt: u64,
    pub notify_finish: Option<Box<dyn FnMut() + Send>>,
    pub notify_sent: Option<Box<dyn FnMut() + Send>>,
}

type QpCallback = Box<dyn FnMut(&SharedQp) + Send>;

pub struct RdmaHost {
    pub(crate) node_id: u32,
    pub(crate) node_type: u32,
    pub(crate) cfg: HostConfig,
    pub(crate) sched: Arc<EventScheduler>,
    pub(crate) nics: Vec<NicEntry>,
    /// NVSwitch nodes reachable from this host
    nvswitch_set: HashSet<u32>,

    pub(crate) qp_map: RwLock<HashMap<QpKey, SharedQp>>,
    // Looked up and lazily created from the receive path; the lock is the
    // critical section the multi-partition mode needs.
    rx_qp_map: Mutex<HashMap<QpKey, SharedRxQp>>,

    rt_inter_server: RwLock<HashMap<u32, Vec<usize>>>,
    rt_nvswitch: RwLock<HashMap<u32, Vec<usize>>>,

    pub(crate) tx_bytes: Mutex<Vec<u64>>,
    pub(crate) telemetry: Mutex<TelemetryState>,

    qp_complete_cb: Mutex<Option<QpCallback>>,
    send_complete_cb: Mutex<Option<QpCallback>>,

    pub(crate) rng: Mutex<StdRng>,
}

impl RdmaHost {
    pub fn new(node_id: u32, node_type: u32, cfg: HostConfig, sched: Arc<EventScheduler>) -> Self {
        Self {
            node_id,
            node_type,
            cfg,
            sched,
            nics: Vec::new(),
            nvswitch_set: HashSet::new(),
            qp_map: RwLock::new(HashMap::new()),
            rx_qp_map: Mutex::new(HashMap::new()),
            rt_inter_server: RwLock::new(HashMap::new()),
            rt_nvswitch: RwLock::new(HashMap::new()),
            tx_bytes: Mutex::new(Vec::new()),
            telemetry: Mutex::new(TelemetryState::default()),
            qp_complete_cb: Mutex::new(None),
            send_complete_cb: Mutex::new(None),
            rng: Mutex::new(StdRng::seed_from_u64(u64::from(node_id))),
        }
    }

    /// Installs the next NIC port. Ports must all be in place before
    /// `setup`.
    pub fn add_port(&mut self, dev: Arc<dyn QbbPort>) {
        self.nics.push(NicEntry::new(dev));
    }

    /// Reserves a port slot with no device behind it; routing entries must
    /// not point at it.
    pub fn add_empty_port(&mut self) {
        self.nics.push(NicEntry::disabled());
    }

    pub fn enable_nvls(&mut self) {
        self.cfg.nvls_enable = true;
    }

    pub fn disable_nvls(&mut self) {
        self.cfg.nvls_enable = false;
    }

    pub fn add_nvswitch(&mut self, node_id: u32) {
        self.nvswitch_set.insert(node_id);
    }

    /// Whether `node_id` is a registered NVSwitch.
    pub fn is_nvswitch(&self, node_id: u32) -> bool {
        self.nvswitch_set.contains(&node_id)
    }

    pub fn set_pint_sample_threshold(&mut self, p: f64) {
        self.cfg.pint_smpl_thresh = (65536.0 * p) as u32;
    }

    pub fn config(&self) -> &HostConfig {
        &self.cfg
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn scheduler(&self) -> &Arc<EventScheduler> {
        &self.sched
    }

    /// Binds the completion callbacks and wires every installed port with
    /// the upward hook bundle. Call once, after all ports are installed.
    pub fn setup(
        self: &Arc<Self>,
        qp_complete: impl FnMut(&SharedQp) + Send + 'static,
        send_complete: impl FnMut(&SharedQp) + Send + 'static,
    ) {
        {
            let mut tx = self.tx_bytes.lock();
            tx.clear();
            tx.resize(self.nics.len(), 0);
            self.telemetry.lock().last_tx_bytes = vec![0; self.nics.len()];
        }
        for (idx, nic) in self.nics.iter().enumerate() {
            let Some(dev) = &nic.dev else { continue };
            dev.setup(Arc::clone(&nic.qp_grp), self.make_hooks(idx));
        }
        *self.qp_complete_cb.lock() = Some(Box::new(qp_complete));
        *self.send_complete_cb.lock() = Some(Box::new(send_complete));
    }

    fn make_hooks(self: &Arc<Self>, port_idx: usize) -> PortHooks {
        let w_receive = Arc::downgrade(self);
        let w_sent = Arc::downgrade(self);
        let w_link = Arc::downgrade(self);
        let w_pkt_sent = Arc::downgrade(self);
        let w_tx_bytes = Arc::downgrade(self);
        let w_get_nxt = Arc::downgrade(self);
        PortHooks {
            receive: Box::new(move |pkt, ch| match w_receive.upgrade() {
                Some(host) => host.receive(&pkt, &ch),
                None => Ok(()),
            }),
            sent: Box::new(move |pkt, ch| match w_sent.upgrade() {
                Some(host) => host.send_packet_complete(&pkt, &ch),
                None => Ok(()),
            }),
            link_down: Box::new(move || {
                if let Some(host) = w_link.upgrade() {
                    host.set_link_down(port_idx);
                }
            }),
            pkt_sent: Box::new(move |qp, pkt, ifg| {
                if let Some(host) = w_pkt_sent.upgrade() {
                    host.pkt_sent(qp, pkt, ifg);
                }
            }),
            update_tx_bytes: Box::new(move |bytes| {
                if let Some(host) = w_tx_bytes.upgrade() {
                    host.update_tx_bytes(port_idx, bytes);
                }
            }),
            get_nxt_packet: Box::new(move |qp| match w_get_nxt.upgrade() {
                Some(host) => host.get_nxt_packet(qp),
                None => Packet::default(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Adds a next-hop port for `dst_ip` to the inter-server or NVSwitch
    /// table.
    pub fn add_table_entry(&self, dst_ip: u32, port_idx: usize, is_nvswitch: bool) {
        if is_nvswitch {
            self.rt_nvswitch.write().entry(dst_ip).or_default().push(port_idx);
        } else {
            self.rt_inter_server.write().entry(dst_ip).or_default().push(port_idx);
        }
    }

    pub fn clear_table(&self) {
        self.rt_inter_server.write().clear();
        self.rt_nvswitch.write().clear();
    }

    /// Selects the NIC port of a transmit QP: the NVSwitch table serves
    /// intra-server flows (or any destination it lists), the inter-server
    /// table everything else; within a list the flow hash picks the port.
    pub fn nic_idx_of_qp(&self, qp: &QueuePair) -> Result<usize> {
        let per_server = self.cfg.gpus_per_server.max(1);
        let intra = qp.src_node / per_server == qp.dst_node / per_server;
        {
            let nv = self.rt_nvswitch.read();
            if intra || nv.contains_key(&qp.dip) {
                return pick_port(&nv, qp.dip, qp.hash());
            }
        }
        pick_port(&self.rt_inter_server.read(), qp.dip, qp.hash())
    }

    /// Port selection on the receive side: inter-server table first, then
    /// NVSwitch.
    pub fn nic_idx_of_rx_qp(&self, q: &RxQueuePair) -> Result<usize> {
        {
            let rt = self.rt_inter_server.read();
            if rt.contains_key(&q.dip) {
                return pick_port(&rt, q.dip, q.hash());
            }
        }
        pick_port(&self.rt_nvswitch.read(), q.dip, q.hash())
    }

    /// Re-hashes every QP against the current tables and hands it back to
    /// its (possibly new) port. Used when link state changes the tables.
    pub fn redistribute_qp(&self) -> Result<()> {
        for nic in &self.nics {
            if nic.dev.is_some() {
                nic.qp_grp.clear();
            }
        }
        let qps: Vec<SharedQp> = self.qp_map.read().values().cloned().collect();
        for qp_arc in qps {
            let (nic_idx, dip) = {
                let qp = qp_arc.lock();
                (self.nic_idx_of_qp(&qp)?, qp.dip)
            };
            self.nics[nic_idx].qp_grp.add_qp(&qp_arc);
            self.dev(nic_idx, dip)?.reassigned_qp(&qp_arc);
        }
        Ok(())
    }

    pub(crate) fn dev(&self, nic_idx: usize, dip: u32) -> Result<&Arc<dyn QbbPort>> {
        self.nics
            .get(nic_idx)
            .and_then(|nic| nic.dev.as_ref())
            .ok_or(HostError::NoAliveNic { dip })
    }

    // ------------------------------------------------------------------
    // QP lifecycle
    // ------------------------------------------------------------------

    /// Registers a flow: routes it onto a port, seeds rate and CC substate
    /// from the port's line rate, and notifies the port.
    pub fn add_queue_pair(&self, req: NewQueuePair) -> Result<()> {
        let mut qp = QueuePair::new(req.pg, req.sip, req.dip, req.sport, req.dport);
        qp.src_node = req.src_node;
        qp.dst_node = req.dst_node;
        qp.tag = req.tag;
        qp.size = req.size;
        qp.initial_size = req.size;
        qp.win = req.win;
        qp.base_rtt = req.base_rtt;
        qp.var_win = self.cfg.var_win;
        qp.nvls_enable = self.cfg.nvls_enable;
        qp.notify_finish = req.notify_finish;
        qp.notify_sent = req.notify_sent;
        qp.cc = CcState::for_mode(self.cfg.cc_mode);

        let nic_idx = self.nic_idx_of_qp(&qp)?;
        let dip = qp.dip;
        let line_rate = self.dev(nic_idx, dip)?.data_rate();
        qp.rate = line_rate;
        qp.max_rate = line_rate;
        qp.cc.seed(line_rate, self.cfg.multiple_rate);

        let key = qp.key();
        let qp_arc: SharedQp = Arc::new(Mutex::new(qp));
        self.nics[nic_idx].qp_grp.add_qp(&qp_arc);
        self.qp_map.write().insert(key, Arc::clone(&qp_arc));
        trace!(
            "node {}: new qp key={key:#x} on port {nic_idx} at {line_rate}",
            self.node_id
        );
        self.dev(nic_idx, dip)?.new_qp(&qp_arc);
        Ok(())
    }

    /// Removes the QP's map entry and its telemetry history.
    pub fn delete_queue_pair(&self, key: QpKey) {
        self.qp_map.write().remove(&key);
        let mut t = self.telemetry.lock();
        t.last_qp_rate.remove(&key);
        t.last_qp_cnp.remove(&key);
    }

    pub fn get_qp(&self, dip: u32, sport: u16, pg: u16) -> Option<SharedQp> {
        self.qp_map.read().get(&qp_key(dip, sport, pg)).cloned()
    }

    /// Looks up the receive QP of `(dip, pg, dport)`, lazily creating it
    /// when `create` is set. `sip`/`sport` are this host's side of the
    /// reverse flow.
    pub fn get_rx_qp(
        &self,
        sip: u32,
        dip: u32,
        sport: u16,
        dport: u16,
        pg: u16,
        create: bool,
    ) -> Option<SharedRxQp> {
        let key = rx_qp_key(dip, pg, dport);
        let mut map = self.rx_qp_map.lock();
        if let Some(q) = map.get(&key) {
            return Some(Arc::clone(q));
        }
        if !create {
            return None;
        }
        let q = Arc::new(Mutex::new(RxQueuePair {
            sip,
            dip,
            sport,
            dport,
            ecn: EcnAccount {
                qindex: pg,
                ..EcnAccount::default()
            },
            ..RxQueuePair::default()
        }));
        map.insert(key, Arc::clone(&q));
        Some(q)
    }

    pub fn delete_rx_qp(&self, dip: u32, pg: u16, dport: u16) {
        self.rx_qp_map.lock().remove(&rx_qp_key(dip, pg, dport));
    }

    /// Completion: cancels CC timers, fires the bound callbacks, destroys
    /// the QP.
    pub fn qp_complete(&self, qp_arc: &SharedQp) {
        let (key, notify) = {
            let mut qp = qp_arc.lock();
            if let CcState::Mlx(ref mut mlx) = qp.cc {
                for ev in [
                    mlx.ev_update_alpha.take(),
                    mlx.ev_decrease_rate.take(),
                    mlx.ev_rp_timer.take(),
                ]
                .into_iter()
                .flatten()
                {
                    self.sched.cancel(ev);
                }
            }
            (qp.key(), qp.notify_finish.take())
        };
        // The callback logs flow stats and may delete the peer's RxQP.
        if let Some(cb) = self.qp_complete_cb.lock().as_mut() {
            cb(qp_arc);
        }
        if let Some(mut notify) = notify {
            notify();
        }
        self.delete_queue_pair(key);
    }

    // ------------------------------------------------------------------
    // RX pipeline
    // ------------------------------------------------------------------

    /// L3 demux of every frame the ports deliver.
    pub fn receive(&self, pkt: &Packet, ch: &ParsedHeader) -> Result<()> {
        match ch.l3_prot {
            PROTO_UDP => self.receive_udp(pkt, ch),
            PROTO_CNP => self.receive_cnp(pkt, ch),
            PROTO_ACK | PROTO_NACK => self.receive_ack(pkt, ch),
            _ => Ok(()),
        }
    }

    fn receive_udp(&self, pkt: &Packet, ch: &ParsedHeader) -> Result<()> {
        let L4Header::Udp {
            sport,
            dport,
            pg,
            seq,
            ih,
        } = ch.l4
        else {
            return Ok(());
        };
        let ecn_bits = ch.ecn_bits;
        let payload_size = u64::from(pkt.payload_size());
        let rxqp_arc = self
            .get_rx_qp(ch.dip, ch.sip, dport, sport, pg, true)
            .unwrap_or_else(|| unreachable!("create is set"));
        let mut rxq = rxqp_arc.lock();
        if ecn_bits != 0 {
            rxq.ecn.ecn_bits |= ecn_bits;
            rxq.ecn.qfb = rxq.ecn.qfb.wrapping_add(1);
        }
        rxq.ecn.total = rxq.ecn.total.wrapping_add(1);
        rxq.milestone_rx = u64::from(self.cfg.ack_interval);

        let decision = self.receiver_check_seq(seq, &mut rxq, payload_size);
        if !matches!(decision, SeqDecision::Ack | SeqDecision::Nack) {
            return Ok(());
        }

        // Echo a control packet back to the sender, carrying the next
        // expected byte and the data packet's telemetry.
        let mut qbb = QbbHeader {
            seq: rxq.expected_seq,
            pg,
            sport: dport,
            dport: sport,
            flags: 0,
            ih,
        };
        if ecn_bits != 0 {
            qbb.set_cnp();
        }
        let pad = (MIN_FRAME_LEN as i64
            - i64::from(ETH_HEADER_LEN)
            - i64::from(IPV4_HEADER_LEN)
            - i64::from(QbbHeader::serialized_size()))
        .max(0) as u32;
        let mut newp = Packet::new(pad);
        newp.add_qbb(qbb);
        let ipid = rxq.ipid;
        rxq.ipid = rxq.ipid.wrapping_add(1);
        newp.add_ipv4(Ipv4Header {
            src: ch.dip,
            dst: ch.sip,
            protocol: if decision == SeqDecision::Ack {
                PROTO_ACK
            } else {
                PROTO_NACK
            },
            ttl: 64,
            tos: if ch.tos == TOS_NVLS { TOS_NVLS } else { 0 },
            ecn: 0,
            identification: ipid,
            payload_size: newp.size(),
        });
        newp.add_ppp(PppHeader {
            protocol: ether_to_ppp(0x0800)?,
        });

        let nic_idx = self.nic_idx_of_rx_qp(&rxq)?;
        drop(rxq);
        let dev = self.dev(nic_idx, ch.sip)?;
        dev.rdma_enqueue_high_prio_q(newp);
        let did = ip_to_node_id(ch.dip);
        if did == self.node_id && self.node_type == NODE_TYPE_NVSWITCH && ch.tos == TOS_NVLS {
            dev.switch_as_host_send();
        } else {
            dev.trigger_transmit();
        }
        Ok(())
    }

    /// The receiver-side sequence check.
    pub fn receiver_check_seq(
        &self,
        seq: u64,
        q: &mut RxQueuePair,
        size: u64,
    ) -> SeqDecision {
        let expected = q.expected_seq;
        if seq == expected {
            q.expected_seq = expected + size;
            let chunk = u64::from(self.cfg.chunk);
            if self.cfg.ack_interval > 0 && q.expected_seq >= q.milestone_rx {
                q.milestone_rx += u64::from(self.cfg.ack_interval);
                SeqDecision::Ack
            } else if chunk > 0 && q.expected_seq % chunk == 0 {
                SeqDecision::Ack
            } else {
                SeqDecision::Silent
            }
        } else if seq > expected {
            // One NACK per (expected, timer) window.
            if self.sched.now() >= q.nack_timer || q.last_nack != expected {
                q.nack_timer = self.sched.now() + SimTime::from_micros(self.cfg.nack_interval);
                q.last_nack = expected;
                if self.cfg.back_to_0 && self.cfg.chunk > 0 {
                    let chunk = u64::from(self.cfg.chunk);
                    q.expected_seq = q.expected_seq / chunk * chunk;
                }
                SeqDecision::Nack
            } else {
                SeqDecision::NackSuppressed
            }
        } else {
            SeqDecision::Duplicate
        }
    }

    fn receive_cnp(&self, _pkt: &Packet, ch: &ParsedHeader) -> Result<()> {
        let L4Header::Cnp(cnp) = ch.l4 else {
            return Ok(());
        };
        // qIndex 1 is DCTCP's queue; its marks come back in ACKs instead.
        if cnp.qindex == 1 {
            return Ok(());
        }
        let qp_arc =
            self.get_qp(ch.sip, cnp.fid, cnp.qindex)
                .ok_or(HostError::UnknownFlow {
                    sip: ch.sip,
                    sport: cnp.fid,
                    pg: cnp.qindex,
                })?;
        let mut qp = qp_arc.lock();
        if qp.rate.is_zero() {
            // A CNP can beat the first send; seed from the port's line rate.
            let nic_idx = self.nic_idx_of_qp(&qp)?;
            let line_rate = self.dev(nic_idx, qp.dip)?.data_rate();
            qp.rate = line_rate;
            let multiple_rate = self.cfg.multiple_rate;
            qp.cc.seed(line_rate, multiple_rate);
        }
        Ok(())
    }

    fn receive_ack(&self, _pkt: &Packet, ch: &ParsedHeader) -> Result<()> {
        let L4Header::Ack(qbb) = ch.l4 else {
            return Ok(());
        };
        let Some(qp_arc) = self.get_qp(ch.sip, qbb.dport, qbb.pg) else {
            return Ok(());
        };
        let seq = qbb.seq;
        let cnp = qbb.is_cnp();
        let nic_idx;
        let mut finished = false;
        {
            let mut qp = qp_arc.lock();
            nic_idx = self.nic_idx_of_qp(&qp)?;
            if self.cfg.ack_interval == 0 {
                error!(
                    "node {}: received an ACK while L2 ACKs are disabled",
                    self.node_id
                );
            } else {
                let ack = if self.cfg.back_to_0 && self.cfg.chunk > 0 {
                    let chunk = u64::from(self.cfg.chunk);
                    seq / chunk * chunk
                } else {
                    seq
                };
                qp.acknowledge(ack);
                finished = qp.is_finished();
            }
        }
        if finished {
            self.qp_complete(&qp_arc);
        }
        {
            let mut qp = qp_arc.lock();
            if ch.l3_prot == PROTO_NACK {
                self.recover_queue(&mut qp);
            }
            if cnp {
                qp.cnp_cnt += 1;
                if self.cfg.cc_mode == CcMode::Dcqcn {
                    self.cnp_received_mlx(&mut qp)?;
                }
            }
            match self.cfg.cc_mode {
                CcMode::Hpcc => self.handle_ack_hp(&mut qp, &qbb)?,
                CcMode::Timely => self.handle_ack_timely(&mut qp, &qbb)?,
                CcMode::Dctcp => self.handle_ack_dctcp(&mut qp, &qbb)?,
                CcMode::HpccPint => self.handle_ack_hp_pint(&mut qp, &qbb)?,
                CcMode::Dcqcn | CcMode::None => {}
            }
        }
        // The ACK may have advanced the window; let the port look again.
        let dev = self.dev(nic_idx, ch.sip)?;
        if ip_to_node_id(ch.dip) == self.node_id && self.node_type == NODE_TYPE_NVSWITCH {
            dev.switch_as_host_send();
        } else {
            dev.trigger_transmit();
        }
        Ok(())
    }

    /// Go-back-N: retransmission restarts at the first unacknowledged byte.
    pub fn recover_queue(&self, qp: &mut QueuePair) {
        qp.snd_nxt = qp.snd_una;
    }

    /// Transmit-complete for a data packet of ours.
    pub fn send_packet_complete(&self, _pkt: &Packet, ch: &ParsedHeader) -> Result<()> {
        let L4Header::Udp { sport, pg, .. } = ch.l4 else {
            return Ok(());
        };
        let Some(qp_arc) = self.get_qp(ch.dip, sport, pg) else {
            return Ok(());
        };
        if let Some(cb) = self.send_complete_cb.lock().as_mut() {
            cb(&qp_arc);
        }
        let notify = {
            let mut qp = qp_arc.lock();
            qp.notify_sent.take()
        };
        if let Some(mut notify) = notify {
            notify();
            qp_arc.lock().notify_sent = Some(notify);
        }
        Ok(())
    }

    pub fn set_link_down(&self, port_idx: usize) {
        warn!("node {}: link down on port {port_idx}", self.node_id);
    }

    pub fn update_tx_bytes(&self, port_idx: usize, bytes: u64) {
        let mut tx = self.tx_bytes.lock();
        if let Some(counter) = tx.get_mut(port_idx) {
            *counter += bytes;
        }
    }

    // ------------------------------------------------------------------
    // TX pipeline and pacing
    // ------------------------------------------------------------------

    /// Synthesises the next segment of `qp` and advances `snd_nxt`.
    pub fn get_nxt_packet(&self, qp_arc: &SharedQp) -> Packet {
        let mut qp = qp_arc.lock();
        let payload_size = qp.bytes_left().min(u64::from(self.cfg.mtu)) as u32;
        let mut pkt = Packet::new(payload_size);
        // Sender timestamp; switches stamp their own hop records on top.
        let ih = IntHeader::timestamped(self.sched.now().nanos());
        pkt.add_seq_ts(SeqTsHeader {
            seq: qp.snd_nxt,
            pg: qp.pg,
            ih,
        });
        pkt.add_udp(UdpHeader {
            sport: qp.sport,
            dport: qp.dport,
        });
        pkt.add_ipv4(Ipv4Header {
            src: qp.sip,
            dst: qp.dip,
            protocol: PROTO_UDP,
            ttl: 64,
            tos: if qp.nvls_enable { TOS_NVLS } else { 0 },
            ecn: 0,
            identification: qp.ipid,
            payload_size: pkt.size(),
        });
        pkt.add_ppp(PppHeader {
            protocol: PPP_PROTO_IPV4,
        });

        qp.snd_nxt += u64::from(payload_size);
        qp.ipid = qp.ipid.wrapping_add(1);
        pkt
    }

    /// Pacing bookkeeping after the port put a packet on the wire.
    pub fn pkt_sent(&self, qp_arc: &SharedQp, pkt: &Packet, ifg: SimTime) {
        let mut qp = qp_arc.lock();
        qp.last_pkt_size = pkt.size();
        let size = pkt.size();
        self.update_next_avail(&mut qp, ifg, size);
    }

    /// Moves the QP's earliest eligible send time past the transmit time of
    /// `pkt_size` at the effective rate.
    pub fn update_next_avail(&self, qp: &mut QueuePair, ifg: SimTime, pkt_size: u32) {
        let rate = if self.cfg.rate_bound {
            qp.rate
        } else {
            qp.max_rate
        };
        qp.next_avail = self.sched.now() + ifg + rate.bytes_tx_time(u64::from(pkt_size));
    }

    /// Re-paces the QP at `new_rate`, preserving the wait already served,
    /// and pushes the new gate into the owning port.
    pub fn change_rate(&self, qp: &mut QueuePair, new_rate: DataRate) -> Result<()> {
        let old_tx = qp.rate.bytes_tx_time(u64::from(qp.last_pkt_size));
        let new_tx = new_rate.bytes_tx_time(u64::from(qp.last_pkt_size));
        qp.next_avail = qp.next_avail + new_tx - old_tx;
        let nic_idx = self.nic_idx_of_qp(qp)?;
        self.dev(nic_idx, qp.dip)?.update_next_avail(qp.next_avail);
        qp.rate = new_rate;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Dispatch of a fired timer event. Events for QPs that have completed
    /// since scheduling resolve to nothing.
    pub fn handle_timer(&self, ev: TimerEvent) -> Result<()> {
        let Some(qp_arc) = self.qp_map.read().get(&ev.qp_key()).cloned() else {
            return Ok(());
        };
        match ev {
            TimerEvent::UpdateAlpha(_) => {
                self.update_alpha_mlx(&qp_arc);
                Ok(())
            }
            TimerEvent::CheckRateDecrease(_) => self.check_rate_decrease_mlx(&qp_arc),
            TimerEvent::RateIncrease(_) => self.rate_inc_event_timer_mlx(&qp_arc),
        }
    }
}

fn pick_port(table: &HashMap<u32, Vec<usize>>, dip: u32, hash: u32) -> Result<usize> {
    let ports = table
        .get(&dip)
        .filter(|v| !v.is_empty())
        .ok_or(HostError::NoAliveNic { dip })?;
    Ok(ports[hash as usize % ports.len()])
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct MockPort {
        rate: DataRate,
        transmits: AtomicUsize,
        high_prio: Mutex<Vec<Packet>>,
        next_avail: Mutex<Option<SimTime>>,
    }

    impl MockPort {
        fn new(rate: DataRate) -> Arc<Self> {
            Arc::new(Self {
                rate,
                transmits: AtomicUsize::new(0),
                high_prio: Mutex::new(Vec::new()),
                next_avail: Mutex::new(None),
            })
        }
    }

    impl QbbPort for MockPort {
        fn data_rate(&self) -> DataRate {
            self.rate
        }
        fn setup(&self, _qp_group: Arc<QpGroup>, _hooks: PortHooks) {}
        fn new_qp(&self, _qp: &SharedQp) {}
        fn reassigned_qp(&self, _qp: &SharedQp) {}
        fn trigger_transmit(&self) {
            self.transmits.fetch_add(1, Ordering::Relaxed);
        }
        fn switch_as_host_send(&self) {}
        fn rdma_enqueue_high_prio_q(&self, pkt: Packet) {
            self.high_prio.lock().push(pkt);
        }
        fn update_next_avail(&self, t: SimTime) {
            *self.next_avail.lock() = Some(t);
        }
    }

    fn node_ip(id: u32) -> u32 {
        0x0b00_0001 + (id << 8)
    }

    fn host_with_ports(cfg: HostConfig, n_ports: usize) -> (Arc<RdmaHost>, Vec<Arc<MockPort>>) {
        let sched = Arc::new(EventScheduler::new());
        let mut host = RdmaHost::new(1, 0, cfg, sched);
        let ports: Vec<Arc<MockPort>> = (0..n_ports)
            .map(|_| MockPort::new(DataRate::from_gbps(100)))
            .collect();
        for port in &ports {
            host.add_port(Arc::clone(port) as Arc<dyn QbbPort>);
        }
        let host = Arc::new(host);
        host.setup(|_| {}, |_| {});
        (host, ports)
    }

    fn flow_to(dst_node: u32, sport: u16) -> NewQueuePair {
        NewQueuePair {
            src_node: 1,
            dst_node,
            tag: 0,
            size: 1_000_000,
            pg: 3,
            sip: node_ip(1),
            dip: node_ip(dst_node),
            sport,
            dport: 100,
            win: 0,
            base_rtt: 8000,
            notify_finish: None,
            notify_sent: None,
        }
    }

    #[test]
    fn intra_server_flows_use_the_nvswitch_table() {
        let cfg = HostConfig {
            gpus_per_server: 8,
            ..HostConfig::default()
        };
        let (host, _ports) = host_with_ports(cfg, 4);
        // node 2 shares the server (2/8 == 1/8), node 9 does not
        host.add_table_entry(node_ip(2), 0, true);
        host.add_table_entry(node_ip(2), 1, true);
        host.add_table_entry(node_ip(9), 2, false);
        host.add_table_entry(node_ip(9), 3, false);

        let mut intra = QueuePair::new(3, node_ip(1), node_ip(2), 200, 100);
        intra.src_node = 1;
        intra.dst_node = 2;
        let idx = host.nic_idx_of_qp(&intra).unwrap();
        assert_eq!(idx, [0, 1][intra.hash() as usize % 2]);

        let mut inter = QueuePair::new(3, node_ip(1), node_ip(9), 200, 100);
        inter.src_node = 1;
        inter.dst_node = 9;
        let idx = host.nic_idx_of_qp(&inter).unwrap();
        assert_eq!(idx, [2, 3][inter.hash() as usize % 2]);
    }

    #[test]
    fn missing_route_is_a_configuration_fault() {
        let (host, _ports) = host_with_ports(HostConfig::default(), 1);
        let err = host.add_queue_pair(flow_to(2, 200)).unwrap_err();
        assert!(matches!(err, HostError::NoAliveNic { dip } if dip == node_ip(2)));
    }

    #[test]
    fn check_seq_acks_on_milestone_and_chunk() {
        let cfg = HostConfig {
            ack_interval: 1000,
            chunk: 4000,
            ..HostConfig::default()
        };
        let (host, _ports) = host_with_ports(cfg, 1);
        let mut rxq = RxQueuePair::default();

        rxq.milestone_rx = 1000;
        assert_eq!(host.receiver_check_seq(0, &mut rxq, 1000), SeqDecision::Ack);
        assert_eq!(rxq.expected_seq, 1000);
        assert_eq!(rxq.milestone_rx, 2000);

        // below the milestone and off the chunk boundary: silent
        rxq.milestone_rx = 10_000;
        assert_eq!(host.receiver_check_seq(1000, &mut rxq, 500), SeqDecision::Silent);
        // chunk-aligned in-order arrival acks even below the milestone
        assert_eq!(host.receiver_check_seq(1500, &mut rxq, 2500), SeqDecision::Ack);
        assert_eq!(rxq.expected_seq, 4000);
    }

    #[test]
    fn check_seq_nack_window_suppresses_duplicates() {
        let (host, _ports) = host_with_ports(HostConfig::default(), 1);
        let mut rxq = RxQueuePair::default();
        rxq.expected_seq = 9000;

        assert_eq!(host.receiver_check_seq(10_000, &mut rxq, 1000), SeqDecision::Nack);
        assert_eq!(rxq.last_nack, 9000);
        // same gap, timer still pending
        assert_eq!(
            host.receiver_check_seq(11_000, &mut rxq, 1000),
            SeqDecision::NackSuppressed
        );
        // stale packet below expected
        assert_eq!(
            host.receiver_check_seq(5000, &mut rxq, 1000),
            SeqDecision::Duplicate
        );
        // once the timer expires the same gap nacks again
        host.scheduler().advance_to(SimTime::from_micros(600.0));
        assert_eq!(host.receiver_check_seq(11_000, &mut rxq, 1000), SeqDecision::Nack);
    }

    #[test]
    fn back_to_zero_snaps_expected_to_chunk_boundary() {
        let cfg = HostConfig {
            back_to_0: true,
            chunk: 4000,
            ..HostConfig::default()
        };
        let (host, _ports) = host_with_ports(cfg, 1);
        let mut rxq = RxQueuePair::default();
        rxq.expected_seq = 9000;
        assert_eq!(host.receiver_check_seq(12_000, &mut rxq, 1000), SeqDecision::Nack);
        assert_eq!(rxq.expected_seq, 8000);
    }

    #[test]
    fn change_rate_preserves_the_remaining_wait() {
        let (host, ports) = host_with_ports(HostConfig::default(), 1);
        host.add_table_entry(node_ip(2), 0, false);
        host.add_queue_pair(flow_to(2, 200)).unwrap();
        let qp_arc = host.get_qp(node_ip(2), 200, 3).unwrap();
        let mut qp = qp_arc.lock();
        qp.last_pkt_size = 1000;
        qp.next_avail = SimTime(80); // one packet at 100Gb/s
        let old_rate = qp.rate;
        host.change_rate(&mut qp, DataRate::from_gbps(50)).unwrap();
        // 1000B at 50Gb/s takes 160ns; the gate moves by the 80ns delta
        assert_eq!(qp.next_avail, SimTime(160));
        assert_eq!(qp.rate, DataRate::from_gbps(50));
        assert_ne!(qp.rate, old_rate);
        assert_eq!(*ports[0].next_avail.lock(), Some(SimTime(160)));
    }

    #[test]
    fn pacing_uses_line_rate_when_rate_bound_is_off() {
        let cfg = HostConfig {
            rate_bound: false,
            ..HostConfig::default()
        };
        let (host, _ports) = host_with_ports(cfg, 1);
        host.add_table_entry(node_ip(2), 0, false);
        host.add_queue_pair(flow_to(2, 200)).unwrap();
        let qp_arc = host.get_qp(node_ip(2), 200, 3).unwrap();
        let mut qp = qp_arc.lock();
        qp.rate = DataRate::from_mbps(100);
        host.update_next_avail(&mut qp, SimTime::ZERO, 1000);
        // paced at max_rate (100Gb/s), not the throttled rate
        assert_eq!(qp.next_avail, SimTime(80));
    }

    #[test]
    fn get_nxt_packet_advances_snd_nxt_and_segments_at_mtu() {
        let (host, _ports) = host_with_ports(HostConfig::default(), 1);
        host.add_table_entry(node_ip(2), 0, false);
        let mut req = flow_to(2, 200);
        req.size = 2500;
        host.add_queue_pair(req).unwrap();
        let qp_arc = host.get_qp(node_ip(2), 200, 3).unwrap();

        let sizes: Vec<u32> = (0..3)
            .map(|_| host.get_nxt_packet(&qp_arc).payload_size())
            .collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        let qp = qp_arc.lock();
        assert_eq!(qp.snd_nxt, 2500);
        assert_eq!(qp.ipid, 3);
    }

    #[test]
    fn redistribute_follows_table_changes() {
        let (host, _ports) = host_with_ports(HostConfig::default(), 2);
        host.add_table_entry(node_ip(2), 0, false);
        host.add_queue_pair(flow_to(2, 200)).unwrap();
        let qp_arc = host.get_qp(node_ip(2), 200, 3).unwrap();

        host.clear_table();
        host.add_table_entry(node_ip(2), 1, false);
        host.redistribute_qp().unwrap();
        assert_eq!(host.nic_idx_of_qp(&qp_arc.lock()).unwrap(), 1);
        assert_eq!(host.nics[0].qp_grp.len(), 0);
        assert_eq!(host.nics[1].qp_grp.len(), 1);
    }
}
