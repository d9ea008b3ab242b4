use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    config::CcMode,
    constants::MAX_HOP,
    packet::IntHop,
    rate::DataRate,
    sim::{EventId, SimTime},
};

/// Map key of a transmit QP: `(dip, sport, pg)`.
pub type QpKey = u64;

pub fn qp_key(dip: u32, sport: u16, pg: u16) -> QpKey {
    (u64::from(dip) << 32) | (u64::from(sport) << 16) | u64::from(pg)
}

/// Map key of a receive QP: `(dip, pg, dport)`.
pub fn rx_qp_key(dip: u32, pg: u16, dport: u16) -> QpKey {
    (u64::from(dip) << 32) | (u64::from(pg) << 16) | u64::from(dport)
}

// FNV-1a over the flow tuple. Port selection must be stable across runs, so
// no per-process hasher state.
fn flow_hash(sip: u32, dip: u32, sport: u16, dport: u16) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    let mut mix = |b: u8| {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x0100_0193);
    };
    for b in sip
        .to_le_bytes()
        .into_iter()
        .chain(dip.to_le_bytes())
        .chain(sport.to_le_bytes())
        .chain(dport.to_le_bytes())
    {
        mix(b);
    }
    h
}

/// Congestion-avoidance state of a DCTCP sender.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CaState {
    #[default]
    Open,
    /// Congestion window reduced; no further decrease until the recorded
    /// high sequence is acknowledged
    Cwr,
}

/// DCQCN (Mellanox QCN) per-QP state.
#[derive(Debug, Default, Clone, Copy)]
pub struct MlxState {
    pub alpha: f64,
    pub alpha_cnp_arrived: bool,
    pub first_cnp: bool,
    pub decrease_cnp_arrived: bool,
    pub rp_time_stage: u32,
    pub target_rate: DataRate,
    pub ev_update_alpha: Option<EventId>,
    pub ev_decrease_rate: Option<EventId>,
    pub ev_rp_timer: Option<EventId>,
}

/// Per-hop rate state for HPCC's multiple-rate mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct HopState {
    pub u: f64,
    pub rc: DataRate,
    pub inc_stage: u32,
}

/// HPCC per-QP state.
#[derive(Debug, Default, Clone, Copy)]
pub struct HpState {
    pub last_update_seq: u64,
    pub cur_rate: DataRate,
    pub inc_stage: u32,
    /// Utilisation EWMA for the aggregate (single-rate) mode
    pub u: f64,
    /// Last INT record seen per hop
    pub hop: [IntHop; MAX_HOP],
    pub hop_state: [HopState; MAX_HOP],
}

/// TIMELY per-QP state.
#[derive(Debug, Default, Clone, Copy)]
pub struct TmlyState {
    pub last_update_seq: u64,
    pub cur_rate: DataRate,
    pub inc_stage: u32,
    pub last_rtt: u64,
    pub rtt_diff: f64,
}

/// DCTCP per-QP state.
#[derive(Debug, Default, Clone, Copy)]
pub struct DctcpState {
    pub alpha: f64,
    pub last_update_seq: u64,
    pub ecn_cnt: u32,
    pub batch_size_of_alpha: u64,
    pub ca_state: CaState,
    pub high_seq: u64,
}

/// HPCC-PINT per-QP state.
#[derive(Debug, Default, Clone, Copy)]
pub struct PintState {
    pub last_update_seq: u64,
    pub cur_rate: DataRate,
    pub inc_stage: u32,
}

/// Congestion-control substate; the variant matches the host's mode.
#[derive(Debug, Clone, Copy)]
pub enum CcState {
    None,
    Mlx(MlxState),
    Hp(HpState),
    Tmly(TmlyState),
    Dctcp(DctcpState),
    Pint(PintState),
}

impl CcState {
    /// Fresh substate for the host's congestion-control mode.
    pub fn for_mode(mode: CcMode) -> CcState {
        match mode {
            CcMode::None => CcState::None,
            CcMode::Dcqcn => CcState::Mlx(MlxState {
                first_cnp: true,
                ..MlxState::default()
            }),
            CcMode::Hpcc => CcState::Hp(HpState::default()),
            CcMode::Timely => CcState::Tmly(TmlyState::default()),
            CcMode::Dctcp => CcState::Dctcp(DctcpState::default()),
            CcMode::HpccPint => CcState::Pint(PintState::default()),
        }
    }

    /// Seeds the substate from the bound port's line rate, as AddQueuePair
    /// and the lazy CNP path both do.
    pub fn seed(&mut self, line_rate: DataRate, multiple_rate: bool) {
        match self {
            CcState::Mlx(mlx) => {
                mlx.target_rate = line_rate;
                mlx.first_cnp = true;
            }
            CcState::Hp(hp) => {
                hp.cur_rate = line_rate;
                if multiple_rate {
                    for hop_state in &mut hp.hop_state {
                        hop_state.rc = line_rate;
                    }
                }
            }
            CcState::Tmly(tmly) => tmly.cur_rate = line_rate,
            CcState::Pint(pint) => pint.cur_rate = line_rate,
            CcState::Dctcp(_) | CcState::None => {}
        }
    }
}

/// A unidirectional reliable RDMA flow on the transmit side.
///
/// Mutated only by the engine (TX path and CC callbacks) and by the bound
/// NIC port through the engine's hooks.
pub struct QueuePair {
    pub src_node: u32,
    pub dst_node: u32,
    /// Opaque application tag
    pub tag: u64,
    pub sip: u32,
    pub dip: u32,
    pub sport: u16,
    pub dport: u16,
    pub pg: u16,

    /// Total bytes to send
    pub size: u64,
    pub initial_size: u64,
    pub snd_nxt: u64,
    pub snd_una: u64,
    pub win: u64,
    pub base_rtt: u64,
    pub var_win: bool,
    pub ipid: u16,

    pub rate: DataRate,
    pub max_rate: DataRate,
    pub last_pkt_size: u32,
    pub next_avail: SimTime,

    pub nvls_enable: bool,
    /// CNPs received on this flow
    pub cnp_cnt: u32,

    pub notify_finish: Option<Box<dyn FnMut() + Send>>,
    pub notify_sent: Option<Box<dyn FnMut() + Send>>,

    pub cc: CcState,
}

impl QueuePair {
    pub fn new(pg: u16, sip: u32, dip: u32, sport: u16, dport: u16) -> Self {
        Self {
            src_node: 0,
            dst_node: 0,
            tag: 0,
            sip,
            dip,
            sport,
            dport,
            pg,
            size: 0,
            initial_size: 0,
            snd_nxt: 0,
            snd_una: 0,
            win: 0,
            base_rtt: 0,
            var_win: false,
            ipid: 0,
            rate: DataRate::ZERO,
            max_rate: DataRate::ZERO,
            last_pkt_size: 0,
            next_avail: SimTime::ZERO,
            nvls_enable: false,
            cnp_cnt: 0,
            notify_finish: None,
            notify_sent: None,
            cc: CcState::None,
        }
    }

    pub fn key(&self) -> QpKey {
        qp_key(self.dip, self.sport, self.pg)
    }

    pub fn hash(&self) -> u32 {
        flow_hash(self.sip, self.dip, self.sport, self.dport)
    }

    pub fn bytes_left(&self) -> u64 {
        self.size.saturating_sub(self.snd_nxt)
    }

    pub fn on_the_fly(&self) -> u64 {
        self.snd_nxt.saturating_sub(self.snd_una)
    }

    /// Effective window: scaled by `rate/max_rate` when variable, never
    /// scaled to zero.
    pub fn current_win(&self) -> u64 {
        if self.win == 0 {
            return 0;
        }
        if self.var_win {
            let w = self.win * self.rate.bit_rate() / self.max_rate.bit_rate().max(1);
            w.max(1)
        } else {
            self.win
        }
    }

    pub fn is_win_bound(&self) -> bool {
        let w = self.current_win();
        w != 0 && self.on_the_fly() >= w
    }

    /// Advances `snd_una`; cumulative, so stale ACKs are no-ops.
    pub fn acknowledge(&mut self, ack: u64) {
        if ack > self.snd_una {
            self.snd_una = ack;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.snd_una >= self.size
    }
}

impl std::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("sip", &self.sip)
            .field("dip", &self.dip)
            .field("sport", &self.sport)
            .field("dport", &self.dport)
            .field("pg", &self.pg)
            .field("size", &self.size)
            .field("snd_nxt", &self.snd_nxt)
            .field("snd_una", &self.snd_una)
            .field("rate", &self.rate)
            .finish_non_exhaustive()
    }
}

/// Per-reverse-flow receive state at the sink, created lazily on the first
/// packet of a flow.
#[derive(Debug, Default, Clone, Copy)]
pub struct RxQueuePair {
    pub sip: u32,
    pub dip: u32,
    pub sport: u16,
    pub dport: u16,

    /// Next byte expected in order
    pub expected_seq: u64,
    /// Byte threshold of the next unconditional ACK
    pub milestone_rx: u64,
    /// Earliest time a duplicate NACK may be re-emitted
    pub nack_timer: SimTime,
    pub last_nack: u64,
    pub ipid: u16,

    /// ECN feedback accumulators for congestion notification
    pub ecn: EcnAccount,
}

/// ECN marks observed on a receive flow, aggregated for CNP feedback.
#[derive(Debug, Default, Clone, Copy)]
pub struct EcnAccount {
    /// Priority group the marks were observed on
    pub qindex: u16,
    pub ecn_bits: u8,
    /// Marked packets
    pub qfb: u16,
    /// All packets
    pub total: u16,
}

impl RxQueuePair {
    pub fn hash(&self) -> u32 {
        flow_hash(self.sip, self.dip, self.sport, self.dport)
    }
}

pub type SharedQp = Arc<Mutex<QueuePair>>;
pub type SharedRxQp = Arc<Mutex<RxQueuePair>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn qp() -> QueuePair {
        let mut qp = QueuePair::new(3, 0x0b000001, 0x0b000101, 100, 200);
        qp.size = 10_000;
        qp.win = 4000;
        qp.rate = DataRate::from_gbps(50);
        qp.max_rate = DataRate::from_gbps(100);
        qp
    }

    #[test]
    fn key_packs_dip_sport_pg() {
        let qp = qp();
        assert_eq!(qp.key(), (0x0b000101u64 << 32) | (100u64 << 16) | 3);
        assert_eq!(
            rx_qp_key(0x0b000101, 3, 200),
            (0x0b000101u64 << 32) | (3u64 << 16) | 200
        );
    }

    #[test]
    fn hash_is_deterministic_and_spreads() {
        let a = qp().hash();
        assert_eq!(a, qp().hash());
        let mut other = qp();
        other.sport = 101;
        assert_ne!(a, other.hash());
    }

    #[test]
    fn window_accessors() {
        let mut qp = qp();
        qp.snd_nxt = 5000;
        qp.snd_una = 2000;
        assert_eq!(qp.bytes_left(), 5000);
        assert_eq!(qp.on_the_fly(), 3000);
        // fixed window
        assert_eq!(qp.current_win(), 4000);
        assert!(!qp.is_win_bound());
        qp.snd_nxt = 6001;
        assert!(qp.is_win_bound());
        // variable window scales with rate
        qp.var_win = true;
        assert_eq!(qp.current_win(), 2000);
        // and never drops to zero while the window is configured
        qp.rate = DataRate::ZERO;
        assert_eq!(qp.current_win(), 1);
    }

    #[test]
    fn acknowledge_is_cumulative() {
        let mut qp = qp();
        qp.snd_nxt = 4000;
        qp.acknowledge(3000);
        assert_eq!(qp.snd_una, 3000);
        qp.acknowledge(1000);
        assert_eq!(qp.snd_una, 3000);
        qp.acknowledge(10_000);
        assert!(qp.is_finished());
    }

    #[test]
    fn cc_seed_sets_line_rate() {
        let line = DataRate::from_gbps(100);
        let mut cc = CcState::Hp(HpState::default());
        cc.seed(line, true);
        match cc {
            CcState::Hp(hp) => {
                assert_eq!(hp.cur_rate, line);
                assert!(hp.hop_state.iter().all(|h| h.rc == line));
            }
            _ => unreachable!(),
        }
    }
}
