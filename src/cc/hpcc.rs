//! HPCC: telemetry-driven high-precision congestion control.
//!
//! Every ACK carries the per-hop INT records of the data packet that
//! triggered it. A full update runs once per RTT (when the ACK passes the
//! last snapshot of `snd_nxt`); in between, fast reactions run the same
//! computation without persisting the reference state.

use crate::{
    constants::MAX_HOP,
    error::Result,
    host::RdmaHost,
    packet::QbbHeader,
    queue_pair::{CcState, QueuePair},
    rate::DataRate,
};

impl RdmaHost {
    pub(crate) fn handle_ack_hp(&self, qp: &mut QueuePair, qbb: &QbbHeader) -> Result<()> {
        let last_update_seq = match qp.cc {
            CcState::Hp(ref hp) => hp.last_update_seq,
            _ => return Ok(()),
        };
        if qbb.seq > last_update_seq {
            self.update_rate_hp(qp, qbb, false)
        } else if self.cfg.fast_react {
            self.update_rate_hp(qp, qbb, true)
        } else {
            Ok(())
        }
    }

    fn update_rate_hp(&self, qp: &mut QueuePair, qbb: &QbbHeader, fast_react: bool) -> Result<()> {
        let next_seq = qp.snd_nxt;
        let ih = qbb.ih;
        let max_rate = qp.max_rate;
        let win = qp.win;
        let base_rtt = qp.base_rtt.max(1);

        let mut new_rate = DataRate::ZERO;
        let mut new_inc_stage = 0u32;
        let mut new_rate_per_hop = [DataRate::ZERO; MAX_HOP];
        let mut new_inc_stage_per_hop = [0u32; MAX_HOP];
        let mut updated = [false; MAX_HOP];
        let mut updated_any = false;

        {
            let CcState::Hp(ref mut hp) = qp.cc else {
                return Ok(());
            };
            if hp.last_update_seq == 0 {
                // First RTT: snapshot only.
                hp.last_update_seq = next_seq;
                for (slot, h) in hp.hop.iter_mut().zip(ih.hops()) {
                    *slot = *h;
                }
                return Ok(());
            }

            // Utilisation per hop; the EWMA weight is the hop's own
            // feedback interval relative to the base RTT.
            let mut max_u = 0f64;
            let mut dt = 0u64;
            for (i, h) in ih.hops().iter().enumerate() {
                if self.cfg.sample_feedback && h.qlen == 0 && fast_react {
                    continue;
                }
                updated[i] = true;
                updated_any = true;

                let tau = h.time_delta(&hp.hop[i]);
                let duration = tau as f64 * 1e-9;
                let tx_rate = h.bytes_delta(&hp.hop[i]) as f64 * 8.0 / duration;
                let qlen_term = if win > 0 {
                    f64::from(h.qlen.min(hp.hop[i].qlen)) * max_rate.bit_rate() as f64
                        / h.line_rate.bit_rate() as f64
                        / win as f64
                } else {
                    0.0
                };
                let u = tx_rate / h.line_rate.bit_rate() as f64 + qlen_term;

                if self.cfg.multiple_rate {
                    let tau = tau.min(base_rtt);
                    hp.hop_state[i].u = (hp.hop_state[i].u * (base_rtt - tau) as f64
                        + u * tau as f64)
                        / base_rtt as f64;
                } else if u > max_u {
                    max_u = u;
                    dt = tau;
                }
                hp.hop[i] = *h;
            }

            if !self.cfg.multiple_rate {
                // Aggregate: one EWMA, one rate.
                if updated_any {
                    let dt = dt.min(base_rtt);
                    hp.u = (hp.u * (base_rtt - dt) as f64 + max_u * dt as f64) / base_rtt as f64;
                    let max_c = hp.u / self.cfg.target_util;
                    if max_c >= 1.0 || hp.inc_stage >= self.cfg.mi_thresh {
                        new_rate = DataRate::from_bps(
                            (hp.cur_rate.bit_rate() as f64 / max_c) as u64,
                        ) + self.cfg.rai;
                        new_inc_stage = 0;
                    } else {
                        new_rate = hp.cur_rate + self.cfg.rai;
                        new_inc_stage = hp.inc_stage + 1;
                    }
                    new_rate = new_rate.clamp(self.cfg.min_rate, max_rate);
                }
            } else {
                // Per hop: one rate each, the flow takes the minimum. Hops
                // without fresh telemetry still contribute their previous
                // rate to the minimum.
                new_rate = max_rate;
                for i in 0..ih.n_hop() {
                    if updated[i] {
                        let c = hp.hop_state[i].u / self.cfg.target_util;
                        let (rate, inc_stage) =
                            if c >= 1.0 || hp.hop_state[i].inc_stage >= self.cfg.mi_thresh {
                                (
                                    DataRate::from_bps(
                                        (hp.hop_state[i].rc.bit_rate() as f64 / c) as u64,
                                    ) + self.cfg.rai,
                                    0,
                                )
                            } else {
                                (hp.hop_state[i].rc + self.cfg.rai, hp.hop_state[i].inc_stage + 1)
                            };
                        let rate = rate.clamp(self.cfg.min_rate, max_rate);
                        new_rate_per_hop[i] = rate;
                        new_inc_stage_per_hop[i] = inc_stage;
                        if rate < new_rate {
                            new_rate = rate;
                        }
                    } else if hp.hop_state[i].rc < new_rate {
                        new_rate = hp.hop_state[i].rc;
                    }
                }
            }

            if !fast_react {
                if updated_any {
                    hp.cur_rate = new_rate;
                    hp.inc_stage = new_inc_stage;
                }
                if self.cfg.multiple_rate {
                    for i in 0..ih.n_hop() {
                        if updated[i] {
                            hp.hop_state[i].rc = new_rate_per_hop[i];
                            hp.hop_state[i].inc_stage = new_inc_stage_per_hop[i];
                        }
                    }
                }
                if next_seq > hp.last_update_seq {
                    hp.last_update_seq = next_seq;
                }
            }
        }

        if updated_any {
            self.change_rate(qp, new_rate)?;
        }
        Ok(())
    }
}
