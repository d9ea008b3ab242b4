//! TIMELY: RTT-gradient rate control.
//!
//! The ACK's telemetry carries the sender timestamp of the triggering data
//! packet; the RTT and its smoothed gradient decide between additive
//! increase and multiplicative decrease. There is no fast-react path: rate
//! moves once per RTT of feedback.

use crate::{
    error::Result,
    host::RdmaHost,
    packet::QbbHeader,
    queue_pair::{CcState, QueuePair},
};

impl RdmaHost {
    pub(crate) fn handle_ack_timely(&self, qp: &mut QueuePair, qbb: &QbbHeader) -> Result<()> {
        let last_update_seq = match qp.cc {
            CcState::Tmly(ref tmly) => tmly.last_update_seq,
            _ => return Ok(()),
        };
        if qbb.seq > last_update_seq {
            self.update_rate_timely(qp, qbb)?;
        }
        Ok(())
    }

    fn update_rate_timely(&self, qp: &mut QueuePair, qbb: &QbbHeader) -> Result<()> {
        let next_seq = qp.snd_nxt;
        let rtt = self.sched.now().nanos().saturating_sub(qbb.ih.ts);
        let max_rate = qp.max_rate;
        let min_rate = self.cfg.min_rate;
        let t = self.cfg.timely;
        let mut new_rate = None;
        {
            let CcState::Tmly(ref mut tmly) = qp.cc else {
                return Ok(());
            };
            if tmly.last_update_seq != 0 {
                let new_rtt_diff = rtt as i64 - tmly.last_rtt as i64;
                let rtt_diff = (1.0 - t.alpha) * tmly.rtt_diff + t.alpha * new_rtt_diff as f64;
                let gradient = rtt_diff / t.min_rtt as f64;
                let inc = if rtt < t.t_low {
                    true
                } else if rtt > t.t_high {
                    false
                } else {
                    gradient <= 0.0
                };
                if inc {
                    let step = if tmly.inc_stage < 5 {
                        self.cfg.rai
                    } else {
                        self.cfg.rhai
                    };
                    let r = (tmly.cur_rate + step).min(max_rate);
                    tmly.cur_rate = r;
                    tmly.inc_stage += 1;
                    tmly.rtt_diff = rtt_diff;
                    new_rate = Some(r);
                } else {
                    let c = if rtt > t.t_high {
                        1.0 - t.beta * (1.0 - t.t_high as f64 / rtt as f64)
                    } else {
                        (1.0 - t.beta * gradient).max(0.0)
                    };
                    let r = min_rate.max(tmly.cur_rate * c);
                    tmly.cur_rate = r;
                    tmly.inc_stage = 0;
                    tmly.rtt_diff = rtt_diff;
                    new_rate = Some(r);
                }
            }
            if next_seq > tmly.last_update_seq {
                tmly.last_update_seq = next_seq;
                tmly.last_rtt = rtt;
            }
        }
        if let Some(r) = new_rate {
            self.change_rate(qp, r)?;
        }
        Ok(())
    }
}
