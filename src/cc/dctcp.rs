//! DCTCP adapted to rate-based pacing.
//!
//! ECN echoes are counted per RTT-sized batch into an alpha EWMA; a mark
//! outside congestion-window-reduced state cuts the rate by `alpha/2`, and
//! each marked-free batch earns one additive increase.

use crate::{
    error::Result,
    host::RdmaHost,
    packet::QbbHeader,
    queue_pair::{CaState, CcState, QueuePair},
};

impl RdmaHost {
    pub(crate) fn handle_ack_dctcp(&self, qp: &mut QueuePair, qbb: &QbbHeader) -> Result<()> {
        let ack_seq = qbb.seq;
        let cnp = qbb.is_cnp();
        let snd_nxt = qp.snd_nxt;
        let rate = qp.rate;
        let max_rate = qp.max_rate;
        let min_rate = self.cfg.min_rate;
        let mtu = u64::from(self.cfg.mtu.max(1));
        let g = self.cfg.g;

        let mut new_rate = None;
        {
            let CcState::Dctcp(ref mut dctcp) = qp.cc else {
                return Ok(());
            };
            dctcp.ecn_cnt += u32::from(cnp);

            // Alpha update at batch end.
            let mut new_batch = false;
            if ack_seq > dctcp.last_update_seq {
                new_batch = true;
                if dctcp.last_update_seq == 0 {
                    // first RTT
                    dctcp.last_update_seq = snd_nxt;
                    dctcp.batch_size_of_alpha = snd_nxt / mtu + 1;
                } else {
                    let frac = 1f64
                        .min(f64::from(dctcp.ecn_cnt) / dctcp.batch_size_of_alpha as f64);
                    dctcp.alpha = (1.0 - g) * dctcp.alpha + g * frac;
                    dctcp.last_update_seq = snd_nxt;
                    dctcp.ecn_cnt = 0;
                    dctcp.batch_size_of_alpha = (snd_nxt - ack_seq) / mtu + 1;
                }
            }

            // Leave CWR once the reduction's high-water mark is acked.
            if dctcp.ca_state == CaState::Cwr && ack_seq > dctcp.high_seq {
                dctcp.ca_state = CaState::Open;
            }

            if cnp && dctcp.ca_state == CaState::Open {
                new_rate = Some(min_rate.max(rate * (1.0 - dctcp.alpha / 2.0)));
                dctcp.ca_state = CaState::Cwr;
                dctcp.high_seq = snd_nxt;
            } else if dctcp.ca_state == CaState::Open && new_batch {
                new_rate = Some((rate + self.cfg.dctcp_rai).min(max_rate));
            }
        }
        if let Some(r) = new_rate {
            self.change_rate(qp, r)?;
        }
        Ok(())
    }
}
