//! HPCC over PINT: the aggregate HPCC update fed by a single compressed
//! utilisation value, applied on a sampled subset of ACKs.

use rand::Rng;

use crate::{
    constants::PINT_SAMPLE_SCALE,
    error::Result,
    host::RdmaHost,
    packet::QbbHeader,
    pint,
    queue_pair::{CcState, QueuePair},
    rate::DataRate,
};

impl RdmaHost {
    pub(crate) fn handle_ack_hp_pint(&self, qp: &mut QueuePair, qbb: &QbbHeader) -> Result<()> {
        if self.rng.lock().gen_range(0..PINT_SAMPLE_SCALE) >= self.cfg.pint_smpl_thresh {
            return Ok(());
        }
        let last_update_seq = match qp.cc {
            CcState::Pint(ref pint) => pint.last_update_seq,
            _ => return Ok(()),
        };
        let fast_react = qbb.seq <= last_update_seq;
        self.update_rate_hp_pint(qp, qbb, fast_react)
    }

    fn update_rate_hp_pint(
        &self,
        qp: &mut QueuePair,
        qbb: &QbbHeader,
        fast_react: bool,
    ) -> Result<()> {
        let next_seq = qp.snd_nxt;
        let max_rate = qp.max_rate;
        let mut new_rate = None;
        {
            let CcState::Pint(ref mut pint) = qp.cc else {
                return Ok(());
            };
            if pint.last_update_seq == 0 {
                // first RTT
                pint.last_update_seq = next_seq;
                return Ok(());
            }
            let u = pint::decode_u(qbb.ih.power);
            let max_c = u / self.cfg.target_util;
            let (rate, inc_stage) = if max_c >= 1.0 || pint.inc_stage >= self.cfg.mi_thresh {
                (
                    DataRate::from_bps((pint.cur_rate.bit_rate() as f64 / max_c) as u64)
                        + self.cfg.rai,
                    0,
                )
            } else {
                (pint.cur_rate + self.cfg.rai, pint.inc_stage + 1)
            };
            let rate = rate.clamp(self.cfg.min_rate, max_rate);
            if !fast_react {
                pint.cur_rate = rate;
                pint.inc_stage = inc_stage;
                if next_seq > pint.last_update_seq {
                    pint.last_update_seq = next_seq;
                }
            }
            new_rate = Some(rate);
        }
        if let Some(r) = new_rate {
            self.change_rate(qp, r)?;
        }
        Ok(())
    }
}
