//! Mellanox-style DCQCN.
//!
//! Rate-based ECN reaction: CNP arrivals drive an alpha EWMA and a periodic
//! multiplicative decrease; a reaction-point timer walks the increase phases
//! (fast recovery, active increase, hyper increase). All three timers are
//! armed by the first CNP and cancelled on QP completion.

use log::trace;

use crate::{
    error::Result,
    host::RdmaHost,
    queue_pair::{CcState, QueuePair, SharedQp},
    rate::DataRate,
    sim::{SimTime, TimerEvent},
};

impl RdmaHost {
    /// ECN-echo arrived on an ACK for `qp`.
    pub(crate) fn cnp_received_mlx(&self, qp: &mut QueuePair) -> Result<()> {
        let key = qp.key();
        let rate = qp.rate;
        let mut new_rate = None;
        {
            let CcState::Mlx(ref mut mlx) = qp.cc else {
                return Ok(());
            };
            mlx.alpha_cnp_arrived = true;
            mlx.decrease_cnp_arrived = true;
            if mlx.first_cnp {
                mlx.alpha = 1.0;
                mlx.alpha_cnp_arrived = false;
                mlx.ev_update_alpha = Some(self.sched.schedule(
                    SimTime::from_micros(self.cfg.alpha_resume_interval),
                    TimerEvent::UpdateAlpha(key),
                ));
                // 1ns later, so the decrease check runs after the alpha
                // update when both land in the same interval
                mlx.ev_decrease_rate = Some(self.sched.schedule(
                    SimTime::from_micros(self.cfg.rate_decrease_interval) + SimTime(1),
                    TimerEvent::CheckRateDecrease(key),
                ));
                let r = rate * self.cfg.rate_on_first_cnp;
                mlx.target_rate = r;
                mlx.first_cnp = false;
                new_rate = Some(r);
                trace!("node {}: first CNP on qp {key:#x}, rate {rate} -> {r}", self.node_id);
            }
        }
        if let Some(r) = new_rate {
            self.change_rate(qp, r)?;
        }
        Ok(())
    }

    /// Periodic alpha EWMA against the binary CNP-arrived feedback.
    pub(crate) fn update_alpha_mlx(&self, qp_arc: &SharedQp) {
        let mut qp = qp_arc.lock();
        let key = qp.key();
        let g = self.cfg.g;
        let next = self.sched.schedule(
            SimTime::from_micros(self.cfg.alpha_resume_interval),
            TimerEvent::UpdateAlpha(key),
        );
        let CcState::Mlx(ref mut mlx) = qp.cc else {
            self.sched.cancel(next);
            return;
        };
        if mlx.alpha_cnp_arrived {
            mlx.alpha = (1.0 - g) * mlx.alpha + g;
        } else {
            mlx.alpha = (1.0 - g) * mlx.alpha;
        }
        mlx.alpha_cnp_arrived = false;
        mlx.ev_update_alpha = Some(next);
    }

    /// Periodic decrease check: cuts the rate by `alpha/2` if a CNP arrived
    /// since the last check and rewinds the increase phase.
    pub(crate) fn check_rate_decrease_mlx(&self, qp_arc: &SharedQp) -> Result<()> {
        let mut qp = qp_arc.lock();
        let key = qp.key();
        let next = self.sched.schedule(
            SimTime::from_micros(self.cfg.rate_decrease_interval),
            TimerEvent::CheckRateDecrease(key),
        );
        let rate = qp.rate;
        let min_rate = self.cfg.min_rate;
        let clamp_cfg = self.cfg.clamp_target_rate;
        let mut new_rate = None;
        {
            let CcState::Mlx(ref mut mlx) = qp.cc else {
                self.sched.cancel(next);
                return Ok(());
            };
            mlx.ev_decrease_rate = Some(next);
            if !mlx.decrease_cnp_arrived {
                return Ok(());
            }
            // Clamp unless clamping is off and no increase stage has run yet.
            if clamp_cfg || mlx.rp_time_stage != 0 {
                mlx.target_rate = rate;
            }
            new_rate = Some(min_rate.max(rate * (1.0 - mlx.alpha / 2.0)));
            mlx.rp_time_stage = 0;
            mlx.decrease_cnp_arrived = false;
            if let Some(id) = mlx.ev_rp_timer.take() {
                self.sched.cancel(id);
            }
            mlx.ev_rp_timer = Some(self.sched.schedule(
                SimTime::from_micros(self.cfg.rp_timer),
                TimerEvent::RateIncrease(key),
            ));
        }
        if let Some(r) = new_rate {
            trace!("node {}: rate decrease on qp {key:#x}, {rate} -> {r}", self.node_id);
            self.change_rate(&mut qp, r)?;
        }
        Ok(())
    }

    /// Reaction-point timer tick: one increase step, then advance the phase
    /// counter.
    pub(crate) fn rate_inc_event_timer_mlx(&self, qp_arc: &SharedQp) -> Result<()> {
        let mut qp = qp_arc.lock();
        let key = qp.key();
        let next = self.sched.schedule(
            SimTime::from_micros(self.cfg.rp_timer),
            TimerEvent::RateIncrease(key),
        );
        match qp.cc {
            CcState::Mlx(ref mut mlx) => mlx.ev_rp_timer = Some(next),
            _ => {
                self.sched.cancel(next);
                return Ok(());
            }
        }
        self.rate_inc_event_mlx(&mut qp)?;
        if let CcState::Mlx(ref mut mlx) = qp.cc {
            mlx.rp_time_stage += 1;
        }
        Ok(())
    }

    fn rate_inc_event_mlx(&self, qp: &mut QueuePair) -> Result<()> {
        let stage = match qp.cc {
            CcState::Mlx(ref mlx) => mlx.rp_time_stage,
            _ => return Ok(()),
        };
        if stage < self.cfg.fast_recovery_times {
            self.fast_recovery_mlx(qp)
        } else if stage == self.cfg.fast_recovery_times {
            self.active_increase_mlx(qp)
        } else {
            self.hyper_increase_mlx(qp)
        }
    }

    /// Fast recovery: close half the gap to the target rate.
    fn fast_recovery_mlx(&self, qp: &mut QueuePair) -> Result<()> {
        let rate = qp.rate;
        let CcState::Mlx(ref mlx) = qp.cc else {
            return Ok(());
        };
        let new_rate = half_way(rate, mlx.target_rate);
        self.change_rate(qp, new_rate)
    }

    /// Active increase: push the target up by `rai`, then close half the
    /// gap.
    fn active_increase_mlx(&self, qp: &mut QueuePair) -> Result<()> {
        let nic_idx = self.nic_idx_of_qp(qp)?;
        let line_rate = self.dev(nic_idx, qp.dip)?.data_rate();
        let rate = qp.rate;
        let rai = self.cfg.rai;
        let new_rate = {
            let CcState::Mlx(ref mut mlx) = qp.cc else {
                return Ok(());
            };
            mlx.target_rate = (mlx.target_rate + rai).min(line_rate);
            half_way(rate, mlx.target_rate)
        };
        self.change_rate(qp, new_rate)
    }

    /// Hyper increase: as active increase but with the `rhai` step.
    fn hyper_increase_mlx(&self, qp: &mut QueuePair) -> Result<()> {
        let nic_idx = self.nic_idx_of_qp(qp)?;
        let line_rate = self.dev(nic_idx, qp.dip)?.data_rate();
        let rate = qp.rate;
        let rhai = self.cfg.rhai;
        let new_rate = {
            let CcState::Mlx(ref mut mlx) = qp.cc else {
                return Ok(());
            };
            mlx.target_rate = (mlx.target_rate + rhai).min(line_rate);
            half_way(rate, mlx.target_rate)
        };
        self.change_rate(qp, new_rate)
    }
}

fn half_way(rate: DataRate, target: DataRate) -> DataRate {
    DataRate::from_bps(rate.bit_rate() / 2 + target.bit_rate() / 2)
}
