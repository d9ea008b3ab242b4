//! Line-oriented telemetry sinks.
//!
//! Every printer is sample-on-change: a record is skipped when its value
//! matches the last one emitted for the same key. Sinks are plain writers;
//! the monitoring loop owns the files and the sampling cadence.

use std::{
    collections::HashMap,
    io::{self, Write},
};

use crate::{host::RdmaHost, queue_pair::QpKey};

/// Last-emitted values per sink, kept by the host.
#[derive(Debug, Default)]
pub(crate) struct TelemetryState {
    pub(crate) last_tx_bytes: Vec<u64>,
    pub(crate) last_qp_rate: HashMap<QpKey, u64>,
    pub(crate) last_qp_cnp: HashMap<QpKey, u32>,
}

impl RdmaHost {
    /// `time, host_id, port_id, bandwidth_gbps` for every port whose
    /// counter moved during the last `bw_mon_interval_us` microseconds.
    pub fn print_host_bw(&self, out: &mut dyn Write, bw_mon_interval_us: u64) -> io::Result<()> {
        let tx = self.tx_bytes.lock();
        let mut t = self.telemetry.lock();
        if t.last_tx_bytes.len() < tx.len() {
            t.last_tx_bytes.resize(tx.len(), 0);
        }
        for (i, &bytes) in tx.iter().enumerate() {
            if bytes == t.last_tx_bytes[i] {
                continue;
            }
            let bw_gbps = (bytes - t.last_tx_bytes[i]) as f64 * 8.0 * 1e6
                / bw_mon_interval_us as f64
                / 1e9;
            writeln!(
                out,
                "{}, {}, {}, {:.6}",
                self.sched.now().nanos(),
                self.node_id,
                i,
                bw_gbps
            )?;
            t.last_tx_bytes[i] = bytes;
        }
        Ok(())
    }

    /// `time, src, dst, sport, dport, size, rate_bps` for every QP whose
    /// rate changed since the last emission.
    pub fn print_qp_rate(&self, out: &mut dyn Write) -> io::Result<()> {
        let qps: Vec<_> = self
            .qp_map
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        let mut t = self.telemetry.lock();
        for (key, qp_arc) in qps {
            let qp = qp_arc.lock();
            let rate = qp.rate.bit_rate();
            if t.last_qp_rate.get(&key).copied().unwrap_or(0) == rate {
                continue;
            }
            writeln!(
                out,
                "{}, {}, {}, {}, {}, {}, {}",
                self.sched.now().nanos(),
                qp.src_node,
                qp.dst_node,
                qp.sport,
                qp.dport,
                qp.size,
                rate
            )?;
            t.last_qp_rate.insert(key, rate);
        }
        Ok(())
    }

    /// `time, src, dst, sport, dport, size, cnp_count` for every QP whose
    /// CNP count changed since the last emission.
    pub fn print_qp_cnp(&self, out: &mut dyn Write) -> io::Result<()> {
        let qps: Vec<_> = self
            .qp_map
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        let mut t = self.telemetry.lock();
        for (key, qp_arc) in qps {
            let qp = qp_arc.lock();
            if t.last_qp_cnp.get(&key).copied().unwrap_or(0) == qp.cnp_cnt {
                continue;
            }
            writeln!(
                out,
                "{}, {}, {}, {}, {}, {}, {}",
                self.sched.now().nanos(),
                qp.src_node,
                qp.dst_node,
                qp.sport,
                qp.dport,
                qp.size,
                qp.cnp_cnt
            )?;
            t.last_qp_cnp.insert(key, qp.cnp_cnt);
        }
        Ok(())
    }
}
