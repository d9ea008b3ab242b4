use std::{
    fmt::Display,
    ops::{Add, AddAssign, Mul},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::sim::SimTime;

/// A transmission rate in bits per second.
///
/// Parses from and formats to the textual form configuration files use
/// (`"100Gb/s"`, `"5Mb/s"`, `"1500b/s"`).
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct DataRate(u64);

impl DataRate {
    pub const ZERO: DataRate = DataRate(0);

    pub fn from_bps(bps: u64) -> Self {
        DataRate(bps)
    }

    pub fn from_gbps(gbps: u64) -> Self {
        DataRate(gbps * 1_000_000_000)
    }

    pub fn from_mbps(mbps: u64) -> Self {
        DataRate(mbps * 1_000_000)
    }

    pub fn bit_rate(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Time to clock `bytes` onto the wire at this rate.
    ///
    /// A zero rate stalls the sender until lazy initialisation reseeds it.
    pub fn bytes_tx_time(self, bytes: u64) -> SimTime {
        if bytes == 0 {
            return SimTime::ZERO;
        }
        if self.0 == 0 {
            return SimTime(u64::MAX);
        }
        let ns = (u128::from(bytes) * 8 * 1_000_000_000) / u128::from(self.0);
        SimTime(ns.min(u128::from(u64::MAX)) as u64)
    }
}

impl Add for DataRate {
    type Output = DataRate;

    fn add(self, rhs: DataRate) -> DataRate {
        DataRate(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for DataRate {
    fn add_assign(&mut self, rhs: DataRate) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Mul<f64> for DataRate {
    type Output = DataRate;

    fn mul(self, rhs: f64) -> DataRate {
        DataRate((self.0 as f64 * rhs) as u64)
    }
}

impl FromStr for DataRate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .trim()
            .strip_suffix("b/s")
            .ok_or_else(|| format!("data rate `{s}` is missing a `b/s` suffix"))?;
        let (digits, scale) = match body.as_bytes().last() {
            Some(b'K') => (&body[..body.len() - 1], 1e3),
            Some(b'M') => (&body[..body.len() - 1], 1e6),
            Some(b'G') => (&body[..body.len() - 1], 1e9),
            Some(b'T') => (&body[..body.len() - 1], 1e12),
            _ => (body, 1.0),
        };
        let value: f64 = digits
            .trim()
            .parse()
            .map_err(|_| format!("invalid data rate `{s}`"))?;
        if value < 0.0 {
            return Err(format!("negative data rate `{s}`"));
        }
        Ok(DataRate((value * scale) as u64))
    }
}

impl TryFrom<String> for DataRate {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DataRate> for String {
    fn from(r: DataRate) -> String {
        r.to_string()
    }
}

impl Display for DataRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            n if n >= 1_000_000_000 && n % 1_000_000_000 == 0 => {
                write!(f, "{}Gb/s", n / 1_000_000_000)
            }
            n if n >= 1_000_000 && n % 1_000_000 == 0 => write!(f, "{}Mb/s", n / 1_000_000),
            n if n >= 1_000 && n % 1_000 == 0 => write!(f, "{}Kb/s", n / 1_000),
            n => write!(f, "{n}b/s"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_textual_forms() {
        assert_eq!("100Gb/s".parse::<DataRate>().unwrap(), DataRate::from_gbps(100));
        assert_eq!("5Mb/s".parse::<DataRate>().unwrap(), DataRate::from_mbps(5));
        assert_eq!("1500Kb/s".parse::<DataRate>().unwrap(), DataRate(1_500_000));
        assert_eq!("42b/s".parse::<DataRate>().unwrap(), DataRate(42));
        assert_eq!("2.5Gb/s".parse::<DataRate>().unwrap(), DataRate(2_500_000_000));
        assert!("100".parse::<DataRate>().is_err());
        assert!("xGb/s".parse::<DataRate>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for r in [
            DataRate::from_gbps(100),
            DataRate::from_mbps(5),
            DataRate(1_500_000),
            DataRate(42),
        ] {
            assert_eq!(r.to_string().parse::<DataRate>().unwrap(), r);
        }
    }

    #[test]
    fn bytes_tx_time_at_line_rate() {
        // 1000 bytes at 100Gb/s = 80ns
        let r = DataRate::from_gbps(100);
        assert_eq!(r.bytes_tx_time(1000), SimTime(80));
        // 1000 bytes at 1Gb/s = 8us
        assert_eq!(DataRate::from_gbps(1).bytes_tx_time(1000), SimTime(8000));
        // zero rate stalls
        assert_eq!(DataRate::ZERO.bytes_tx_time(1), SimTime(u64::MAX));
    }

    #[test]
    fn scaling_keeps_floor() {
        let r = DataRate::from_gbps(100);
        assert_eq!(r * 0.5, DataRate::from_gbps(50));
        assert_eq!(r * 1.0, r);
    }
}
