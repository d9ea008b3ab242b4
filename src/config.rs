use serde::{Deserialize, Serialize};

use crate::rate::DataRate;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Which congestion-control state machine a host runs.
///
/// Chosen once per host for its process lifetime; every QP carries the
/// matching substate.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CcMode {
    /// No reaction to congestion feedback
    #[default]
    None,
    Dcqcn,
    Hpcc,
    Timely,
    Dctcp,
    HpccPint,
}

impl CcMode {
    /// Numeric mode codes, as configuration surfaces historically used them.
    pub fn from_code(code: u32) -> Option<CcMode> {
        match code {
            0 => Some(CcMode::None),
            1 => Some(CcMode::Dcqcn),
            3 => Some(CcMode::Hpcc),
            7 => Some(CcMode::Timely),
            8 => Some(CcMode::Dctcp),
            10 => Some(CcMode::HpccPint),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            CcMode::None => 0,
            CcMode::Dcqcn => 1,
            CcMode::Hpcc => 3,
            CcMode::Timely => 7,
            CcMode::Dctcp => 8,
            CcMode::HpccPint => 10,
        }
    }
}

/// TIMELY parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelyConfig {
    /// RTT-difference EWMA weight
    pub alpha: f64,
    /// Multiplicative decrease factor
    pub beta: f64,
    /// Below this RTT (ns) always increase
    pub t_low: u64,
    /// Above this RTT (ns) always decrease
    pub t_high: u64,
    /// RTT normaliser (ns) for the gradient
    pub min_rtt: u64,
}

impl Default for TimelyConfig {
    fn default() -> Self {
        Self {
            alpha: 0.875,
            beta: 0.8,
            t_low: 50_000,
            t_high: 500_000,
            min_rtt: 20_000,
        }
    }
}

/// Host engine attributes.
///
/// Defaults mirror the simulation's canonical attribute table; intervals are
/// microseconds unless the name says otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Minimum rate of a throttled flow
    pub min_rate: DataRate,
    pub mtu: u32,
    pub cc_mode: CcMode,
    /// NACK generation interval in microseconds
    pub nack_interval: f64,
    /// Layer 2 chunk size in bytes; 0 disables chunk mode
    pub chunk: u32,
    /// Layer 2 ACK interval in bytes; 0 disables ACKs
    pub ack_interval: u32,
    /// Layer 2 go-back-to-zero transmission
    pub back_to_0: bool,
    /// EWMA gain for the level of rate decrease
    pub g: f64,
    /// Fraction of rate kept on the first CNP
    pub rate_on_first_cnp: f64,
    pub clamp_target_rate: bool,
    /// Rate increase timer at the reaction point, microseconds
    pub rp_timer: f64,
    /// Rate decrease check interval, microseconds
    pub rate_decrease_interval: f64,
    /// Rate-increase stages spent in fast recovery
    pub fast_recovery_times: u32,
    /// Alpha resume interval, microseconds
    pub alpha_resume_interval: f64,
    /// Rate increment unit in the additive increase period
    pub rai: DataRate,
    /// Rate increment unit in the hyperactive increase period
    pub rhai: DataRate,
    /// Scale the window with rate/max_rate
    pub var_win: bool,
    /// React to feedback before a full RTT of it is ready
    pub fast_react: bool,
    /// Consecutive additive increases before multiplicative increase
    pub mi_thresh: u32,
    /// Target utilisation of the bottleneck bandwidth
    pub target_util: f64,
    /// Upper bound of the target utilisation
    pub util_high: f64,
    /// Bound packet sending by rate; disabling paces at line rate, for test
    /// runs only
    pub rate_bound: bool,
    /// Maintain one rate per hop in HPCC
    pub multiple_rate: bool,
    /// Skip congestion-free hops on fast reactions
    pub sample_feedback: bool,
    pub timely: TimelyConfig,
    /// DCTCP rate increment unit in the additive increase period
    pub dctcp_rai: DataRate,
    /// PINT sampling threshold out of 65536
    pub pint_smpl_thresh: u32,
    /// GPUs per server, used to tell intra-server flows apart
    pub gpus_per_server: u32,
    pub nvls_enable: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            min_rate: DataRate::from_mbps(100),
            mtu: 1000,
            cc_mode: CcMode::None,
            nack_interval: 500.0,
            chunk: 0,
            ack_interval: 0,
            back_to_0: false,
            g: 1.0 / 16.0,
            rate_on_first_cnp: 1.0,
            clamp_target_rate: false,
            rp_timer: 1500.0,
            rate_decrease_interval: 4.0,
            fast_recovery_times: 5,
            alpha_resume_interval: 55.0,
            rai: DataRate::from_mbps(5),
            rhai: DataRate::from_mbps(50),
            var_win: false,
            fast_react: true,
            mi_thresh: 5,
            target_util: 0.95,
            util_high: 0.98,
            rate_bound: true,
            multiple_rate: true,
            sample_feedback: false,
            timely: TimelyConfig::default(),
            dctcp_rai: DataRate::from_mbps(1000),
            pint_smpl_thresh: 65536,
            gpus_per_server: 1,
            nvls_enable: false,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the configuration from the specified path.
    pub fn load_from_path(path: &str) -> Result<HostConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<HostConfig, ConfigError> {
        let config: HostConfig = toml::from_str(content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_attribute_table() {
        let cfg = HostConfig::default();
        assert_eq!(cfg.min_rate, DataRate::from_mbps(100));
        assert_eq!(cfg.mtu, 1000);
        assert_eq!(cfg.cc_mode, CcMode::None);
        assert_eq!(cfg.fast_recovery_times, 5);
        assert_eq!(cfg.rai, DataRate::from_mbps(5));
        assert_eq!(cfg.pint_smpl_thresh, 65536);
        assert!(cfg.rate_bound);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let cfg = ConfigLoader::load_from_str(
            r#"
            cc_mode = "dcqcn"
            ack_interval = 1000
            rate_on_first_cnp = 0.5
            rai = "40Mb/s"

            [timely]
            t_low = 60000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.cc_mode, CcMode::Dcqcn);
        assert_eq!(cfg.ack_interval, 1000);
        assert_eq!(cfg.rai, DataRate::from_mbps(40));
        assert_eq!(cfg.timely.t_low, 60_000);
        // untouched fields keep their defaults
        assert_eq!(cfg.mtu, 1000);
        assert_eq!(cfg.timely.t_high, 500_000);
    }

    #[test]
    fn cc_mode_codes_round_trip() {
        for mode in [
            CcMode::None,
            CcMode::Dcqcn,
            CcMode::Hpcc,
            CcMode::Timely,
            CcMode::Dctcp,
            CcMode::HpccPint,
        ] {
            assert_eq!(CcMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(CcMode::from_code(2), None);
    }
}
