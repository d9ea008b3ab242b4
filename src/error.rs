//! Error types for the RDMA host engine.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type for host engine operations.
pub type Result<T> = std::result::Result<T, HostError>;

/// Errors that can occur in the host engine.
///
/// Every variant except `Config` is a configuration fault in the running
/// simulation and aborts it; transport anomalies (NACK, duplicates,
/// out-of-order arrivals) are handled in the data path and never surface
/// here.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HostError {
    /// Routing tables have no alive NIC for a destination
    #[error("no alive NIC for destination 0x{dip:08x}")]
    NoAliveNic {
        /// Destination IP that failed to resolve
        dip: u32,
    },

    /// PPP encoding of an Ethertype the link layer does not define
    #[error("PPP protocol number not defined for Ethertype 0x{0:04x}")]
    UnknownEthertype(u16),

    /// Congestion notification arrived for a flow the host does not know
    #[error("CNP received for unknown flow: sip=0x{sip:08x} sport={sport} pg={pg}")]
    UnknownFlow {
        sip: u32,
        sport: u16,
        pg: u16,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
