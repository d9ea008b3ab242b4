//! Packet-level RDMA host engine for discrete-event network simulation.
//!
//! One [`RdmaHost`] models the RoCE data plane of a single end host: it owns
//! the transmit and receive queue pairs, spreads them over the installed NIC
//! ports (with an NVSwitch next-hop table for intra-server traffic),
//! implements the reliable go-back-N transport with selective ACK/NACK
//! generation, and runs one of the pluggable congestion-control state
//! machines (DCQCN, HPCC, TIMELY, DCTCP, HPCC-PINT).
//!
//! The simulator kernel and the lossless link layer stay outside the crate:
//! the kernel is consumed through [`sim::EventScheduler`]'s now/schedule/
//! cancel surface, the link layer through the [`port::QbbPort`] trait and
//! the hook bundle [`RdmaHost::setup`] installs on it.

pub mod config;
pub mod constants;
pub mod error;
pub mod host;
pub mod packet;
pub mod pint;
pub mod port;
pub mod queue_pair;
pub mod rate;
pub mod sim;

mod cc;
mod telemetry;

pub use config::{CcMode, ConfigLoader, HostConfig, TimelyConfig};
pub use error::{HostError, Result};
pub use host::{ip_to_node_id, NewQueuePair, RdmaHost, SeqDecision};
pub use packet::{IntHeader, IntHop, Packet, ParsedHeader};
pub use port::{NicEntry, PortHooks, QbbPort, QpGroup};
pub use queue_pair::{CcState, QueuePair, RxQueuePair, SharedQp, SharedRxQp};
pub use rate::DataRate;
pub use sim::{EventScheduler, SimTime, TimerEvent};
