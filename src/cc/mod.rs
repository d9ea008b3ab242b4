//! Congestion-control state machines.
//!
//! One per supported mode, all implemented as impl blocks on the host
//! engine: they share its rate-change path, its scheduler, and the
//! `[min_rate, max_rate]` clamp. A host runs exactly one of them for its
//! whole lifetime; each QP carries the matching substate variant.

mod dcqcn;
mod dctcp;
mod hpcc;
mod hpcc_pint;
mod timely;
