//! Passive network-flow metering agent.
//!
//! Worker threads drain a fanned-out packet tap into private flow
//! tables; a coordinator periodically swaps those tables out under each
//! worker's lock, merges them with a parallel pairwise reduction,
//! enriches the endpoints with ASNs, and exports the result as IPFIX
//! datagrams or CSV snapshots.

pub mod asn;
pub mod export;
pub mod flow;
pub mod headers;
pub mod meter;
pub mod processor;
pub mod reduce;
