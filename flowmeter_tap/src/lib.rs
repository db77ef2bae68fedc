//! The packet-tap seam for the flow metering daemon.
//!
//! A tap delivers captured packets in blocks, fanned out across N
//! disjoint slices so each worker thread sees its own stream. This crate
//! defines the connection contract and ships an in-memory loopback tap
//! (`mem:` endpoints) used by the integration tests and for smoke runs.
//! Production packet sources implement [`TapConnection`] behind the same
//! `connect` seam; their wire protocols are not this crate's business.

pub mod loopback;

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TapError {
    #[error("no tap driver for endpoint '{0}'")]
    UnknownEndpoint(String),
    #[error("no tap named '{0}' is registered")]
    NotFound(String),
    #[error("fanout index {index} out of range (fanout size {size})")]
    BadFanoutIndex { index: usize, size: usize },
    #[error("connection used before set_fanout_index/init")]
    NotInitialized,
}

/// A single captured packet, borrowed from its block.
pub struct TapPacket<'b> {
    /// Captured bytes, possibly truncated at the tap's snap length.
    pub data: &'b [u8],
    /// Original on-the-wire length.
    pub orig_len: u32,
    /// Capture timestamp, nanoseconds since the UNIX epoch.
    pub timestamp_ns: u64,
    /// VLAN TCI from tap metadata, when the tap saw a tag.
    pub vlan_tci: Option<u16>,
}

/// An owned packet as stored inside a block.
#[derive(Clone)]
pub struct PacketBuf {
    pub data: Vec<u8>,
    pub orig_len: u32,
    pub timestamp_ns: u64,
    pub vlan_tci: Option<u16>,
}

impl PacketBuf {
    /// An untruncated capture: the wire length is the buffer length.
    pub fn from_bytes(data: Vec<u8>, timestamp_ns: u64) -> Self {
        let orig_len = data.len() as u32;
        Self { data, orig_len, timestamp_ns, vlan_tci: None }
    }

    pub fn with_vlan(mut self, tci: u16) -> Self {
        self.vlan_tci = Some(tci);
        self
    }
}

/// A batch of captured packets. Dropping the block returns it to the tap.
pub struct TapBlock {
    packets: Vec<PacketBuf>,
}

impl TapBlock {
    pub fn new(packets: Vec<PacketBuf>) -> Self {
        Self { packets }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn packets(&self) -> impl Iterator<Item = TapPacket<'_>> {
        self.packets.iter().map(|p| TapPacket {
            data: &p.data,
            orig_len: p.orig_len,
            timestamp_ns: p.timestamp_ns,
            vlan_tci: p.vlan_tci,
        })
    }
}

/// One connection to a tap endpoint. The first connection is typically
/// used only to discover `fanout_size`; each worker then opens its own
/// connection bound to one fanout slice.
pub trait TapConnection: Send {
    /// Number of fanout slices the tap splits traffic across.
    fn fanout_size(&self) -> usize;

    /// Bind this connection to one fanout slice. Must precede `init`.
    fn set_fanout_index(&mut self, index: usize) -> Result<(), TapError>;

    /// Finish connection setup. Must precede `next_block`.
    fn init(&mut self) -> Result<(), TapError>;

    /// Block up to `timeout` for the next batch of packets. `Ok(None)`
    /// means the timeout elapsed with no traffic.
    fn next_block(&mut self, timeout: Duration) -> Result<Option<TapBlock>, TapError>;
}

/// Open a connection to the named tap endpoint. `mem:<name>` endpoints
/// resolve against the in-process loopback registry.
pub fn connect(endpoint: &str) -> Result<Box<dyn TapConnection>, TapError> {
    if let Some(name) = endpoint.strip_prefix("mem:") {
        Ok(Box::new(loopback::connect(name)?))
    } else {
        Err(TapError::UnknownEndpoint(endpoint.to_string()))
    }
}
