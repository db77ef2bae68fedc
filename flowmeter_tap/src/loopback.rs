//! In-memory fan-out tap. Blocks injected on slice `i` are delivered to
//! whichever connection bound itself to fanout index `i`, mirroring how a
//! kernel tap splits traffic across worker sockets.

use crate::{PacketBuf, TapBlock, TapConnection, TapError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::debug;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

// Enough in-flight blocks per slice that a test can inject a burst
// before any worker starts draining.
const SLICE_DEPTH: usize = 1024;

struct Shared {
    receivers: Vec<Receiver<TapBlock>>,
}

static REGISTRY: Lazy<Mutex<HashMap<String, Shared>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Handle for feeding packets into a loopback tap.
pub struct LoopbackInjector {
    senders: Vec<Sender<TapBlock>>,
}

impl LoopbackInjector {
    pub fn fanout_size(&self) -> usize {
        self.senders.len()
    }

    /// Deliver one block of packets to fanout slice `slice`.
    pub fn inject(&self, slice: usize, packets: Vec<PacketBuf>) {
        // A full or disconnected slice drops the block, like a kernel
        // tap whose consumer fell behind.
        let _ = self.senders[slice].try_send(TapBlock::new(packets));
    }
}

/// Register a loopback tap reachable at `mem:<name>` with the given
/// fanout size. Returns the injector side.
pub fn create(name: &str, fanout_size: usize) -> LoopbackInjector {
    let mut senders = Vec::with_capacity(fanout_size);
    let mut receivers = Vec::with_capacity(fanout_size);
    for _ in 0..fanout_size {
        let (tx, rx) = bounded(SLICE_DEPTH);
        senders.push(tx);
        receivers.push(rx);
    }
    debug!("Registered loopback tap '{name}' with fanout size {fanout_size}");
    REGISTRY.lock().insert(name.to_string(), Shared { receivers });
    LoopbackInjector { senders }
}

pub(crate) fn connect(name: &str) -> Result<LoopbackConnection, TapError> {
    let registry = REGISTRY.lock();
    let shared = registry
        .get(name)
        .ok_or_else(|| TapError::NotFound(name.to_string()))?;
    Ok(LoopbackConnection {
        receivers: shared.receivers.clone(),
        index: None,
        initialized: false,
    })
}

pub struct LoopbackConnection {
    receivers: Vec<Receiver<TapBlock>>,
    index: Option<usize>,
    initialized: bool,
}

impl TapConnection for LoopbackConnection {
    fn fanout_size(&self) -> usize {
        self.receivers.len()
    }

    fn set_fanout_index(&mut self, index: usize) -> Result<(), TapError> {
        if index >= self.receivers.len() {
            return Err(TapError::BadFanoutIndex {
                index,
                size: self.receivers.len(),
            });
        }
        self.index = Some(index);
        Ok(())
    }

    fn init(&mut self) -> Result<(), TapError> {
        if self.index.is_none() {
            return Err(TapError::NotInitialized);
        }
        self.initialized = true;
        Ok(())
    }

    fn next_block(&mut self, timeout: Duration) -> Result<Option<TapBlock>, TapError> {
        if !self.initialized {
            return Err(TapError::NotInitialized);
        }
        let index = self.index.ok_or(TapError::NotInitialized)?;
        match self.receivers[index].recv_timeout(timeout) {
            Ok(block) => Ok(Some(block)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                // The injector went away. Idle at the caller's poll
                // cadence until the worker is told to stop.
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fanout_delivery() {
        let injector = create("fanout_delivery", 2);
        let mut conn0 = connect("fanout_delivery").unwrap();
        conn0.set_fanout_index(0).unwrap();
        conn0.init().unwrap();
        let mut conn1 = connect("fanout_delivery").unwrap();
        conn1.set_fanout_index(1).unwrap();
        conn1.init().unwrap();

        injector.inject(0, vec![PacketBuf::from_bytes(vec![1, 2, 3], 10)]);
        injector.inject(1, vec![
            PacketBuf::from_bytes(vec![4], 20),
            PacketBuf::from_bytes(vec![5], 30).with_vlan(42),
        ]);

        let block0 = conn0
            .next_block(Duration::from_secs(1))
            .unwrap()
            .expect("slice 0 should have a block");
        assert_eq!(block0.len(), 1);
        let pkt = block0.packets().next().unwrap();
        assert_eq!(pkt.data, &[1, 2, 3]);
        assert_eq!(pkt.orig_len, 3);
        assert_eq!(pkt.timestamp_ns, 10);
        assert_eq!(pkt.vlan_tci, None);

        let block1 = conn1
            .next_block(Duration::from_secs(1))
            .unwrap()
            .expect("slice 1 should have a block");
        assert_eq!(block1.len(), 2);
        let vlans: Vec<_> = block1.packets().map(|p| p.vlan_tci).collect();
        assert_eq!(vlans, vec![None, Some(42)]);
    }

    #[test]
    fn test_timeout_yields_none() {
        let _injector = create("timeout_none", 1);
        let mut conn = connect("timeout_none").unwrap();
        conn.set_fanout_index(0).unwrap();
        conn.init().unwrap();
        let got = conn.next_block(Duration::from_millis(10)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_connect_unknown_name() {
        assert!(matches!(
            connect("never_registered"),
            Err(TapError::NotFound(_))
        ));
    }

    #[test]
    fn test_fanout_index_bounds() {
        let _injector = create("index_bounds", 2);
        let mut conn = connect("index_bounds").unwrap();
        assert!(matches!(
            conn.set_fanout_index(2),
            Err(TapError::BadFanoutIndex { index: 2, size: 2 })
        ));
        assert!(conn.set_fanout_index(1).is_ok());
    }

    #[test]
    fn test_block_before_init_is_rejected() {
        let _injector = create("uninit_block", 1);
        let mut conn = connect("uninit_block").unwrap();
        assert!(matches!(
            conn.next_block(Duration::from_millis(1)),
            Err(TapError::NotInitialized)
        ));
    }
}
