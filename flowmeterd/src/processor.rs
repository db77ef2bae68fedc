//! Worker pool bound to a fanned-out packet tap, and the swap-under-lock
//! gather protocol the coordinator uses to collect their flow tables.

use crate::meter::{MeterFactory, MeterState};
use anyhow::{Context, Result};
use flowmeter_tap::TapConnection;
use flowmeter_utils::Notification;
use log::{debug, error, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

struct TapWorker {
    state: Arc<Mutex<MeterState>>,
    handle: Option<JoinHandle<()>>,
}

impl TapWorker {
    /// Replace the worker's state with a rotated successor and hand the
    /// old one to the coordinator. The worker only touches its state
    /// under the same lock, so ownership transfers cleanly here.
    fn swap_state(&self, factory: &MeterFactory) -> MeterState {
        let mut state = self.state.lock();
        let next = factory.build(Some(&state));
        std::mem::replace(&mut *state, next)
    }
}

/// Owns one worker thread per tap fanout slice and gathers their states.
///
/// `start_threads` must be called once before the first `gather`, and
/// `gather(true)` exactly once before the processor is dropped.
pub struct TapProcessor {
    endpoint: String,
    factory: Arc<MeterFactory>,
    workers: Vec<TapWorker>,
    last: Arc<Notification>,
}

impl TapProcessor {
    pub fn new(endpoint: &str, factory: Arc<MeterFactory>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            factory,
            workers: Vec::new(),
            last: Arc::new(Notification::new()),
        }
    }

    /// Discover the tap's fanout size and spawn one worker per slice,
    /// each on its own connection.
    pub fn start_threads(&mut self) -> Result<()> {
        assert!(self.workers.is_empty(), "start_threads called twice");
        info!("Initial connection to tap {}", self.endpoint);
        let control = flowmeter_tap::connect(&self.endpoint)?;
        let fanout_size = control.fanout_size();
        drop(control);

        for index in 0..fanout_size {
            info!("Starting tap worker {index}");
            let mut conn = flowmeter_tap::connect(&self.endpoint)?;
            conn.set_fanout_index(index)?;
            conn.init()?;

            let state = Arc::new(Mutex::new(self.factory.build(None)));
            let worker_state = state.clone();
            let last = self.last.clone();
            let handle = std::thread::Builder::new()
                .name(format!("tap-worker-{index}"))
                .spawn(move || worker_loop(conn, worker_state, last))
                .context("spawning tap worker thread")?;
            self.workers.push(TapWorker { state, handle: Some(handle) });
        }
        Ok(())
    }

    /// Swap every worker's state out and return the old ones. With
    /// `last` set, first stop and join all workers so the returned
    /// states are final.
    pub fn gather(&mut self, last: bool) -> Vec<MeterState> {
        assert!(!self.workers.is_empty(), "gather before start_threads");
        assert!(
            !self.last.has_been_notified(),
            "gather after the final gather"
        );
        if last {
            info!("Final gather, stopping {} tap workers", self.workers.len());
            self.last.notify();
            for (index, worker) in self.workers.iter_mut().enumerate() {
                debug!("Waiting for tap worker {index}");
                if let Some(handle) = worker.handle.take() {
                    if handle.join().is_err() {
                        error!("Tap worker {index} panicked");
                    }
                }
            }
        }
        debug!("Gathering state from {} workers", self.workers.len());
        self.workers
            .iter()
            .map(|worker| worker.swap_state(&self.factory))
            .collect()
    }
}

fn worker_loop(
    mut conn: Box<dyn TapConnection>,
    state: Arc<Mutex<MeterState>>,
    last: Arc<Notification>,
) {
    while !last.has_been_notified() {
        let block = match conn.next_block(BLOCK_TIMEOUT) {
            Ok(Some(block)) => block,
            Ok(None) => continue,
            Err(e) => {
                error!("Tap read failed, stopping worker: {e}");
                break;
            }
        };
        for pkt in block.packets() {
            // Bounded critical section: one packet's aggregation.
            let mut state = state.lock();
            state.process(&pkt);
        }
        // Dropping the block returns it to the tap.
    }
}
