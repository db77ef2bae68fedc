//! Parallel pairwise reduction of gathered worker states.

use crate::meter::MeterState;
use log::debug;

/// Combine the gathered states into one by repeatedly merging the second
/// half into the first on transient threads, halving the count each
/// pass. Merging is commutative and associative, so the outcome is
/// independent of thread schedule.
pub fn combine_states(mut states: Vec<MeterState>) -> MeterState {
    while states.len() > 1 {
        // New size is 1/2 the old size, rounded up.
        let keep = states.len() / 2 + states.len() % 2;
        debug!("Combining {} states into {}", states.len(), keep);
        let tail = states.split_off(keep);
        std::thread::scope(|scope| {
            for (dst, src) in states.iter_mut().zip(tail) {
                scope.spawn(move || dst.merge(src));
            }
        });
    }
    states.into_iter().next().unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::flow::{add_to_table, FlowKey, FlowStats};

    fn state_with(src: u32, bytes: u64, ts_ns: u64) -> MeterState {
        let mut state = MeterState::new();
        let mut key = FlowKey::default();
        key.set_src_ip4(src);
        key.set_dst_ip4(99);
        key.protocol = 17;
        add_to_table(
            state.flows_mut(),
            key,
            FlowStats::for_packet(bytes, 1, ts_ns),
        );
        state
    }

    #[test]
    fn test_empty_input() {
        assert!(combine_states(Vec::new()).is_empty());
    }

    #[test]
    fn test_single_state_passes_through() {
        let merged = combine_states(vec![state_with(1, 10, 100)]);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_identical_flows_sum() {
        let states = vec![
            state_with(1, 10, 1_000),
            state_with(1, 20, 3_000),
            state_with(1, 30, 2_000),
        ];
        let merged = combine_states(states);
        assert_eq!(merged.len(), 1);
        let stats = merged.flows().values().next().unwrap();
        assert_eq!(stats.bytes, 60);
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.first_ns, 1_000);
        assert_eq!(stats.last_ns, 3_000);
    }

    #[test]
    fn test_distinct_flows_survive_many_passes() {
        // Seven states force three reduction passes with odd leftovers.
        let states: Vec<MeterState> =
            (1..=7).map(|i| state_with(i, i as u64 * 10, 1_000)).collect();
        let merged = combine_states(states);
        assert_eq!(merged.len(), 7);
        let total: u64 = merged.flows().values().map(|s| s.bytes).sum();
        assert_eq!(total, 280);
    }
}
