//! Balancing policies.
//!
//! Each policy is a pure function from a snapshot of a service's backend
//! slice (plus the service's residual round-robin state) to an ordered
//! candidate list. The first entry is the preferred pick; the accept loop
//! walks the rest on dial failure. Down backends never appear in the
//! output.

use std::sync::Arc;

use capstan_client::BalancePolicy;

use super::backend::Backend;

/// Residual weighted round-robin state. Lives in the service and is reset
/// whenever the backend list changes, so indices never drift.
#[derive(Debug, Default)]
pub struct RoundRobinState {
    last_index: usize,
    last_count: u32,
}

impl RoundRobinState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Build the ordered candidate list for one new connection.
pub fn rotation(
    policy: BalancePolicy,
    backends: &[Arc<Backend>],
    rr: &mut RoundRobinState,
) -> Vec<Arc<Backend>> {
    match policy {
        BalancePolicy::RoundRobin => round_robin(backends, rr),
        BalancePolicy::LeastConn => least_conn(backends),
    }
}

/// Weighted round robin: serve `weight` connections from the current
/// backend before advancing, skipping down backends. Returns the up
/// backends rotated so the chosen one comes first.
fn round_robin(backends: &[Arc<Backend>], state: &mut RoundRobinState) -> Vec<Arc<Backend>> {
    if !backends.iter().any(|b| b.is_up()) {
        return Vec::new();
    }

    if state.last_index >= backends.len() || !backends[state.last_index].is_up() {
        state.last_index = next_up(backends, state.last_index);
        state.last_count = 0;
    }

    let chosen = state.last_index;
    state.last_count += 1;
    if state.last_count >= backends[chosen].weight() {
        state.last_index = next_up(backends, chosen);
        state.last_count = 0;
    }

    let len = backends.len();
    (0..len)
        .map(|i| &backends[(chosen + i) % len])
        .filter(|b| b.is_up())
        .map(Arc::clone)
        .collect()
}

/// Least connections: up backends ordered by current `active`, ties broken
/// by cumulative connection count, then by list order.
fn least_conn(backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
    let mut up: Vec<Arc<Backend>> = backends.iter().filter(|b| b.is_up()).cloned().collect();
    up.sort_by_key(|b| (b.active_count(), b.total_conns()));
    up
}

/// First up backend after `from`, cyclically. The caller guarantees at
/// least one backend is up.
fn next_up(backends: &[Arc<Backend>], from: usize) -> usize {
    let len = backends.len();
    let from = from % len;
    for step in 1..=len {
        let idx = (from + step) % len;
        if backends[idx].is_up() {
            return idx;
        }
    }
    from
}
