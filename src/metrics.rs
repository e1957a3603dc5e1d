//! Ambient Prometheus metrics. Present purely as instrumentation — the crate
//! behaves identically whether or not callers scrape these, matching the
//! teacher's `atomic_swap::metrics` module. Gated behind the `metrics`
//! feature so crates that never scrape metrics don't pull the dependency.

use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

lazy_static! {
    /// Count of sub-tx state transitions, labeled by sub-tx and target state.
    pub static ref SWAP_STATE_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "beam_btc_swap_state_transitions_total",
        "Number of sub-transaction state transitions",
        &["subtx", "state"]
    )
    .expect("metric registration cannot fail at startup");

    /// Latency of outbound Bitcoin RPC calls, labeled by method.
    pub static ref RPC_CALL_LATENCY_SECONDS: HistogramVec = register_histogram_vec!(
        "beam_btc_swap_rpc_call_latency_seconds",
        "Latency of Bitcoin JSON-RPC calls",
        &["method"]
    )
    .expect("metric registration cannot fail at startup");

    /// Count of broadcasts rejected by the node, labeled by sub-tx.
    pub static ref BROADCAST_REJECTIONS: IntCounterVec = register_int_counter_vec!(
        "beam_btc_swap_broadcast_rejections_total",
        "Number of sendrawtransaction calls the node rejected",
        &["subtx"]
    )
    .expect("metric registration cannot fail at startup");
}

/// Records a sub-tx state transition. Cheap enough to call unconditionally
/// from the driver; the registry itself is the only global state here.
pub fn record_state_transition(subtx: &str, state: &str) {
    SWAP_STATE_TRANSITIONS.with_label_values(&[subtx, state]).inc();
}

pub fn record_broadcast_rejection(subtx: &str) {
    BROADCAST_REJECTIONS.with_label_values(&[subtx]).inc();
}

/// Starts a timer for an outbound RPC call; the caller observes it once the
/// call completes. Split into start/observe (rather than wrapping a closure)
/// because the call itself is `async` and spans an `.await`.
pub fn start_rpc_timer(method: &str) -> prometheus::HistogramTimer {
    RPC_CALL_LATENCY_SECONDS
        .with_label_values(&[method])
        .start_timer()
}
