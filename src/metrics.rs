//! Metrics emitted by pools and command batches.
//!
//! Recorded through the `metrics` facade, so they go wherever the embedding application
//! installed a recorder (and nowhere if it installed none).
//!
//! - `volley_transfers_total{result}`: finished transfers, `result` is `ok`, `error` or `queued`
//! - `volley_send_cycles_total`: outermost `send()` cycles
//! - `volley_send_duration_seconds`: wall time of outermost `send()` cycles
//! - `volley_commands_total{mode}`: commands executed by batches, `mode` is `serial` or `parallel`

use std::time::Duration;

use metrics::{Unit, counter, describe_counter, describe_histogram, histogram};

pub const TRANSFERS_TOTAL: &str = "volley_transfers_total";
pub const SEND_CYCLES_TOTAL: &str = "volley_send_cycles_total";
pub const SEND_DURATION_SECONDS: &str = "volley_send_duration_seconds";
pub const COMMANDS_TOTAL: &str = "volley_commands_total";

/// Register descriptions for every metric with the installed recorder.
///
/// Optional; call once after installing a recorder to get help text in exports.
pub fn describe() {
    describe_counter!(TRANSFERS_TOTAL, "Finished transfers by result");
    describe_counter!(SEND_CYCLES_TOTAL, "Outermost pool send cycles");
    describe_histogram!(
        SEND_DURATION_SECONDS,
        Unit::Seconds,
        "Wall time of outermost pool send cycles"
    );
    describe_counter!(COMMANDS_TOTAL, "Commands executed by batches by mode");
}

pub(crate) fn record_transfer(result: &'static str) {
    counter!(TRANSFERS_TOTAL, "result" => result).increment(1);
}

pub(crate) fn record_send_cycle(duration: Duration) {
    counter!(SEND_CYCLES_TOTAL).increment(1);
    histogram!(SEND_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub(crate) fn record_commands(mode: &'static str, count: usize) {
    counter!(COMMANDS_TOTAL, "mode" => mode).increment(count as u64);
}
