use crate::types::{RecentEvent, Snapshot, StatsUpdate};

/// Emit a published update as a single JSON line to stdout.
pub fn report_update(update: &StatsUpdate) {
    if let Ok(json) = serde_json::to_string(update) {
        println!("{json}");
    }
}

/// Emit one accepted event as a single JSON line to stdout.
pub fn report_event(event: &RecentEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{json}");
    }
}

/// Emit the final snapshot as pretty-printed JSON to stdout.
pub fn report_exit_summary(snapshot: &Snapshot) {
    if let Ok(json) = serde_json::to_string_pretty(snapshot) {
        println!("{json}");
    }
}
