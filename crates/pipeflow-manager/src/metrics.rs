//! Prometheus text snapshot of the Manager's state.
//!
//! Written to a file after each registry poll, for a node-exporter style
//! textfile collector.

use std::fmt::Write;

use pipeflow_core::{SlotStatus, Status};

use crate::cancellation::CancellationTracker;
use crate::runs::RunTable;
use crate::slots::SlotTable;

/// Format the current state as Prometheus text.
pub fn collect_metrics(runs: &RunTable, slots: &SlotTable, cancellations: &CancellationTracker) -> String {
    let mut output = String::new();

    collect_slot_metrics(slots, &mut output);
    collect_unit_metrics(runs, &mut output);

    writeln!(output).ok();
    writeln!(output, "# HELP pipeflow_runs_active Runs the manager is driving").ok();
    writeln!(output, "# TYPE pipeflow_runs_active gauge").ok();
    writeln!(output, "pipeflow_runs_active {}", runs.len()).ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP pipeflow_cancellations_pending Cancellations not yet acknowledged by every holder"
    )
    .ok();
    writeln!(output, "# TYPE pipeflow_cancellations_pending gauge").ok();
    writeln!(output, "pipeflow_cancellations_pending {}", cancellations.len()).ok();

    output
}

fn collect_slot_metrics(slots: &SlotTable, output: &mut String) {
    writeln!(output, "# HELP pipeflow_worker_slots Worker slots by status").ok();
    writeln!(output, "# TYPE pipeflow_worker_slots gauge").ok();
    for (label, status) in [
        ("connecting", SlotStatus::Connecting),
        ("idle", SlotStatus::Idle),
        ("busy", SlotStatus::Busy),
        ("dead", SlotStatus::Dead),
    ] {
        writeln!(
            output,
            "pipeflow_worker_slots{{status=\"{label}\"}} {}",
            slots.count(status)
        )
        .ok();
    }
}

fn collect_unit_metrics(runs: &RunTable, output: &mut String) {
    let mut counts = [0u64; 5];
    for unit in runs.iter().flat_map(|r| r.graph.units()) {
        let i = match unit.status {
            Status::Pending => 0,
            Status::Running => 1,
            Status::Complete => 2,
            Status::Failed => 3,
            Status::Cancelled => 4,
        };
        counts[i] += 1;
    }

    writeln!(output).ok();
    writeln!(output, "# HELP pipeflow_units Units of active runs by status").ok();
    writeln!(output, "# TYPE pipeflow_units gauge").ok();
    for (label, count) in ["pending", "running", "complete", "failed", "cancelled"]
        .iter()
        .zip(counts)
    {
        writeln!(output, "pipeflow_units{{status=\"{label}\"}} {count}").ok();
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    #[test]
    fn test_collect_metrics_empty_state() {
        let output = collect_metrics(
            &RunTable::new(),
            &SlotTable::new(3, Instant::now()),
            &CancellationTracker::new(),
        );

        assert!(output.contains("pipeflow_worker_slots{status=\"connecting\"} 2"));
        assert!(output.contains("pipeflow_worker_slots{status=\"dead\"} 0"));
        assert!(output.contains("pipeflow_units{status=\"pending\"} 0"));
        assert!(output.contains("pipeflow_runs_active 0"));
        assert!(output.contains("pipeflow_cancellations_pending 0"));
    }
}
