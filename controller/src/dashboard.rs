//! Console dashboard printed every couple of seconds when `--dashboard` is set

use crate::server::AppState;
use chrono::{Local, TimeZone};
use std::fmt::Write;
use std::time::Duration;
use tokio::sync::watch;

const BAR_CELLS: usize = 20;
const MBPS_PER_CELL: f64 = 50.0;
const RULE: &str = "═══════════════════════════════════════════════════════════════";
const THIN_RULE: &str = "───────────────────────────────────────────────────────────────";

/// `filled` solid cells followed by empty ones, `total` cells wide
pub fn progress_bar(filled: usize, total: usize) -> String {
    let filled = filled.min(total);
    "█".repeat(filled) + &"░".repeat(total - filled)
}

/// Render the dashboard as text
pub async fn render(state: &AppState) -> String {
    let aggregate = state.aggregator.aggregate();
    let fleet = state.scheduler.snapshot().await;
    let target_gbps = state.config.throughput.target_gbps;
    let current_gbps = aggregate.total_mbps / 1000.0;
    let percent = if target_gbps > 0.0 {
        current_gbps / target_gbps * 100.0
    } else {
        0.0
    };
    let next_rotation = Local
        .timestamp_millis_opt(fleet.next_rotation as i64)
        .single()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());

    let mut out = String::new();
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "                  Tidepool Fleet Dashboard");
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(
        out,
        "\nTarget: {:.2} Gbps | Current: {:.2} Gbps ({:.1}%)",
        target_gbps, current_gbps, percent
    );
    let _ = writeln!(
        out,
        "Active Workers: {}/{}",
        fleet.allocations.len(),
        state.config.workers.len()
    );
    let _ = writeln!(
        out,
        "Next Rotation: {} ({}s)",
        next_rotation, fleet.seconds_until_rotation
    );
    let _ = writeln!(
        out,
        "Phase: {} | Rotations: {}\n",
        fleet.phase, fleet.rotation_count
    );
    let _ = writeln!(out, "Worker Throughput:");
    let _ = writeln!(out, "{}", THIN_RULE);

    let mut rows: Vec<(&str, f64)> = state
        .config
        .workers
        .iter()
        .filter_map(|w| {
            let mbps = *aggregate.per_worker.get(&w.id)?;
            (mbps > 0.0).then_some((w.display_name(), mbps))
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(b.0));
    for (name, mbps) in rows {
        let bar = progress_bar((mbps / MBPS_PER_CELL) as usize, BAR_CELLS);
        let _ = writeln!(out, "{:<20} [{}] {:>7.0} Mbps", name, bar, mbps);
    }

    let _ = writeln!(out, "\n{}", RULE);
    let _ = writeln!(
        out,
        "Metrics API: http://{}:{}/metrics",
        state.config.server.host, state.config.server.port
    );
    let _ = writeln!(out, "{}", RULE);
    out
}

/// Clear the terminal and print the dashboard every `interval` until shutdown
pub async fn run(state: AppState, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                print!("\x1b[H\x1b[2J{}", render(&state).await);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_config;
    use tidepool_protocol::MetricsReport;

    #[test]
    fn test_progress_bar() {
        assert_eq!(progress_bar(0, 4), "░░░░");
        assert_eq!(progress_bar(2, 4), "██░░");
        assert_eq!(progress_bar(9, 4), "████");
    }

    #[tokio::test]
    async fn test_render_lists_only_busy_workers() {
        let state = AppState::new(test_config());
        state.aggregator.update(
            "w1",
            MetricsReport {
                current_mbps: 500.0,
                average_mbps: 480.0,
                bytes_downloaded: 0,
                active_commands: 1,
                commands: vec![],
            },
        );
        state.aggregator.update("w2", MetricsReport::default());

        let text = render(&state).await;
        assert!(text.contains("Phase: idle | Rotations: 0"));
        assert!(text.contains(&format!("[{}]", progress_bar(10, 20))));
        assert!(text.contains("edge-1"));
        assert!(!text.contains("edge-2"), "idle worker should not be listed:\n{}", text);
    }
}
