//! Status table output.
//!
//! Pure formatting over the manager's liveness accessors, plus the 1 Hz
//! printer task.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;

use crate::heart::ConnectionStatus;
use crate::manager::Manager;

const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// One line of the status table.
#[derive(Debug, Clone)]
pub struct StatusRow {
    pub kind: &'static str,
    pub name: String,
    pub host: String,
    pub last_beat_before: Option<TimeDelta>,
    pub dead: bool,
}

impl StatusRow {
    pub fn new(
        kind: &'static str,
        name: String,
        host: String,
        status: Option<ConnectionStatus>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            kind,
            name,
            host,
            last_beat_before: status.and_then(|s| s.last_beat_before(now)),
            dead: status.is_some_and(|s| s.is_dead()),
        }
    }
}

/// Render the liveness table: one row per peer manager and local VM.
///
/// Columns are sized to their content; the beat column is right-aligned
/// so silences line up under each other.
pub fn format_status_table(rows: &[StatusRow]) -> String {
    use std::fmt::Write;

    if rows.is_empty() {
        return "No connections expected.\n".to_string();
    }

    let beats: Vec<String> = rows.iter().map(format_last_beat).collect();
    let kind_width = column_width("TYPE", rows.iter().map(|r| r.kind.len()));
    let name_width = column_width("NAME", rows.iter().map(|r| r.name.len()));
    let host_width = column_width("ADDRESS", rows.iter().map(|r| r.host.len()));
    let beat_width = column_width("LAST BEAT BEFORE", beats.iter().map(String::len));

    let mut output = String::new();
    writeln!(
        output,
        "{:<kind_width$}   {:<name_width$}   {:<host_width$}   {:>beat_width$}",
        "TYPE", "NAME", "ADDRESS", "LAST BEAT BEFORE"
    )
    .unwrap();
    for (row, beat) in rows.iter().zip(&beats) {
        writeln!(
            output,
            "{:<kind_width$}   {:<name_width$}   {:<host_width$}   {:>beat_width$}",
            row.kind, row.name, row.host, beat
        )
        .unwrap();
    }
    output
}

fn column_width(header: &str, cells: impl Iterator<Item = usize>) -> usize {
    cells.fold(header.len(), usize::max)
}

fn format_last_beat(row: &StatusRow) -> String {
    let rendered = match row.last_beat_before {
        Some(delta) => format!("{} ms", delta.num_milliseconds()),
        None => "-".to_string(),
    };
    if row.dead {
        format!("{rendered} (dead)")
    } else {
        rendered
    }
}

/// Collect current rows from the manager's accessors.
pub async fn status_rows(manager: &Manager) -> Vec<StatusRow> {
    let now = chrono::Utc::now();
    let mut rows = Vec::new();
    for (peer, status) in manager.manager_statuses().await {
        rows.push(StatusRow::new(
            "Manager",
            peer.name.clone(),
            peer.host(),
            status,
            now,
        ));
    }
    for (vm, status) in manager.vm_statuses().await {
        rows.push(StatusRow::new("VM", vm.name(), vm.host(), status, now));
    }
    rows
}

/// Print the status table once a second until shutdown.
pub async fn run_status_printer(manager: Arc<Manager>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let rows = status_rows(&manager).await;
                println!("{}", format_status_table(&rows));
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(kind: &'static str, name: &str, ms: Option<i64>, dead: bool) -> StatusRow {
        StatusRow {
            kind,
            name: name.to_string(),
            host: "10.0.0.2:8080".to_string(),
            last_beat_before: ms.map(TimeDelta::milliseconds),
            dead,
        }
    }

    #[test]
    fn formats_beats_and_silence() {
        let rows = vec![
            row("Manager", "m2", Some(230), false),
            row("VM", "wso-m1-wrk-time-x", None, false),
            row("VM", "wso-m1-wrk-time-y", Some(15000), true),
        ];
        let table = format_status_table(&rows);
        assert!(table.contains("TYPE"));
        assert!(table.contains('-'));
        assert!(table.contains("15000 ms (dead)"));

        // Beat column is right-aligned against the widest entry.
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].ends_with("LAST BEAT BEFORE"));
        assert!(lines[1].ends_with("          230 ms"));
        assert_eq!(lines[0].len(), lines[1].len());
    }

    #[test]
    fn empty_table_has_a_placeholder() {
        assert!(format_status_table(&[]).contains("No connections expected"));
    }
}
