use chrono::{DateTime, Local, TimeDelta};
use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Cell, Paragraph, Row, Table};

use crate::app::App;
use crate::supervisor::{BackupStatus, ForwardState, TunnelSnapshot};

const BG: Color = Color::Rgb(9, 15, 25);
const ACCENT: Color = Color::Rgb(52, 211, 153);
const MUTED: Color = Color::Rgb(140, 156, 178);
const OK: Color = Color::Rgb(52, 211, 153);
const WARN: Color = Color::Rgb(251, 191, 36);
const ERROR: Color = Color::Rgb(248, 113, 113);
const DIM: Color = Color::Rgb(90, 100, 115);

const ERROR_DETAIL_THRESHOLD: usize = 40;

pub fn render(frame: &mut Frame, app: &App) {
    if app.quitting() {
        let notice = Paragraph::new("Shutting down port-forwards…")
            .alignment(Alignment::Center)
            .style(Style::default().bg(BG).fg(MUTED));
        frame.render_widget(notice, frame.area());
        return;
    }

    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(4),
            Constraint::Length(1),
        ])
        .split(frame.area());

    render_header(frame, root[0], app);
    render_table(frame, root[1], app);
    render_footer(frame, root[2]);
}

fn render_header(frame: &mut Frame, area: ratatui::layout::Rect, app: &App) {
    let total = app.rows().len();
    let active = app
        .rows()
        .iter()
        .filter(|row| row.state == ForwardState::Active)
        .count();

    let line = Line::from(vec![
        Span::styled(
            " moray ",
            Style::default()
                .fg(Color::Black)
                .bg(ACCENT)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            " Kubernetes port-forward supervisor  ",
            Style::default().fg(MUTED),
        ),
        Span::styled(
            format!("{active}/{total} active"),
            Style::default().fg(if active == total { OK } else { WARN }),
        ),
    ]);
    frame.render_widget(Paragraph::new(line).style(Style::default().bg(BG)), area);
}

fn render_table(frame: &mut Frame, area: ratatui::layout::Rect, app: &App) {
    let now = Local::now();
    let header = Row::new(
        ["Cluster", "Namespace", "Service", "Ports", "Status", "Backup", "Info"]
            .map(|title| Cell::from(title)),
    )
    .style(Style::default().fg(ACCENT).add_modifier(Modifier::BOLD));

    let rows = app.rows().iter().map(|snapshot| table_row(snapshot, now));

    let table = Table::new(
        rows,
        [
            Constraint::Length(16),
            Constraint::Length(14),
            Constraint::Min(20),
            Constraint::Length(12),
            Constraint::Length(14),
            Constraint::Length(12),
            Constraint::Min(18),
        ],
    )
    .header(header)
    .style(Style::default().bg(BG).fg(Color::White));

    frame.render_widget(table, area);
}

fn render_footer(frame: &mut Frame, area: ratatui::layout::Rect) {
    let footer = Paragraph::new(" q quit · r refresh").style(Style::default().bg(BG).fg(DIM));
    frame.render_widget(footer, area);
}

fn table_row(snapshot: &TunnelSnapshot, now: DateTime<Local>) -> Row<'static> {
    let (status, color, info) = status_parts(snapshot, now);
    let error_detail = failed_error_detail(snapshot);

    let info_cell = match &error_detail {
        Some(detail) => Cell::from(Text::from(vec![
            Line::styled(info, Style::default().fg(MUTED)),
            Line::styled(format!("Error: {detail}"), Style::default().fg(ERROR)),
        ])),
        None => Cell::from(info).style(Style::default().fg(MUTED)),
    };

    let row = Row::new(vec![
        Cell::from(truncate(&snapshot.cluster, 16)),
        Cell::from(truncate(&snapshot.namespace, 14)),
        Cell::from(truncate(&snapshot.service, 35)),
        Cell::from(format!("{}:{}", snapshot.local_port, snapshot.remote_port)),
        Cell::from(status).style(Style::default().fg(color)),
        Cell::from(backup_text(snapshot)),
        info_cell,
    ]);
    if error_detail.is_some() {
        row.height(2)
    } else {
        row
    }
}

/// The full error for a second row line, when a failed tunnel's error is
/// too long for the Info cell alone.
fn failed_error_detail(snapshot: &TunnelSnapshot) -> Option<String> {
    (snapshot.state == ForwardState::Failed
        && snapshot.last_error.chars().count() > ERROR_DETAIL_THRESHOLD)
        .then(|| snapshot.last_error.clone())
}

fn status_parts(
    snapshot: &TunnelSnapshot,
    now: DateTime<Local>,
) -> (&'static str, Color, String) {
    match snapshot.state {
        ForwardState::Active => {
            let info = snapshot
                .last_probe_at
                .map(|at| format!("checked {} ago", format_duration(now - at)))
                .unwrap_or_default();
            ("● Active", OK, info)
        }
        ForwardState::Reconnecting => {
            let info = match snapshot.reconnect_at {
                Some(at) if at > now => format!(
                    "retry in {} (attempt {})",
                    format_duration(at - now),
                    snapshot.retry_count
                ),
                Some(_) => format!("retrying… (attempt {})", snapshot.retry_count),
                None => String::new(),
            };
            ("● Reconnecting", WARN, info)
        }
        ForwardState::Failed => (
            "● Failed",
            ERROR,
            truncate(&snapshot.last_error, ERROR_DETAIL_THRESHOLD),
        ),
        ForwardState::Starting => ("● Starting", MUTED, "initializing…".to_string()),
        ForwardState::Stopped => ("● Stopped", DIM, String::new()),
    }
}

fn backup_text(snapshot: &TunnelSnapshot) -> String {
    if !snapshot.has_backup {
        return "-".to_string();
    }
    match &snapshot.backup {
        BackupStatus::None => "waiting".to_string(),
        BackupStatus::Pending => "pending".to_string(),
        BackupStatus::Running => "running".to_string(),
        BackupStatus::Completed { size_mb } => format!("✓ {}", format_size(*size_mb)),
        BackupStatus::Failed { .. } => "✗ failed".to_string(),
    }
}

fn format_size(size_mb: f64) -> String {
    if size_mb < 1.0 {
        format!("{:.0}KB", size_mb * 1024.0)
    } else {
        format!("{size_mb:.1}MB")
    }
}

fn format_duration(delta: TimeDelta) -> String {
    let seconds = delta.num_seconds();
    if seconds < 1 {
        return "now".to_string();
    }
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 3_600 {
        return format!("{}m{}s", seconds / 60, seconds % 60);
    }
    format!("{}h{}m", seconds / 3_600, (seconds % 3_600) / 60)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{kept}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(state: ForwardState) -> TunnelSnapshot {
        TunnelSnapshot {
            cluster: "staging".to_string(),
            namespace: "default".to_string(),
            service: "api".to_string(),
            local_port: 18080,
            remote_port: 80,
            has_backup: false,
            state,
            last_error: String::new(),
            last_probe_at: None,
            reconnect_at: None,
            retry_count: 0,
            backup: BackupStatus::None,
        }
    }

    #[test]
    fn formats_durations_per_magnitude() {
        assert_eq!(format_duration(TimeDelta::milliseconds(400)), "now");
        assert_eq!(format_duration(TimeDelta::seconds(42)), "42s");
        assert_eq!(format_duration(TimeDelta::seconds(95)), "1m35s");
        assert_eq!(format_duration(TimeDelta::seconds(3_720)), "1h2m");
        assert_eq!(format_duration(TimeDelta::seconds(-5)), "now");
    }

    #[test]
    fn formats_backup_sizes() {
        assert_eq!(format_size(0.5), "512KB");
        assert_eq!(format_size(2.34), "2.3MB");
    }

    #[test]
    fn truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactly-10", 10), "exactly-10");
        assert_eq!(truncate("a-very-long-name", 10), "a-very-lo…");
        assert_eq!(truncate("über-länglich", 6), "über-…");
    }

    #[test]
    fn reconnecting_rows_show_the_attempt() {
        let mut row = snapshot(ForwardState::Reconnecting);
        row.retry_count = 3;
        row.reconnect_at = Some(Local::now() + TimeDelta::seconds(8));
        let (status, _, info) = status_parts(&row, Local::now());
        assert_eq!(status, "● Reconnecting");
        assert!(info.starts_with("retry in"));
        assert!(info.ends_with("(attempt 3)"));

        row.reconnect_at = Some(Local::now() - TimeDelta::seconds(1));
        let (_, _, info) = status_parts(&row, Local::now());
        assert_eq!(info, "retrying… (attempt 3)");
    }

    #[test]
    fn active_rows_report_the_last_probe() {
        let mut row = snapshot(ForwardState::Active);
        let now = Local::now();
        row.last_probe_at = Some(now - TimeDelta::seconds(12));
        let (status, _, info) = status_parts(&row, now);
        assert_eq!(status, "● Active");
        assert_eq!(info, "checked 12s ago");
    }

    #[test]
    fn failed_rows_surface_the_error() {
        let mut row = snapshot(ForwardState::Failed);
        row.last_error = "dial failed: connection refused".to_string();
        let (status, _, info) = status_parts(&row, Local::now());
        assert_eq!(status, "● Failed");
        assert_eq!(info, "dial failed: connection refused");
        assert!(failed_error_detail(&row).is_none());
    }

    #[test]
    fn long_failed_errors_get_a_detail_line() {
        let mut row = snapshot(ForwardState::Failed);
        row.last_error =
            "port-forward dial failed: error trying to connect: tcp connect error: connection refused"
                .to_string();

        let (_, _, info) = status_parts(&row, Local::now());
        assert_eq!(info.chars().count(), ERROR_DETAIL_THRESHOLD);
        assert!(info.ends_with('…'));

        let detail = failed_error_detail(&row).expect("detail line for long error");
        assert_eq!(detail, row.last_error);
    }

    #[test]
    fn long_errors_outside_failed_get_no_detail_line() {
        let mut row = snapshot(ForwardState::Reconnecting);
        row.last_error =
            "port-forward dial failed: error trying to connect: tcp connect error: connection refused"
                .to_string();
        assert!(failed_error_detail(&row).is_none());
    }

    #[test]
    fn backup_column_reflects_status() {
        let mut row = snapshot(ForwardState::Active);
        assert_eq!(backup_text(&row), "-");

        row.has_backup = true;
        assert_eq!(backup_text(&row), "waiting");

        row.backup = BackupStatus::Running;
        assert_eq!(backup_text(&row), "running");

        row.backup = BackupStatus::Completed { size_mb: 1.5 };
        assert_eq!(backup_text(&row), "✓ 1.5MB");

        row.backup = BackupStatus::Failed {
            error: "pg_dump failed".to_string(),
        };
        assert_eq!(backup_text(&row), "✗ failed");
    }
}
