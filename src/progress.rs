//! Scan progress reporting.
//!
//! Renders [`ScanSnapshot`]s during `ke scan` (and the implicit scan of
//! `ke search` / `ke ask`) so users see what is being indexed, how much is
//! left, and roughly how long it will take. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::scan::{ScanSnapshot, ScanStatus};

/// Reports scan progress. Implementations write to stderr (human or JSON).
pub trait ScanProgressReporter: Send + Sync {
    /// Emit one snapshot. Called by the CLI's polling loop.
    fn report(&self, snapshot: &ScanSnapshot);
}

/// Human-friendly progress on stderr: "scan  running  1,234 / 5,000 files  (24.7%)  ~12s left".
pub struct StderrProgress;

impl ScanProgressReporter for StderrProgress {
    fn report(&self, snapshot: &ScanSnapshot) {
        let line = format!("{}\n", human_line(snapshot));
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

fn human_line(s: &ScanSnapshot) -> String {
    let status = status_name(s.status);
    if s.status == ScanStatus::Running && s.total_files == 0 {
        return format!("scan  {status}  discovering...");
    }
    let mut line = format!(
        "scan  {}  {} / {} files  ({:.1}%)",
        status,
        format_number(s.processed_files as u64),
        format_number(s.total_files as u64),
        s.progress_percent()
    );
    if s.errors > 0 {
        line.push_str(&format!("  {} errors", format_number(s.errors as u64)));
    }
    if s.status.is_active() {
        if let Some(eta) = s.estimated_remaining_seconds.filter(|e| *e > 0) {
            line.push_str(&format!("  ~{eta}s left"));
        }
    } else if let Some(message) = &s.message {
        line.push_str(&format!("  {message}"));
    }
    line
}

fn status_name(status: ScanStatus) -> &'static str {
    match status {
        ScanStatus::Idle => "idle",
        ScanStatus::Running => "running",
        ScanStatus::Stopping => "stopping",
        ScanStatus::Stopped => "stopped",
        ScanStatus::Completed => "completed",
        ScanStatus::Failed => "failed",
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ScanProgressReporter for JsonProgress {
    fn report(&self, snapshot: &ScanSnapshot) {
        let obj = serde_json::json!({
            "event": "progress",
            "status": snapshot.status,
            "generation": snapshot.generation,
            "processed": snapshot.processed_files,
            "total": snapshot.total_files,
            "indexed": snapshot.files_indexed,
            "unchanged": snapshot.files_unchanged,
            "errors": snapshot.errors,
            "current_file": snapshot.current_file,
            "eta_seconds": snapshot.estimated_remaining_seconds,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ScanProgressReporter for NoProgress {
    fn report(&self, _snapshot: &ScanSnapshot) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ScanProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn snapshot(status: ScanStatus, processed: usize, total: usize) -> ScanSnapshot {
        ScanSnapshot {
            generation: 1,
            status,
            roots: vec![PathBuf::from("/notes")],
            embedding_provider: Some("hash:384".to_string()),
            total_files: total,
            processed_files: processed,
            current_file: None,
            files_indexed: processed,
            files_unchanged: 0,
            errors: 0,
            started_at: None,
            finished_at: None,
            estimated_remaining_seconds: Some(12),
            message: Some("Indexed 4, unchanged 0, errors 0".to_string()),
        }
    }

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn human_line_running_and_done() {
        let running = human_line(&snapshot(ScanStatus::Running, 1234, 5000));
        assert_eq!(running, "scan  running  1,234 / 5,000 files  (24.7%)  ~12s left");

        let done = human_line(&snapshot(ScanStatus::Completed, 4, 4));
        assert!(done.starts_with("scan  completed  4 / 4 files  (100.0%)"));
        assert!(done.ends_with("Indexed 4, unchanged 0, errors 0"));

        let discovering = human_line(&snapshot(ScanStatus::Running, 0, 0));
        assert_eq!(discovering, "scan  running  discovering...");
    }
}
