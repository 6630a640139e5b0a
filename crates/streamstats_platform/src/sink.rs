#![forbid(unsafe_code)]

//! User-facing stats log.
//!
//! One file per day (`YYYYMMDD.txt`) in the configured directory. Each record
//! is a single line: local time, label, then `key:value` fields. Rotation
//! hands back a new sink instead of mutating a shared one.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Local};
use parking_lot::Mutex;

use crate::stats::{SessionStats, TIME_FORMAT};

pub const STREAM_HISTORY_FILE: &str = "配信履歴.txt";
pub const RAID_LOG_FILE: &str = "レイド.txt";
pub const LOCAL_TEST_FILE: &str = "local.test.txt";
pub const FIELD_SPLIT: &str = " | ";

#[derive(Clone, Debug)]
pub struct StatsSink {
	dir: PathBuf,
	local_test: bool,
	path: PathBuf,
	file: Arc<Mutex<File>>,
}

fn open_append(path: &Path) -> anyhow::Result<File> {
	OpenOptions::new()
		.create(true)
		.append(true)
		.open(path)
		.with_context(|| format!("open {}", path.display()))
}

pub fn log_file_name(now: DateTime<Local>, local_test: bool) -> String {
	if local_test {
		return LOCAL_TEST_FILE.to_string();
	}
	format!("{}.txt", now.format("%Y%m%d"))
}

/// `<time> <label> | k:v | k:v`
pub fn format_line(at: DateTime<Local>, label: &str, fields: &[(&str, String)]) -> String {
	let mut line = format!("{} {label}", at.format(TIME_FORMAT));
	for (k, v) in fields {
		line.push_str(FIELD_SPLIT);
		line.push_str(k);
		line.push(':');
		line.push_str(v);
	}
	line
}

impl StatsSink {
	pub fn open(dir: impl Into<PathBuf>, local_test: bool) -> anyhow::Result<Self> {
		let dir = dir.into();
		std::fs::create_dir_all(&dir).with_context(|| format!("create log dir {}", dir.display()))?;
		let path = dir.join(log_file_name(Local::now(), local_test));
		let file = open_append(&path)?;
		Ok(Self {
			dir,
			local_test,
			path,
			file: Arc::new(Mutex::new(file)),
		})
	}

	/// A sink for today's file in the same directory.
	pub fn rotate(&self) -> anyhow::Result<Self> {
		Self::open(self.dir.clone(), self.local_test)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn record(&self, label: &str, fields: &[(&str, String)]) {
		let line = format_line(Local::now(), label, fields);
		let mut file = self.file.lock();
		if let Err(e) = writeln!(file, "{line}") {
			tracing::warn!(error = %e, path = %self.path.display(), "stats sink write failed");
		}
	}

	/// Append the end-of-stream report to the history file.
	pub fn append_report(&self, stats: &SessionStats) -> anyhow::Result<()> {
		let path = self.dir.join(STREAM_HISTORY_FILE);
		let mut file = open_append(&path)?;
		writeln!(file, "{}", stats.report()).with_context(|| format!("write {}", path.display()))
	}

	pub fn append_raid_clips(&self, from: &str, clip_text: &str) -> anyhow::Result<()> {
		let path = self.dir.join(RAID_LOG_FILE);
		let mut file = open_append(&path)?;
		write!(file, "-- {from} さんのクリップ -- \n{clip_text}").with_context(|| format!("write {}", path.display()))
	}

	pub fn clear_raid_log(&self) -> anyhow::Result<()> {
		let path = self.dir.join(RAID_LOG_FILE);
		match std::fs::remove_file(&path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
		}
	}
}

#[cfg(test)]
mod tests {
	use chrono::{Local, TimeZone};

	use super::{RAID_LOG_FILE, STREAM_HISTORY_FILE, StatsSink, format_line, log_file_name};
	use crate::stats::SessionStats;

	fn temp_dir(name: &str) -> std::path::PathBuf {
		let dir = std::env::temp_dir().join(format!("streamstats-sink-{}-{}", name, std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		dir
	}

	#[test]
	fn line_has_time_label_and_fields() {
		let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
		let line = format_line(at, "チャット", &[("user", "bob".into()), ("text", "hi".into())]);
		assert_eq!(line, "2024/03/09 07:05:01 チャット | user:bob | text:hi");
	}

	#[test]
	fn file_name_is_daily_or_local_test() {
		let at = Local.with_ymd_and_hms(2024, 12, 31, 23, 0, 0).unwrap();
		assert_eq!(log_file_name(at, false), "20241231.txt");
		assert_eq!(log_file_name(at, true), "local.test.txt");
	}

	#[test]
	fn records_append_and_rotate_keeps_directory() {
		let dir = temp_dir("append");
		let sink = StatsSink::open(&dir, true).unwrap();
		sink.record("ToolVersion", &[("v", "0.1.0".into())]);
		sink.record("フォロー", &[("user", "amy".into())]);

		let rotated = sink.rotate().unwrap();
		assert_eq!(rotated.dir(), sink.dir());
		rotated.record("フォロー", &[("user", "bo".into())]);

		let content = std::fs::read_to_string(sink.path()).unwrap();
		let lines: Vec<_> = content.lines().collect();
		assert_eq!(lines.len(), 3);
		assert!(lines[0].ends_with("ToolVersion | v:0.1.0"));
		assert!(lines[2].ends_with("フォロー | user:bo"));

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn raid_log_appends_and_clears() {
		let dir = temp_dir("raid");
		let sink = StatsSink::open(&dir, true).unwrap();
		sink.clear_raid_log().unwrap();

		sink.append_raid_clips("raider", "   line\n").unwrap();
		let content = std::fs::read_to_string(dir.join(RAID_LOG_FILE)).unwrap();
		assert_eq!(content, "-- raider さんのクリップ -- \n   line\n");

		sink.clear_raid_log().unwrap();
		assert!(!dir.join(RAID_LOG_FILE).exists());

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn report_goes_to_history_file() {
		let dir = temp_dir("history");
		let sink = StatsSink::open(&dir, true).unwrap();
		let mut stats = SessionStats::new();
		stats.stream_started();
		stats.stream_finished();

		sink.append_report(&stats).unwrap();
		let content = std::fs::read_to_string(dir.join(STREAM_HISTORY_FILE)).unwrap();
		assert!(content.starts_with("----"));
		assert!(content.contains("新規フォロー: 0人"));

		let _ = std::fs::remove_dir_all(&dir);
	}
}
