#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Local};

use super::SessionStats;

pub const TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";
const RULE: &str = "------------------------------------------------------------";

fn format_time(t: Option<DateTime<Local>>) -> String {
	t.map(|t| t.format(TIME_FORMAT).to_string()).unwrap_or_default()
}

fn sorted<V>(map: &HashMap<String, V>) -> Vec<(&String, &V)> {
	let mut entries: Vec<_> = map.iter().collect();
	entries.sort_by(|a, b| a.0.cmp(b.0));
	entries
}

impl SessionStats {
	/// Human-readable end-of-stream summary.
	pub fn report(&self) -> String {
		self.to_string()
	}
}

impl fmt::Display for SessionStats {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let period = self.last_period();
		writeln!(f, "{RULE}")?;
		writeln!(
			f,
			"  配信時間: {} ~ {}",
			format_time(period.started),
			format_time(period.finished)
		)?;

		writeln!(f, "  新規フォロー: {}人", self.follows().len())?;
		for user in self.follows() {
			writeln!(f, "    - {user}")?;
		}

		writeln!(f, "  チャネポ総回数: {}", self.channel_point_total())?;
		for (user, times) in sorted(self.channel_point_history()) {
			writeln!(f, "    - {user}: {times}回")?;
		}

		writeln!(f, "  新規サブスク: {}人", self.subscribed().len())?;
		for (user, _) in sorted(self.subscribed()) {
			writeln!(f, "    - {user}")?;
		}

		writeln!(f, "  ビッツ: {}", self.cheer_total())?;
		for (user, rec) in sorted(self.cheer_history()) {
			writeln!(f, "    - {user} ({} ビッツ)", rec.bits)?;
		}

		let (raids, _) = self.raid_result();
		writeln!(f, "  レイド: {raids}回")?;
		for raid in self.raid_history() {
			writeln!(f, "    - {}", raid.from)?;
		}
		Ok(())
	}
}
