#![forbid(unsafe_code)]

//! In-memory statistics for one streaming session.

mod report;

pub use report::TIME_FORMAT;


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::RwLock;

/// Shared handle: written by the receive loop, read by the host.
pub type SharedStats = Arc<RwLock<SessionStats>>;

pub fn shared() -> SharedStats {
	Arc::new(RwLock::new(SessionStats::new()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamPeriod {
	pub started: Option<DateTime<Local>>,
	pub finished: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
	pub time: DateTime<Local>,
	pub user: String,
	pub text: String,
}

/// Per-actor bits (or gifted subs) and how many events contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitsRecord {
	pub bits: u64,
	pub times: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
	pub tier: String,
	/// Received as a gift rather than bought by the actor.
	pub gifted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaidEntry {
	pub from: String,
	pub viewers: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerUpRecord {
	pub gigantified_emotes: u64,
	pub message_effects: u64,
}

#[derive(Debug, Clone, Default)]
struct ChatStats {
	total: u64,
	history: Vec<ChatEntry>,
}

#[derive(Debug, Clone, Default)]
struct BitsStats {
	total: u64,
	history: HashMap<String, BitsRecord>,
}

impl BitsStats {
	fn add(&mut self, user: &str, n: u64) {
		self.total += n;
		let rec = self.history.entry(user.to_string()).or_default();
		rec.bits += n;
		rec.times += 1;
	}
}

#[derive(Debug, Clone, Default)]
struct ChannelPointStats {
	total: u64,
	record: HashMap<String, u64>,
}

/// Running aggregate for the current stream.
///
/// `follow` and `chat` only count while a stream is live. Every other mutator
/// counts unconditionally, so late cheers and raids after the offline signal
/// are still attributed.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
	in_streaming: bool,
	period: StreamPeriod,
	follows: Vec<String>,
	chat: ChatStats,
	cheer: BitsStats,
	sub_gift: BitsStats,
	subscriptions: HashMap<String, SubscriptionEntry>,
	channel_points: ChannelPointStats,
	raids: Vec<RaidEntry>,
	power_ups: HashMap<String, PowerUpRecord>,
}

impl SessionStats {
	pub fn new() -> Self {
		Self::default()
	}

	/// Reset every aggregate. The last stream period is kept for reporting.
	pub fn clear(&mut self) {
		let period = self.period;
		*self = Self {
			period,
			..Self::default()
		};
	}

	pub fn stream_started(&mut self) {
		self.stream_started_at(Local::now());
	}

	pub fn stream_started_at(&mut self, at: DateTime<Local>) {
		self.clear();
		self.in_streaming = true;
		self.period = StreamPeriod {
			started: Some(at),
			finished: None,
		};
	}

	pub fn stream_finished(&mut self) {
		self.stream_finished_at(Local::now());
	}

	pub fn stream_finished_at(&mut self, at: DateTime<Local>) {
		self.period.finished = Some(at);
		self.in_streaming = false;
	}

	pub fn is_streaming(&self) -> bool {
		self.in_streaming
	}

	pub fn follow(&mut self, user: &str) {
		if !self.in_streaming {
			return;
		}
		self.follows.push(user.to_string());
	}

	pub fn chat(&mut self, user: &str, text: &str) {
		if !self.in_streaming {
			return;
		}
		self.chat.total += 1;
		self.chat.history.push(ChatEntry {
			time: Local::now(),
			user: user.to_string(),
			text: text.to_string(),
		});
	}

	/// Count one reward redemption. The reward title is not aggregated.
	pub fn channel_point(&mut self, user: &str, _title: &str) {
		self.channel_points.total += 1;
		*self.channel_points.record.entry(user.to_string()).or_insert(0) += 1;
	}

	pub fn cheer(&mut self, user: &str, bits: u64) {
		self.cheer.add(user, bits);
	}

	/// `user` gifted `n` subscriptions to the community.
	pub fn sub_gift(&mut self, user: &str, n: u64) {
		self.sub_gift.add(user, n);
	}

	/// `recipient` received a gifted subscription.
	pub fn sub_gifted(&mut self, recipient: &str, tier: &str) {
		self.subscriptions.insert(
			recipient.to_string(),
			SubscriptionEntry {
				tier: tier.to_string(),
				gifted: true,
			},
		);
	}

	pub fn subscribe(&mut self, user: &str, tier: &str) {
		self.subscriptions.insert(
			user.to_string(),
			SubscriptionEntry {
				tier: tier.to_string(),
				gifted: false,
			},
		);
	}

	pub fn raid(&mut self, from: &str, viewers: u64) {
		self.raids.push(RaidEntry {
			from: from.to_string(),
			viewers,
		});
	}

	pub fn gigantified_emote(&mut self, user: &str) {
		self.power_ups.entry(user.to_string()).or_default().gigantified_emotes += 1;
	}

	pub fn message_effect(&mut self, user: &str) {
		self.power_ups.entry(user.to_string()).or_default().message_effects += 1;
	}

	/// Length of the last finished stream, zero while live or before any stream.
	pub fn period(&self) -> Duration {
		match (self.period.started, self.period.finished) {
			(Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
			_ => Duration::ZERO,
		}
	}

	pub fn last_period(&self) -> StreamPeriod {
		self.period
	}

	pub fn follows(&self) -> &[String] {
		&self.follows
	}

	pub fn n_chats(&self) -> u64 {
		self.chat.total
	}

	pub fn chat_history(&self) -> &[ChatEntry] {
		&self.chat.history
	}

	pub fn cheer_total(&self) -> u64 {
		self.cheer.total
	}

	pub fn cheer_history(&self) -> &HashMap<String, BitsRecord> {
		&self.cheer.history
	}

	pub fn sub_gift_total(&self) -> u64 {
		self.sub_gift.total
	}

	pub fn sub_gift_history(&self) -> &HashMap<String, BitsRecord> {
		&self.sub_gift.history
	}

	pub fn subscribed(&self) -> &HashMap<String, SubscriptionEntry> {
		&self.subscriptions
	}

	pub fn channel_point_total(&self) -> u64 {
		self.channel_points.total
	}

	pub fn channel_point_history(&self) -> &HashMap<String, u64> {
		&self.channel_points.record
	}

	pub fn channel_point_times(&self, user: &str) -> u64 {
		self.channel_points.record.get(user).copied().unwrap_or(0)
	}

	/// Number of incoming raids and the summed viewer count.
	pub fn raid_result(&self) -> (usize, u64) {
		(self.raids.len(), self.raids.iter().map(|r| r.viewers).sum())
	}

	pub fn raid_history(&self) -> &[RaidEntry] {
		&self.raids
	}

	pub fn power_ups(&self) -> &HashMap<String, PowerUpRecord> {
		&self.power_ups
	}
}
