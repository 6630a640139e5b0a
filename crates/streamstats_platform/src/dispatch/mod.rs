#![forbid(unsafe_code)]

//! Static table of the subscription types this core asks for, and the
//! dispatcher that routes each notification to its handler.

mod handlers;


use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::StreamStatsError;
use crate::eventsub::NotificationEnvelope;
use crate::helix::{CreateSubscriptionRequest, HelixClient, SubscriptionCondition};
use crate::host::{HostCallbacks, StreamControl};
use crate::sink::StatsSink;
use crate::stats::SharedStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionShape {
	Broadcaster,
	BroadcasterModerator,
	BroadcasterUser,
	FromBroadcaster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
	ChannelSubscribe,
	ChannelCheer,
	StreamOnline,
	StreamOffline,
	ChannelSubscriptionGift,
	ChannelSubscriptionMessage,
	ChannelChatNotification,
	ChannelChatMessage,
	ChannelRaid,
	ChannelFollow,
	ChannelPointsRedemptionAdd,
}

impl SubscriptionKind {
	pub const ALL: [Self; 11] = [
		Self::ChannelSubscribe,
		Self::ChannelCheer,
		Self::StreamOnline,
		Self::StreamOffline,
		Self::ChannelSubscriptionGift,
		Self::ChannelSubscriptionMessage,
		Self::ChannelChatNotification,
		Self::ChannelChatMessage,
		Self::ChannelRaid,
		Self::ChannelFollow,
		Self::ChannelPointsRedemptionAdd,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::ChannelSubscribe => "channel.subscribe",
			Self::ChannelCheer => "channel.cheer",
			Self::StreamOnline => "stream.online",
			Self::StreamOffline => "stream.offline",
			Self::ChannelSubscriptionGift => "channel.subscription.gift",
			Self::ChannelSubscriptionMessage => "channel.subscription.message",
			Self::ChannelChatNotification => "channel.chat.notification",
			Self::ChannelChatMessage => "channel.chat.message",
			Self::ChannelRaid => "channel.raid",
			Self::ChannelFollow => "channel.follow",
			Self::ChannelPointsRedemptionAdd => "channel.channel_points_custom_reward_redemption.add",
		}
	}

	/// Label written to the stats sink.
	pub fn label(self) -> &'static str {
		match self {
			Self::ChannelSubscribe => "サブスク",
			Self::ChannelCheer => "cheer",
			Self::StreamOnline => "配信開始",
			Self::StreamOffline => "配信終了",
			Self::ChannelSubscriptionGift => "サブギフ",
			Self::ChannelSubscriptionMessage => "再サブスク",
			Self::ChannelChatNotification => "通知",
			Self::ChannelChatMessage => "チャット",
			Self::ChannelRaid => "レイド開始",
			Self::ChannelFollow => "フォロー",
			Self::ChannelPointsRedemptionAdd => "チャネポ",
		}
	}

	pub fn version(self) -> &'static str {
		match self {
			Self::ChannelFollow => "2",
			_ => "1",
		}
	}

	pub fn condition_shape(self) -> ConditionShape {
		match self {
			Self::ChannelFollow => ConditionShape::BroadcasterModerator,
			Self::ChannelChatNotification | Self::ChannelChatMessage => ConditionShape::BroadcasterUser,
			Self::ChannelRaid => ConditionShape::FromBroadcaster,
			_ => ConditionShape::Broadcaster,
		}
	}

	pub fn from_wire(s: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|k| k.as_str() == s)
	}
}

/// A subscription type string as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireSubscription<'a> {
	Registered(SubscriptionKind),
	Unregistered(&'a str),
}

pub fn lookup(s: &str) -> WireSubscription<'_> {
	match SubscriptionKind::from_wire(s) {
		Some(kind) => WireSubscription::Registered(kind),
		None => WireSubscription::Unregistered(s),
	}
}

/// Sink label for a raw subscription type; unknown types log under their own name.
pub fn label_for(raw: &str) -> &str {
	match lookup(raw) {
		WireSubscription::Registered(kind) => kind.label(),
		WireSubscription::Unregistered(s) => s,
	}
}

/// The broadcaster is also the moderator and the reading user.
pub fn build_subscription_request<'a>(
	kind: SubscriptionKind,
	broadcaster_id: &'a str,
	session_id: &'a str,
) -> CreateSubscriptionRequest<'a> {
	let condition = match kind.condition_shape() {
		ConditionShape::Broadcaster => SubscriptionCondition::Broadcaster {
			broadcaster_user_id: broadcaster_id,
		},
		ConditionShape::BroadcasterModerator => SubscriptionCondition::Moderator {
			broadcaster_user_id: broadcaster_id,
			moderator_user_id: broadcaster_id,
		},
		ConditionShape::BroadcasterUser => SubscriptionCondition::User {
			broadcaster_user_id: broadcaster_id,
			user_id: broadcaster_id,
		},
		ConditionShape::FromBroadcaster => SubscriptionCondition::FromBroadcaster {
			from_broadcaster_user_id: broadcaster_id,
		},
	};
	CreateSubscriptionRequest::websocket(kind.as_str(), kind.version(), condition, session_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
	pub stop_stream_after_raid: bool,
	pub delay_to_stop: Duration,
}

impl Default for DispatchOptions {
	fn default() -> Self {
		Self {
			stop_stream_after_raid: true,
			delay_to_stop: Duration::from_secs(180),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
	Continue,
	StreamFinished,
}

#[derive(Debug, Default)]
pub struct SubscriptionReport {
	pub created: Vec<SubscriptionKind>,
	pub failed: Vec<StreamStatsError>,
}

pub struct Dispatcher {
	stats: SharedStats,
	sink_tx: watch::Sender<StatsSink>,
	helix: Arc<HelixClient>,
	callbacks: Arc<dyn HostCallbacks>,
	stream_control: Option<Arc<dyn StreamControl>>,
	options: DispatchOptions,
}

impl Dispatcher {
	pub fn new(
		stats: SharedStats,
		sink: StatsSink,
		helix: Arc<HelixClient>,
		callbacks: Arc<dyn HostCallbacks>,
		options: DispatchOptions,
	) -> Self {
		let (sink_tx, _) = watch::channel(sink);
		Self {
			stats,
			sink_tx,
			helix,
			callbacks,
			stream_control: None,
			options,
		}
	}

	pub fn with_stream_control(mut self, control: Arc<dyn StreamControl>) -> Self {
		self.stream_control = Some(control);
		self
	}

	pub fn stats(&self) -> SharedStats {
		self.stats.clone()
	}

	/// The current stats sink.
	pub fn sink(&self) -> StatsSink {
		self.sink_tx.borrow().clone()
	}

	/// Follows sink rotation.
	pub fn sink_updates(&self) -> watch::Receiver<StatsSink> {
		self.sink_tx.subscribe()
	}

	pub fn helix(&self) -> &Arc<HelixClient> {
		&self.helix
	}

	/// Create one subscription per table entry for `session_id`.
	///
	/// A failed registration is logged and counted; the others still proceed.
	pub async fn register_subscriptions(&self, broadcaster_id: &str, session_id: &str) -> SubscriptionReport {
		let mut report = SubscriptionReport::default();

		for kind in SubscriptionKind::ALL {
			let req = build_subscription_request(kind, broadcaster_id, session_id);
			debug!(kind = %kind.as_str(), session_id, "creating eventsub subscription");

			match self.helix.create_eventsub_subscription(&req).await {
				Ok(()) => report.created.push(kind),
				Err(e) => {
					metrics::counter!("streamstats_subscription_failures_total").increment(1);
					let err = StreamStatsError::subscription(kind.as_str(), &e);
					warn!(error = %err, "eventsub subscription failed");
					report.failed.push(err);
				}
			}
		}

		info!(
			created = report.created.len(),
			failed = report.failed.len(),
			session_id,
			"eventsub subscriptions registered"
		);
		report
	}

	/// Route one `notification` frame. Frames are handled strictly in order by
	/// the single receive loop that owns this dispatcher.
	pub async fn handle_notification(&self, env: &NotificationEnvelope<'_>) -> NotificationOutcome {
		let Some(sub_type) = env.subscription_type.as_deref() else {
			warn!(message_id = %env.message_id, "notification without subscription type");
			return NotificationOutcome::Continue;
		};

		let kind = match lookup(sub_type) {
			WireSubscription::Registered(kind) => kind,
			WireSubscription::Unregistered(name) => {
				metrics::counter!("streamstats_unregistered_notifications_total").increment(1);
				warn!(subscription_type = %name, message_id = %env.message_id, "notification for unregistered type");
				return NotificationOutcome::Continue;
			}
		};

		metrics::counter!("streamstats_notifications_total", "type" => kind.as_str()).increment(1);

		if let Err(e) = handlers::handle(self, kind, env.raw).await {
			let err = StreamStatsError::decode(format!("{}: {e:#}", kind.as_str()));
			warn!(error = %err, message_id = %env.message_id, "notification dropped");
		}

		if kind == SubscriptionKind::StreamOffline {
			NotificationOutcome::StreamFinished
		} else {
			NotificationOutcome::Continue
		}
	}
}
