#![forbid(unsafe_code)]

use anyhow::Context;
use tracing::{debug, info, warn};

use super::{Dispatcher, SubscriptionKind};
use crate::eventsub::{
	self, ChannelChatMessageEvent, ChannelChatNotificationEvent, ChannelCheerEvent, ChannelFollowEvent,
	ChannelPointsRedemptionEvent, ChannelRaidEvent, ChannelSubscribeEvent, ChannelSubscriptionGiftEvent,
	ChannelSubscriptionMessageEvent, ChatMessageType, ChatNotice, ChatRaidNotice, StreamOfflineEvent,
	StreamOnlineEvent, SubGiftNotice,
};
use crate::helix::clip_text;
use crate::host::{RaidNotice, UserClip};

const ANONYMOUS: &str = "anonymous";

/// Decode the event for `kind` and apply it.
pub(super) async fn handle(d: &Dispatcher, kind: SubscriptionKind, raw: &str) -> anyhow::Result<()> {
	match kind {
		SubscriptionKind::ChannelSubscribe => channel_subscribe(d, raw),
		SubscriptionKind::ChannelCheer => channel_cheer(d, raw),
		SubscriptionKind::StreamOnline => stream_online(d, raw),
		SubscriptionKind::StreamOffline => {
			stream_offline(d, raw);
			Ok(())
		}
		SubscriptionKind::ChannelSubscriptionGift => subscription_gift(d, raw),
		SubscriptionKind::ChannelSubscriptionMessage => subscription_message(d, raw),
		SubscriptionKind::ChannelChatNotification => chat_notification(d, raw).await,
		SubscriptionKind::ChannelChatMessage => chat_message(d, raw),
		SubscriptionKind::ChannelRaid => raid_started(d, raw),
		SubscriptionKind::ChannelFollow => follow(d, raw),
		SubscriptionKind::ChannelPointsRedemptionAdd => channel_points(d, raw),
	}
}

fn channel_subscribe(d: &Dispatcher, raw: &str) -> anyhow::Result<()> {
	let e: ChannelSubscribeEvent = eventsub::parse_event(raw).context("decode channel.subscribe")?;
	if e.is_gift {
		// counted through the chat notification sub_gift sub-kind
		debug!(user = %e.user_name, "gifted subscription skipped");
		return Ok(());
	}

	d.sink().record(
		SubscriptionKind::ChannelSubscribe.label(),
		&[("user", e.user_name.clone()), ("tier", e.tier.clone()), ("gift", "false".into())],
	);
	d.stats.write().subscribe(&e.user_name, &e.tier);
	Ok(())
}

fn channel_cheer(d: &Dispatcher, raw: &str) -> anyhow::Result<()> {
	let e: ChannelCheerEvent = eventsub::parse_event(raw).context("decode channel.cheer")?;
	let user = e.user_name.unwrap_or_else(|| ANONYMOUS.to_string());

	d.sink().record(
		SubscriptionKind::ChannelCheer.label(),
		&[
			("user", user.clone()),
			("anonymous", e.is_anonymous.to_string()),
			("bits", e.bits.to_string()),
			("msg", e.message),
		],
	);
	d.stats.write().cheer(&user, e.bits);
	Ok(())
}

fn stream_online(d: &Dispatcher, raw: &str) -> anyhow::Result<()> {
	let e: StreamOnlineEvent = eventsub::parse_event(raw).context("decode stream.online")?;

	match d.sink().rotate() {
		Ok(next) => {
			info!(path = %next.path().display(), "stats sink rotated");
			d.sink_tx.send_replace(next);
		}
		Err(e) => warn!(error = ?e, "stats sink rotation failed; keeping current sink"),
	}

	d.stats.write().stream_started();

	let sink = d.sink();
	sink.record(
		SubscriptionKind::StreamOnline.label(),
		&[("user", e.broadcaster_user_name), ("at", e.started_at)],
	);
	if let Err(e) = sink.clear_raid_log() {
		warn!(error = ?e, "raid log clear failed");
	}
	Ok(())
}

/// The stream ends even when the payload does not decode.
fn stream_offline(d: &Dispatcher, raw: &str) {
	let user = match eventsub::parse_event::<StreamOfflineEvent>(raw) {
		Ok(e) => e.broadcaster_user_name,
		Err(e) => {
			warn!(error = ?e, "decode stream.offline");
			String::new()
		}
	};

	let sink = d.sink();
	sink.record(SubscriptionKind::StreamOffline.label(), &[("user", user)]);

	let snapshot = {
		let mut stats = d.stats.write();
		stats.stream_finished();
		stats.clone()
	};
	if let Err(e) = sink.append_report(&snapshot) {
		warn!(error = ?e, "stream history write failed");
	}
}

fn subscription_gift(d: &Dispatcher, raw: &str) -> anyhow::Result<()> {
	let e: ChannelSubscriptionGiftEvent = eventsub::parse_event(raw).context("decode channel.subscription.gift")?;
	let user = e.user_name.unwrap_or_else(|| ANONYMOUS.to_string());

	d.sink().record(
		SubscriptionKind::ChannelSubscriptionGift.label(),
		&[
			("user", user.clone()),
			("tier", e.tier),
			("num", e.total.to_string()),
			("cumulative", e.cumulative_total.map(|n| n.to_string()).unwrap_or_default()),
			("anonymous", e.is_anonymous.to_string()),
		],
	);
	d.stats.write().sub_gift(&user, e.total);
	Ok(())
}

fn subscription_message(d: &Dispatcher, raw: &str) -> anyhow::Result<()> {
	let e: ChannelSubscriptionMessageEvent =
		eventsub::parse_event(raw).context("decode channel.subscription.message")?;

	d.sink().record(
		SubscriptionKind::ChannelSubscriptionMessage.label(),
		&[
			("user", e.user_name.clone()),
			("tier", e.tier.clone()),
			("duration", e.duration_months.to_string()),
			("streak", e.streak_months.map(|n| n.to_string()).unwrap_or_default()),
			("cumulative", e.cumulative_months.to_string()),
		],
	);
	d.stats.write().subscribe(&e.user_name, &e.tier);
	Ok(())
}

async fn chat_notification(d: &Dispatcher, raw: &str) -> anyhow::Result<()> {
	let e: ChannelChatNotificationEvent = eventsub::parse_event(raw).context("decode channel.chat.notification")?;

	match e.notice {
		ChatNotice::SubGift { sub_gift } => sub_gifted(d, &e.chatter_user_name, sub_gift),
		ChatNotice::Raid { raid } => raided(d, raid).await,
		ChatNotice::Unrecognized => {
			let notice_type = eventsub::peek_notice_type(raw).unwrap_or_default();
			warn!(notice_type = %notice_type, "chat notification sub-kind not handled");
		}
		// resub arrives again as channel.subscription.message
		other => debug!(notice = ?other, "chat notification ignored"),
	}
	Ok(())
}

fn sub_gifted(d: &Dispatcher, from: &str, gift: SubGiftNotice) {
	d.sink().record(
		SubscriptionKind::ChannelChatNotification.label(),
		&[
			("category", "サブギフ受信".into()),
			("from", from.to_string()),
			("to", gift.recipient_user_name.clone()),
		],
	);
	d.stats
		.write()
		.sub_gifted(&gift.recipient_user_name, &gift.sub_tier);
}

async fn raided(d: &Dispatcher, raid: ChatRaidNotice) {
	let sink = d.sink();
	sink.record(
		SubscriptionKind::ChannelChatNotification.label(),
		&[
			("category", "レイド".into()),
			("from", raid.user_name.clone()),
			("viewers", raid.viewer_count.to_string()),
		],
	);
	d.stats.write().raid(&raid.user_name, raid.viewer_count);

	let clips = match d.helix.get_user_clips(&raid.user_id).await {
		Ok(clips) => clips,
		Err(e) => {
			warn!(error = %e, from = %raid.user_name, "raider clip lookup failed");
			Vec::new()
		}
	};

	if let Err(e) = sink.append_raid_clips(&raid.user_name, &clip_text(&clips)) {
		warn!(error = ?e, "raid clip log write failed");
	}

	let notice = RaidNotice {
		from: raid.user_name,
		clips: clips.iter().map(UserClip::from).collect(),
	};
	d.callbacks.on_raid(&notice);
}

fn chat_message(d: &Dispatcher, raw: &str) -> anyhow::Result<()> {
	let e: ChannelChatMessageEvent = eventsub::parse_event(raw).context("decode channel.chat.message")?;

	let label = {
		let mut stats = d.stats.write();
		stats.chat(&e.chatter_user_name, &e.message.text);
		match e.message_type {
			ChatMessageType::PowerUpsGigantifiedEmote => {
				stats.gigantified_emote(&e.chatter_user_name);
				"巨大化スタンプ"
			}
			ChatMessageType::PowerUpsMessageEffect => {
				stats.message_effect(&e.chatter_user_name);
				"メッセージエフェクト"
			}
			_ => SubscriptionKind::ChannelChatMessage.label(),
		}
	};

	d.sink().record(
		label,
		&[
			("user", e.chatter_user_name),
			("login", e.chatter_user_login),
			("text", e.message.text),
		],
	);
	Ok(())
}

fn raid_started(d: &Dispatcher, raw: &str) -> anyhow::Result<()> {
	let e: ChannelRaidEvent = eventsub::parse_event(raw).context("decode channel.raid")?;

	d.sink().record(
		SubscriptionKind::ChannelRaid.label(),
		&[
			("from", e.from_broadcaster_user_name),
			("to", e.to_broadcaster_user_name),
			("viewers", e.viewers.to_string()),
		],
	);

	if !d.options.stop_stream_after_raid {
		return Ok(());
	}
	let Some(control) = d.stream_control.clone() else {
		debug!("no stream control configured; stream keeps running after raid");
		return Ok(());
	};

	let delay = d.options.delay_to_stop;
	info!(delay = ?delay, "stream stop scheduled after raid");
	tokio::spawn(async move {
		tokio::time::sleep(delay).await;
		match control.stop_stream().await {
			Ok(()) => info!("stream stopped after raid"),
			Err(e) => warn!(error = ?e, "stop stream after raid failed"),
		}
	});
	Ok(())
}

fn follow(d: &Dispatcher, raw: &str) -> anyhow::Result<()> {
	let e: ChannelFollowEvent = eventsub::parse_event(raw).context("decode channel.follow")?;

	d.sink().record(
		SubscriptionKind::ChannelFollow.label(),
		&[("user", e.user_name.clone()), ("login", e.user_login)],
	);
	d.stats.write().follow(&e.user_name);
	Ok(())
}

fn channel_points(d: &Dispatcher, raw: &str) -> anyhow::Result<()> {
	let e: ChannelPointsRedemptionEvent =
		eventsub::parse_event(raw).context("decode channel points redemption")?;

	d.sink().record(
		SubscriptionKind::ChannelPointsRedemptionAdd.label(),
		&[
			("user", e.user_name.clone()),
			("login", e.user_login),
			("title", e.reward.title.clone()),
		],
	);
	d.stats.write().channel_point(&e.user_name, &e.reward.title);
	Ok(())
}
