#![forbid(unsafe_code)]

//! EventSub WebSocket message decoding.
//!
//! Every frame is first read as a [`NotificationEnvelope`]; the typed event for
//! a notification is decoded on demand with [`parse_event`].


use anyhow::Context;
use serde::Deserialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
	Welcome,
	Keepalive,
	Reconnect,
	Notification,
	Revocation,
	Unknown,
}

impl MessageType {
	pub fn from_wire(s: &str) -> Self {
		match s {
			"session_welcome" => Self::Welcome,
			"session_keepalive" => Self::Keepalive,
			"session_reconnect" => Self::Reconnect,
			"notification" => Self::Notification,
			"revocation" => Self::Revocation,
			_ => Self::Unknown,
		}
	}
}

/// EventSub metadata (present on all WebSocket messages).
#[derive(Debug, Deserialize)]
struct EventSubMetadata {
	message_id: String,
	message_type: String,

	#[serde(default)]
	subscription_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EventSubSession {
	pub id: String,

	#[serde(default)]
	pub status: Option<String>,

	#[serde(default)]
	pub keepalive_timeout_seconds: Option<u64>,

	#[serde(default)]
	pub reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionPeek {
	#[serde(rename = "type")]
	r#type: String,
}

#[derive(Debug, Default, Deserialize)]
struct PayloadPeek {
	#[serde(default)]
	session: Option<EventSubSession>,

	#[serde(default)]
	subscription: Option<SubscriptionPeek>,
}

#[derive(Debug, Deserialize)]
struct EnvelopePeek {
	metadata: EventSubMetadata,

	#[serde(default)]
	payload: PayloadPeek,
}

/// One received frame, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEnvelope<'a> {
	pub message_id: String,
	pub message_type: MessageType,
	/// Metadata `subscription_type`, falling back to `payload.subscription.type`.
	pub subscription_type: Option<String>,
	pub session: Option<EventSubSession>,
	pub raw: &'a str,
}

pub fn parse_envelope(raw: &str) -> anyhow::Result<NotificationEnvelope<'_>> {
	let peek: EnvelopePeek = serde_json::from_str(raw).context("parse eventsub envelope")?;
	let subscription_type = peek
		.metadata
		.subscription_type
		.or_else(|| peek.payload.subscription.map(|s| s.r#type));

	Ok(NotificationEnvelope {
		message_id: peek.metadata.message_id,
		message_type: MessageType::from_wire(&peek.metadata.message_type),
		subscription_type,
		session: peek.payload.session,
		raw,
	})
}

#[derive(Debug, Deserialize)]
struct EventSubNotification<TEvent> {
	payload: EventSubNotificationPayload<TEvent>,
}

#[derive(Debug, Deserialize)]
struct EventSubNotificationPayload<TEvent> {
	event: TEvent,
}

/// Decode `payload.event` of a notification frame.
pub fn parse_event<TEvent: DeserializeOwned>(raw: &str) -> anyhow::Result<TEvent> {
	let msg: EventSubNotification<TEvent> = serde_json::from_str(raw).context("parse eventsub notification event")?;
	Ok(msg.payload.event)
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelSubscribeEvent {
	pub user_name: String,
	#[serde(default)]
	pub user_login: String,
	pub tier: String,
	#[serde(default)]
	pub is_gift: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelCheerEvent {
	/// Null for anonymous cheers.
	#[serde(default)]
	pub user_name: Option<String>,
	#[serde(default)]
	pub is_anonymous: bool,
	pub bits: u64,
	#[serde(default)]
	pub message: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StreamOnlineEvent {
	pub broadcaster_user_name: String,
	#[serde(default)]
	pub started_at: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StreamOfflineEvent {
	pub broadcaster_user_name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelSubscriptionGiftEvent {
	#[serde(default)]
	pub user_name: Option<String>,
	pub tier: String,
	pub total: u64,
	#[serde(default)]
	pub cumulative_total: Option<u64>,
	#[serde(default)]
	pub is_anonymous: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelSubscriptionMessageEvent {
	pub user_name: String,
	pub tier: String,
	#[serde(default)]
	pub cumulative_months: u64,
	#[serde(default)]
	pub streak_months: Option<u64>,
	#[serde(default)]
	pub duration_months: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelFollowEvent {
	pub user_name: String,
	#[serde(default)]
	pub user_login: String,
}

/// Outgoing raid started by the broadcaster.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelRaidEvent {
	pub from_broadcaster_user_name: String,
	pub to_broadcaster_user_name: String,
	pub viewers: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RedemptionReward {
	pub title: String,
	#[serde(default)]
	pub cost: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelPointsRedemptionEvent {
	pub user_name: String,
	#[serde(default)]
	pub user_login: String,
	pub reward: RedemptionReward,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SubGiftNotice {
	pub recipient_user_name: String,
	#[serde(default)]
	pub sub_tier: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChatRaidNotice {
	pub user_id: String,
	pub user_name: String,
	pub viewer_count: u64,
}

/// The active sub-kind of a `channel.chat.notification`, keyed by `notice_type`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "notice_type", rename_all = "snake_case")]
pub enum ChatNotice {
	Sub,
	Resub,
	SubGift {
		sub_gift: SubGiftNotice,
	},
	CommunitySubGift,
	GiftPaidUpgrade,
	PrimePaidUpgrade,
	Raid {
		raid: ChatRaidNotice,
	},
	Unraid,
	PayItForward,
	Announcement,
	BitsBadgeTier,
	CharityDonation,
	#[serde(other)]
	Unrecognized,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelChatNotificationEvent {
	pub chatter_user_name: String,
	#[serde(flatten)]
	pub notice: ChatNotice,
}

#[derive(Debug, Deserialize)]
struct NoticeTypePeek {
	#[serde(default)]
	notice_type: String,
}

/// The raw `notice_type` string, for logging sub-kinds this build does not know.
pub fn peek_notice_type(raw: &str) -> Option<String> {
	parse_event::<NoticeTypePeek>(raw).ok().map(|p| p.notice_type)
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatMessageType {
	#[default]
	Text,
	ChannelPointsHighlighted,
	ChannelPointsSubOnly,
	UserIntro,
	PowerUpsGigantifiedEmote,
	PowerUpsMessageEffect,
	#[serde(other)]
	Other,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ChatMessageContent {
	#[serde(default)]
	pub text: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelChatMessageEvent {
	pub chatter_user_name: String,
	#[serde(default)]
	pub chatter_user_login: String,
	#[serde(default)]
	pub message: ChatMessageContent,
	#[serde(default)]
	pub message_type: ChatMessageType,
}
