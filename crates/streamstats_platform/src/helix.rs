#![forbid(unsafe_code)]

//! Typed Helix calls: EventSub subscription creation and clip lookup.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::credential::CredentialStore;
use crate::host::UserClip;
use crate::rest::{RestAuth, RestBody, RestError, RestRequest, RestTransport, execute};

pub const HELIX_BASE_URL: &str = "https://api.twitch.tv";
pub const EVENTSUB_SUBSCRIPTIONS_URL: &str = "https://api.twitch.tv/helix/eventsub/subscriptions";
pub const SANDBOX_SUBSCRIPTIONS_URL: &str = "http://127.0.0.1:8080/eventsub/subscriptions";

const CLIPS_PATH: &str = "/helix/clips";
const CLIPS_PAGE_SIZE: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelixEndpoints {
	/// Base for regular Helix resources (clips).
	pub base_url: Url,
	/// Where subscription-creation requests are posted.
	pub subscriptions_url: Url,
}

impl HelixEndpoints {
	pub fn production() -> anyhow::Result<Self> {
		Ok(Self {
			base_url: Url::parse(HELIX_BASE_URL).context("parse helix base url")?,
			subscriptions_url: Url::parse(EVENTSUB_SUBSCRIPTIONS_URL).context("parse subscriptions url")?,
		})
	}

	/// Local EventSub test server for subscriptions; clips still come from production.
	pub fn sandbox() -> anyhow::Result<Self> {
		Ok(Self {
			subscriptions_url: Url::parse(SANDBOX_SUBSCRIPTIONS_URL).context("parse sandbox subscriptions url")?,
			..Self::production()?
		})
	}

	/// Point both endpoints at a custom Helix base (`<base>/helix/...`).
	pub fn with_base(base: &str) -> anyhow::Result<Self> {
		let base_url = Url::parse(base).with_context(|| format!("parse helix base url {base}"))?;
		let subscriptions_url = base_url
			.join("/helix/eventsub/subscriptions")
			.context("join subscriptions url")?;
		Ok(Self {
			base_url,
			subscriptions_url,
		})
	}
}

/// One of the four condition shapes a subscription type addresses its target with.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SubscriptionCondition<'a> {
	Moderator {
		broadcaster_user_id: &'a str,
		moderator_user_id: &'a str,
	},
	User {
		broadcaster_user_id: &'a str,
		user_id: &'a str,
	},
	Broadcaster {
		broadcaster_user_id: &'a str,
	},
	FromBroadcaster {
		from_broadcaster_user_id: &'a str,
	},
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WebsocketTransport<'a> {
	pub method: &'a str,
	pub session_id: &'a str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CreateSubscriptionRequest<'a> {
	#[serde(rename = "type")]
	pub r#type: &'a str,
	pub version: &'a str,
	pub condition: SubscriptionCondition<'a>,
	pub transport: WebsocketTransport<'a>,
}

impl<'a> CreateSubscriptionRequest<'a> {
	pub fn websocket(
		r#type: &'a str,
		version: &'a str,
		condition: SubscriptionCondition<'a>,
		session_id: &'a str,
	) -> Self {
		Self {
			r#type,
			version,
			condition,
			transport: WebsocketTransport {
				method: "websocket",
				session_id,
			},
		}
	}

	pub fn to_json_bytes(&self) -> anyhow::Result<Vec<u8>> {
		serde_json::to_vec(self).context("encode subscription request")
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixClipsResponse {
	#[serde(default)]
	pub data: Vec<HelixClip>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HelixClip {
	pub id: String,
	pub url: String,
	#[serde(default)]
	pub creator_name: String,
	pub title: String,
	#[serde(default)]
	pub view_count: u64,
	#[serde(default)]
	pub created_at: String,
	#[serde(default)]
	pub thumbnail_url: String,
	#[serde(default)]
	pub duration: f32,
}

impl From<&HelixClip> for UserClip {
	fn from(c: &HelixClip) -> Self {
		Self {
			id: c.id.clone(),
			url: c.url.clone(),
			title: c.title.clone(),
			thumbnail: c.thumbnail_url.clone(),
			view_count: c.view_count,
			duration: c.duration,
			mp4: mp4_url_from_thumbnail(&c.thumbnail_url),
		}
	}
}

/// Clip thumbnails end in `-preview-<w>x<h>.jpg`; the video sits next to them as `.mp4`.
pub fn mp4_url_from_thumbnail(thumbnail: &str) -> String {
	match thumbnail.find("-preview-") {
		Some(idx) => format!("{}.mp4", &thumbnail[..idx]),
		None => thumbnail.to_string(),
	}
}

/// One line per clip, as written to the raid clip log.
pub fn clip_text(clips: &[HelixClip]) -> String {
	let mut out = String::new();
	for c in clips {
		let _ = writeln!(
			out,
			"   再生回数[{}] / タイトル[{}] / URL[ {} ] / Id[ {} ]",
			c.view_count, c.title, c.url, c.id
		);
	}
	out
}

pub struct HelixClient {
	rest: Arc<dyn RestTransport>,
	endpoints: HelixEndpoints,
	credential: Arc<CredentialStore>,
}

impl HelixClient {
	pub fn new(rest: Arc<dyn RestTransport>, endpoints: HelixEndpoints, credential: Arc<CredentialStore>) -> Self {
		Self {
			rest,
			endpoints,
			credential,
		}
	}

	pub fn endpoints(&self) -> &HelixEndpoints {
		&self.endpoints
	}

	fn authed(&self) -> RestAuth {
		RestAuth::Bearer {
			token: self.credential.access_token(),
			client_id: self.credential.client_id().to_string(),
		}
	}

	pub async fn create_eventsub_subscription(&self, req: &CreateSubscriptionRequest<'_>) -> Result<(), RestError> {
		let body = req.to_json_bytes()?;
		let request = RestRequest::post(self.endpoints.subscriptions_url.clone(), self.authed(), RestBody::Json(body));
		execute(self.rest.as_ref(), request).await?;
		Ok(())
	}

	pub async fn get_clips(
		&self,
		broadcaster_id: &str,
		featured: bool,
		started_at: Option<DateTime<Utc>>,
		first: u32,
	) -> Result<Vec<HelixClip>, RestError> {
		let mut url = self
			.endpoints
			.base_url
			.join(CLIPS_PATH)
			.context("join helix clips url")?;
		{
			let mut q = url.query_pairs_mut();
			q.append_pair("broadcaster_id", broadcaster_id);
			q.append_pair("is_featured", if featured { "true" } else { "false" });
			q.append_pair("first", &first.to_string());
			if let Some(at) = started_at {
				q.append_pair("started_at", &at.to_rfc3339_opts(SecondsFormat::Secs, true));
			}
		}

		let resp = execute(self.rest.as_ref(), RestRequest::get(url, self.authed())).await?;
		let parsed: HelixClipsResponse = serde_json::from_str(&resp.body).context("helix clips parse json")?;
		Ok(parsed.data)
	}

	/// Featured clips first; when there are none, fall back to any clips.
	pub async fn get_user_clips_since(
		&self,
		broadcaster_id: &str,
		started_at: Option<DateTime<Utc>>,
	) -> Result<Vec<HelixClip>, RestError> {
		let featured = self
			.get_clips(broadcaster_id, true, started_at, CLIPS_PAGE_SIZE)
			.await?;
		if !featured.is_empty() {
			return Ok(featured);
		}
		self.get_clips(broadcaster_id, false, started_at, CLIPS_PAGE_SIZE)
			.await
	}

	pub async fn get_user_clips(&self, broadcaster_id: &str) -> Result<Vec<HelixClip>, RestError> {
		self.get_user_clips_since(broadcaster_id, None).await
	}

	/// Non-featured clips created since `since`, newest lookup used by the clip watcher.
	pub async fn clips_since(&self, broadcaster_id: &str, since: DateTime<Utc>) -> Result<Vec<HelixClip>, RestError> {
		self.get_clips(broadcaster_id, false, Some(since), CLIPS_PAGE_SIZE)
			.await
	}
}
