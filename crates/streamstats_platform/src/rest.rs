#![forbid(unsafe_code)]

//! Authenticated REST capability.
//!
//! Callers build a [`RestRequest`] and hand it to a [`RestTransport`]. The
//! transport only moves bytes; [`execute`] applies the status policy: 401 is
//! surfaced as [`RestError::Unauthorized`] and never retried, any other non-2xx
//! becomes [`RestError::Status`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use thiserror::Error;
use url::Url;

use crate::SecretString;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
	Get,
	Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestAuth {
	None,
	/// `Authorization: OAuth <token>`, used by the identity provider's validate endpoint.
	OAuth(SecretString),
	/// `Authorization: Bearer <token>` plus `Client-Id`.
	Bearer { token: SecretString, client_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestBody {
	Json(Vec<u8>),
	Form(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestRequest {
	pub method: Method,
	pub url: Url,
	pub auth: RestAuth,
	pub body: Option<RestBody>,
}

impl RestRequest {
	pub fn get(url: Url, auth: RestAuth) -> Self {
		Self {
			method: Method::Get,
			url,
			auth,
			body: None,
		}
	}

	pub fn post(url: Url, auth: RestAuth, body: RestBody) -> Self {
		Self {
			method: Method::Post,
			url,
			auth,
			body: Some(body),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestResponse {
	pub status: u16,
	pub body: String,
}

impl RestResponse {
	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}
}

#[derive(Error, Debug)]
pub enum RestError {
	#[error("unauthorized: body={body}")]
	Unauthorized { body: String },

	#[error("request failed: status={status} body={body}")]
	Status { status: u16, body: String },

	#[error(transparent)]
	Transport(#[from] anyhow::Error),
}

impl RestError {
	pub fn is_unauthorized(&self) -> bool {
		matches!(self, Self::Unauthorized { .. })
	}
}

/// Moves one request over the wire and returns the raw status and body.
#[async_trait]
pub trait RestTransport: Send + Sync {
	async fn send(&self, req: RestRequest) -> anyhow::Result<RestResponse>;
}

/// Send `req` and classify the response.
pub async fn execute(transport: &dyn RestTransport, req: RestRequest) -> Result<RestResponse, RestError> {
	let resp = transport.send(req).await?;
	if resp.status == 401 {
		return Err(RestError::Unauthorized { body: resp.body });
	}
	if !resp.is_success() {
		return Err(RestError::Status {
			status: resp.status,
			body: resp.body,
		});
	}
	Ok(resp)
}

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

/// reqwest-backed transport. Retries once on 429 (honouring the rate-limit
/// headers) and once on 5xx; 401 is returned as-is.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
	http: reqwest::Client,
}

impl ReqwestTransport {
	pub fn new() -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("streamstats/0.x")
			.build()
			.context("build reqwest client")?;
		Ok(Self { http })
	}

	fn build(&self, req: &RestRequest) -> reqwest::RequestBuilder {
		let mut builder = match req.method {
			Method::Get => self.http.get(req.url.clone()),
			Method::Post => self.http.post(req.url.clone()),
		};

		builder = match &req.auth {
			RestAuth::None => builder,
			RestAuth::OAuth(token) => builder.header("Authorization", format!("OAuth {}", token.expose())),
			RestAuth::Bearer { token, client_id } => builder
				.header("Client-Id", client_id)
				.header("Authorization", format!("Bearer {}", token.expose())),
		};

		match &req.body {
			None => builder,
			Some(RestBody::Json(bytes)) => builder
				.header(reqwest::header::CONTENT_TYPE, "application/json")
				.body(bytes.clone()),
			Some(RestBody::Form(pairs)) => builder.form(pairs),
		}
	}

	async fn send_with_retry(&self, req: &RestRequest) -> anyhow::Result<reqwest::Response> {
		let label = format!("{:?} {}", req.method, req.url.path());
		let resp = self
			.build(req)
			.send()
			.await
			.with_context(|| format!("rest {label} send"))?;
		let status = resp.status();

		if status == StatusCode::TOO_MANY_REQUESTS
			&& let Some(delay) = retry_delay_from_headers(resp.headers())
		{
			tokio::time::sleep(delay).await;
			return self
				.build(req)
				.send()
				.await
				.with_context(|| format!("rest {label} retry send"));
		}

		if status.is_server_error() {
			tokio::time::sleep(Duration::from_millis(250)).await;
			return self
				.build(req)
				.send()
				.await
				.with_context(|| format!("rest {label} retry send"));
		}

		Ok(resp)
	}
}

#[async_trait]
impl RestTransport for ReqwestTransport {
	async fn send(&self, req: RestRequest) -> anyhow::Result<RestResponse> {
		let resp = self.send_with_retry(&req).await?;
		let status = resp.status().as_u16();
		let body = resp.text().await.context("rest read body")?;
		Ok(RestResponse { status, body })
	}
}
