#![forbid(unsafe_code)]

//! Access/refresh credential pair and the identity-provider operations on it.

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::rest::{RestAuth, RestBody, RestError, RestRequest, RestTransport, execute};
use crate::{Result, SecretString, StreamStatsError};

pub const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
pub const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
	pub access_token: SecretString,
	pub refresh_token: SecretString,
}

impl Credential {
	pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
		Self {
			access_token: SecretString::new(access_token),
			refresh_token: SecretString::new(refresh_token),
		}
	}
}

/// Who the access token belongs to. Subscription conditions address the
/// broadcaster by `user_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
	pub user_id: String,
	pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
	pub valid: bool,
	pub expires_in: u64,
	pub login: String,
	pub user_id: String,
}

impl Validation {
	fn invalid() -> Self {
		Self {
			valid: false,
			expires_in: 0,
			login: String::new(),
			user_id: String::new(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
	pub access: SecretString,
	pub refresh: SecretString,
	pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
	pub validate_url: Url,
	pub token_url: Url,
}

impl OAuthEndpoints {
	pub fn production() -> anyhow::Result<Self> {
		Ok(Self {
			validate_url: Url::parse(VALIDATE_URL).context("parse validate url")?,
			token_url: Url::parse(TOKEN_URL).context("parse token url")?,
		})
	}

	/// `<base>/oauth2/validate` and `<base>/oauth2/token`.
	pub fn with_base(base: &str) -> anyhow::Result<Self> {
		let base = Url::parse(base).with_context(|| format!("parse identity base url {base}"))?;
		Ok(Self {
			validate_url: base.join("/oauth2/validate").context("join validate url")?,
			token_url: base.join("/oauth2/token").context("join token url")?,
		})
	}
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
	#[serde(default)]
	login: String,
	#[serde(default)]
	user_id: String,
	#[serde(default)]
	expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	refresh_token: Option<String>,
	#[serde(default)]
	expires_in: Option<u64>,
}

/// Holds the current credential and the identity resolved from it.
pub struct CredentialStore {
	rest: Arc<dyn RestTransport>,
	endpoints: OAuthEndpoints,
	client_id: String,
	client_secret: SecretString,
	credential: RwLock<Credential>,
	identity: RwLock<Option<TokenIdentity>>,
}

impl CredentialStore {
	pub fn new(
		rest: Arc<dyn RestTransport>,
		client_id: impl Into<String>,
		client_secret: SecretString,
		credential: Credential,
	) -> anyhow::Result<Self> {
		Ok(Self {
			rest,
			endpoints: OAuthEndpoints::production()?,
			client_id: client_id.into(),
			client_secret,
			credential: RwLock::new(credential),
			identity: RwLock::new(None),
		})
	}

	pub fn with_endpoints(mut self, endpoints: OAuthEndpoints) -> Self {
		self.endpoints = endpoints;
		self
	}

	pub fn credential(&self) -> Credential {
		self.credential.read().clone()
	}

	pub fn access_token(&self) -> SecretString {
		self.credential.read().access_token.clone()
	}

	pub fn client_id(&self) -> &str {
		&self.client_id
	}

	pub fn identity(&self) -> Option<TokenIdentity> {
		self.identity.read().clone()
	}

	pub fn broadcaster_id(&self) -> Option<String> {
		self.identity.read().as_ref().map(|i| i.user_id.clone())
	}

	pub fn replace(&self, credential: Credential) {
		*self.credential.write() = credential;
	}

	/// Ask the identity provider whether the current access token is valid.
	///
	/// A 401 is a definite "no" (`valid = false`, no error); anything that
	/// prevents an answer is an [`StreamStatsError::Auth`].
	pub async fn validate(&self) -> Result<Validation> {
		let req = RestRequest::get(self.endpoints.validate_url.clone(), RestAuth::OAuth(self.access_token()));

		let resp = match execute(self.rest.as_ref(), req).await {
			Ok(resp) => resp,
			Err(RestError::Unauthorized { body }) => {
				info!(body = %body, "access token rejected by validate");
				return Ok(Validation::invalid());
			}
			Err(e) => return Err(StreamStatsError::auth(format!("validate token: {e}"))),
		};

		let parsed: ValidateResponse =
			serde_json::from_str(&resp.body).map_err(|e| StreamStatsError::decode(format!("validate response: {e}")))?;

		*self.identity.write() = Some(TokenIdentity {
			user_id: parsed.user_id.clone(),
			login: parsed.login.clone(),
		});
		debug!(login = %parsed.login, user_id = %parsed.user_id, expires_in = parsed.expires_in, "access token valid");

		Ok(Validation {
			valid: true,
			expires_in: parsed.expires_in,
			login: parsed.login,
			user_id: parsed.user_id,
		})
	}

	/// Trade `refresh_token` for a new pair and install it.
	///
	/// When the provider omits a new refresh token the old one is kept.
	pub async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenPair> {
		let form = vec![
			("grant_type".to_string(), "refresh_token".to_string()),
			("client_id".to_string(), self.client_id.clone()),
			("client_secret".to_string(), self.client_secret.expose().to_string()),
			("refresh_token".to_string(), refresh_token.expose().to_string()),
		];

		let result = self.token_request(form, "refresh").await;
		let outcome = if result.is_ok() { "ok" } else { "error" };
		metrics::counter!("streamstats_token_refresh_total", "result" => outcome).increment(1);

		let resp = result?;
		let pair = TokenPair {
			access: SecretString::new(resp.access_token),
			refresh: resp
				.refresh_token
				.map(SecretString::new)
				.unwrap_or_else(|| refresh_token.clone()),
			expires_in: resp.expires_in,
		};
		self.install(&pair);
		info!(expires_in = ?pair.expires_in, "access token refreshed");
		Ok(pair)
	}

	/// One-time exchange of an authorization code for a credential pair.
	pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenPair> {
		let form = vec![
			("grant_type".to_string(), "authorization_code".to_string()),
			("client_id".to_string(), self.client_id.clone()),
			("client_secret".to_string(), self.client_secret.expose().to_string()),
			("code".to_string(), code.to_string()),
			("redirect_uri".to_string(), redirect_uri.to_string()),
		];

		let resp = self.token_request(form, "authorization_code").await?;
		let pair = TokenPair {
			access: SecretString::new(resp.access_token),
			refresh: SecretString::new(resp.refresh_token.unwrap_or_default()),
			expires_in: resp.expires_in,
		};
		self.install(&pair);
		info!("authorization code exchanged");
		Ok(pair)
	}

	async fn token_request(&self, form: Vec<(String, String)>, grant: &str) -> Result<TokenResponse> {
		let req = RestRequest::post(self.endpoints.token_url.clone(), RestAuth::None, RestBody::Form(form));
		let resp = execute(self.rest.as_ref(), req)
			.await
			.map_err(|e| StreamStatsError::auth(format!("token request (grant={grant}): {e}")))?;
		serde_json::from_str(&resp.body)
			.map_err(|e| StreamStatsError::decode(format!("token response (grant={grant}): {e}")))
	}

	fn install(&self, pair: &TokenPair) {
		let mut cred = self.credential.write();
		cred.access_token = pair.access.clone();
		cred.refresh_token = pair.refresh.clone();
	}
}

/// Where the credential pair lives between runs.
pub trait CredentialPersistence: Send + Sync {
	/// `Ok(None)` when nothing has been stored yet.
	fn load(&self) -> Result<Option<Credential>>;
	fn save(&self, credential: &Credential) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCredential {
	#[serde(default)]
	access_token: String,
	#[serde(default)]
	refresh_token: String,
}

/// TOML file with `access_token` and `refresh_token`.
#[derive(Debug, Clone)]
pub struct FileCredentialPersistence {
	path: PathBuf,
}

impl FileCredentialPersistence {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl CredentialPersistence for FileCredentialPersistence {
	fn load(&self) -> Result<Option<Credential>> {
		let raw = match std::fs::read_to_string(&self.path) {
			Ok(s) => s,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => {
				return Err(StreamStatsError::config(format!(
					"read credential file {}: {e}",
					self.path.display()
				)));
			}
		};

		let stored: StoredCredential = toml::from_str(&raw)
			.map_err(|e| StreamStatsError::config(format!("parse credential file {}: {e}", self.path.display())))?;
		Ok(Some(Credential::new(stored.access_token, stored.refresh_token)))
	}

	fn save(&self, credential: &Credential) -> Result<()> {
		if let Some(parent) = self.path.parent()
			&& !parent.as_os_str().is_empty()
		{
			std::fs::create_dir_all(parent)
				.map_err(|e| StreamStatsError::config(format!("create credential dir {}: {e}", parent.display())))?;
		}

		let stored = StoredCredential {
			access_token: credential.access_token.expose().to_string(),
			refresh_token: credential.refresh_token.expose().to_string(),
		};
		let raw = toml::to_string(&stored).map_err(|e| StreamStatsError::config(format!("encode credential: {e}")))?;
		std::fs::write(&self.path, raw)
			.map_err(|e| StreamStatsError::config(format!("write credential file {}: {e}", self.path.display())))
	}
}

/// Persist the store's current credential and confirm it validates.
/// Returns the remaining lifetime in seconds.
pub async fn commit_credential(store: &CredentialStore, persistence: &dyn CredentialPersistence) -> Result<u64> {
	persistence.save(&store.credential())?;
	let v = store.validate().await?;
	if !v.valid {
		return Err(StreamStatsError::auth("token still invalid after update"));
	}
	Ok(v.expires_in)
}

/// Startup check: load the stored credential, validate it and refresh once
/// when the provider says it is no longer valid.
pub async fn confirm_access_token(store: &CredentialStore, persistence: &dyn CredentialPersistence) -> Result<u64> {
	match persistence.load()? {
		Some(c) => store.replace(c),
		None if store.credential().access_token.is_empty() => {
			return Err(StreamStatsError::auth(
				"no stored credential; authorize once with an authorization code",
			));
		}
		None => {}
	}

	let v = store.validate().await?;
	if v.valid {
		info!(login = %v.login, expires_in = v.expires_in, "stored access token ok");
		return Ok(v.expires_in);
	}

	warn!("stored access token invalid; refreshing");
	let refresh_token = store.credential().refresh_token;
	store.refresh(&refresh_token).await?;
	commit_credential(store, persistence).await
}
