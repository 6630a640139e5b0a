#![forbid(unsafe_code)]

use std::sync::Arc;

use super::{
	Credential, CredentialPersistence, CredentialStore, FileCredentialPersistence, OAuthEndpoints, confirm_access_token,
};
use crate::SecretString;
use crate::rest::testing::RecordingTransport;
use crate::rest::{Method, RestAuth, RestBody};

const VALID_BODY: &str = r#"{"client_id":"cid","login":"streamer","user_id":"1234","expires_in":3600,"scopes":[]}"#;

fn mk_store(t: &Arc<RecordingTransport>, cred: Credential) -> CredentialStore {
	CredentialStore::new(t.clone(), "cid", SecretString::new("csecret"), cred).expect("store")
}

fn temp_path(name: &str) -> std::path::PathBuf {
	let dir = std::env::temp_dir().join(format!(
		"streamstats-credential-{}-{}",
		name,
		std::process::id()
	));
	let _ = std::fs::remove_dir_all(&dir);
	dir.join("auth.toml")
}

fn form_value(body: &Option<RestBody>, key: &str) -> Option<String> {
	match body {
		Some(RestBody::Form(pairs)) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()),
		_ => None,
	}
}

#[tokio::test]
async fn validate_caches_identity_and_uses_oauth_header() {
	let t = Arc::new(RecordingTransport::new());
	t.push(200, VALID_BODY);
	let store = mk_store(&t, Credential::new("acc", "ref"));

	let v = store.validate().await.expect("validate");
	assert!(v.valid);
	assert_eq!(v.expires_in, 3600);
	assert_eq!(v.login, "streamer");
	assert_eq!(store.broadcaster_id().as_deref(), Some("1234"));

	let sent = t.requests();
	assert_eq!(sent[0].method, Method::Get);
	assert_eq!(sent[0].url.as_str(), super::VALIDATE_URL);
	assert_eq!(sent[0].auth, RestAuth::OAuth(SecretString::new("acc")));
}

#[tokio::test]
async fn validate_401_is_invalid_without_error() {
	let t = Arc::new(RecordingTransport::new());
	t.push(401, r#"{"status":401,"message":"invalid access token"}"#);
	let store = mk_store(&t, Credential::new("stale", "ref"));

	let v = store.validate().await.expect("401 is not an error");
	assert!(!v.valid);
	assert_eq!(store.identity(), None);
}

#[tokio::test]
async fn validate_transport_failure_is_auth_error() {
	let t = Arc::new(RecordingTransport::new());
	t.push_err("dns failure");
	let store = mk_store(&t, Credential::new("acc", "ref"));

	assert!(store.validate().await.unwrap_err().is_auth());
}

#[tokio::test]
async fn refresh_posts_form_and_installs_new_pair() {
	let t = Arc::new(RecordingTransport::new());
	t.push(200, r#"{"access_token":"new-acc","refresh_token":"new-ref","expires_in":14000}"#);
	let store = mk_store(&t, Credential::new("old-acc", "old-ref"));

	let pair = store.refresh(&SecretString::new("old-ref")).await.expect("refresh");
	assert_eq!(pair.access.expose(), "new-acc");
	assert_eq!(pair.expires_in, Some(14000));
	assert_eq!(store.credential(), Credential::new("new-acc", "new-ref"));

	let sent = t.requests();
	assert_eq!(sent[0].method, Method::Post);
	assert_eq!(sent[0].url.as_str(), super::TOKEN_URL);
	assert_eq!(form_value(&sent[0].body, "grant_type").as_deref(), Some("refresh_token"));
	assert_eq!(form_value(&sent[0].body, "refresh_token").as_deref(), Some("old-ref"));
	assert_eq!(form_value(&sent[0].body, "client_secret").as_deref(), Some("csecret"));
}

#[tokio::test]
async fn refresh_keeps_old_refresh_token_when_omitted() {
	let t = Arc::new(RecordingTransport::new());
	t.push(200, r#"{"access_token":"new-acc"}"#);
	let store = mk_store(&t, Credential::new("old-acc", "old-ref"));

	store.refresh(&SecretString::new("old-ref")).await.expect("refresh");
	assert_eq!(store.credential(), Credential::new("new-acc", "old-ref"));
}

#[tokio::test]
async fn rejected_refresh_is_auth_error_and_keeps_credential() {
	let t = Arc::new(RecordingTransport::new());
	t.push(400, r#"{"status":400,"message":"Invalid refresh token"}"#);
	let store = mk_store(&t, Credential::new("old-acc", "old-ref"));

	let err = store.refresh(&SecretString::new("old-ref")).await.unwrap_err();
	assert!(err.is_auth());
	assert_eq!(store.credential(), Credential::new("old-acc", "old-ref"));
}

#[tokio::test]
async fn exchange_code_sends_authorization_code_grant() {
	let t = Arc::new(RecordingTransport::new());
	t.push(200, r#"{"access_token":"a","refresh_token":"r","expires_in":100,"token_type":"bearer"}"#);
	let store = mk_store(&t, Credential::default());

	store
		.exchange_code("the-code", "http://localhost")
		.await
		.expect("exchange");
	assert_eq!(store.credential(), Credential::new("a", "r"));

	let sent = t.requests();
	assert_eq!(form_value(&sent[0].body, "grant_type").as_deref(), Some("authorization_code"));
	assert_eq!(form_value(&sent[0].body, "code").as_deref(), Some("the-code"));
	assert_eq!(form_value(&sent[0].body, "redirect_uri").as_deref(), Some("http://localhost"));
}

#[test]
fn custom_identity_base_builds_both_urls() {
	let e = OAuthEndpoints::with_base("http://127.0.0.1:9000").unwrap();
	assert_eq!(e.validate_url.as_str(), "http://127.0.0.1:9000/oauth2/validate");
	assert_eq!(e.token_url.as_str(), "http://127.0.0.1:9000/oauth2/token");
}

#[test]
fn file_persistence_round_trips() {
	let path = temp_path("roundtrip");
	let p = FileCredentialPersistence::new(&path);
	let cred = Credential::new("access-\"quoted\"", "refresh-token-value");

	p.save(&cred).expect("save");
	let loaded = p.load().expect("load").expect("present");
	assert_eq!(loaded.access_token.expose(), cred.access_token.expose());
	assert_eq!(loaded.refresh_token.expose(), cred.refresh_token.expose());

	let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn missing_file_loads_as_none() {
	let path = temp_path("missing");
	assert_eq!(FileCredentialPersistence::new(&path).load().expect("load"), None);
}

#[test]
fn malformed_file_is_config_error() {
	let path = temp_path("malformed");
	std::fs::create_dir_all(path.parent().unwrap()).unwrap();
	std::fs::write(&path, "access_token = [").unwrap();

	let err = FileCredentialPersistence::new(&path).load().unwrap_err();
	assert!(matches!(err, crate::StreamStatsError::Config(_)));

	let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[tokio::test]
async fn confirm_refreshes_when_stored_token_is_invalid() {
	let path = temp_path("confirm");
	let p = FileCredentialPersistence::new(&path);
	p.save(&Credential::new("stale", "ref")).unwrap();

	let t = Arc::new(RecordingTransport::new());
	t.push(401, "{}");
	t.push(200, r#"{"access_token":"fresh","refresh_token":"ref2","expires_in":14000}"#);
	t.push(200, VALID_BODY);
	let store = mk_store(&t, Credential::default());

	let expires = confirm_access_token(&store, &p).await.expect("confirm");
	assert_eq!(expires, 3600);
	assert_eq!(p.load().unwrap(), Some(Credential::new("fresh", "ref2")));
	assert_eq!(t.requests().len(), 3);

	let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[tokio::test]
async fn confirm_without_any_credential_is_auth_error() {
	let path = temp_path("confirm-empty");
	let t = Arc::new(RecordingTransport::new());
	let store = mk_store(&t, Credential::default());

	let err = confirm_access_token(&store, &FileCredentialPersistence::new(&path))
		.await
		.unwrap_err();
	assert!(err.is_auth());
	assert!(t.requests().is_empty());
}
