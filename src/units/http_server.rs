//! The HTTP surface.
//!
//! Serves the dashboard's JSON API and the interactive approval pages.  All
//! endpoints speak JSON except `GET /requests/{id}`, which renders the HTML
//! approval (or registration) page.  CORS reflects the caller's origin with
//! credentials allowed, since the dashboard lives on another origin.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::Html;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use nostr::nips::nip19::ToBech32;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};

use crate::api::{
    AppEntry, AppsList, ApproveBody, ApproveResult, AuditEntryInfo, ActivityBucket,
    ConnectionInfo, Dashboard, DashboardCounts, EventPreview, KeyCreate, KeyCreateError,
    KeyCreateResult, KeyEntry, KeysList, RegisterBody, RequestEntry, RequestsList,
};
use crate::center::{self, ApproveError, Center, KeyActionError};
use crate::comms::{ApplicationCommand, Terminated};
use crate::provision;
use crate::store::{PendingRequest, RequestStatus, SigningCondition, PENDING_TTL_SECS};
use crate::util;
use crate::vault::VaultError;

const UNIT: &str = "HS";

/// How often the registration handler polls for the provisioned key.
const REGISTER_POLL: Duration = Duration::from_millis(100);

/// How long the registration handler waits for the provisioned key.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpServer {
    pub center: Arc<Center>,
}

struct HttpState {
    center: Arc<Center>,
}

impl HttpServer {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
        ready_tx: oneshot::Sender<bool>,
    ) -> Result<(), Terminated> {
        let addr = {
            let config = self.center.config.lock().unwrap();
            format!("{}:{}", config.auth_host, config.auth_port)
        };
        let sock = TcpListener::bind(&addr).await.map_err(|e| {
            error!("[{UNIT}]: cannot listen on {addr}: {e}");
            Terminated
        })?;
        info!("[{UNIT}] Listening on {addr}");

        tokio::task::spawn(async move {
            loop {
                let cmd = cmd_rx.recv().await;
                let Some(cmd) = cmd else {
                    return Result::<(), Terminated>::Err(Terminated);
                };
                if matches!(cmd, ApplicationCommand::Terminate) {
                    return Err(Terminated);
                }
            }
        });

        let state = Arc::new(HttpState {
            center: self.center,
        });

        let cors = CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_credentials(true)
            .allow_methods([Method::GET, Method::POST, Method::PATCH])
            .allow_headers([header::CONTENT_TYPE]);

        let app = Router::new()
            .route("/connection", get(Self::connection))
            .route("/requests", get(Self::requests_list))
            .route(
                "/requests/{id}",
                get(Self::request_page).post(Self::request_approve),
            )
            .route("/register/{id}", post(Self::register))
            .route("/keys", get(Self::keys_list).post(Self::keys_create))
            .route("/apps", get(Self::apps_list))
            .route("/apps/{id}", patch(Self::app_rename))
            .route("/apps/{id}/revoke", post(Self::app_revoke))
            .route("/dashboard", get(Self::dashboard))
            .layer(cors)
            .with_state(state);

        ready_tx.send(true).map_err(|_| Terminated)?;

        axum::serve(sock, app).await.map_err(|e| {
            error!("[{UNIT}]: {e}");
            Terminated
        })
    }

    async fn connection(State(state): State<Arc<HttpState>>) -> Json<ConnectionInfo> {
        let center = &state.center;
        let config = center.config.lock().unwrap();
        let admin_keys = config.admin_keys();
        let admin_pubkey = admin_keys.as_ref().map(|k| k.public_key().to_hex());

        let mut bunker_uris = Vec::new();
        if let Some(pubkey) = &admin_pubkey {
            bunker_uris.push(center::connection_descriptor(
                pubkey,
                &config.admin.admin_relays,
                config.admin.secret.as_deref(),
            ));
        }
        for name in center.active_key_names() {
            if let Some(key) = center.active_key(&name) {
                bunker_uris.push(center::connection_descriptor(
                    &key.keys.public_key().to_hex(),
                    &config.nostr.relays,
                    None,
                ));
            }
        }

        Json(ConnectionInfo {
            bunker_uris,
            relays: config.nostr.relays.clone(),
            admin_pubkey,
        })
    }

    async fn requests_list(
        State(state): State<Arc<HttpState>>,
        Query(query): Query<ListQuery>,
    ) -> Result<Json<RequestsList>, (StatusCode, Json<ApproveResult>)> {
        let status = match query.status.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<RequestStatus>().map_err(|()| {
                input_error("unknown status")
            })?),
        };

        let rows = state
            .center
            .store
            .list_requests(status, query.limit.unwrap_or(50), query.offset.unwrap_or(0))
            .map_err(internal_error)?;

        Ok(Json(RequestsList {
            requests: rows.iter().map(request_entry).collect(),
        }))
    }

    async fn request_page(
        State(state): State<Arc<HttpState>>,
        Path(id): Path<i64>,
    ) -> Result<Html<String>, StatusCode> {
        let row = state
            .center
            .store
            .get_pending_request(id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .ok_or(StatusCode::NOT_FOUND)?;

        let encrypted = {
            let config = state.center.config.lock().unwrap();
            config
                .keys
                .get(&row.key_name)
                .is_some_and(|key| key.is_encrypted())
        };

        Ok(Html(render_request_page(&row, encrypted)))
    }

    async fn request_approve(
        State(state): State<Arc<HttpState>>,
        Path(id): Path<i64>,
        Json(body): Json<ApproveBody>,
    ) -> (StatusCode, Json<ApproveResult>) {
        match center::approve_pending(&state.center, id, body.password.as_deref()) {
            Ok(()) => (StatusCode::OK, Json(ApproveResult::ok())),
            Err(err) => approve_error(err),
        }
    }

    async fn register(
        State(state): State<Arc<HttpState>>,
        Path(id): Path<i64>,
        Json(body): Json<RegisterBody>,
    ) -> (StatusCode, Json<ApproveResult>) {
        // Vet the form values.  The reserved-name list applied to the
        // originally requested name; the form value is taken as-is.
        let username = match provision::validate_username(&body.username) {
            Ok(username) => username,
            Err(err) => return input_error(err.to_string()),
        };
        let domain = body.domain.trim().to_lowercase();
        {
            let config = state.center.config.lock().unwrap();
            if !config.domains.contains_key(&domain) {
                return input_error("unknown domain");
            }
        }
        if body.password.is_empty() {
            return input_error("a password is required");
        }
        let email = body.email.unwrap_or_default();

        let params = [username.clone(), domain.clone(), email];
        if let Err(err) = center::approve_registration(&state.center, id, &params) {
            return approve_error(err);
        }

        // Wait for the provisioning path to mint the key.
        let key_name = format!("{username}@{domain}");
        let appeared = tokio::time::timeout(REGISTER_TIMEOUT, async {
            loop {
                match state.center.store.get_key_row(&key_name) {
                    Ok(Some(_)) => return true,
                    Ok(None) => tokio::time::sleep(REGISTER_POLL).await,
                    Err(_) => return false,
                }
            }
        })
        .await
        .unwrap_or(false);
        if !appeared {
            return (
                StatusCode::BAD_GATEWAY,
                Json(ApproveResult::error("the key was not provisioned in time")),
            );
        }

        let Ok(hash) = bcrypt::hash(&body.password, 10) else {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApproveResult::error("cannot hash the password")),
            );
        };
        if let Err(err) = state.center.store.upsert_user(&key_name, &hash) {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApproveResult::error(err.to_string())),
            );
        }

        (StatusCode::OK, Json(ApproveResult::ok()))
    }

    async fn keys_list(State(state): State<Arc<HttpState>>) -> Json<KeysList> {
        let center = &state.center;
        let config = center.config.lock().unwrap();
        let keys = config
            .keys
            .iter()
            .map(|(name, stored)| {
                let active = center.active_key(name);
                let npub = active
                    .as_ref()
                    .and_then(|key| key.keys.public_key().to_bech32().ok());
                let bunker_uri = active.as_ref().map(|key| {
                    center::connection_descriptor(
                        &key.keys.public_key().to_hex(),
                        &config.nostr.relays,
                        None,
                    )
                });
                KeyEntry {
                    name: name.clone(),
                    npub,
                    active: active.is_some(),
                    encrypted: stored.is_encrypted(),
                    bunker_uri,
                }
            })
            .collect();
        Json(KeysList { keys })
    }

    async fn keys_create(
        State(state): State<Arc<HttpState>>,
        Json(body): Json<KeyCreate>,
    ) -> Result<Json<KeyCreateResult>, (StatusCode, Json<KeyCreateError>)> {
        if body.key_name.trim().is_empty() {
            return Err((StatusCode::BAD_REQUEST, Json(KeyCreateError::InvalidName)));
        }

        let active = center::create_key(
            &state.center,
            body.key_name.trim(),
            body.passphrase.as_deref(),
            body.nsec.as_deref(),
        )
        .map_err(|err| {
            warn!("[{UNIT}] Cannot create key '{}': {err}", body.key_name.trim());
            let (status, wire) = key_create_error(&err);
            (status, Json(wire))
        })?;

        Ok(Json(KeyCreateResult {
            name: active.name.clone(),
            npub: active
                .keys
                .public_key()
                .to_bech32()
                .unwrap_or_else(|_| active.keys.public_key().to_hex()),
        }))
    }

    async fn apps_list(
        State(state): State<Arc<HttpState>>,
    ) -> Result<Json<AppsList>, (StatusCode, Json<ApproveResult>)> {
        let store = &state.center.store;
        let users = store.list_key_users(None, false).map_err(internal_error)?;

        let mut apps = Vec::with_capacity(users.len());
        for user in users {
            let conditions = store.conditions_for(user.id).map_err(internal_error)?;
            let request_count = store.audit_count_for(user.id).map_err(internal_error)?;
            apps.push(AppEntry {
                id: user.id,
                key_name: user.key_name,
                description: user.description,
                pubkey: user.user_pubkey,
                permissions: conditions.iter().map(permission_string).collect(),
                request_count,
                created_at: user.created_at,
                last_used_at: user.last_used_at,
            });
        }

        Ok(Json(AppsList { apps }))
    }

    async fn app_rename(
        State(state): State<Arc<HttpState>>,
        Path(id): Path<i64>,
        Json(body): Json<crate::api::RenameBody>,
    ) -> (StatusCode, Json<ApproveResult>) {
        match state.center.store.rename_key_user(id, &body.description) {
            Ok(true) => (StatusCode::OK, Json(ApproveResult::ok())),
            Ok(false) => (
                StatusCode::NOT_FOUND,
                Json(ApproveResult::error("no such app")),
            ),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApproveResult::error(err.to_string())),
            ),
        }
    }

    async fn app_revoke(
        State(state): State<Arc<HttpState>>,
        Path(id): Path<i64>,
    ) -> (StatusCode, Json<ApproveResult>) {
        match state.center.store.revoke_key_user(id) {
            Ok(true) => (StatusCode::OK, Json(ApproveResult::ok())),
            Ok(false) => (
                StatusCode::NOT_FOUND,
                Json(ApproveResult::error("no such app")),
            ),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApproveResult::error(err.to_string())),
            ),
        }
    }

    async fn dashboard(
        State(state): State<Arc<HttpState>>,
    ) -> Result<Json<Dashboard>, (StatusCode, Json<ApproveResult>)> {
        let store = &state.center.store;
        let counts = store.counts().map_err(internal_error)?;
        let recent = store.recent_audit(5).map_err(internal_error)?;
        let activity = store.activity_buckets(24).map_err(internal_error)?;

        Ok(Json(Dashboard {
            counts: DashboardCounts {
                keys: counts.keys,
                apps: counts.apps,
                pending_requests: counts.pending_requests,
                policies: counts.policies,
                tokens: counts.tokens,
            },
            recent: recent
                .into_iter()
                .map(|entry| AuditEntryInfo {
                    timestamp: entry.timestamp,
                    entry_type: entry.entry_type,
                    method: entry.method,
                    key_user_id: entry.key_user_id,
                })
                .collect(),
            activity: activity
                .into_iter()
                .map(|(hour, count)| ActivityBucket { hour, count })
                .collect(),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u32>,
    offset: Option<u32>,
    status: Option<String>,
}

//--- Response shaping

fn request_entry(row: &PendingRequest) -> RequestEntry {
    let age = util::unix_now() - row.created_at;
    RequestEntry {
        id: row.id,
        request_id: row.request_id.clone(),
        key_name: row.key_name.clone(),
        remote_pubkey: row.remote_pubkey.clone(),
        method: row.method.clone(),
        params: serde_json::from_str(&row.params).unwrap_or(Value::Array(Vec::new())),
        allowed: row.allowed,
        created_at: row.created_at,
        ttl_seconds: (PENDING_TTL_SECS - age).max(0),
        event_preview: event_preview(row),
    }
}

/// The interesting bits of a `sign_event` request, if its event parses.
///
/// A parse failure yields no preview, not an error.
fn event_preview(row: &PendingRequest) -> Option<EventPreview> {
    if row.method != "sign_event" {
        return None;
    }
    let params: Vec<String> = serde_json::from_str(&row.params).ok()?;
    let event: Value = serde_json::from_str(params.first()?).ok()?;
    let event = event.as_object()?;
    Some(EventPreview {
        kind: event.get("kind").and_then(Value::as_i64),
        content: event
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string),
        tags: event.get("tags").cloned(),
    })
}

/// Render a condition as a compact permission string.
fn permission_string(condition: &SigningCondition) -> String {
    let mut out = String::new();
    if !condition.allowed {
        out.push('!');
    }
    out.push_str(&condition.method);
    if let Some(kind) = &condition.kind {
        out.push(':');
        out.push_str(kind);
    }
    out
}

/// Map a key-creation failure onto the wire error and its status code.
fn key_create_error(err: &KeyActionError) -> (StatusCode, KeyCreateError) {
    match err {
        KeyActionError::AlreadyExists => (StatusCode::CONFLICT, KeyCreateError::AlreadyExists),
        KeyActionError::Vault(VaultError::BadSecret) => {
            (StatusCode::BAD_REQUEST, KeyCreateError::BadSecret)
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, KeyCreateError::Internal),
    }
}

fn approve_error(err: ApproveError) -> (StatusCode, Json<ApproveResult>) {
    let status = match &err {
        ApproveError::NotFound => StatusCode::NOT_FOUND,
        ApproveError::AlreadyDecided => StatusCode::CONFLICT,
        ApproveError::NotApprovable => StatusCode::BAD_REQUEST,
        ApproveError::PasswordRequired | ApproveError::WrongPassword => StatusCode::UNAUTHORIZED,
        ApproveError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApproveResult::error(err.to_string())))
}

fn input_error(message: impl Into<String>) -> (StatusCode, Json<ApproveResult>) {
    (StatusCode::BAD_REQUEST, Json(ApproveResult::error(message)))
}

fn internal_error(err: crate::store::StoreError) -> (StatusCode, Json<ApproveResult>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApproveResult::error(err.to_string())),
    )
}

//--- Approval pages

/// Render the HTML approval (or registration) page for a request.
fn render_request_page(row: &PendingRequest, encrypted: bool) -> String {
    let title = match row.method.as_str() {
        "create_account" => "Account registration",
        _ => "Authorization request",
    };

    let mut details = format!(
        "<dl><dt>Method</dt><dd>{}</dd>\
         <dt>Key</dt><dd>{}</dd>\
         <dt>Client</dt><dd><code>{}</code></dd></dl>",
        escape(&row.method),
        escape(&row.key_name),
        escape(&row.remote_pubkey),
    );
    if let Some(preview) = event_preview(row) {
        details.push_str(&format!(
            "<h3>Event</h3><dl><dt>Kind</dt><dd>{}</dd><dt>Content</dt><dd>{}</dd></dl>",
            preview.kind.unwrap_or_default(),
            escape(preview.content.as_deref().unwrap_or_default()),
        ));
    }

    let form = if row.method == "create_account" {
        let params: Vec<String> = serde_json::from_str(&row.params).unwrap_or_default();
        let username = params.first().cloned().unwrap_or_default();
        let domain = params.get(1).cloned().unwrap_or_default();
        let email = params.get(2).cloned().unwrap_or_default();
        format!(
            r#"<form onsubmit="submitForm(event, '/register/{id}')">
  <label>Username <input name="username" value="{username}"></label>
  <label>Domain <input name="domain" value="{domain}"></label>
  <label>Email <input name="email" value="{email}"></label>
  <label>Password <input name="password" type="password"></label>
  <button type="submit">Create account</button>
</form>"#,
            id = row.id,
            username = escape(&username),
            domain = escape(&domain),
            email = escape(&email),
        )
    } else {
        let password_field = if encrypted {
            r#"<label>Password <input name="password" type="password"></label>"#
        } else {
            ""
        };
        format!(
            r#"<form onsubmit="submitForm(event, '/requests/{id}')">
  {password_field}
  <button type="submit">Approve</button>
</form>"#,
            id = row.id,
        )
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>{title}</title></head>
<body>
<h1>{title}</h1>
{details}
{form}
<p id="outcome"></p>
<script>
async function submitForm(event, url) {{
  event.preventDefault();
  const data = Object.fromEntries(new FormData(event.target));
  const response = await fetch(url, {{
    method: 'POST',
    headers: {{'Content-Type': 'application/json'}},
    body: JSON.stringify(data),
  }});
  const body = await response.json();
  document.getElementById('outcome').textContent =
    body.ok ? 'Done. You can close this page.' : (body.error || 'Failed.');
}}
</script>
</body>
</html>"#,
    )
}

/// Minimal HTML escaping for interpolated values.
fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(method: &str, params: &str) -> PendingRequest {
        PendingRequest {
            id: 7,
            request_id: "r1".into(),
            key_name: "alice".into(),
            remote_pubkey: "ab".repeat(32),
            method: method.into(),
            params: params.into(),
            allowed: None,
            created_at: util::unix_now(),
            processed_at: None,
        }
    }

    #[test]
    fn preview_extraction() {
        let row = pending(
            "sign_event",
            r#"["{\"kind\":1,\"content\":\"hi\",\"tags\":[]}"]"#,
        );
        let preview = event_preview(&row).unwrap();
        assert_eq!(preview.kind, Some(1));
        assert_eq!(preview.content.as_deref(), Some("hi"));

        // Parse failures yield no preview, not an error.
        assert!(event_preview(&pending("sign_event", r#"["not json"]"#)).is_none());
        assert!(event_preview(&pending("connect", "[]")).is_none());
    }

    #[test]
    fn fresh_requests_have_full_ttl() {
        let entry = request_entry(&pending("connect", "[]"));
        assert!(entry.ttl_seconds > 55 && entry.ttl_seconds <= 60);

        let mut old = pending("connect", "[]");
        old.created_at -= 600;
        assert_eq!(request_entry(&old).ttl_seconds, 0);
    }

    #[test]
    fn key_creation_failures_map_onto_wire_errors() {
        let (status, wire) = key_create_error(&KeyActionError::AlreadyExists);
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(wire, KeyCreateError::AlreadyExists);

        let (status, wire) = key_create_error(&KeyActionError::Vault(VaultError::BadSecret));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(wire, KeyCreateError::BadSecret);

        let (status, wire) = key_create_error(&KeyActionError::NoSuchKey);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(wire, KeyCreateError::Internal);
    }

    #[test]
    fn permission_strings() {
        let condition = |method: &str, kind: Option<&str>, allowed| SigningCondition {
            id: 1,
            key_user_id: 1,
            method: method.into(),
            kind: kind.map(str::to_string),
            allowed,
        };
        assert_eq!(permission_string(&condition("connect", None, true)), "connect");
        assert_eq!(
            permission_string(&condition("sign_event", Some("1"), true)),
            "sign_event:1"
        );
        assert_eq!(permission_string(&condition("*", None, false)), "!*");
    }

    #[test]
    fn approval_page_offers_the_right_form() {
        let row = pending("sign_event", r#"["{\"kind\":1,\"content\":\"hi\"}"]"#);
        let page = render_request_page(&row, true);
        assert!(page.contains("Authorization request"));
        assert!(page.contains("type=\"password\""));
        assert!(page.contains("/requests/7"));

        let row = pending("create_account", r#"["alice","example.com",""]"#);
        let page = render_request_page(&row, false);
        assert!(page.contains("Account registration"));
        assert!(page.contains("/register/7"));
        assert!(page.contains("value=\"alice\""));
    }

    #[test]
    fn page_escapes_untrusted_content() {
        let row = pending(
            "sign_event",
            r#"["{\"kind\":1,\"content\":\"<script>alert(1)</script>\"}"]"#,
        );
        let page = render_request_page(&row, false);
        assert!(!page.contains("<script>alert"));
        assert!(page.contains("&lt;script&gt;"));
    }
}
