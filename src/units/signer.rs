//! The per-key NIP-46 signing endpoints.
//!
//! One logical endpoint per unlocked user key, all served by this unit
//! through a shared relay pool.  Inbound kind-24133 events are decrypted,
//! parsed, authorized and executed; replies travel back encrypted to the
//! requesting client.  Requests are processed strictly in arrival order per
//! (key, client) pair, each pair getting its own worker task, while distinct
//! clients proceed independently.  Workers retire after an idle period and
//! their channel slots are evicted, so the worker map stays bounded by the
//! set of recently active clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nostr::nips::nip04;
use nostr::nips::nip44;
use nostr::{Event, EventBuilder, JsonUtil, Kind, PublicKey, Tag, Timestamp};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::acl::{self, Decision};
use crate::authorizer::{self, AuthzError};
use crate::center::{ActiveKey, Center};
use crate::comms::{ApplicationCommand, Terminated};
use crate::nip46::{self, Request, Response, Scheme};
use crate::relay::RelayPool;
use crate::util;

const UNIT: &str = "SG";

/// How long a (key, client) worker may sit idle before it retires.
const WORKER_IDLE: Duration = Duration::from_secs(300);

/// A worker slot: (key name, client pubkey).
type WorkerSlot = (String, String);

#[derive(Debug)]
pub struct SignerUnit {
    pub center: Arc<Center>,
}

impl SignerUnit {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
        ready_tx: oneshot::Sender<bool>,
    ) -> Result<(), Terminated> {
        let relays = {
            let config = self.center.config.lock().unwrap();
            config.nostr.relays.clone()
        };

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let pool = RelayPool::spawn(&relays, event_tx);
        let _ = self.center.user_pool.set(pool.clone());

        for name in self.center.active_key_names() {
            subscribe_key(&self.center, &pool, &name);
        }

        // Notify the manager that we are ready.
        ready_tx.send(true).map_err(|_| Terminated)?;

        // Worker channels by slot, and the channel retiring workers report
        // back on.
        let mut workers: HashMap<WorkerSlot, mpsc::UnboundedSender<Event>> = HashMap::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    debug!("[{UNIT}] Received command: {cmd:?}");
                    match cmd {
                        Some(ApplicationCommand::Terminate) | None => {
                            return Err(Terminated);
                        }
                        Some(ApplicationCommand::LoadKey { name }) => {
                            subscribe_key(&self.center, &pool, &name);
                        }
                        Some(_) => { /* not for us */ }
                    }
                }
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        return Err(Terminated);
                    };
                    self.dispatch(&pool, &mut workers, &done_tx, event);
                }
                done = done_rx.recv() => {
                    // Evict only if the slot still holds the retired
                    // worker's channel; a fresh worker may have replaced it.
                    if let Some(slot) = done {
                        if workers.get(&slot).is_some_and(|tx| tx.is_closed()) {
                            workers.remove(&slot);
                        }
                    }
                }
            }
        }
    }

    /// Hand an inbound event to the worker of its (key, client) pair.
    fn dispatch(
        &self,
        pool: &Arc<RelayPool>,
        workers: &mut HashMap<WorkerSlot, mpsc::UnboundedSender<Event>>,
        done_tx: &mpsc::UnboundedSender<WorkerSlot>,
        mut event: Event,
    ) {
        if event.kind != Kind::NostrConnect {
            return;
        }

        // The `#p` tag names the user key this request is for.
        let Some(target) = event.tags.public_keys().next().copied() else {
            return;
        };
        let keys_map = self.center.active_keys.load();
        let Some(key) = keys_map
            .values()
            .find(|k| k.keys.public_key() == target)
            .cloned()
        else {
            return;
        };

        let slot = (key.name.clone(), event.pubkey.to_hex());
        if let Some(tx) = workers.get(&slot) {
            match tx.send(event) {
                Ok(()) => return,
                // The worker retired and closed its queue; replace it.
                Err(unsent) => {
                    event = unsent.0;
                    workers.remove(&slot);
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(client_worker(
            self.center.clone(),
            pool.clone(),
            key,
            event.pubkey,
            rx,
            done_tx.clone(),
        ));
        let _ = tx.send(event);
        workers.insert(slot, tx);
    }
}

/// Open the NIP-46 subscription for a key.
fn subscribe_key(center: &Arc<Center>, pool: &Arc<RelayPool>, name: &str) {
    let Some(key) = center.active_key(name) else {
        warn!("[{UNIT}] Cannot subscribe for unknown key '{name}'");
        return;
    };
    let pubkey = key.keys.public_key().to_hex();
    pool.subscribe(
        &format!("sg-{name}"),
        json!({
            "kinds": [Kind::NostrConnect.as_u16()],
            "#p": [pubkey],
            "since": util::unix_now(),
        }),
    );
    info!("[{UNIT}] Serving key '{name}'");
}

/// Process one client's requests against one key, in arrival order.
///
/// Retires after [`WORKER_IDLE`] without a request: the queue is closed so
/// late sends bounce back to the dispatcher, anything that raced in is
/// drained, and the slot is reported back for eviction.
async fn client_worker(
    center: Arc<Center>,
    pool: Arc<RelayPool>,
    key: Arc<ActiveKey>,
    client: PublicKey,
    mut rx: mpsc::UnboundedReceiver<Event>,
    done_tx: mpsc::UnboundedSender<WorkerSlot>,
) {
    loop {
        match tokio::time::timeout(WORKER_IDLE, rx.recv()).await {
            Ok(Some(event)) => handle_event(&center, &pool, &key, client, event).await,
            // The unit dropped our channel.
            Ok(None) => return,
            Err(_) => break,
        }
    }

    rx.close();
    while let Ok(event) = rx.try_recv() {
        handle_event(&center, &pool, &key, client, event).await;
    }
    debug!(
        "[{UNIT}] Worker for {} on key '{}' retired",
        client.to_hex(),
        key.name
    );
    let _ = done_tx.send((key.name.clone(), client.to_hex()));
}

/// Decrypt, authorize, execute and answer a single inbound event.
async fn handle_event(
    center: &Arc<Center>,
    pool: &Arc<RelayPool>,
    key: &Arc<ActiveKey>,
    client: PublicKey,
    event: Event,
) {
    // Undecryptable or unparseable events are dropped without a reply; we
    // don't leak structure to unauthenticated origins.
    let Ok((plaintext, scheme)) =
        nip46::decrypt_payload(key.keys.secret_key(), &client, &event.content)
    else {
        debug!("[{UNIT}] Dropping undecryptable event for key '{}'", key.name);
        return;
    };
    let request = match Request::from_json(&plaintext) {
        Ok(request) => request,
        Err(err) => {
            debug!("[{UNIT}] Dropping malformed envelope for key '{}': {err}", key.name);
            return;
        }
    };

    debug!(
        "[{UNIT}] '{}' from {} for key '{}'",
        request.method,
        client.to_hex(),
        key.name
    );

    let request = match authorize(center, pool, key, client, scheme, request).await {
        Ok(request) => request,
        Err(response) => {
            send_response(pool, key, client, scheme, &response);
            return;
        }
    };

    let response = execute(key, &request);
    send_response(pool, key, client, scheme, &response);
}

/// The authorization callback: consult the ACL, fall back to the broker.
///
/// Returns the request to execute (possibly with parameters replaced by
/// the approval flow) or the error response to send instead.
async fn authorize(
    center: &Arc<Center>,
    pool: &Arc<RelayPool>,
    key: &Arc<ActiveKey>,
    client: PublicKey,
    scheme: Scheme,
    mut request: Request,
) -> Result<Request, Response> {
    let client_hex = client.to_hex();

    if request.method == "connect" {
        if let Some(credential) = request.params.get(1).filter(|c| !c.is_empty()) {
            let connect_secret = {
                let config = center.config.lock().unwrap();
                config.admin.secret.clone()
            };
            if connect_secret.as_deref() == Some(credential.as_str()) {
                // The client presented the descriptor secret; let it in.
                return Ok(request);
            }
            // Otherwise the credential may be a one-shot token; redeeming
            // it records the key user and its conditions.
            match center.store.redeem_token(credential, &client_hex) {
                Ok(_) => {
                    info!("[{UNIT}] Token redeemed by {client_hex} for key '{}'", key.name);
                    return Ok(request);
                }
                Err(err) => {
                    debug!("[{UNIT}] Token redemption failed for key '{}': {err}", key.name);
                    return Err(Response::error(&request.id, err.to_string()));
                }
            }
        }
    }

    let decision = match acl::evaluate(
        &center.store,
        &key.name,
        &client_hex,
        &request.method,
        request.params.first().map(String::as_str),
    ) {
        Ok(decision) => decision,
        Err(err) => {
            warn!("[{UNIT}] ACL evaluation failed: {err}");
            return Err(Response::error(&request.id, "internal error"));
        }
    };

    match decision {
        Decision::Allow => {
            if let Ok(Some(user)) = center.store.find_key_user(&key.name, &client_hex) {
                let _ = center.store.touch_key_user(user.id);
            }
            Ok(request)
        }
        Decision::Deny => Err(Response::error(&request.id, "unauthorized")),
        Decision::Unknown => {
            let outcome = {
                let pool = pool.clone();
                let key = key.clone();
                let request_id = request.id.clone();
                authorizer::request_authorization(
                    center,
                    &key.name.clone(),
                    &request.id,
                    &client_hex,
                    &request.method,
                    &request.params,
                    move |url| {
                        // Point the client at the approval page; the real
                        // result follows under the same id once decided.
                        let sentinel = Response::auth_url(&request_id, url);
                        send_response(&pool, &key, client, scheme, &sentinel);
                    },
                )
                .await
            };

            match outcome {
                Ok(params) => {
                    request.params = params;
                    Ok(request)
                }
                Err(AuthzError::Denied) => Err(Response::error(&request.id, "unauthorized")),
                Err(AuthzError::TimedOut) => {
                    Err(Response::error(&request.id, "authorization timed out"))
                }
                Err(AuthzError::Store(err)) => {
                    warn!("[{UNIT}] Authorization failed: {err}");
                    Err(Response::error(&request.id, "internal error"))
                }
            }
        }
    }
}

/// Execute an authorized request against a key.
fn execute(key: &ActiveKey, request: &Request) -> Response {
    match request.method.as_str() {
        "connect" => Response::ok(&request.id, "ok"),
        "ping" => Response::ok(&request.id, "pong"),
        "get_public_key" => Response::ok(&request.id, key.keys.public_key().to_hex()),
        "sign_event" => sign_event(key, request),
        "nip04_encrypt" => {
            with_peer(request, |peer, text| {
                nip04::encrypt(key.keys.secret_key(), &peer, text)
                    .map_err(|e| e.to_string())
            })
        }
        "nip04_decrypt" => {
            with_peer(request, |peer, text| {
                nip04::decrypt(key.keys.secret_key(), &peer, text)
                    .map_err(|e| e.to_string())
            })
        }
        "nip44_encrypt" => {
            with_peer(request, |peer, text| {
                nip44::encrypt(key.keys.secret_key(), &peer, text, nip44::Version::V2)
                    .map_err(|e| e.to_string())
            })
        }
        "nip44_decrypt" => {
            with_peer(request, |peer, text| {
                nip44::decrypt(key.keys.secret_key(), &peer, text)
                    .map_err(|e| e.to_string())
            })
        }
        _ => Response::error(&request.id, "unknown method"),
    }
}

/// Run an encryption method taking `[peer_pubkey, text]` parameters.
fn with_peer(
    request: &Request,
    f: impl FnOnce(PublicKey, &str) -> Result<String, String>,
) -> Response {
    let (Some(peer), Some(text)) = (request.params.first(), request.params.get(1)) else {
        return Response::error(&request.id, "invalid params");
    };
    let Ok(peer) = PublicKey::parse(peer) else {
        return Response::error(&request.id, "invalid params");
    };
    match f(peer, text) {
        Ok(result) => Response::ok(&request.id, result),
        Err(message) => Response::error(&request.id, message),
    }
}

/// Sign the event described by `params[0]`.
fn sign_event(key: &ActiveKey, request: &Request) -> Response {
    let Some(param) = request.params.first() else {
        return Response::error(&request.id, "invalid params");
    };
    let Ok(template) = serde_json::from_str::<serde_json::Value>(param) else {
        return Response::error(&request.id, "invalid params");
    };
    let Some(obj) = template.as_object() else {
        return Response::error(&request.id, "invalid params");
    };

    let Some(kind) = obj.get("kind").and_then(|k| k.as_u64()) else {
        return Response::error(&request.id, "invalid params");
    };
    let content = obj
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();

    let mut tags = Vec::new();
    for tag in obj
        .get("tags")
        .and_then(|t| t.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let Some(parts) = tag.as_array() else {
            return Response::error(&request.id, "invalid params");
        };
        let parts: Vec<String> = parts
            .iter()
            .map(|p| p.as_str().map(str::to_string).unwrap_or_else(|| p.to_string()))
            .collect();
        match Tag::parse(&parts) {
            Ok(tag) => tags.push(tag),
            Err(_) => return Response::error(&request.id, "invalid params"),
        }
    }

    let mut builder = EventBuilder::new(Kind::from(kind as u16), content).tags(tags);
    if let Some(created_at) = obj.get("created_at").and_then(|t| t.as_u64()) {
        builder = builder.custom_created_at(Timestamp::from(created_at));
    }

    match builder.sign_with_keys(&key.keys) {
        Ok(event) => Response::ok(&request.id, event.as_json()),
        Err(err) => Response::error(&request.id, err.to_string()),
    }
}

/// Encrypt and publish a response to the client.
fn send_response(
    pool: &Arc<RelayPool>,
    key: &Arc<ActiveKey>,
    client: PublicKey,
    scheme: Scheme,
    response: &Response,
) {
    let payload = response.to_json();
    let Ok(ciphertext) =
        nip46::encrypt_payload(key.keys.secret_key(), &client, &payload, scheme)
    else {
        warn!("[{UNIT}] Cannot encrypt a response for key '{}'", key.name);
        return;
    };
    let event = EventBuilder::new(Kind::NostrConnect, ciphertext)
        .tags([Tag::public_key(client)])
        .sign_with_keys(&key.keys);
    match event {
        Ok(event) => pool.publish(&event),
        Err(err) => warn!("[{UNIT}] Cannot sign a response for key '{}': {err}", key.name),
    }
}

#[cfg(test)]
mod tests {
    use nostr::Keys;

    use super::*;

    fn active_key() -> ActiveKey {
        ActiveKey {
            name: "alice".into(),
            keys: Keys::generate(),
        }
    }

    fn request(method: &str, params: &[&str]) -> Request {
        Request {
            id: "req-1".into(),
            method: method.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn ping_pong() {
        let key = active_key();
        let response = execute(&key, &request("ping", &[]));
        assert_eq!(response, Response::ok("req-1", "pong"));
    }

    #[test]
    fn get_public_key_returns_hex() {
        let key = active_key();
        let response = execute(&key, &request("get_public_key", &[]));
        assert_eq!(response.result, key.keys.public_key().to_hex());
    }

    #[test]
    fn unknown_method_is_reported() {
        let key = active_key();
        let response = execute(&key, &request("describe", &[]));
        assert_eq!(response.result, "error");
        assert_eq!(response.error.as_deref(), Some("unknown method"));
    }

    #[test]
    fn sign_event_produces_a_valid_event() {
        let key = active_key();
        let response = execute(
            &key,
            &request(
                "sign_event",
                &[r#"{"kind":1,"content":"hi","tags":[["t","test"]]}"#],
            ),
        );
        assert!(response.error.is_none(), "{:?}", response.error);

        let event = Event::from_json(&response.result).unwrap();
        assert_eq!(event.pubkey, key.keys.public_key());
        assert_eq!(event.kind, Kind::TextNote);
        assert_eq!(event.content, "hi");
        event.verify().unwrap();
    }

    #[test]
    fn sign_event_validates_params() {
        let key = active_key();
        for param in ["not json", "[]", r#"{"content":"no kind"}"#] {
            let response = execute(&key, &request("sign_event", &[param]));
            assert_eq!(response.error.as_deref(), Some("invalid params"), "{param}");
        }
        let response = execute(&key, &request("sign_event", &[]));
        assert_eq!(response.error.as_deref(), Some("invalid params"));
    }

    #[test]
    fn nip04_round_trip_through_methods() {
        let server = active_key();
        let peer = Keys::generate();

        let encrypted = execute(
            &server,
            &request("nip04_encrypt", &[&peer.public_key().to_hex(), "secret note"]),
        );
        assert!(encrypted.error.is_none());

        // The peer decrypts what the bunker encrypted.
        let plaintext = nip04::decrypt(
            peer.secret_key(),
            &server.keys.public_key(),
            &encrypted.result,
        )
        .unwrap();
        assert_eq!(plaintext, "secret note");

        // And the bunker can decrypt what the peer sends.
        let ciphertext =
            nip04::encrypt(peer.secret_key(), &server.keys.public_key(), "reply").unwrap();
        let decrypted = execute(
            &server,
            &request("nip04_decrypt", &[&peer.public_key().to_hex(), &ciphertext]),
        );
        assert_eq!(decrypted.result, "reply");
    }

    #[test]
    fn encryption_methods_validate_arity() {
        let key = active_key();
        let response = execute(&key, &request("nip44_encrypt", &["only-one"]));
        assert_eq!(response.error.as_deref(), Some("invalid params"));
    }
}
