//! The admin channel.
//!
//! A second NIP-46 endpoint bound to the bunker's own admin identity.  It
//! serves the management RPCs to whitelisted administrators, forwards `acl`
//! queries for the authorization broker, and publishes the connection
//! descriptor at startup.  A self-addressed heartbeat doubles as a relay
//! liveness check: if the bunker stops hearing its own pings, the process
//! exits so a supervisor can restart it instead of it staying deaf.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nostr::nips::nip19::ToBech32;
use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, Tag};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::center::{self, Center};
use crate::comms::{AclQuery, ApplicationCommand, Terminated};
use crate::nip46::{self, Request, Response, Scheme};
use crate::provision;
use crate::relay::RelayPool;
use crate::util;

const UNIT: &str = "AC";

/// How often the heartbeat ping is published.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// How long without a self-addressed ping before the process exits.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(50);

/// How long a forwarded `acl` query stays live.
const ACL_QUERY_TTL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct AdminUnit {
    pub center: Arc<Center>,
}

impl AdminUnit {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
        ready_tx: oneshot::Sender<bool>,
    ) -> Result<(), Terminated> {
        let (keys, relays, admins) = {
            let config = self.center.config.lock().unwrap();
            let Some(keys) = config.admin_keys() else {
                error!("[{UNIT}] No admin key configured; run 'setup' first");
                return Err(Terminated);
            };
            (keys, config.admin.admin_relays.clone(), config.admin_pubkeys())
        };

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let pool = RelayPool::spawn(&relays, event_tx);
        pool.subscribe(
            "admin",
            json!({
                "kinds": [Kind::NostrConnect.as_u16()],
                "#p": [keys.public_key().to_hex()],
                "since": util::unix_now(),
            }),
        );

        self.announce(&keys, &pool, &admins);

        // Notify the manager that we are ready.
        ready_tx.send(true).map_err(|_| Terminated)?;

        let mut channel = AdminChannel {
            center: self.center,
            keys,
            pool,
            admins,
            heartbeat: Heartbeat::new(),
            acl_queries: HashMap::new(),
        };

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watchdog = tokio::time::interval(Duration::from_secs(1));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    channel.publish_heartbeat();
                }
                _ = watchdog.tick() => {
                    if channel.heartbeat.expired(Instant::now()) {
                        // Deliberately fatal; supervisors restart a wedged
                        // bunker.
                        error!(
                            "[{UNIT}] No heartbeat for {}s; exiting",
                            HEARTBEAT_TIMEOUT.as_secs()
                        );
                        std::process::exit(1);
                    }
                    channel.prune_acl_queries();
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ApplicationCommand::Terminate) | None => {
                            return Err(Terminated);
                        }
                        Some(ApplicationCommand::AdminAcl { query, decision_tx }) => {
                            channel.forward_acl_query(query, decision_tx);
                        }
                        Some(cmd) => {
                            debug!("[{UNIT}] Ignoring command: {cmd:?}");
                        }
                    }
                }
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        return Err(Terminated);
                    };
                    channel.handle_event(event).await;
                }
            }
        }
    }

    /// Write the connection descriptor and optionally DM it to each admin.
    fn announce(&self, keys: &Keys, pool: &Arc<RelayPool>, admins: &[PublicKey]) {
        let (relays, secret, notify, path) = {
            let config = self.center.config.lock().unwrap();
            (
                config.admin.admin_relays.clone(),
                config.admin.secret.clone(),
                config.admin.notify_admins_on_boot,
                config.connection_file(),
            )
        };

        let descriptor = center::connection_descriptor(
            &keys.public_key().to_hex(),
            &relays,
            secret.as_deref(),
        );
        match util::write_file(&path, format!("{descriptor}\n").as_bytes()) {
            Ok(()) => info!("[{UNIT}] Connection descriptor written to '{path}'"),
            Err(err) => warn!("[{UNIT}] Cannot write '{path}': {err}"),
        }

        if notify {
            for admin in admins {
                let Ok(ciphertext) =
                    nostr::nips::nip04::encrypt(keys.secret_key(), admin, &descriptor)
                else {
                    continue;
                };
                let event = EventBuilder::new(Kind::EncryptedDirectMessage, ciphertext)
                    .tags([Tag::public_key(*admin)])
                    .sign_with_keys(keys);
                if let Ok(event) = event {
                    pool.publish(&event);
                }
            }
        }
    }
}

//----------- Heartbeat --------------------------------------------------------

/// Liveness tracking for the self-addressed ping.
#[derive(Debug)]
struct Heartbeat {
    last_seen: Instant,
}

impl Heartbeat {
    fn new() -> Self {
        Self {
            last_seen: Instant::now(),
        }
    }

    fn mark(&mut self) {
        self.last_seen = Instant::now();
    }

    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen) > HEARTBEAT_TIMEOUT
    }
}

//----------- AdminChannel -----------------------------------------------------

/// The running state of the admin endpoint.
struct AdminChannel {
    center: Arc<Center>,
    keys: Keys,
    pool: Arc<RelayPool>,
    admins: Vec<PublicKey>,
    heartbeat: Heartbeat,
    /// Outstanding `acl` queries by request id.
    acl_queries: HashMap<String, (mpsc::Sender<String>, Instant)>,
}

impl AdminChannel {
    /// Publish the self-addressed heartbeat ping.
    fn publish_heartbeat(&self) {
        let request = Request {
            id: util::random_hex(8),
            method: "ping".into(),
            params: Vec::new(),
        };
        let Ok(ciphertext) = nip46::encrypt_payload(
            self.keys.secret_key(),
            &self.keys.public_key(),
            &request.to_json(),
            Scheme::Nip44,
        ) else {
            return;
        };
        let event = EventBuilder::new(Kind::NostrConnect, ciphertext)
            .tags([Tag::public_key(self.keys.public_key())])
            .sign_with_keys(&self.keys);
        if let Ok(event) = event {
            self.pool.publish(&event);
        }
    }

    /// Forward an `acl` query to every whitelisted admin.
    fn forward_acl_query(&mut self, query: AclQuery, decision_tx: mpsc::Sender<String>) {
        if self.admins.is_empty() {
            debug!("[{UNIT}] No admins to forward an acl query to");
            return;
        }

        let payload = json!({
            "keyName": query.key_name,
            "remotePubkey": query.remote_pubkey,
            "method": query.method,
            "param": query.param,
            "description": query.description,
        })
        .to_string();

        for admin in &self.admins {
            let request = Request {
                id: util::random_hex(8),
                method: "acl".into(),
                params: vec![payload.clone()],
            };
            self.acl_queries
                .insert(request.id.clone(), (decision_tx.clone(), Instant::now()));
            self.send_to(*admin, Scheme::Nip44, &request.to_json());
        }
    }

    /// Drop acl queries nobody answered.
    fn prune_acl_queries(&mut self) {
        let now = Instant::now();
        self.acl_queries
            .retain(|_, (_, created)| now.duration_since(*created) < ACL_QUERY_TTL);
    }

    /// Handle one inbound event on the admin channel.
    async fn handle_event(&mut self, event: Event) {
        if event.kind != Kind::NostrConnect {
            return;
        }
        let Ok((plaintext, scheme)) =
            nip46::decrypt_payload(self.keys.secret_key(), &event.pubkey, &event.content)
        else {
            debug!("[{UNIT}] Dropping undecryptable event");
            return;
        };

        // Responses to our own `acl` queries come over the same channel.
        if let Ok(response) = Response::from_json(&plaintext) {
            if let Some((decision_tx, _)) = self.acl_queries.remove(&response.id) {
                debug!("[{UNIT}] Admin decision '{}' for query {}", response.result, response.id);
                let _ = decision_tx.send(response.result).await;
                return;
            }
        }

        let request = match Request::from_json(&plaintext) {
            Ok(request) => request,
            Err(_) => return,
        };

        // Our own heartbeat coming back: the relay path is alive.
        if event.pubkey == self.keys.public_key() && request.method == "ping" {
            self.heartbeat.mark();
            return;
        }

        // `create_account` is open to anyone and can wait a long time on
        // the approval flow, so it runs in its own task.
        if request.method == "create_account" {
            self.spawn_create_account(event.pubkey, scheme, request);
            return;
        }

        // Everything else is gated on the admin allow-list, with no side
        // effects for strangers.
        if !self.admins.contains(&event.pubkey) {
            warn!(
                "[{UNIT}] Rejecting '{}' from non-admin {}",
                request.method,
                event.pubkey.to_hex()
            );
            self.send_to(
                event.pubkey,
                scheme,
                &Response::error(&request.id, "unauthorized").to_json(),
            );
            return;
        }

        let response = self.execute(&event.pubkey, &request);
        self.send_to(event.pubkey, scheme, &response.to_json());
    }

    /// Execute a management RPC for a verified admin.
    fn execute(&self, admin: &PublicKey, request: &Request) -> Response {
        let id = &request.id;
        let params = &request.params;
        match request.method.as_str() {
            "ping" => Response::ok(id, "pong"),

            "get_keys" => {
                let config = self.center.config.lock().unwrap();
                let entries: Vec<_> = config
                    .keys
                    .iter()
                    .map(|(name, stored)| {
                        let active = self.center.active_key(name);
                        json!({
                            "name": name,
                            "encrypted": stored.is_encrypted(),
                            "active": active.is_some(),
                            "npub": active.and_then(|k| {
                                k.keys.public_key().to_bech32().ok()
                            }),
                        })
                    })
                    .collect();
                Response::ok(id, json!(entries).to_string())
            }

            "get_key_users" => {
                let Some(key_name) = params.first() else {
                    return Response::error(id, "invalid params");
                };
                match self.center.store.list_key_users(Some(key_name.as_str()), true) {
                    Ok(users) => {
                        let entries: Vec<_> = users
                            .iter()
                            .map(|u| {
                                json!({
                                    "id": u.id,
                                    "pubkey": u.user_pubkey,
                                    "description": u.description,
                                    "createdAt": u.created_at,
                                    "lastUsedAt": u.last_used_at,
                                    "revokedAt": u.revoked_at,
                                })
                            })
                            .collect();
                        Response::ok(id, json!(entries).to_string())
                    }
                    Err(err) => Response::error(id, err.to_string()),
                }
            }

            "get_key_tokens" => {
                let Some(key_name) = params.first() else {
                    return Response::error(id, "invalid params");
                };
                match self.center.store.list_tokens(key_name) {
                    Ok(tokens) => {
                        let entries: Vec<_> = tokens
                            .iter()
                            .map(|t| {
                                json!({
                                    "token": t.token,
                                    "clientName": t.client_name,
                                    "policyId": t.policy_id,
                                    "createdAt": t.created_at,
                                    "expiresAt": t.expires_at,
                                    "redeemedAt": t.redeemed_at,
                                })
                            })
                            .collect();
                        Response::ok(id, json!(entries).to_string())
                    }
                    Err(err) => Response::error(id, err.to_string()),
                }
            }

            "get_policies" => match self.center.store.list_policies() {
                Ok(policies) => {
                    let entries: Vec<_> = policies
                        .iter()
                        .map(|p| {
                            json!({
                                "id": p.id,
                                "name": p.name,
                                "expiresAt": p.expires_at,
                                "rules": p.rules.iter().map(|r| json!({
                                    "method": r.method,
                                    "kind": r.kind,
                                    "maxUsageCount": r.max_usage_count,
                                    "currentUsageCount": r.current_usage_count,
                                })).collect::<Vec<_>>(),
                            })
                        })
                        .collect();
                    Response::ok(id, json!(entries).to_string())
                }
                Err(err) => Response::error(id, err.to_string()),
            },

            "create_new_key" => {
                let Some(name) = params.first().filter(|n| !n.is_empty()) else {
                    return Response::error(id, "invalid params");
                };
                let passphrase = params.get(1).map(String::as_str).filter(|p| !p.is_empty());
                match center::create_key(&self.center, name, passphrase, None) {
                    Ok(active) => Response::ok(id, active.keys.public_key().to_hex()),
                    Err(err) => Response::error(id, err.to_string()),
                }
            }

            "create_new_policy" => {
                let Some(name) = params.first().filter(|n| !n.is_empty()) else {
                    return Response::error(id, "invalid params");
                };
                let rules = match params.get(1).map(String::as_str) {
                    None | Some("") => Vec::new(),
                    Some(raw) => match parse_policy_rules(raw) {
                        Some(rules) => rules,
                        None => return Response::error(id, "invalid params"),
                    },
                };
                let expires_at = params.get(2).and_then(|e| e.parse::<i64>().ok());
                let created_by = admin.to_hex();
                match self.center.store.create_policy(
                    name,
                    Some(created_by.as_str()),
                    expires_at,
                    &rules,
                ) {
                    Ok(policy_id) => Response::ok(id, policy_id.to_string()),
                    Err(err) => Response::error(id, err.to_string()),
                }
            }

            "create_new_token" => {
                let (Some(key_name), Some(client_name), Some(policy_id)) =
                    (params.first(), params.get(1), params.get(2))
                else {
                    return Response::error(id, "invalid params");
                };
                let Ok(policy_id) = policy_id.parse::<i64>() else {
                    return Response::error(id, "invalid params");
                };
                let expires_at = params.get(3).and_then(|e| e.parse::<i64>().ok());
                match self.center.store.create_token(
                    key_name,
                    client_name,
                    policy_id,
                    &admin.to_hex(),
                    expires_at,
                ) {
                    Ok(token) => Response::ok(id, token),
                    Err(err) => Response::error(id, err.to_string()),
                }
            }

            "rename_key_user" => {
                let (Some(user_id), Some(description)) = (params.first(), params.get(1)) else {
                    return Response::error(id, "invalid params");
                };
                let Ok(user_id) = user_id.parse::<i64>() else {
                    return Response::error(id, "invalid params");
                };
                match self.center.store.rename_key_user(user_id, description) {
                    Ok(true) => Response::ok(id, "ok"),
                    Ok(false) => Response::error(id, "no such key user"),
                    Err(err) => Response::error(id, err.to_string()),
                }
            }

            "revoke_user" => {
                let Some(user_id) = params.first().and_then(|p| p.parse::<i64>().ok()) else {
                    return Response::error(id, "invalid params");
                };
                match self.center.store.revoke_key_user(user_id) {
                    Ok(true) => Response::ok(id, "ok"),
                    Ok(false) => Response::error(id, "no such key user"),
                    Err(err) => Response::error(id, err.to_string()),
                }
            }

            "unlock_key" => {
                let (Some(name), Some(passphrase)) = (params.first(), params.get(1)) else {
                    return Response::error(id, "invalid params");
                };
                match center::unlock_key(&self.center, name, passphrase) {
                    Ok(_) => Response::ok(id, "ok"),
                    Err(err) => Response::error(id, err.to_string()),
                }
            }

            _ => Response::error(id, "unknown method"),
        }
    }

    /// Run a `create_account` flow in its own task.
    fn spawn_create_account(&self, requester: PublicKey, scheme: Scheme, request: Request) {
        let center = self.center.clone();
        let keys = self.keys.clone();
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let reply = |payload: &str| {
                send_encrypted(&pool, &keys, requester, scheme, payload);
            };

            let result = provision::create_account(
                &center,
                &request.id,
                &requester.to_hex(),
                &request.params,
                |url| reply(&Response::auth_url(&request.id, url).to_json()),
            )
            .await;

            match result {
                Ok(pubkey) => reply(&Response::ok(&request.id, pubkey).to_json()),
                Err(err) => reply(&Response::error(&request.id, err.to_string()).to_json()),
            }
        });
    }

    fn send_to(&self, recipient: PublicKey, scheme: Scheme, payload: &str) {
        send_encrypted(&self.pool, &self.keys, recipient, scheme, payload);
    }
}

/// Encrypt a payload to a recipient and publish it.
fn send_encrypted(
    pool: &Arc<RelayPool>,
    keys: &Keys,
    recipient: PublicKey,
    scheme: Scheme,
    payload: &str,
) {
    let Ok(ciphertext) = nip46::encrypt_payload(keys.secret_key(), &recipient, payload, scheme)
    else {
        warn!("[{UNIT}] Cannot encrypt a payload");
        return;
    };
    let event = EventBuilder::new(Kind::NostrConnect, ciphertext)
        .tags([Tag::public_key(recipient)])
        .sign_with_keys(keys);
    match event {
        Ok(event) => pool.publish(&event),
        Err(err) => warn!("[{UNIT}] Cannot sign a payload: {err}"),
    }
}

/// Parse `create_new_policy` rules: a JSON array of
/// `{method, kind?, maxUsageCount?}` objects.
fn parse_policy_rules(raw: &str) -> Option<Vec<(String, Option<String>, Option<i64>)>> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let mut rules = Vec::new();
    for rule in value.as_array()? {
        let rule = rule.as_object()?;
        let method = rule.get("method")?.as_str()?.to_string();
        let kind = rule.get("kind").and_then(|k| match k {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        let max_usage = rule.get("maxUsageCount").and_then(|m| m.as_i64());
        rules.push((method, kind, max_usage));
    }
    Some(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_expiry_boundary() {
        let mut heartbeat = Heartbeat::new();
        let start = Instant::now();
        heartbeat.last_seen = start;

        assert!(!heartbeat.expired(start + Duration::from_secs(49)));
        assert!(heartbeat.expired(start + Duration::from_secs(51)));

        heartbeat.mark();
        assert!(!heartbeat.expired(Instant::now()));
    }

    #[test]
    fn policy_rules_parsing() {
        let rules = parse_policy_rules(
            r#"[{"method":"sign_event","kind":1,"maxUsageCount":5},{"method":"connect"}]"#,
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].0, "sign_event");
        assert_eq!(rules[0].1.as_deref(), Some("1"));
        assert_eq!(rules[0].2, Some(5));
        assert_eq!(rules[1], ("connect".to_string(), None, None));

        assert!(parse_policy_rules("not json").is_none());
        assert!(parse_policy_rules(r#"[{"kind":1}]"#).is_none());
    }
}
