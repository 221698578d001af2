//! The authorization broker.
//!
//! When the ACL has no answer for a request, the broker routes it to an
//! administrator: either by handing the client an approval-page URL (when
//! the daemon has a public base URL) or by forwarding an `acl` query to the
//! admins' relay clients.  Every pending request is an independent wait;
//! nothing here serialises across requests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::acl;
use crate::center::{self, Center, PendingOutcome};
use crate::comms::{AclQuery, ApplicationCommand};
use crate::store::{StoreError, PENDING_TTL_SECS};

/// How long the relay admin path waits for a decision.
const ADMIN_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// The unit name of the admin channel.
const ADMIN_UNIT: &str = "AC";

//----------- AuthzError -------------------------------------------------------

/// A refused or failed authorization.
#[derive(Debug)]
pub enum AuthzError {
    /// The administrator denied the request.
    Denied,

    /// No decision arrived in time.
    TimedOut,

    /// The store failed.
    Store(StoreError),
}

impl std::error::Error for AuthzError {}

impl fmt::Display for AuthzError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied => f.write_str("denied"),
            Self::TimedOut => f.write_str("authorization timed out"),
            Self::Store(err) => err.fmt(f),
        }
    }
}

impl From<StoreError> for AuthzError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

//--- Brokering

/// Route an undecided request to an administrator.
///
/// Persists a pending request, schedules its reaper, and waits for the
/// decision.  On approval the (possibly rewritten) request parameters are
/// returned; the caller continues with those.  `on_auth_url` is invoked
/// with the approval-page URL when the HTTP path applies, so the endpoint
/// can forward the sentinel response to the client.
pub async fn request_authorization(
    center: &Arc<Center>,
    key_name: &str,
    request_id: &str,
    client_pubkey: &str,
    method: &str,
    params: &[String],
    on_auth_url: impl Fn(String),
) -> Result<Vec<String>, AuthzError> {
    let params_json =
        serde_json::to_string(params).expect("string arrays always serialize");
    let pending_id = center.store.create_pending_request(
        request_id,
        key_name,
        client_pubkey,
        method,
        &params_json,
    )?;
    let waiter = center.register_waiter(pending_id);
    spawn_reaper(center, pending_id);

    if let Some(base_url) = center.base_url() {
        // The interactive HTTP path: point the client at the approval page
        // and wait for the administrator's decision.
        on_auth_url(format!("{base_url}/requests/{pending_id}"));

        return match waiter.await {
            Ok(PendingOutcome::Approved { params }) => Ok(params),
            Ok(PendingOutcome::Denied) => Err(AuthzError::Denied),
            Ok(PendingOutcome::Expired) | Err(_) => Err(AuthzError::TimedOut),
        };
    }

    // The relay admin path: forward an `acl` query to every whitelisted
    // admin and take the first answer.
    let description = center
        .store
        .find_key_user(key_name, client_pubkey)?
        .and_then(|user| user.description);
    let (decision_tx, mut decision_rx) = mpsc::channel(4);
    let query = AclQuery {
        key_name: key_name.to_string(),
        remote_pubkey: client_pubkey.to_string(),
        method: method.to_string(),
        param: params.first().cloned(),
        description,
    };
    if center
        .app_cmd_tx
        .send((ADMIN_UNIT.into(), ApplicationCommand::AdminAcl { query, decision_tx }))
        .is_err()
    {
        return Err(AuthzError::TimedOut);
    }

    let decision = tokio::select! {
        decision = decision_rx.recv() => decision,
        outcome = waiter => {
            // The request can still be decided out-of-band, e.g. through
            // the dashboard.
            return match outcome {
                Ok(PendingOutcome::Approved { params }) => Ok(params),
                Ok(PendingOutcome::Denied) => Err(AuthzError::Denied),
                Ok(PendingOutcome::Expired) | Err(_) => Err(AuthzError::TimedOut),
            };
        }
        () = tokio::time::sleep(ADMIN_RPC_TIMEOUT) => None,
    };

    let Some(decision) = decision else {
        debug!("No admin decision for request {pending_id}; rejecting");
        return Err(AuthzError::TimedOut);
    };

    match decision.as_str() {
        // A one-off approval: nothing is persisted.
        "allow" | "true" => {
            let _ = center.store.decide_pending_request(pending_id, true)?;
            Ok(params.to_vec())
        }
        "deny" | "false" => {
            let _ = center::deny_pending(center, pending_id);
            Err(AuthzError::Denied)
        }
        // A standing approval, scoped to the method (and, for signing, the
        // requested event kind).
        "always" => {
            let kind = match method {
                "sign_event" => params.first().and_then(|p| acl::event_kind(p)),
                _ => None,
            };
            acl::permit_all_requests(
                &center.store,
                key_name,
                client_pubkey,
                method,
                kind.as_deref(),
                None,
            )?;
            let _ = center.store.decide_pending_request(pending_id, true)?;
            Ok(params.to_vec())
        }
        // The standing veto.
        "never" => {
            acl::forbid_all_requests(&center.store, key_name, client_pubkey)?;
            let _ = center::deny_pending(center, pending_id);
            Err(AuthzError::Denied)
        }
        other => {
            warn!("Ignoring unrecognised admin decision '{other}'");
            Err(AuthzError::TimedOut)
        }
    }
}

/// Schedule the 60 s reaper for a pending request.
///
/// The reaper removes the row whether or not it was decided; if it was
/// still undecided, the waiter is woken with the expiry signal.  Reaping is
/// idempotent and never undoes conditions written by an approval.
fn spawn_reaper(center: &Arc<Center>, pending_id: i64) {
    let center = center.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(PENDING_TTL_SECS as u64)).await;
        match center.store.reap_pending_request(pending_id) {
            Ok(Some(true)) => {
                debug!("Pending request {pending_id} expired undecided");
                center.wake_pending(pending_id, PendingOutcome::Expired);
            }
            Ok(Some(false)) | Ok(None) => {}
            Err(err) => warn!("Cannot reap pending request {pending_id}: {err}"),
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use nostr::Keys;
    use tokio::sync::mpsc;

    use crate::config::{Config, StoredKey};
    use crate::store::Store;

    use super::*;

    const CLIENT: &str = "82341f882b6eabcd2ba7f1ef90aad961cf074af15b9ef44a09f9d2a8fbfbe6a2";

    fn http_center() -> Arc<Center> {
        let mut config = Config::default();
        config.base_url = Some("https://bunker.example.org".into());
        let keys = Keys::generate();
        config.keys.insert(
            "alice".into(),
            StoredKey::Plain {
                key: keys.secret_key().to_secret_hex(),
            },
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Center::new(config, Store::open_in_memory().unwrap(), tx))
    }

    #[tokio::test]
    async fn http_approval_resolves_the_wait() {
        let center = http_center();
        let seen_urls = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let center = center.clone();
            let seen_urls = seen_urls.clone();
            tokio::spawn(async move {
                request_authorization(
                    &center,
                    "alice",
                    "req-1",
                    CLIENT,
                    "sign_event",
                    &[r#"{"kind":1,"content":"hi","tags":[]}"#.to_string()],
                    |url| seen_urls.lock().unwrap().push(url),
                )
                .await
            })
        };

        // Wait for the pending request to appear, then approve it the way
        // the HTTP surface would.
        let pending_id = loop {
            if let Some(row) = center.store.list_requests(None, 50, 0).unwrap().first() {
                break row.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        center::approve_pending(&center, pending_id, None).unwrap();

        let params = task.await.unwrap().unwrap();
        assert_eq!(params.len(), 1);

        let urls = seen_urls.lock().unwrap();
        assert_eq!(
            urls.as_slice(),
            [format!("https://bunker.example.org/requests/{pending_id}")]
        );
    }

    #[tokio::test]
    async fn http_denial_rejects_the_wait() {
        let center = http_center();

        let task = {
            let center = center.clone();
            tokio::spawn(async move {
                request_authorization(&center, "alice", "req-1", CLIENT, "connect", &[], |_| {})
                    .await
            })
        };

        let pending_id = loop {
            if let Some(row) = center.store.list_requests(None, 50, 0).unwrap().first() {
                break row.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        center::deny_pending(&center, pending_id).unwrap();

        assert!(matches!(task.await.unwrap(), Err(AuthzError::Denied)));
    }

    #[tokio::test(start_paused = true)]
    async fn undecided_requests_expire() {
        let center = http_center();

        let result = request_authorization(
            &center,
            "alice",
            "req-1",
            CLIENT,
            "sign_event",
            &[],
            |_| {},
        )
        .await;

        assert!(matches!(result, Err(AuthzError::TimedOut)));
        // The reaper removed the row.
        assert!(center.store.list_requests(None, 50, 0).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn relay_path_persists_always() {
        // No base URL: decisions come from the admin channel.
        let keys = Keys::generate();
        let mut config = Config::default();
        config.keys.insert(
            "alice".into(),
            StoredKey::Plain {
                key: keys.secret_key().to_secret_hex(),
            },
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let center = Arc::new(Center::new(config, Store::open_in_memory().unwrap(), tx));

        // An admin that answers "always" to everything.
        tokio::spawn(async move {
            while let Some((unit, cmd)) = rx.recv().await {
                assert_eq!(unit, "AC");
                if let ApplicationCommand::AdminAcl { decision_tx, .. } = cmd {
                    let _ = decision_tx.send("always".to_string()).await;
                }
            }
        });

        let params = [r#"{"kind":1,"content":"hi","tags":[]}"#.to_string()];
        let result = request_authorization(
            &center, "alice", "req-1", CLIENT, "sign_event", &params, |_| {},
        )
        .await;
        assert!(result.is_ok());

        // "always" persisted a kind-scoped condition.
        let key_user = center.store.find_key_user("alice", CLIENT).unwrap().unwrap();
        let conditions = center.store.conditions_for(key_user.id).unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].kind.as_deref(), Some("1"));
        assert!(conditions[0].allowed);
    }
}
