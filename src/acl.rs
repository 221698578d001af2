//! Access control decisions.
//!
//! Evaluation is a pure function of policy-store state.  The single
//! always-consulted veto is a `method = '*', allowed = false` row; everything
//! else is scoped to the requested method and, for `sign_event`, to the
//! event kind.  Kind filters are compared as strings, including the literal
//! `"all"`, so blanket approvals compose with per-kind rules.

use crate::store::{Store, StoreError};

/// The method name of the wildcard veto row.
const WILDCARD: &str = "*";

/// The kind filter matching every event kind.
pub const KIND_ALL: &str = "all";

//----------- Decision ---------------------------------------------------------

/// The outcome of evaluating a request against the recorded conditions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The request is allowed.
    Allow,

    /// The request is denied.
    Deny,

    /// No recorded condition applies; an interactive decision is needed.
    Unknown,
}

//--- Evaluation

/// Decide whether a client may perform a method against a key.
///
/// `param_primary` is the first request parameter; for `sign_event` it is
/// parsed as a JSON object to extract the event kind.
pub fn evaluate(
    store: &Store,
    key_name: &str,
    client_pubkey: &str,
    method: &str,
    param_primary: Option<&str>,
) -> Result<Decision, StoreError> {
    let Some(key_user) = store.find_key_user(key_name, client_pubkey)? else {
        return Ok(Decision::Unknown);
    };

    let conditions = store.conditions_for(key_user.id)?;

    // The wildcard deny vetoes everything for this key user.
    if conditions
        .iter()
        .any(|c| c.method == WILDCARD && !c.allowed)
    {
        return Ok(Decision::Deny);
    }

    // Blanket approvals are recorded with the kind filter "all"; a
    // `sign_event` request additionally matches a filter naming its own
    // kind.  Other methods carry no kind.
    let mut kind_set = vec![KIND_ALL.to_string()];
    if method == "sign_event" {
        if let Some(kind) = param_primary.and_then(event_kind) {
            kind_set.push(kind);
        }
    }

    let matched = conditions.iter().find(|c| {
        if c.method != method {
            return false;
        }
        if method == "sign_event" {
            c.kind.as_deref().is_some_and(|k| kind_set.iter().any(|s| s == k))
        } else {
            true
        }
    });

    let Some(condition) = matched else {
        return Ok(Decision::Unknown);
    };

    // A revoked key user keeps its denials but loses its approvals.
    if key_user.revoked_at.is_some() && condition.allowed {
        return Ok(Decision::Deny);
    }

    Ok(if condition.allowed {
        Decision::Allow
    } else {
        Decision::Deny
    })
}

/// Extract the numeric `kind` of an event given as a JSON object.
pub fn event_kind(param: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(param).ok()?;
    let kind = value.as_object()?.get("kind")?.as_i64()?;
    Some(kind.to_string())
}

//--- Recording decisions

/// Record a standing approval for a (key, client, method) triple.
///
/// `kind` scopes `sign_event` approvals (`"all"` or a specific kind as a
/// string).  Approving `connect` implies approving `sign_event` for all
/// kinds, matching what the interactive approval page grants.
pub fn permit_all_requests(
    store: &Store,
    key_name: &str,
    client_pubkey: &str,
    method: &str,
    kind: Option<&str>,
    description: Option<&str>,
) -> Result<i64, StoreError> {
    let key_user_id = store.upsert_key_user(key_name, client_pubkey, description)?;

    let kind = match method {
        "sign_event" => Some(kind.unwrap_or(KIND_ALL)),
        _ => None,
    };
    store.insert_condition(key_user_id, method, kind, true)?;

    if method == "connect" {
        store.insert_condition(key_user_id, "sign_event", Some(KIND_ALL), true)?;
    }

    Ok(key_user_id)
}

/// Record the standing veto for a (key, client) pair.
///
/// Once present, every request from this client is denied regardless of
/// other conditions.
pub fn forbid_all_requests(
    store: &Store,
    key_name: &str,
    client_pubkey: &str,
) -> Result<i64, StoreError> {
    let key_user_id = store.upsert_key_user(key_name, client_pubkey, None)?;
    store.insert_condition(key_user_id, WILDCARD, None, false)?;
    Ok(key_user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: &str = "82341f882b6eabcd2ba7f1ef90aad961cf074af15b9ef44a09f9d2a8fbfbe6a2";

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn event(kind: i64) -> String {
        format!(r#"{{"kind":{kind},"content":"hi","tags":[]}}"#)
    }

    #[test]
    fn unknown_without_key_user() {
        let store = store();
        let decision = evaluate(&store, "alice", CLIENT, "get_public_key", None).unwrap();
        assert_eq!(decision, Decision::Unknown);
    }

    #[test]
    fn grant_is_monotonic() {
        let store = store();
        permit_all_requests(&store, "alice", CLIENT, "sign_event", Some(KIND_ALL), None).unwrap();

        for kind in [1, 4, 30023] {
            let decision =
                evaluate(&store, "alice", CLIENT, "sign_event", Some(event(kind).as_str())).unwrap();
            assert_eq!(decision, Decision::Allow);
        }
    }

    #[test]
    fn kind_scoped_grant() {
        let store = store();
        permit_all_requests(&store, "alice", CLIENT, "sign_event", Some("1"), None).unwrap();

        assert_eq!(
            evaluate(&store, "alice", CLIENT, "sign_event", Some(event(1).as_str())).unwrap(),
            Decision::Allow
        );
        // Other kinds are not covered by the grant.
        assert_eq!(
            evaluate(&store, "alice", CLIENT, "sign_event", Some(event(4).as_str())).unwrap(),
            Decision::Unknown
        );
        // So is an event whose kind cannot be extracted.
        assert_eq!(
            evaluate(&store, "alice", CLIENT, "sign_event", Some("not json")).unwrap(),
            Decision::Unknown
        );
    }

    #[test]
    fn connect_implies_blanket_signing() {
        let store = store();
        permit_all_requests(&store, "alice", CLIENT, "connect", None, None).unwrap();

        assert_eq!(
            evaluate(&store, "alice", CLIENT, "connect", None).unwrap(),
            Decision::Allow
        );
        assert_eq!(
            evaluate(&store, "alice", CLIENT, "sign_event", Some(event(1).as_str())).unwrap(),
            Decision::Allow
        );
        // Only signing is implied; other methods stay undecided.
        assert_eq!(
            evaluate(&store, "alice", CLIENT, "nip04_encrypt", None).unwrap(),
            Decision::Unknown
        );
    }

    #[test]
    fn veto_beats_everything() {
        let store = store();
        permit_all_requests(&store, "alice", CLIENT, "connect", None, None).unwrap();
        forbid_all_requests(&store, "alice", CLIENT).unwrap();

        for method in ["connect", "sign_event", "get_public_key", "nip04_decrypt"] {
            let param = event(1);
            let decision = evaluate(&store, "alice", CLIENT, method, Some(param.as_str())).unwrap();
            assert_eq!(decision, Decision::Deny, "method {method}");
        }
    }

    #[test]
    fn revocation_downgrades_approvals_only() {
        let store = store();
        let key_user_id =
            permit_all_requests(&store, "alice", CLIENT, "sign_event", Some(KIND_ALL), None)
                .unwrap();
        store.insert_condition(key_user_id, "ping", None, false).unwrap();
        store.revoke_key_user(key_user_id).unwrap();

        // The approval no longer applies...
        assert_eq!(
            evaluate(&store, "alice", CLIENT, "sign_event", Some(event(1).as_str())).unwrap(),
            Decision::Deny
        );
        // ...while the recorded denial still does.
        assert_eq!(
            evaluate(&store, "alice", CLIENT, "ping", None).unwrap(),
            Decision::Deny
        );
    }

    #[test]
    fn non_signing_methods_ignore_kind_filters() {
        let store = store();
        let key_user_id = store.upsert_key_user("alice", CLIENT, None).unwrap();
        store
            .insert_condition(key_user_id, "nip04_encrypt", None, true)
            .unwrap();

        assert_eq!(
            evaluate(&store, "alice", CLIENT, "nip04_encrypt", Some("peer-pubkey")).unwrap(),
            Decision::Allow
        );
    }
}
