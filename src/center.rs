//! The bunker's central command.
//!
//! The [`Center`] owns everything shared between units: the configuration
//! (which doubles as the key vault), the policy store, the unlocked signing
//! keys and the waiters for pending approval decisions.  Approval actions
//! live here too, so the HTTP surface and the admin channel resolve
//! requests through one code path.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use arc_swap::ArcSwap;
use nostr::Keys;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use url::Url;

use crate::acl;
use crate::comms::ApplicationCommand;
use crate::config::Config;
use crate::relay::RelayPool;
use crate::store::{Store, StoreError};

//----------- ActiveKey --------------------------------------------------------

/// A runtime-unlocked user key.
#[derive(Clone)]
pub struct ActiveKey {
    /// The vault name of the key.
    pub name: String,

    /// The unlocked signing identity.
    pub keys: Keys,
}

impl fmt::Debug for ActiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never expose the secret, not even in debug output.
        f.debug_struct("ActiveKey")
            .field("name", &self.name)
            .field("pubkey", &self.keys.public_key())
            .finish()
    }
}

//----------- PendingOutcome ---------------------------------------------------

/// The resolution of a pending approval request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingOutcome {
    /// Approved, with the (possibly admin-rewritten) parameters.
    Approved { params: Vec<String> },

    /// Denied by the administrator.
    Denied,

    /// Reaped before a decision was made.
    Expired,
}

//----------- Center -----------------------------------------------------------

/// The bunker's central command.
#[derive(Debug)]
pub struct Center {
    /// The configuration document, including the key vault.
    pub config: Mutex<Config>,

    /// The policy store.
    pub store: Store,

    /// The unlocked signing keys, by vault name.
    ///
    /// Read on every request, written only on the control path (boot,
    /// `unlock_key`, provisioning), hence the swap-on-write map.
    pub active_keys: ArcSwap<HashMap<String, Arc<ActiveKey>>>,

    /// The relay pool of the user-key endpoints.  Set once by the signer
    /// unit at startup; provisioning publishes profile events through it.
    pub user_pool: OnceLock<Arc<RelayPool>>,

    /// A channel to send units commands.
    pub app_cmd_tx: mpsc::UnboundedSender<(String, ApplicationCommand)>,

    /// Waiters for pending-request decisions, keyed by pending id.
    waiters: Mutex<HashMap<i64, Vec<oneshot::Sender<PendingOutcome>>>>,
}

impl Center {
    /// Set up the central command.
    pub fn new(
        config: Config,
        store: Store,
        app_cmd_tx: mpsc::UnboundedSender<(String, ApplicationCommand)>,
    ) -> Self {
        Self {
            config: Mutex::new(config),
            store,
            active_keys: ArcSwap::from_pointee(HashMap::new()),
            user_pool: OnceLock::new(),
            app_cmd_tx,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Look up an unlocked key by name.
    pub fn active_key(&self, name: &str) -> Option<Arc<ActiveKey>> {
        self.active_keys.load().get(name).cloned()
    }

    /// The names of all unlocked keys.
    pub fn active_key_names(&self) -> Vec<String> {
        self.active_keys.load().keys().cloned().collect()
    }

    /// Publish a newly unlocked key.
    ///
    /// Callers on the control path only; concurrent writers are not
    /// supported.
    pub fn insert_active_key(&self, name: &str, keys: Keys) -> Arc<ActiveKey> {
        let active = Arc::new(ActiveKey {
            name: name.to_string(),
            keys,
        });
        let mut map = HashMap::clone(&self.active_keys.load());
        map.insert(name.to_string(), active.clone());
        self.active_keys.store(Arc::new(map));
        debug!("Key '{name}' is now active");
        active
    }

    /// The configured public base URL, if any.
    pub fn base_url(&self) -> Option<String> {
        let config = self.config.lock().unwrap();
        config
            .base_url
            .as_ref()
            .map(|url| url.trim_end_matches('/').to_string())
    }

    //--- Pending-request waiters

    /// Register interest in the decision of a pending request.
    pub fn register_waiter(&self, pending_id: i64) -> oneshot::Receiver<PendingOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .entry(pending_id)
            .or_default()
            .push(tx);
        rx
    }

    /// Wake every waiter of a pending request.
    ///
    /// Unknown ids are fine; waking an already-woken request does nothing.
    pub fn wake_pending(&self, pending_id: i64, outcome: PendingOutcome) {
        let senders = self.waiters.lock().unwrap().remove(&pending_id);
        for tx in senders.into_iter().flatten() {
            let _ = tx.send(outcome.clone());
        }
    }
}

//--- Actions

/// An error approving a pending request.
#[derive(Debug)]
pub enum ApproveError {
    /// No such pending request exists.
    NotFound,

    /// The request was already decided.
    AlreadyDecided,

    /// This request type is resolved elsewhere (registration form).
    NotApprovable,

    /// The key is encrypted and approval needs a password.
    PasswordRequired,

    /// The supplied password does not match.
    WrongPassword,

    /// The store failed.
    Store(StoreError),
}

impl std::error::Error for ApproveError {}

impl fmt::Display for ApproveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("no such pending request"),
            Self::AlreadyDecided => f.write_str("the request was already decided"),
            Self::NotApprovable => {
                f.write_str("account creation is approved through the registration form")
            }
            Self::PasswordRequired => f.write_str("a password is required"),
            Self::WrongPassword => f.write_str("wrong password"),
            Self::Store(err) => err.fmt(f),
        }
    }
}

impl From<StoreError> for ApproveError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Approve a pending request.
///
/// Verifies the user password when the key is passphrase-encrypted, records
/// the standing approval, appends the audit entry, decides the request and
/// wakes its waiter.
pub fn approve_pending(
    center: &Center,
    pending_id: i64,
    password: Option<&str>,
) -> Result<(), ApproveError> {
    let Some(request) = center.store.get_pending_request(pending_id)? else {
        return Err(ApproveError::NotFound);
    };
    if request.allowed.is_some() {
        return Err(ApproveError::AlreadyDecided);
    }
    if request.method == "create_account" {
        return Err(ApproveError::NotApprovable);
    }

    // Approving against an encrypted key needs the key user's password.
    let encrypted = {
        let config = center.config.lock().unwrap();
        config
            .keys
            .get(&request.key_name)
            .is_some_and(|key| key.is_encrypted())
    };
    if encrypted {
        let password = password
            .filter(|p| !p.is_empty())
            .ok_or(ApproveError::PasswordRequired)?;
        let user = center
            .store
            .get_user(&request.key_name)?
            .ok_or(ApproveError::WrongPassword)?;
        if !bcrypt::verify(password, &user.password_hash).unwrap_or(false) {
            return Err(ApproveError::WrongPassword);
        }
    }

    let params: Vec<String> = serde_json::from_str(&request.params).unwrap_or_default();
    let kind = match request.method.as_str() {
        "sign_event" => Some(acl::KIND_ALL),
        _ => None,
    };
    let key_user_id = acl::permit_all_requests(
        &center.store,
        &request.key_name,
        &request.remote_pubkey,
        &request.method,
        kind,
        None,
    )?;

    center.store.append_audit(
        "approval",
        Some(request.method.as_str()),
        Some(request.params.as_str()),
        Some(key_user_id),
    )?;

    if !center.store.decide_pending_request(pending_id, true)? {
        return Err(ApproveError::AlreadyDecided);
    }
    center.wake_pending(pending_id, PendingOutcome::Approved { params });

    info!(
        "Approved '{}' for client {} on key '{}'",
        request.method, request.remote_pubkey, request.key_name
    );
    Ok(())
}

/// Deny a pending request and wake its waiter.
pub fn deny_pending(center: &Center, pending_id: i64) -> Result<(), ApproveError> {
    if !center.store.decide_pending_request(pending_id, false)? {
        return Err(ApproveError::AlreadyDecided);
    }
    center.wake_pending(pending_id, PendingOutcome::Denied);
    Ok(())
}

/// Approve a `create_account` request with the vetted registration values.
///
/// The pending request's parameters are replaced by
/// `[username, domain, email]` before the decision, so the provisioning
/// flow resumes with what the administrator actually accepted.
pub fn approve_registration(
    center: &Center,
    pending_id: i64,
    params: &[String; 3],
) -> Result<(), ApproveError> {
    let Some(request) = center.store.get_pending_request(pending_id)? else {
        return Err(ApproveError::NotFound);
    };
    if request.method != "create_account" {
        return Err(ApproveError::NotApprovable);
    }
    if request.allowed.is_some() {
        return Err(ApproveError::AlreadyDecided);
    }

    let params_json =
        serde_json::to_string(params.as_slice()).expect("string arrays always serialize");
    center.store.update_pending_params(pending_id, &params_json)?;
    if !center.store.decide_pending_request(pending_id, true)? {
        return Err(ApproveError::AlreadyDecided);
    }
    center.wake_pending(
        pending_id,
        PendingOutcome::Approved {
            params: params.to_vec(),
        },
    );
    Ok(())
}

/// An error creating or unlocking a key.
#[derive(Debug)]
pub enum KeyActionError {
    /// A key of this name already exists.
    AlreadyExists,

    /// No stored key of this name exists.
    NoSuchKey,

    /// The vault refused the entry.
    Vault(crate::vault::VaultError),

    /// The configuration could not be written back.
    Io(std::io::Error),

    /// The store failed.
    Store(StoreError),
}

impl std::error::Error for KeyActionError {}

impl fmt::Display for KeyActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => f.write_str("a key of this name already exists"),
            Self::NoSuchKey => f.write_str("no such key"),
            Self::Vault(err) => err.fmt(f),
            Self::Io(err) => write!(f, "cannot save the configuration: {err}"),
            Self::Store(err) => err.fmt(f),
        }
    }
}

impl From<StoreError> for KeyActionError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<crate::vault::VaultError> for KeyActionError {
    fn from(err: crate::vault::VaultError) -> Self {
        Self::Vault(err)
    }
}

/// Mint (or import) a key, store it in the vault and bring it online.
///
/// The stored form is passphrase-encrypted when a passphrase is given,
/// plain otherwise.  The signer unit is told to start serving the key.
pub fn create_key(
    center: &Center,
    name: &str,
    passphrase: Option<&str>,
    nsec: Option<&str>,
) -> Result<Arc<ActiveKey>, KeyActionError> {
    let keys = match nsec.filter(|n| !n.is_empty()) {
        Some(nsec) => {
            Keys::parse(nsec).map_err(|_| KeyActionError::Vault(crate::vault::VaultError::BadSecret))?
        }
        None => Keys::generate(),
    };

    {
        let mut config = center.config.lock().unwrap();
        if config.keys.contains_key(name) {
            return Err(KeyActionError::AlreadyExists);
        }
        let stored = crate::vault::store_secret(&keys.secret_key().to_secret_hex(), passphrase);
        config.keys.insert(name.to_string(), stored);
        config.save().map_err(KeyActionError::Io)?;
    }

    load_key(center, name, keys)
}

/// Unlock a stored key with its passphrase and bring it online.
pub fn unlock_key(
    center: &Center,
    name: &str,
    passphrase: &str,
) -> Result<Arc<ActiveKey>, KeyActionError> {
    let stored = {
        let config = center.config.lock().unwrap();
        config.keys.get(name).cloned()
    };
    let Some(stored) = stored else {
        return Err(KeyActionError::NoSuchKey);
    };

    let keys = crate::vault::unlock_stored(&stored, Some(passphrase))?;
    load_key(center, name, keys)
}

/// Publish an unlocked key and tell the signer unit to serve it.
pub fn load_key(
    center: &Center,
    name: &str,
    keys: Keys,
) -> Result<Arc<ActiveKey>, KeyActionError> {
    let pubkey = keys.public_key().to_hex();
    let active = center.insert_active_key(name, keys);
    center.store.add_key_row(name, &pubkey)?;
    let _ = center.app_cmd_tx.send((
        "SG".into(),
        ApplicationCommand::LoadKey {
            name: name.to_string(),
        },
    ));
    info!("Key '{name}' is online as {pubkey}");
    Ok(active)
}

/// Build a `bunker://` connection descriptor.
pub fn connection_descriptor(pubkey_hex: &str, relays: &[Url], secret: Option<&str>) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for relay in relays {
        query.append_pair("relay", relay.as_str());
    }
    if let Some(secret) = secret {
        query.append_pair("secret", secret);
    }
    format!("bunker://{pubkey_hex}?{}", query.finish())
}

#[cfg(test)]
mod tests {
    use crate::config::StoredKey;

    use super::*;

    const CLIENT: &str = "82341f882b6eabcd2ba7f1ef90aad961cf074af15b9ef44a09f9d2a8fbfbe6a2";

    fn center_with(config: Config) -> Center {
        let (tx, _rx) = mpsc::unbounded_channel();
        Center::new(config, Store::open_in_memory().unwrap(), tx)
    }

    fn plain_key_config(name: &str) -> Config {
        let mut config = Config::default();
        let keys = Keys::generate();
        config.keys.insert(
            name.into(),
            StoredKey::Plain {
                key: keys.secret_key().to_secret_hex(),
            },
        );
        config
    }

    #[test]
    fn approving_unknown_request_fails() {
        let center = center_with(Config::default());
        assert!(matches!(
            approve_pending(&center, 42, None),
            Err(ApproveError::NotFound)
        ));
    }

    #[test]
    fn approval_writes_conditions_and_audit() {
        let center = center_with(plain_key_config("alice"));
        let id = center
            .store
            .create_pending_request("r1", "alice", CLIENT, "sign_event", r#"["{}"]"#)
            .unwrap();
        let waiter = center.register_waiter(id);

        approve_pending(&center, id, None).unwrap();

        let key_user = center.store.find_key_user("alice", CLIENT).unwrap().unwrap();
        let conditions = center.store.conditions_for(key_user.id).unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].method, "sign_event");
        assert_eq!(conditions[0].kind.as_deref(), Some("all"));

        let audit = center.store.recent_audit(5).unwrap();
        assert_eq!(audit[0].entry_type, "approval");

        assert!(matches!(
            waiter.blocking_recv().unwrap(),
            PendingOutcome::Approved { .. }
        ));

        // A second approval is rejected.
        assert!(matches!(
            approve_pending(&center, id, None),
            Err(ApproveError::AlreadyDecided)
        ));
    }

    #[test]
    fn encrypted_keys_demand_the_right_password() {
        let mut config = Config::default();
        config.keys.insert(
            "alice".into(),
            StoredKey::Encrypted {
                iv: "00".repeat(16),
                data: "00".repeat(32),
            },
        );
        let center = center_with(config);
        center
            .store
            .upsert_user("alice", &bcrypt::hash("hunter2", 10).unwrap())
            .unwrap();
        let id = center
            .store
            .create_pending_request("r1", "alice", CLIENT, "connect", "[]")
            .unwrap();

        assert!(matches!(
            approve_pending(&center, id, None),
            Err(ApproveError::PasswordRequired)
        ));
        assert!(matches!(
            approve_pending(&center, id, Some("wrong")),
            Err(ApproveError::WrongPassword)
        ));
        approve_pending(&center, id, Some("hunter2")).unwrap();

        // connect implies blanket signing.
        let key_user = center.store.find_key_user("alice", CLIENT).unwrap().unwrap();
        let methods: Vec<_> = center
            .store
            .conditions_for(key_user.id)
            .unwrap()
            .into_iter()
            .map(|c| c.method)
            .collect();
        assert_eq!(methods, vec!["connect", "sign_event"]);
    }

    #[test]
    fn registration_rewrites_params() {
        let center = center_with(Config::default());
        let id = center
            .store
            .create_pending_request(
                "r1",
                "alice@example.com",
                CLIENT,
                "create_account",
                r#"["alice","example.com",""]"#,
            )
            .unwrap();
        let waiter = center.register_waiter(id);

        // The plain approval path refuses account creations.
        assert!(matches!(
            approve_pending(&center, id, None),
            Err(ApproveError::NotApprovable)
        ));

        let vetted = ["alicia".to_string(), "example.com".to_string(), String::new()];
        approve_registration(&center, id, &vetted).unwrap();

        let row = center.store.get_pending_request(id).unwrap().unwrap();
        assert_eq!(row.params, r#"["alicia","example.com",""]"#);
        assert_eq!(
            waiter.blocking_recv().unwrap(),
            PendingOutcome::Approved {
                params: vetted.to_vec()
            }
        );
    }

    #[test]
    fn descriptor_format() {
        let relays = vec![Url::parse("wss://relay.example.org").unwrap()];
        let uri = connection_descriptor("abc123", &relays, Some("s3cret"));
        assert_eq!(
            uri,
            "bunker://abc123?relay=wss%3A%2F%2Frelay.example.org%2F&secret=s3cret"
        );
    }
}
