//! End-to-end account provisioning.
//!
//! `create_account` is the one RPC open to anyone: a client asks for a name
//! under one of the configured domains, the administrator vets the request
//! through the registration form, and the bunker mints a fresh key, wires
//! it into the public name directory and grants the requester access.
//! External side-effects (custodial wallet, lightning address) are attempted
//! but never fatal; the key is persisted even when they fail.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::{fmt, io};

use camino::Utf8Path;
use nostr::{EventBuilder, Keys, Kind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use crate::acl;
use crate::authorizer::{self, AuthzError};
use crate::center::{self, Center, KeyActionError};
use crate::config::{DomainConfig, StoredKey};
use crate::store::StoreError;
use crate::util;

/// Names nobody gets to register.
const RESERVED_NAMES: [&str; 5] = ["admin", "root", "_", "administrator", "__"];

/// The length of derived usernames.
const DERIVED_NAME_LEN: usize = 10;

//----------- ProvisionError ---------------------------------------------------

/// An error provisioning an account.
#[derive(Debug)]
pub enum ProvisionError {
    /// No domains are configured.
    NoDomains,

    /// The requested domain is not configured.
    UnknownDomain,

    /// The requested username is reserved.
    ReservedName,

    /// The requested username is malformed.
    BadName,

    /// The name is already taken in the domain directory.
    NameTaken,

    /// The administrator denied the request.
    Denied,

    /// No decision arrived in time.
    TimedOut,

    /// The store failed.
    Store(StoreError),

    /// The directory file could not be read or written.
    Io(io::Error),

    /// The key could not be persisted.
    Key(KeyActionError),
}

impl std::error::Error for ProvisionError {}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDomains => f.write_str("no domains are configured"),
            Self::UnknownDomain => f.write_str("unknown domain"),
            Self::ReservedName => f.write_str("this username is reserved"),
            Self::BadName => f.write_str("invalid username"),
            Self::NameTaken => f.write_str("this username is taken"),
            Self::Denied => f.write_str("denied"),
            Self::TimedOut => f.write_str("authorization timed out"),
            Self::Store(err) => err.fmt(f),
            Self::Io(err) => write!(f, "directory error: {err}"),
            Self::Key(err) => err.fmt(f),
        }
    }
}

impl From<StoreError> for ProvisionError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<io::Error> for ProvisionError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

//--- The flow

/// Handle a `create_account` request end-to-end.
///
/// Params are `[username?, domain?, email?]`.  Returns the hex public key
/// of the freshly minted identity.
pub async fn create_account(
    center: &Arc<Center>,
    request_id: &str,
    requester_pubkey: &str,
    params: &[String],
    on_auth_url: impl Fn(String),
) -> Result<String, ProvisionError> {
    // Pick the domain and derive (or validate) the requested username.
    let domain = {
        let config = center.config.lock().unwrap();
        let requested = params.get(1).map(|d| d.trim().to_lowercase());
        match requested.filter(|d| !d.is_empty()) {
            Some(domain) => {
                if !config.domains.contains_key(&domain) {
                    return Err(ProvisionError::UnknownDomain);
                }
                domain
            }
            None => config
                .domains
                .keys()
                .next()
                .cloned()
                .ok_or(ProvisionError::NoDomains)?,
        }
    };

    let username = match params.first().map(|u| u.trim().to_lowercase()) {
        Some(requested) if !requested.is_empty() => {
            // The reserved-name check applies to the requested name; a name
            // the administrator rewrites on the form is taken as-is.
            if RESERVED_NAMES.contains(&requested.as_str()) {
                return Err(ProvisionError::ReservedName);
            }
            validate_username(&requested)?
        }
        _ => util::random_base36(DERIVED_NAME_LEN),
    };
    let email = params.get(2).cloned().unwrap_or_default();
    let key_name = format!("{username}@{domain}");

    // Hand the decision to the administrator; the registration form may
    // rewrite all three values.
    let approved = authorizer::request_authorization(
        center,
        &key_name,
        request_id,
        requester_pubkey,
        "create_account",
        &[username, domain, email],
        on_auth_url,
    )
    .await
    .map_err(|err| match err {
        AuthzError::Denied => ProvisionError::Denied,
        AuthzError::TimedOut => ProvisionError::TimedOut,
        AuthzError::Store(err) => ProvisionError::Store(err),
    })?;

    let username = approved.first().cloned().unwrap_or_default();
    let domain = approved.get(1).cloned().unwrap_or_default();
    if username.is_empty() || domain.is_empty() {
        return Err(ProvisionError::BadName);
    }

    finalize(center, requester_pubkey, &username, &domain).await
}

/// Complete provisioning once the administrator has accepted the values.
async fn finalize(
    center: &Arc<Center>,
    requester_pubkey: &str,
    username: &str,
    domain: &str,
) -> Result<String, ProvisionError> {
    let domain_config = {
        let config = center.config.lock().unwrap();
        config
            .domains
            .get(domain)
            .cloned()
            .ok_or(ProvisionError::UnknownDomain)?
    };

    // The name must still be free; approvals can race.
    let directory = Directory::load(&domain_config.directory)?;
    if directory.names.contains_key(username) {
        return Err(ProvisionError::NameTaken);
    }

    let keys = Keys::generate();
    let pubkey = keys.public_key().to_hex();
    let key_name = format!("{username}@{domain}");

    // A minimal profile so the identity resolves right away.
    publish_profile(center, &keys, username, domain, None);

    let mut directory = directory;
    directory.names.insert(username.to_string(), pubkey.clone());
    if !domain_config.relays.is_empty() {
        directory
            .relays
            .insert(pubkey.clone(), domain_config.relays.clone());
    }
    directory.save(&domain_config.directory)?;

    // Optional external services; failures are logged and ignored, and the
    // key is persisted regardless.
    side_effects(center, &domain_config, username, domain, &keys).await;

    // Persist the key plain, bring it online and whitelist the requester.
    {
        let mut config = center.config.lock().unwrap();
        if config.keys.contains_key(&key_name) {
            return Err(ProvisionError::NameTaken);
        }
        config.keys.insert(
            key_name.clone(),
            StoredKey::Plain {
                key: keys.secret_key().to_secret_hex(),
            },
        );
        config.save()?;
    }
    center::load_key(center, &key_name, keys).map_err(ProvisionError::Key)?;

    let key_user_id =
        acl::permit_all_requests(&center.store, &key_name, requester_pubkey, "connect", None, None)?;
    for method in ["nip04_encrypt", "nip04_decrypt", "nip44_encrypt", "nip44_decrypt"] {
        center
            .store
            .insert_condition(key_user_id, method, None, true)?;
    }
    center.store.append_audit(
        "registered",
        Some("create_account"),
        Some(json!([username, domain]).to_string().as_str()),
        Some(key_user_id),
    )?;

    info!("Provisioned '{key_name}' as {pubkey}");
    Ok(pubkey)
}

/// Publish the kind-0 profile of a fresh identity.
fn publish_profile(
    center: &Arc<Center>,
    keys: &Keys,
    username: &str,
    domain: &str,
    lud16: Option<&str>,
) {
    let Some(pool) = center.user_pool.get() else {
        debug!("No relay pool yet; skipping the profile publish");
        return;
    };
    let mut profile = json!({
        "name": username,
        "nip05": format!("{username}@{domain}"),
    });
    if let Some(lud16) = lud16 {
        profile["lud16"] = json!(lud16);
    }
    match EventBuilder::new(Kind::Metadata, profile.to_string()).sign_with_keys(keys) {
        Ok(event) => pool.publish(&event),
        Err(err) => warn!("Cannot sign the profile event: {err}"),
    }
}

/// Run the optional wallet and lightning-address side-effects.
async fn side_effects(
    center: &Arc<Center>,
    domain_config: &DomainConfig,
    username: &str,
    domain: &str,
    keys: &Keys,
) {
    let client = reqwest::Client::new();
    let pubkey = keys.public_key().to_hex();

    if let Some(service) = &domain_config.wallet_service {
        let result = client
            .post(service.clone())
            .json(&json!({ "username": username, "domain": domain, "pubkey": pubkey }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!("Wallet provisioned for '{username}@{domain}'")
            }
            Ok(response) => warn!("Wallet service answered {}", response.status()),
            Err(err) => warn!("Wallet service unreachable: {err}"),
        }
    }

    if let Some(service) = &domain_config.lnaddress_service {
        let result = client
            .post(service.clone())
            .json(&json!({ "username": username, "domain": domain, "pubkey": pubkey }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                // The lightning address goes into the profile.
                let lud16 = format!("{username}@{domain}");
                publish_profile(center, keys, username, domain, Some(lud16.as_str()));
            }
            Ok(response) => warn!("Lightning-address service answered {}", response.status()),
            Err(err) => warn!("Lightning-address service unreachable: {err}"),
        }
    }
}

/// Check a username against the directory charset.
pub fn validate_username(name: &str) -> Result<String, ProvisionError> {
    let name = name.trim().to_lowercase();
    if name.is_empty()
        || name.len() > 64
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(ProvisionError::BadName);
    }
    Ok(name)
}

/// Whether a username is reserved.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

//----------- Directory --------------------------------------------------------

/// A domain's public name directory (NIP-05 style `nostr.json`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Directory {
    /// Username to hex public key.
    #[serde(default)]
    pub names: BTreeMap<String, String>,

    /// Hex public key to advertised relays.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relays: BTreeMap<String, Vec<Url>>,
}

impl Directory {
    /// Load a directory file; a missing file is an empty directory.
    pub fn load(path: &Utf8Path) -> io::Result<Self> {
        match std::fs::read(path) {
            Ok(contents) => serde_json::from_slice(&contents)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err),
        }
    }

    /// Atomically write the directory back.
    pub fn save(&self, path: &Utf8Path) -> io::Result<()> {
        let contents = serde_json::to_vec_pretty(self).expect("directories always serialize");
        util::write_file(path, &contents)
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use tokio::sync::mpsc;

    use crate::config::Config;
    use crate::store::Store;

    use super::*;

    const CLIENT: &str = "82341f882b6eabcd2ba7f1ef90aad961cf074af15b9ef44a09f9d2a8fbfbe6a2";

    #[test]
    fn username_validation() {
        assert_eq!(validate_username("  Alice  ").unwrap(), "alice");
        assert_eq!(validate_username("a.b_c-9").unwrap(), "a.b_c-9");
        assert!(matches!(validate_username(""), Err(ProvisionError::BadName)));
        assert!(matches!(
            validate_username("has space"),
            Err(ProvisionError::BadName)
        ));
        for name in RESERVED_NAMES {
            assert!(is_reserved(name));
        }
    }

    #[test]
    fn directory_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("nostr.json")).unwrap();

        // Missing file reads as empty.
        let mut directory = Directory::load(&path).unwrap();
        assert!(directory.names.is_empty());

        directory.names.insert("alice".into(), "ab".repeat(32));
        directory.save(&path).unwrap();

        let again = Directory::load(&path).unwrap();
        assert_eq!(again.names["alice"], "ab".repeat(32));
    }

    fn provisioning_center(dir: &Utf8Path) -> Arc<Center> {
        let mut config = Config::default();
        config.path = dir.join("bunker.json");
        config.base_url = Some("https://bunker.example.org".into());
        config.domains.insert(
            "example.com".into(),
            DomainConfig {
                directory: dir.join("nostr.json"),
                relays: Vec::new(),
                wallet_service: None,
                lnaddress_service: None,
            },
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Center::new(config, Store::open_in_memory().unwrap(), tx))
    }

    #[tokio::test]
    async fn reserved_and_unknown_inputs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let center = provisioning_center(&root);

        let result = create_account(
            &center,
            "r1",
            CLIENT,
            &["admin".into(), "example.com".into()],
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(ProvisionError::ReservedName)));

        let result = create_account(
            &center,
            "r1",
            CLIENT,
            &["alice".into(), "elsewhere.org".into()],
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(ProvisionError::UnknownDomain)));
    }

    #[tokio::test]
    async fn full_flow_with_admin_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let center = provisioning_center(&root);

        let task = {
            let center = center.clone();
            tokio::spawn(async move {
                create_account(
                    &center,
                    "r1",
                    CLIENT,
                    &["alice".into(), "example.com".into(), String::new()],
                    |_| {},
                )
                .await
            })
        };

        // The registration form accepts the request but renames the user.
        let pending_id = loop {
            if let Some(row) = center.store.list_requests(None, 50, 0).unwrap().first() {
                break row.id;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        center::approve_registration(
            &center,
            pending_id,
            &["alicia".into(), "example.com".into(), String::new()],
        )
        .unwrap();

        let pubkey = task.await.unwrap().unwrap();

        // The directory gained the rewritten name...
        let directory = Directory::load(&root.join("nostr.json")).unwrap();
        assert_eq!(directory.names["alicia"], pubkey);

        // ...the key was stored plain under username@domain...
        let config = center.config.lock().unwrap();
        let stored = config.keys.get("alicia@example.com").unwrap();
        assert!(!stored.is_encrypted());
        drop(config);
        assert!(center.active_key("alicia@example.com").is_some());

        // ...the key row exists for the registration poll...
        assert!(center
            .store
            .get_key_row("alicia@example.com")
            .unwrap()
            .is_some());

        // ...and the requester was whitelisted.
        let key_user = center
            .store
            .find_key_user("alicia@example.com", CLIENT)
            .unwrap()
            .unwrap();
        let methods: Vec<_> = center
            .store
            .conditions_for(key_user.id)
            .unwrap()
            .into_iter()
            .map(|c| c.method)
            .collect();
        assert!(methods.contains(&"connect".to_string()));
        assert!(methods.contains(&"sign_event".to_string()));
        assert!(methods.contains(&"nip44_decrypt".to_string()));
    }
}
