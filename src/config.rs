//! The bunker configuration document.
//!
//! The configuration lives in a single JSON file, conventionally
//! `bunker.json`.  It doubles as the key vault: the `keys` map holds every
//! stored user key, either passphrase-encrypted (`{iv, data}`) or plain
//! (`{key}`).  The file is rewritten atomically whenever keys or admin
//! settings change, so its layout has to stay compatible with documents
//! written by earlier versions.

use std::collections::BTreeMap;
use std::{fmt, fs, io};

use camino::{Utf8Path, Utf8PathBuf};
use nostr::nips::nip19::FromBech32;
use nostr::{Keys, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::util;

/// Environment variable carrying extra admin npubs (comma-separated).
const ADMIN_NPUBS_VAR: &str = "ADMIN_NPUBS";

/// Environment variable overriding the state-store path.
const DATABASE_URL_VAR: &str = "DATABASE_URL";

//----------- Config -----------------------------------------------------------

/// The bunker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// User-facing relay settings.
    #[serde(default)]
    pub nostr: NostrConfig,

    /// The administrative identity and allow-list.
    #[serde(default)]
    pub admin: AdminConfig,

    /// The listen port of the HTTP surface.
    #[serde(default = "default_auth_port")]
    pub auth_port: u16,

    /// The listen host of the HTTP surface.
    #[serde(default = "default_auth_host")]
    pub auth_host: String,

    /// The public base URL under which approval pages are reachable.
    ///
    /// When unset, first-time requests fall back to the relay admin path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// The path of the state store.  Defaults to `bunker.db` beside the
    /// configuration file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<Utf8PathBuf>,

    /// A log file.  When unset, logs go to stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Utf8PathBuf>,

    /// The key vault: stored user keys by name.
    #[serde(default)]
    pub keys: BTreeMap<String, StoredKey>,

    /// Domains available to the account provisioning flow.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub domains: BTreeMap<String, DomainConfig>,

    /// Whether to log at the debug level.
    #[serde(default)]
    pub verbose: bool,

    /// Where this configuration was loaded from.  Not part of the document.
    #[serde(skip)]
    pub path: Utf8PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nostr: NostrConfig::default(),
            admin: AdminConfig::default(),
            auth_port: default_auth_port(),
            auth_host: default_auth_host(),
            base_url: None,
            database: None,
            logs: None,
            keys: BTreeMap::new(),
            domains: BTreeMap::new(),
            verbose: false,
            path: Utf8PathBuf::new(),
        }
    }
}

//----------- NostrConfig ------------------------------------------------------

/// Relay settings for user-key endpoints.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NostrConfig {
    /// The relays every user-key endpoint subscribes on.
    #[serde(default)]
    pub relays: Vec<Url>,
}

//----------- AdminConfig ------------------------------------------------------

/// The administrative identity and allow-list.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfig {
    /// Public keys (npub encoding) allowed to invoke management RPCs.
    #[serde(default)]
    pub npubs: Vec<String>,

    /// The relays the admin channel subscribes on.
    #[serde(default)]
    pub admin_relays: Vec<Url>,

    /// The bunker's own admin secret key, hex-encoded.
    ///
    /// Generated once by `setup`.  Compromise grants management capability
    /// but no signing capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// An optional connect secret included in the connection descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Whether to DM the connection descriptor to each admin at boot.
    #[serde(default)]
    pub notify_admins_on_boot: bool,
}

//----------- StoredKey --------------------------------------------------------

/// A named entry in the vault.
///
/// Exactly one of the two forms: passphrase-encrypted (`{iv, data}`) or
/// plain (`{key}`, a hex secret).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredKey {
    /// A passphrase-encrypted secret, in the vault cipher layout.
    Encrypted {
        /// Hex-encoded AES IV.
        iv: String,
        /// Hex-encoded `salt ∥ ciphertext`.
        data: String,
    },

    /// A plain hex-encoded secret.
    Plain {
        /// The hex secret key.
        key: String,
    },
}

impl StoredKey {
    /// Whether this entry requires a passphrase to unlock.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, StoredKey::Encrypted { .. })
    }
}

//----------- DomainConfig -----------------------------------------------------

/// A domain the provisioning flow can create accounts under.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainConfig {
    /// The public name directory file (NIP-05 style `nostr.json`).
    pub directory: Utf8PathBuf,

    /// Relays advertised for accounts under this domain.
    #[serde(default)]
    pub relays: Vec<Url>,

    /// An optional custodial wallet service to provision against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_service: Option<Url>,

    /// An optional lightning-address service to register against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lnaddress_service: Option<Url>,
}

//----------- LoadError --------------------------------------------------------

/// An error loading the configuration.
#[derive(Debug)]
pub enum LoadError {
    /// The file could not be read.
    Io(io::Error),

    /// The file is not a valid configuration document.
    Parse(serde_json::Error),
}

impl std::error::Error for LoadError {}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "cannot read the configuration file: {err}"),
            Self::Parse(err) => write!(f, "malformed configuration file: {err}"),
        }
    }
}

impl From<io::Error> for LoadError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

//--- Loading / Saving

impl Config {
    /// Load the configuration document at `path`.
    pub fn load(path: &Utf8Path) -> Result<Self, LoadError> {
        let contents = fs::read(path)?;
        let mut config: Config = serde_json::from_slice(&contents).map_err(LoadError::Parse)?;
        config.path = path.to_owned();
        Ok(config)
    }

    /// Save the configuration document back to where it was loaded from.
    pub fn save(&self) -> io::Result<()> {
        let contents =
            serde_json::to_vec_pretty(self).expect("the configuration always serializes");
        util::write_file(&self.path, &contents)
    }

    /// Merge settings from the environment.
    ///
    /// `ADMIN_NPUBS` (comma-separated) extends the admin allow-list, and
    /// `DATABASE_URL` overrides the state-store path.
    pub fn apply_env(&mut self) {
        if let Ok(npubs) = std::env::var(ADMIN_NPUBS_VAR) {
            self.merge_admins(npubs.split(',').map(str::trim));
        }
        if let Ok(database) = std::env::var(DATABASE_URL_VAR) {
            if !database.is_empty() {
                self.database = Some(Utf8PathBuf::from(database));
            }
        }
    }

    /// Add admin npubs, skipping empties and duplicates.
    pub fn merge_admins<'a>(&mut self, npubs: impl IntoIterator<Item = &'a str>) {
        for npub in npubs {
            if npub.is_empty() {
                continue;
            }
            if !self.admin.npubs.iter().any(|n| n == npub) {
                self.admin.npubs.push(npub.to_string());
            }
        }
    }

    /// The path of the state store.
    pub fn database_path(&self) -> Utf8PathBuf {
        match &self.database {
            Some(path) => path.clone(),
            None => self.sibling("bunker.db"),
        }
    }

    /// The path of the connection descriptor file.
    pub fn connection_file(&self) -> Utf8PathBuf {
        self.sibling("connection.txt")
    }

    /// A path next to the configuration file.
    fn sibling(&self, name: &str) -> Utf8PathBuf {
        match self.path.parent() {
            Some(dir) => dir.join(name),
            None => Utf8PathBuf::from(name),
        }
    }

    /// The admin identity, parsed from the stored hex secret.
    pub fn admin_keys(&self) -> Option<Keys> {
        let hex = self.admin.key.as_deref()?;
        let secret = SecretKey::parse(hex).ok()?;
        Some(Keys::new(secret))
    }

    /// The decoded admin allow-list.
    ///
    /// Entries that are neither a valid npub nor valid hex are skipped with
    /// a warning.
    pub fn admin_pubkeys(&self) -> Vec<PublicKey> {
        self.admin
            .npubs
            .iter()
            .filter_map(|npub| match decode_pubkey(npub) {
                Some(pk) => Some(pk),
                None => {
                    tracing::warn!("Ignoring invalid admin pubkey '{npub}'");
                    None
                }
            })
            .collect()
    }
}

/// Decode an npub or hex-encoded public key.
pub fn decode_pubkey(s: &str) -> Option<PublicKey> {
    if s.starts_with("npub1") {
        PublicKey::from_bech32(s).ok()
    } else {
        PublicKey::parse(s).ok()
    }
}

fn default_auth_port() -> u16 {
    3000
}

fn default_auth_host() -> String {
    "127.0.0.1".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{
        "nostr": { "relays": ["wss://relay.example.org"] },
        "admin": {
            "npubs": ["82341f882b6eabcd2ba7f1ef90aad961cf074af15b9ef44a09f9d2a8fbfbe6a2"],
            "adminRelays": ["wss://admin.example.org"],
            "key": "5a7f38a556dcdd95c19b79fe6e32e0f3a05c5f3524dd8f8e74600cebd1947c04",
            "notifyAdminsOnBoot": true
        },
        "authPort": 3456,
        "authHost": "0.0.0.0",
        "baseUrl": "https://bunker.example.org",
        "keys": {
            "alice": { "iv": "00112233445566778899aabbccddeeff", "data": "deadbeef" },
            "bob": { "key": "d21c9a30979a22e1d9a665bee4f6edbabf972d5b0c4d5dbec32476f6d3de4e0c" }
        },
        "verbose": false
    }"#;

    #[test]
    fn parse_document() {
        let config: Config = serde_json::from_str(DOCUMENT).unwrap();
        assert_eq!(config.auth_port, 3456);
        assert_eq!(config.auth_host, "0.0.0.0");
        assert_eq!(config.base_url.as_deref(), Some("https://bunker.example.org"));
        assert!(config.admin.notify_admins_on_boot);
        assert_eq!(config.admin.admin_relays.len(), 1);
        assert!(config.keys["alice"].is_encrypted());
        assert!(!config.keys["bob"].is_encrypted());
        assert!(config.admin_keys().is_some());
        assert_eq!(config.admin_pubkeys().len(), 1);
    }

    #[test]
    fn defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.auth_port, 3000);
        assert_eq!(config.auth_host, "127.0.0.1");
        assert!(config.keys.is_empty());
        assert!(config.base_url.is_none());
    }

    #[test]
    fn round_trip_preserves_key_forms() {
        let config: Config = serde_json::from_str(DOCUMENT).unwrap();
        let text = serde_json::to_string(&config).unwrap();
        let again: Config = serde_json::from_str(&text).unwrap();
        assert!(again.keys["alice"].is_encrypted());
        assert!(!again.keys["bob"].is_encrypted());
    }

    #[test]
    fn merge_admins_skips_duplicates() {
        let mut config = Config::default();
        config.merge_admins(["npub1aaa", "npub1bbb", "npub1aaa", ""]);
        assert_eq!(config.admin.npubs, vec!["npub1aaa", "npub1bbb"]);
    }
}
