//! The persistent policy store.
//!
//! Everything the bunker has to remember across restarts (key users,
//! signing conditions, policies, tokens, the audit log and the short-lived
//! pending approval requests) lives in a single file-backed SQLite
//! database.  The store is strictly single-writer: every operation
//! serialises through one connection behind a mutex.

use std::fmt;
use std::sync::Mutex;

use camino::Utf8Path;
use rusqlite::{params, Connection, OptionalExtension};

use crate::util;

/// How long a pending request may stay undecided before it is reaped.
pub const PENDING_TTL_SECS: i64 = 60;

/// The hard cap on listing sizes.
const MAX_LIST_LIMIT: u32 = 50;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS keys (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    pubkey      TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    created_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS key_users (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    key_name     TEXT NOT NULL,
    user_pubkey  TEXT NOT NULL,
    description  TEXT,
    created_at   INTEGER NOT NULL,
    last_used_at INTEGER,
    revoked_at   INTEGER,
    UNIQUE (key_name, user_pubkey)
);

CREATE TABLE IF NOT EXISTS signing_conditions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    key_user_id INTEGER NOT NULL,
    method      TEXT NOT NULL,
    kind        TEXT,
    allowed     INTEGER NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS policies (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL,
    created_by TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER
);

CREATE TABLE IF NOT EXISTS policy_rules (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    policy_id           INTEGER NOT NULL,
    method              TEXT NOT NULL,
    kind                TEXT,
    max_usage_count     INTEGER,
    current_usage_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS tokens (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    token       TEXT NOT NULL UNIQUE,
    key_name    TEXT NOT NULL,
    client_name TEXT NOT NULL,
    policy_id   INTEGER NOT NULL,
    created_by  TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    expires_at  INTEGER,
    redeemed_at INTEGER,
    key_user_id INTEGER
);

CREATE TABLE IF NOT EXISTS pending_requests (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id    TEXT NOT NULL,
    key_name      TEXT NOT NULL,
    remote_pubkey TEXT NOT NULL,
    method        TEXT NOT NULL,
    params        TEXT NOT NULL,
    allowed       INTEGER,
    created_at    INTEGER NOT NULL,
    processed_at  INTEGER
);

CREATE TABLE IF NOT EXISTS audit_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   INTEGER NOT NULL,
    type        TEXT NOT NULL,
    method      TEXT,
    params      TEXT,
    key_user_id INTEGER
);

CREATE INDEX IF NOT EXISTS idx_conditions_key_user
    ON signing_conditions (key_user_id);
CREATE INDEX IF NOT EXISTS idx_pending_created
    ON pending_requests (created_at);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp
    ON audit_log (timestamp);
"#;

//----------- Row types --------------------------------------------------------

/// A registered user key.
#[derive(Clone, Debug)]
pub struct KeyRow {
    pub id: i64,
    pub name: String,
    pub pubkey: String,
    pub created_at: i64,
}

/// A dashboard user able to approve requests for a key.
#[derive(Clone, Debug)]
pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub password_hash: String,
    pub created_at: i64,
}

/// A remote client authorised (or being authorised) against one user key.
#[derive(Clone, Debug)]
pub struct KeyUser {
    pub id: i64,
    pub key_name: String,
    pub user_pubkey: String,
    pub description: Option<String>,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
    pub revoked_at: Option<i64>,
}

/// A single (method, kind, allowed) rule under a key user.
#[derive(Clone, Debug)]
pub struct SigningCondition {
    pub id: i64,
    pub key_user_id: i64,
    pub method: String,
    pub kind: Option<String>,
    pub allowed: bool,
}

/// A named bundle of rule templates.
#[derive(Clone, Debug)]
pub struct Policy {
    pub id: i64,
    pub name: String,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub rules: Vec<PolicyRule>,
}

/// A rule template inside a policy.
#[derive(Clone, Debug)]
pub struct PolicyRule {
    pub id: i64,
    pub method: String,
    pub kind: Option<String>,
    pub max_usage_count: Option<i64>,
    pub current_usage_count: i64,
}

/// A one-shot connection token.
#[derive(Clone, Debug)]
pub struct TokenRow {
    pub id: i64,
    pub token: String,
    pub key_name: String,
    pub client_name: String,
    pub policy_id: i64,
    pub created_by: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub redeemed_at: Option<i64>,
    pub key_user_id: Option<i64>,
}

/// A request awaiting an interactive decision.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    pub id: i64,
    pub request_id: String,
    pub key_name: String,
    pub remote_pubkey: String,
    pub method: String,
    pub params: String,
    pub allowed: Option<bool>,
    pub created_at: i64,
    pub processed_at: Option<i64>,
}

/// An audit log entry.
#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: i64,
    pub entry_type: String,
    pub method: Option<String>,
    pub params: Option<String>,
    pub key_user_id: Option<i64>,
}

/// The listing states of a pending request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    /// Undecided and younger than the TTL.
    Pending,
    /// Decided in favour.
    Approved,
    /// Undecided and past the TTL.
    Expired,
}

impl std::str::FromStr for RequestStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "expired" => Ok(Self::Expired),
            _ => Err(()),
        }
    }
}

//----------- Errors -----------------------------------------------------------

/// A storage-level error.
#[derive(Debug)]
pub enum StoreError {
    /// The underlying database failed.
    Db(rusqlite::Error),

    /// A referenced policy does not exist.
    NoSuchPolicy,
}

impl std::error::Error for StoreError {}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Db(err) => write!(f, "database error: {err}"),
            Self::NoSuchPolicy => f.write_str("no policy with that id exists"),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Db(err)
    }
}

/// A token redemption failure.
#[derive(Debug)]
pub enum RedeemError {
    /// No such token exists.
    NotFound,

    /// The token was redeemed before.
    AlreadyRedeemed,

    /// The token (or its policy) has expired.
    Expired,

    /// The policy behind the token no longer exists.
    PolicyMissing,

    /// The underlying database failed.
    Db(rusqlite::Error),
}

impl std::error::Error for RedeemError {}

impl fmt::Display for RedeemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "token-not-found",
            Self::AlreadyRedeemed => "already-redeemed",
            Self::Expired => "expired",
            Self::PolicyMissing => "policy-missing",
            Self::Db(_) => "database error",
        })
    }
}

impl From<rusqlite::Error> for RedeemError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Db(err)
    }
}

impl From<StoreError> for RedeemError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Db(err) => Self::Db(err),
            StoreError::NoSuchPolicy => Self::PolicyMissing,
        }
    }
}

//----------- Store ------------------------------------------------------------

/// The single-writer policy store.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Utf8Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_std_path())?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    //--- Keys

    /// Register a user key by name.
    pub fn add_key_row(&self, name: &str, pubkey: &str) -> Result<i64, StoreError> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO keys (name, pubkey, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (name) DO UPDATE SET pubkey = excluded.pubkey",
                params![name, pubkey, util::unix_now()],
            )?;
            Ok(conn.query_row(
                "SELECT id FROM keys WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?)
        })
    }

    /// Look up a registered key by name.
    pub fn get_key_row(&self, name: &str) -> Result<Option<KeyRow>, StoreError> {
        self.with(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, pubkey, created_at FROM keys WHERE name = ?1",
                    params![name],
                    |row| {
                        Ok(KeyRow {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            pubkey: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    //--- Users

    /// Insert (or replace the password of) a dashboard user.
    pub fn upsert_user(&self, name: &str, password_hash: &str) -> Result<i64, StoreError> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO users (name, password_hash, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (name) DO UPDATE SET password_hash = excluded.password_hash",
                params![name, password_hash, util::unix_now()],
            )?;
            Ok(conn.query_row(
                "SELECT id FROM users WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?)
        })
    }

    /// Look up a dashboard user by name.
    pub fn get_user(&self, name: &str) -> Result<Option<UserRow>, StoreError> {
        self.with(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, password_hash, created_at FROM users WHERE name = ?1",
                    params![name],
                    |row| {
                        Ok(UserRow {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            password_hash: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    //--- Key users

    /// Find the key user for a (key, client) pair.
    pub fn find_key_user(
        &self,
        key_name: &str,
        user_pubkey: &str,
    ) -> Result<Option<KeyUser>, StoreError> {
        self.with(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, key_name, user_pubkey, description, created_at,
                            last_used_at, revoked_at
                     FROM key_users WHERE key_name = ?1 AND user_pubkey = ?2",
                    params![key_name, user_pubkey],
                    key_user_from_row,
                )
                .optional()?)
        })
    }

    /// Look up a key user by id.
    pub fn get_key_user(&self, id: i64) -> Result<Option<KeyUser>, StoreError> {
        self.with(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, key_name, user_pubkey, description, created_at,
                            last_used_at, revoked_at
                     FROM key_users WHERE id = ?1",
                    params![id],
                    key_user_from_row,
                )
                .optional()?)
        })
    }

    /// Create the key user for a (key, client) pair, or return the existing
    /// one.  A description is only filled in when the row has none yet.
    pub fn upsert_key_user(
        &self,
        key_name: &str,
        user_pubkey: &str,
        description: Option<&str>,
    ) -> Result<i64, StoreError> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO key_users (key_name, user_pubkey, description, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (key_name, user_pubkey) DO UPDATE
                 SET description = COALESCE(key_users.description, excluded.description)",
                params![key_name, user_pubkey, description, util::unix_now()],
            )?;
            Ok(conn.query_row(
                "SELECT id FROM key_users WHERE key_name = ?1 AND user_pubkey = ?2",
                params![key_name, user_pubkey],
                |row| row.get(0),
            )?)
        })
    }

    /// List key users, optionally for one key, optionally including revoked
    /// ones.
    pub fn list_key_users(
        &self,
        key_name: Option<&str>,
        include_revoked: bool,
    ) -> Result<Vec<KeyUser>, StoreError> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, key_name, user_pubkey, description, created_at,
                        last_used_at, revoked_at
                 FROM key_users
                 WHERE (?1 IS NULL OR key_name = ?1)
                   AND (?2 OR revoked_at IS NULL)
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![key_name, include_revoked], key_user_from_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// Rename (re-describe) a key user.
    pub fn rename_key_user(&self, id: i64, description: &str) -> Result<bool, StoreError> {
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE key_users SET description = ?2 WHERE id = ?1",
                params![id, description],
            )?;
            Ok(n > 0)
        })
    }

    /// Soft-revoke a key user.  Idempotent: an earlier revocation timestamp
    /// is kept.
    pub fn revoke_key_user(&self, id: i64) -> Result<bool, StoreError> {
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE key_users SET revoked_at = COALESCE(revoked_at, ?2) WHERE id = ?1",
                params![id, util::unix_now()],
            )?;
            Ok(n > 0)
        })
    }

    /// Record that a key user was just served.
    pub fn touch_key_user(&self, id: i64) -> Result<(), StoreError> {
        self.with(|conn| {
            conn.execute(
                "UPDATE key_users SET last_used_at = ?2 WHERE id = ?1",
                params![id, util::unix_now()],
            )?;
            Ok(())
        })
    }

    //--- Signing conditions

    /// The conditions recorded under a key user.
    pub fn conditions_for(&self, key_user_id: i64) -> Result<Vec<SigningCondition>, StoreError> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, key_user_id, method, kind, allowed
                 FROM signing_conditions WHERE key_user_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![key_user_id], |row| {
                Ok(SigningCondition {
                    id: row.get(0)?,
                    key_user_id: row.get(1)?,
                    method: row.get(2)?,
                    kind: row.get(3)?,
                    allowed: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// Record a condition under a key user.
    pub fn insert_condition(
        &self,
        key_user_id: i64,
        method: &str,
        kind: Option<&str>,
        allowed: bool,
    ) -> Result<i64, StoreError> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO signing_conditions (key_user_id, method, kind, allowed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![key_user_id, method, kind, allowed, util::unix_now()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    //--- Policies

    /// Create a policy with its rule templates.
    pub fn create_policy(
        &self,
        name: &str,
        created_by: Option<&str>,
        expires_at: Option<i64>,
        rules: &[(String, Option<String>, Option<i64>)],
    ) -> Result<i64, StoreError> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO policies (name, created_by, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, created_by, util::unix_now(), expires_at],
            )?;
            let policy_id = conn.last_insert_rowid();
            for (method, kind, max_usage) in rules {
                conn.execute(
                    "INSERT INTO policy_rules (policy_id, method, kind, max_usage_count)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![policy_id, method, kind, max_usage],
                )?;
            }
            Ok(policy_id)
        })
    }

    /// Look up a policy (with rules) by id.
    pub fn get_policy(&self, id: i64) -> Result<Option<Policy>, StoreError> {
        self.with(|conn| get_policy_on(conn, id))
    }

    /// All policies, newest first.
    pub fn list_policies(&self) -> Result<Vec<Policy>, StoreError> {
        self.with(|conn| {
            let ids: Vec<i64> = {
                let mut stmt =
                    conn.prepare("SELECT id FROM policies ORDER BY created_at DESC")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };
            let mut policies = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(policy) = get_policy_on(conn, id)? {
                    policies.push(policy);
                }
            }
            Ok(policies)
        })
    }

    //--- Tokens

    /// Mint a token for a (key, client-name, policy) triple.
    pub fn create_token(
        &self,
        key_name: &str,
        client_name: &str,
        policy_id: i64,
        created_by: &str,
        expires_at: Option<i64>,
    ) -> Result<String, StoreError> {
        self.with(|conn| {
            if get_policy_on(conn, policy_id)?.is_none() {
                return Err(StoreError::NoSuchPolicy);
            }
            let token = util::random_hex(32);
            conn.execute(
                "INSERT INTO tokens
                     (token, key_name, client_name, policy_id, created_by, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    token,
                    key_name,
                    client_name,
                    policy_id,
                    created_by,
                    util::unix_now(),
                    expires_at
                ],
            )?;
            Ok(token)
        })
    }

    /// The tokens minted for a key, newest first.
    pub fn list_tokens(&self, key_name: &str) -> Result<Vec<TokenRow>, StoreError> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, token, key_name, client_name, policy_id, created_by,
                        created_at, expires_at, redeemed_at, key_user_id
                 FROM tokens WHERE key_name = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![key_name], |row| {
                Ok(TokenRow {
                    id: row.get(0)?,
                    token: row.get(1)?,
                    key_name: row.get(2)?,
                    client_name: row.get(3)?,
                    policy_id: row.get(4)?,
                    created_by: row.get(5)?,
                    created_at: row.get(6)?,
                    expires_at: row.get(7)?,
                    redeemed_at: row.get(8)?,
                    key_user_id: row.get(9)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// Redeem a token for a client.
    ///
    /// The whole operation is one transaction: the key user is created (or
    /// reused), the `connect` condition plus one condition per policy rule
    /// are inserted, and the token is marked redeemed.  Any failure rolls
    /// everything back.
    pub fn redeem_token(&self, token: &str, client_pubkey: &str) -> Result<i64, RedeemError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = util::unix_now();

        let row = tx
            .query_row(
                "SELECT id, key_name, client_name, policy_id, expires_at, redeemed_at
                 FROM tokens WHERE token = ?1",
                params![token],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((token_id, key_name, client_name, policy_id, expires_at, redeemed_at)) = row
        else {
            return Err(RedeemError::NotFound);
        };

        if redeemed_at.is_some() {
            return Err(RedeemError::AlreadyRedeemed);
        }
        if expires_at.is_some_and(|t| t < now) {
            return Err(RedeemError::Expired);
        }

        let Some(policy) = get_policy_on(&tx, policy_id)? else {
            return Err(RedeemError::PolicyMissing);
        };
        if policy.expires_at.is_some_and(|t| t < now) {
            return Err(RedeemError::Expired);
        }

        tx.execute(
            "INSERT INTO key_users (key_name, user_pubkey, description, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (key_name, user_pubkey) DO UPDATE
             SET description = COALESCE(key_users.description, excluded.description)",
            params![key_name, client_pubkey, client_name, now],
        )?;
        let key_user_id: i64 = tx.query_row(
            "SELECT id FROM key_users WHERE key_name = ?1 AND user_pubkey = ?2",
            params![key_name, client_pubkey],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO signing_conditions (key_user_id, method, kind, allowed, created_at)
             VALUES (?1, 'connect', NULL, 1, ?2)",
            params![key_user_id, now],
        )?;
        for rule in &policy.rules {
            tx.execute(
                "INSERT INTO signing_conditions (key_user_id, method, kind, allowed, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![key_user_id, rule.method, rule.kind, now],
            )?;
        }

        tx.execute(
            "UPDATE tokens SET redeemed_at = ?2, key_user_id = ?3 WHERE id = ?1",
            params![token_id, now, key_user_id],
        )?;

        tx.commit()?;
        Ok(key_user_id)
    }

    //--- Pending requests

    /// Record a request awaiting a decision.
    pub fn create_pending_request(
        &self,
        request_id: &str,
        key_name: &str,
        remote_pubkey: &str,
        method: &str,
        params_json: &str,
    ) -> Result<i64, StoreError> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO pending_requests
                     (request_id, key_name, remote_pubkey, method, params, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![request_id, key_name, remote_pubkey, method, params_json, util::unix_now()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Look up a pending request by id.
    pub fn get_pending_request(&self, id: i64) -> Result<Option<PendingRequest>, StoreError> {
        self.with(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, request_id, key_name, remote_pubkey, method, params,
                            allowed, created_at, processed_at
                     FROM pending_requests WHERE id = ?1",
                    params![id],
                    pending_from_row,
                )
                .optional()?)
        })
    }

    /// Decide a pending request.
    ///
    /// The transition happens exactly once: deciding an already-decided
    /// request returns `false` and changes nothing.
    pub fn decide_pending_request(&self, id: i64, allowed: bool) -> Result<bool, StoreError> {
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE pending_requests SET allowed = ?2, processed_at = ?3
                 WHERE id = ?1 AND allowed IS NULL",
                params![id, allowed, util::unix_now()],
            )?;
            Ok(n > 0)
        })
    }

    /// Replace the parameters of a pending request (used by the registration
    /// form to substitute vetted values).
    pub fn update_pending_params(&self, id: i64, params_json: &str) -> Result<bool, StoreError> {
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE pending_requests SET params = ?2 WHERE id = ?1",
                params![id, params_json],
            )?;
            Ok(n > 0)
        })
    }

    /// Remove a pending request, decided or not.
    ///
    /// Returns `Some(true)` if the removed request was still undecided (the
    /// expiry signal), `Some(false)` if it had been decided, and `None` if
    /// no such request existed.
    pub fn reap_pending_request(&self, id: i64) -> Result<Option<bool>, StoreError> {
        self.with(|conn| {
            let allowed: Option<Option<bool>> = conn
                .query_row(
                    "SELECT allowed FROM pending_requests WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(allowed) = allowed else {
                return Ok(None);
            };
            conn.execute("DELETE FROM pending_requests WHERE id = ?1", params![id])?;
            Ok(Some(allowed.is_none()))
        })
    }

    /// List requests, newest first.
    pub fn list_requests(
        &self,
        status: Option<RequestStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<PendingRequest>, StoreError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let cutoff = util::unix_now() - PENDING_TTL_SECS;
        let clause = match status {
            None => "?3 = ?3",
            Some(RequestStatus::Pending) => "allowed IS NULL AND created_at >= ?3",
            Some(RequestStatus::Expired) => "allowed IS NULL AND created_at < ?3",
            Some(RequestStatus::Approved) => "allowed = 1 AND ?3 = ?3",
        };
        let sql = format!(
            "SELECT id, request_id, key_name, remote_pubkey, method, params,
                    allowed, created_at, processed_at
             FROM pending_requests WHERE {clause}
             ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
        );
        self.with(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit, offset, cutoff], pending_from_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    //--- Audit log

    /// Append an audit entry.
    pub fn append_audit(
        &self,
        entry_type: &str,
        method: Option<&str>,
        params: Option<&str>,
        key_user_id: Option<i64>,
    ) -> Result<(), StoreError> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO audit_log (timestamp, type, method, params, key_user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![util::unix_now(), entry_type, method, params, key_user_id],
            )?;
            Ok(())
        })
    }

    /// The most recent audit entries.
    pub fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEntry>, StoreError> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, type, method, params, key_user_id
                 FROM audit_log ORDER BY timestamp DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(AuditEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    entry_type: row.get(2)?,
                    method: row.get(3)?,
                    params: row.get(4)?,
                    key_user_id: row.get(5)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// How many audit entries reference a key user.
    pub fn audit_count_for(&self, key_user_id: i64) -> Result<i64, StoreError> {
        self.with(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM audit_log WHERE key_user_id = ?1",
                params![key_user_id],
                |row| row.get(0),
            )?)
        })
    }

    /// Audit activity bucketed by hour, oldest bucket first.
    ///
    /// Returns `hours` buckets ending at the current hour.
    pub fn activity_buckets(&self, hours: i64) -> Result<Vec<(i64, i64)>, StoreError> {
        let now = util::unix_now();
        let hour = 3600;
        let end = (now / hour + 1) * hour;
        let start = end - hours * hour;
        self.with(|conn| {
            let mut buckets: Vec<(i64, i64)> = (0..hours)
                .map(|i| (start + i * hour, 0))
                .collect();
            let mut stmt = conn.prepare(
                "SELECT (timestamp / 3600) * 3600 AS bucket, COUNT(*)
                 FROM audit_log WHERE timestamp >= ?1 GROUP BY bucket",
            )?;
            let rows = stmt.query_map(params![start], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (bucket, count) = row?;
                if let Some(slot) = buckets.iter_mut().find(|(b, _)| *b == bucket) {
                    slot.1 = count;
                }
            }
            Ok(buckets)
        })
    }

    //--- Counts

    /// Entity counts for the dashboard.
    pub fn counts(&self) -> Result<StoreCounts, StoreError> {
        self.with(|conn| {
            let one = |sql: &str| -> Result<i64, rusqlite::Error> {
                conn.query_row(sql, [], |row| row.get(0))
            };
            let cutoff = util::unix_now() - PENDING_TTL_SECS;
            Ok(StoreCounts {
                keys: one("SELECT COUNT(*) FROM keys")?,
                apps: one("SELECT COUNT(*) FROM key_users WHERE revoked_at IS NULL")?,
                pending_requests: conn.query_row(
                    "SELECT COUNT(*) FROM pending_requests
                     WHERE allowed IS NULL AND created_at >= ?1",
                    params![cutoff],
                    |row| row.get(0),
                )?,
                policies: one("SELECT COUNT(*) FROM policies")?,
                tokens: one("SELECT COUNT(*) FROM tokens")?,
            })
        })
    }

    #[cfg(test)]
    pub(crate) fn set_pending_created_at(&self, id: i64, created_at: i64) {
        self.with(|conn| {
            conn.execute(
                "UPDATE pending_requests SET created_at = ?2 WHERE id = ?1",
                params![id, created_at],
            )
            .unwrap();
        });
    }
}

/// Entity counts for the dashboard.
#[derive(Clone, Copy, Debug)]
pub struct StoreCounts {
    pub keys: i64,
    pub apps: i64,
    pub pending_requests: i64,
    pub policies: i64,
    pub tokens: i64,
}

fn key_user_from_row(row: &rusqlite::Row<'_>) -> Result<KeyUser, rusqlite::Error> {
    Ok(KeyUser {
        id: row.get(0)?,
        key_name: row.get(1)?,
        user_pubkey: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
        last_used_at: row.get(5)?,
        revoked_at: row.get(6)?,
    })
}

fn pending_from_row(row: &rusqlite::Row<'_>) -> Result<PendingRequest, rusqlite::Error> {
    Ok(PendingRequest {
        id: row.get(0)?,
        request_id: row.get(1)?,
        key_name: row.get(2)?,
        remote_pubkey: row.get(3)?,
        method: row.get(4)?,
        params: row.get(5)?,
        allowed: row.get(6)?,
        created_at: row.get(7)?,
        processed_at: row.get(8)?,
    })
}

fn get_policy_on(conn: &Connection, id: i64) -> Result<Option<Policy>, StoreError> {
    let policy = conn
        .query_row(
            "SELECT id, name, created_by, created_at, expires_at FROM policies WHERE id = ?1",
            params![id],
            |row| {
                Ok(Policy {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_by: row.get(2)?,
                    created_at: row.get(3)?,
                    expires_at: row.get(4)?,
                    rules: Vec::new(),
                })
            },
        )
        .optional()?;
    let Some(mut policy) = policy else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, method, kind, max_usage_count, current_usage_count
         FROM policy_rules WHERE policy_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok(PolicyRule {
            id: row.get(0)?,
            method: row.get(1)?,
            kind: row.get(2)?,
            max_usage_count: row.get(3)?,
            current_usage_count: row.get(4)?,
        })
    })?;
    policy.rules = rows.collect::<Result<_, _>>()?;
    Ok(Some(policy))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    const CLIENT: &str = "82341f882b6eabcd2ba7f1ef90aad961cf074af15b9ef44a09f9d2a8fbfbe6a2";

    #[test]
    fn key_user_upsert_is_stable() {
        let store = store();
        let a = store.upsert_key_user("alice", CLIENT, Some("noteworthy app")).unwrap();
        let b = store.upsert_key_user("alice", CLIENT, None).unwrap();
        assert_eq!(a, b);

        let user = store.find_key_user("alice", CLIENT).unwrap().unwrap();
        assert_eq!(user.description.as_deref(), Some("noteworthy app"));
    }

    #[test]
    fn revoke_keeps_first_timestamp() {
        let store = store();
        let id = store.upsert_key_user("alice", CLIENT, None).unwrap();
        assert!(store.revoke_key_user(id).unwrap());
        let first = store.get_key_user(id).unwrap().unwrap().revoked_at;
        assert!(store.revoke_key_user(id).unwrap());
        let second = store.get_key_user(id).unwrap().unwrap().revoked_at;
        assert_eq!(first, second);
        assert!(first.is_some());
    }

    #[test]
    fn token_redemption_creates_conditions() {
        let store = store();
        let policy_id = store
            .create_policy(
                "social",
                Some("admin"),
                None,
                &[("sign_event".into(), Some("1".into()), Some(5))],
            )
            .unwrap();
        let token = store
            .create_token("alice", "noteworthy app", policy_id, "admin", None)
            .unwrap();
        assert_eq!(token.len(), 64);

        let key_user_id = store.redeem_token(&token, CLIENT).unwrap();
        let conditions = store.conditions_for(key_user_id).unwrap();
        let methods: Vec<_> = conditions.iter().map(|c| c.method.as_str()).collect();
        assert_eq!(methods, vec!["connect", "sign_event"]);
        assert_eq!(conditions[1].kind.as_deref(), Some("1"));
        assert!(conditions.iter().all(|c| c.allowed));

        let tokens = store.list_tokens("alice").unwrap();
        assert!(tokens[0].redeemed_at.is_some());
        assert_eq!(tokens[0].key_user_id, Some(key_user_id));
    }

    #[test]
    fn token_is_one_shot() {
        let store = store();
        let policy_id = store.create_policy("p", None, None, &[]).unwrap();
        let token = store
            .create_token("alice", "app", policy_id, "admin", None)
            .unwrap();
        let key_user_id = store.redeem_token(&token, CLIENT).unwrap();
        let before = store.conditions_for(key_user_id).unwrap().len();

        let err = store.redeem_token(&token, "another-client").unwrap_err();
        assert!(matches!(err, RedeemError::AlreadyRedeemed));

        // The failed redemption produced no new conditions.
        assert_eq!(store.conditions_for(key_user_id).unwrap().len(), before);
    }

    #[test]
    fn token_failure_modes() {
        let store = store();
        assert!(matches!(
            store.redeem_token("no-such-token", CLIENT).unwrap_err(),
            RedeemError::NotFound
        ));

        let policy_id = store.create_policy("p", None, None, &[]).unwrap();
        let expired = store
            .create_token("alice", "app", policy_id, "admin", Some(util::unix_now() - 10))
            .unwrap();
        assert!(matches!(
            store.redeem_token(&expired, CLIENT).unwrap_err(),
            RedeemError::Expired
        ));

        let orphan = store
            .create_token("alice", "app", policy_id, "admin", None)
            .unwrap();
        store.with(|conn| {
            conn.execute("DELETE FROM policies WHERE id = ?1", params![policy_id])
                .unwrap();
        });
        assert!(matches!(
            store.redeem_token(&orphan, CLIENT).unwrap_err(),
            RedeemError::PolicyMissing
        ));

        // Nothing was written along the way.
        assert!(store.find_key_user("alice", CLIENT).unwrap().is_none());
    }

    #[test]
    fn create_token_requires_policy() {
        let store = store();
        assert!(matches!(
            store
                .create_token("alice", "app", 42, "admin", None)
                .unwrap_err(),
            StoreError::NoSuchPolicy
        ));
    }

    #[test]
    fn pending_request_decides_exactly_once() {
        let store = store();
        let id = store
            .create_pending_request("req-1", "alice", CLIENT, "sign_event", "[]")
            .unwrap();
        assert!(store.decide_pending_request(id, true).unwrap());
        assert!(!store.decide_pending_request(id, false).unwrap());

        let row = store.get_pending_request(id).unwrap().unwrap();
        assert_eq!(row.allowed, Some(true));
        assert!(row.processed_at.is_some());
    }

    #[test]
    fn reaping_reports_expiry() {
        let store = store();
        let undecided = store
            .create_pending_request("req-1", "alice", CLIENT, "sign_event", "[]")
            .unwrap();
        let decided = store
            .create_pending_request("req-2", "alice", CLIENT, "connect", "[]")
            .unwrap();
        store.decide_pending_request(decided, false).unwrap();

        assert_eq!(store.reap_pending_request(undecided).unwrap(), Some(true));
        assert_eq!(store.reap_pending_request(decided).unwrap(), Some(false));
        assert_eq!(store.reap_pending_request(undecided).unwrap(), None);
    }

    #[test]
    fn request_listing_statuses() {
        let store = store();
        let pending = store
            .create_pending_request("r1", "alice", CLIENT, "sign_event", "[]")
            .unwrap();
        let approved = store
            .create_pending_request("r2", "alice", CLIENT, "connect", "[]")
            .unwrap();
        store.decide_pending_request(approved, true).unwrap();
        let expired = store
            .create_pending_request("r3", "alice", CLIENT, "sign_event", "[]")
            .unwrap();
        store.set_pending_created_at(expired, util::unix_now() - 120);

        let rows = store
            .list_requests(Some(RequestStatus::Pending), 50, 0)
            .unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![pending]);

        let rows = store
            .list_requests(Some(RequestStatus::Approved), 50, 0)
            .unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![approved]);

        let rows = store
            .list_requests(Some(RequestStatus::Expired), 50, 0)
            .unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![expired]);

        // The limit is capped.
        let rows = store.list_requests(None, 500, 0).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn audit_and_counts() {
        let store = store();
        let key_user = store.upsert_key_user("alice", CLIENT, None).unwrap();
        store
            .append_audit("approval", Some("sign_event"), None, Some(key_user))
            .unwrap();
        store
            .append_audit("registered", Some("create_account"), None, None)
            .unwrap();

        assert_eq!(store.audit_count_for(key_user).unwrap(), 1);
        let recent = store.recent_audit(5).unwrap();
        assert_eq!(recent.len(), 2);

        let buckets = store.activity_buckets(24).unwrap();
        assert_eq!(buckets.len(), 24);
        assert_eq!(buckets.iter().map(|(_, n)| n).sum::<i64>(), 2);

        let counts = store.counts().unwrap();
        assert_eq!(counts.apps, 1);
    }
}
