//! The NIP-46 wire envelope.
//!
//! Requests and responses travel inside kind-24133 events, encrypted to the
//! counterparty and `#p`-tagged to its public key.  The payload is a small
//! JSON-RPC-ish envelope: `{id, method, params[]}` one way, `{id, result,
//! error?}` the other.  Payload encryption is NIP-44, with NIP-04 accepted
//! for older clients; replies mirror the scheme the request arrived in.

use std::fmt;

use nostr::nips::{nip04, nip44};
use nostr::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The result string of the `auth_url` sentinel response.
pub const AUTH_URL_RESULT: &str = "auth_url";

/// The result string of error responses.
pub const ERROR_RESULT: &str = "error";

//----------- Request ----------------------------------------------------------

/// A decrypted NIP-46 request envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    /// The caller-chosen request id, echoed in the response.
    pub id: String,

    /// The method name.
    pub method: String,

    /// Positional string parameters.
    pub params: Vec<String>,
}

impl Request {
    /// Parse a decrypted payload into a request envelope.
    pub fn from_json(payload: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(payload).map_err(|_| EnvelopeError::NotJson)?;
        let obj = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingId)?
            .to_string();
        let method = obj
            .get("method")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingMethod)?
            .to_string();
        let params = obj
            .get("params")
            .and_then(Value::as_array)
            .ok_or(EnvelopeError::BadParams)?
            .iter()
            .map(|p| match p {
                // Params are positional strings on the wire, but some
                // clients send the sign_event payload as a bare object;
                // re-encode those so downstream parsing is uniform.
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();

        Ok(Self { id, method, params })
    }

    /// Serialise the envelope for encryption.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "id": self.id,
            "method": self.method,
            "params": self.params,
        })
        .to_string()
    }
}

//----------- Response ---------------------------------------------------------

/// A NIP-46 response envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// The id of the request this responds to.
    pub id: String,

    /// The result payload, or a sentinel (`"error"`, `"auth_url"`).
    pub result: String,

    /// The secondary payload: the human message for `"error"`, the URL for
    /// `"auth_url"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// A successful response.
    pub fn ok(id: &str, result: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            result: result.into(),
            error: None,
        }
    }

    /// An error response carrying a human message.
    pub fn error(id: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            result: ERROR_RESULT.into(),
            error: Some(message.into()),
        }
    }

    /// The `auth_url` sentinel, pointing the client at an approval page.
    pub fn auth_url(id: &str, url: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            result: AUTH_URL_RESULT.into(),
            error: Some(url.into()),
        }
    }

    /// Serialise the envelope for encryption.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("the envelope always serializes")
    }

    /// Parse a decrypted payload into a response envelope.
    pub fn from_json(payload: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(payload).map_err(|_| EnvelopeError::NotJson)
    }
}

//----------- EnvelopeError ----------------------------------------------------

/// An error parsing an envelope.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    NotJson,
    NotAnObject,
    MissingId,
    MissingMethod,
    BadParams,
}

impl std::error::Error for EnvelopeError {}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotJson => "payload is not JSON",
            Self::NotAnObject => "payload is not an object",
            Self::MissingId => "envelope has no id",
            Self::MissingMethod => "envelope has no method",
            Self::BadParams => "envelope params are not an array",
        })
    }
}

//----------- Payload encryption -----------------------------------------------

/// The payload encryption scheme of a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scheme {
    Nip44,
    Nip04,
}

/// A payload decryption failure.
///
/// Deliberately carries no detail: inbound events that fail to decrypt are
/// dropped without leaking structure to unauthenticated origins.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DecryptError;

impl std::error::Error for DecryptError {}

impl fmt::Display for DecryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cannot decrypt payload")
    }
}

/// Decrypt an inbound payload, detecting the scheme.
pub fn decrypt_payload(
    secret_key: &SecretKey,
    peer: &PublicKey,
    content: &str,
) -> Result<(String, Scheme), DecryptError> {
    if let Ok(plaintext) = nip44::decrypt(secret_key, peer, content) {
        return Ok((plaintext, Scheme::Nip44));
    }
    nip04::decrypt(secret_key, peer, content)
        .map(|plaintext| (plaintext, Scheme::Nip04))
        .map_err(|_| DecryptError)
}

/// Encrypt an outbound payload under the given scheme.
pub fn encrypt_payload(
    secret_key: &SecretKey,
    peer: &PublicKey,
    plaintext: &str,
    scheme: Scheme,
) -> Result<String, DecryptError> {
    match scheme {
        Scheme::Nip44 => nip44::encrypt(secret_key, peer, plaintext, nip44::Version::V2)
            .map_err(|_| DecryptError),
        Scheme::Nip04 => nip04::encrypt(secret_key, peer, plaintext).map_err(|_| DecryptError),
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use nostr::Keys;
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_request() {
        let req = Request::from_json(
            r#"{"id":"abc","method":"sign_event","params":["{\"kind\":1}"]}"#,
        )
        .unwrap();
        assert_eq!(req.id, "abc");
        assert_eq!(req.method, "sign_event");
        assert_eq!(req.params, vec![r#"{"kind":1}"#]);
    }

    #[test]
    fn parse_request_with_object_param() {
        let req =
            Request::from_json(r#"{"id":"1","method":"sign_event","params":[{"kind":1}]}"#)
                .unwrap();
        assert_eq!(req.params, vec![r#"{"kind":1}"#]);
    }

    #[test]
    fn reject_malformed_envelopes() {
        assert_eq!(Request::from_json("nope").unwrap_err(), EnvelopeError::NotJson);
        assert_eq!(Request::from_json("[]").unwrap_err(), EnvelopeError::NotAnObject);
        assert_eq!(
            Request::from_json(r#"{"method":"ping","params":[]}"#).unwrap_err(),
            EnvelopeError::MissingId
        );
        assert_eq!(
            Request::from_json(r#"{"id":"1","method":"ping","params":"x"}"#).unwrap_err(),
            EnvelopeError::BadParams
        );
    }

    #[test]
    fn response_wire_shapes() {
        assert_json_eq!(
            serde_json::from_str::<serde_json::Value>(&Response::ok("1", "pong").to_json())
                .unwrap(),
            json!({"id": "1", "result": "pong"})
        );
        assert_json_eq!(
            serde_json::from_str::<serde_json::Value>(
                &Response::error("2", "unknown method").to_json()
            )
            .unwrap(),
            json!({"id": "2", "result": "error", "error": "unknown method"})
        );
        assert_json_eq!(
            serde_json::from_str::<serde_json::Value>(
                &Response::auth_url("3", "https://bunker.example.org/requests/7").to_json()
            )
            .unwrap(),
            json!({
                "id": "3",
                "result": "auth_url",
                "error": "https://bunker.example.org/requests/7"
            })
        );
    }

    #[test]
    fn payload_round_trip_both_schemes() {
        let server = Keys::generate();
        let client = Keys::generate();
        let plaintext = r#"{"id":"1","method":"ping","params":[]}"#;

        for scheme in [Scheme::Nip44, Scheme::Nip04] {
            let ciphertext = encrypt_payload(
                client.secret_key(),
                &server.public_key(),
                plaintext,
                scheme,
            )
            .unwrap();
            // The server decrypts with its own secret and the client's key.
            let (decrypted, detected) =
                decrypt_payload(server.secret_key(), &client.public_key(), &ciphertext).unwrap();
            assert_eq!(decrypted, plaintext);
            assert_eq!(detected, scheme);
        }
    }

    #[test]
    fn garbage_payload_fails_closed() {
        let server = Keys::generate();
        let client = Keys::generate();
        let err =
            decrypt_payload(server.secret_key(), &client.public_key(), "not-a-payload")
                .unwrap_err();
        assert_eq!(err, DecryptError);
    }
}
