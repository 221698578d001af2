//! Communication between the daemon's units.

use std::fmt;

use tokio::sync::mpsc;

//----------- Terminated -------------------------------------------------------

/// A unit has terminated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Terminated;

impl fmt::Display for Terminated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("terminated")
    }
}

//----------- ApplicationCommand -----------------------------------------------

/// A command sent to a unit.
#[derive(Debug)]
pub enum ApplicationCommand {
    /// Shut the unit down.
    Terminate,

    /// A new active key is available; start serving it.
    LoadKey {
        /// The key name, resolvable through the center's active-key map.
        name: String,
    },

    /// Ask the whitelisted admins for an interactive decision.
    AdminAcl {
        /// The query to forward.
        query: AclQuery,

        /// Where the first admin decision goes.
        decision_tx: mpsc::Sender<String>,
    },
}

/// An interactive query forwarded to the admins' relay clients.
#[derive(Clone, Debug)]
pub struct AclQuery {
    /// The user key the request is against.
    pub key_name: String,

    /// The requesting client.
    pub remote_pubkey: String,

    /// The requested method.
    pub method: String,

    /// The primary request parameter, if any.
    pub param: Option<String>,

    /// A human description of the client, if known.
    pub description: Option<String>,
}
