//! Typed configuration records.
//!
//! Records serialise to flat JSON objects (`id` + `type` + per-kind fields),
//! which is also the text the delta codec diffs. Unknown keys are preserved
//! in a flattened extras map so records written by a newer device survive a
//! decode/encode cycle on an older one.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Server,
    Tunnel,
    Client,
    AutomationCredentials,
}

impl RecordKind {
    pub fn label(&self) -> &'static str {
        match self {
            RecordKind::Server => "Server",
            RecordKind::Tunnel => "Tunnel",
            RecordKind::Client => "Client",
            RecordKind::AutomationCredentials => "Automation Credentials",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RecordKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "server" => Ok(RecordKind::Server),
            "tunnel" => Ok(RecordKind::Tunnel),
            "client" => Ok(RecordKind::Client),
            "automation_credentials" => Ok(RecordKind::AutomationCredentials),
            other => Err(StoreError::Corrupt(format!("unknown record kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFields {
    pub name: String,
    pub ip_address: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelFields {
    pub server_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_client_id: Option<String>,
    pub hostname: String,
    pub remote_port: u16,
    pub local_destination: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFields {
    pub name: String,
    pub syncthing_id: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialFields {
    pub ssh_private_key_path: String,
    pub ssh_public_key_path: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordBody {
    Server(ServerFields),
    Tunnel(TunnelFields),
    Client(ClientFields),
    AutomationCredentials(CredentialFields),
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::Server(_) => RecordKind::Server,
            RecordBody::Tunnel(_) => RecordKind::Tunnel,
            RecordBody::Client(_) => RecordKind::Client,
            RecordBody::AutomationCredentials(_) => RecordKind::AutomationCredentials,
        }
    }
}

/// A natural key identifies the real-world entity behind a record, so two
/// devices independently creating "the same" server or tunnel can be caught
/// even though their generated ids differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NaturalKey {
    ServerAddress(String),
    TunnelEndpoint { server_id: Uuid, hostname: String },
    ClientDevice(String),
    AutomationCredentials,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NaturalKey::ServerAddress(ip) => write!(f, "server {ip}"),
            NaturalKey::TunnelEndpoint {
                server_id,
                hostname,
            } => write!(f, "tunnel {hostname} on {server_id}"),
            NaturalKey::ClientDevice(id) => write!(f, "client {id}"),
            NaturalKey::AutomationCredentials => f.write_str("automation credentials"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    #[serde(flatten)]
    pub body: RecordBody,
}

impl Record {
    pub fn new(id: Uuid, body: RecordBody) -> Self {
        Self { id, body }
    }

    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }

    /// The JSON text versioned by the delta codec. Field order is fixed by
    /// the struct definitions and extras are sorted, so identical records
    /// always serialise to identical text.
    pub fn to_canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| StoreError::Corrupt(format!("unparsable record: {e}")))
    }

    pub fn natural_key(&self) -> NaturalKey {
        match &self.body {
            RecordBody::Server(s) => NaturalKey::ServerAddress(s.ip_address.clone()),
            RecordBody::Tunnel(t) => NaturalKey::TunnelEndpoint {
                server_id: t.server_id,
                hostname: t.hostname.clone(),
            },
            RecordBody::Client(c) => NaturalKey::ClientDevice(c.syncthing_id.clone()),
            RecordBody::AutomationCredentials(_) => NaturalKey::AutomationCredentials,
        }
    }

    /// Display name for the plaintext index: explicit name, else hostname,
    /// else the kind label.
    pub fn display_name(&self) -> String {
        match &self.body {
            RecordBody::Server(s) => s.name.clone(),
            RecordBody::Tunnel(t) => t.hostname.clone(),
            RecordBody::Client(c) => c.name.clone(),
            RecordBody::AutomationCredentials(_) => self.kind().label().to_string(),
        }
    }

    /// Rewrite any reference to `loser` so it points at `winner`. Returns
    /// true when the record changed. Only tunnels carry record references.
    pub fn rewrite_reference(&mut self, loser: Uuid, winner: Uuid) -> bool {
        match &mut self.body {
            RecordBody::Tunnel(t) if t.server_id == loser => {
                t.server_id = winner;
                true
            }
            _ => false,
        }
    }
}
