//! Discovery entries: signed records of how a key can be reached

use crate::{DiscoveryError, DiscoveryResult};
use relaymux_proto::{Keypair, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// Entry format version written by this crate
pub const ENTRY_VERSION: &str = "0.0.1";

/// Client section: the relays a client is reachable through
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub delegated_servers: Vec<PublicKey>,
}

/// Server section: where a relay listens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub address: String,
    /// Remaining client slots advertised by the relay
    pub available_connections: u32,
}

/// A signed discovery record, keyed by `static_pk`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub version: String,
    /// Bumped on every update; the store rejects stale sequences
    pub sequence: u64,
    /// Unix time in nanoseconds
    pub timestamp: i64,
    #[serde(rename = "static")]
    pub static_pk: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

impl Entry {
    /// Unsigned client entry listing `delegated_servers`
    pub fn new_client(static_pk: PublicKey, sequence: u64, delegated_servers: Vec<PublicKey>) -> Self {
        Self {
            version: ENTRY_VERSION.to_string(),
            sequence,
            timestamp: now_nanos(),
            static_pk,
            client: Some(ClientInfo { delegated_servers }),
            server: None,
            signature: None,
        }
    }

    /// Unsigned server entry for a relay listening on `address`
    pub fn new_server(
        static_pk: PublicKey,
        sequence: u64,
        address: impl Into<String>,
        available_connections: u32,
    ) -> Self {
        Self {
            version: ENTRY_VERSION.to_string(),
            sequence,
            timestamp: now_nanos(),
            static_pk,
            client: None,
            server: Some(ServerInfo {
                address: address.into(),
                available_connections,
            }),
            signature: None,
        }
    }

    /// Relays this entry's owner delegates; empty for server entries
    pub fn delegated_servers(&self) -> &[PublicKey] {
        self.client
            .as_ref()
            .map(|c| c.delegated_servers.as_slice())
            .unwrap_or(&[])
    }

    /// Replace the delegated relay list, creating the client section if needed
    pub fn set_delegated_servers(&mut self, servers: Vec<PublicKey>) {
        self.client
            .get_or_insert_with(ClientInfo::default)
            .delegated_servers = servers;
    }

    pub fn server_address(&self) -> Option<&str> {
        self.server
            .as_ref()
            .map(|s| s.address.as_str())
            .filter(|a| !a.is_empty())
    }

    /// Refresh the timestamp and bump the sequence ahead of an update
    pub fn advance(&mut self) {
        self.sequence += 1;
        self.timestamp = now_nanos();
    }

    /// Bytes covered by the signature: the JSON encoding with no signature set
    pub fn signing_bytes(&self) -> DiscoveryResult<Vec<u8>> {
        let unsigned = Entry {
            signature: None,
            ..self.clone()
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Sign with the owner's keypair
    pub fn sign(&mut self, keypair: &Keypair) -> DiscoveryResult<()> {
        if keypair.public_key() != self.static_pk {
            return Err(DiscoveryError::SignerMismatch);
        }
        let bytes = self.signing_bytes()?;
        self.signature = Some(keypair.sign(&bytes));
        Ok(())
    }

    /// Check the signature against `static_pk`
    pub fn verify(&self) -> DiscoveryResult<()> {
        let signature = self.signature.ok_or(DiscoveryError::InvalidSignature)?;
        let bytes = self.signing_bytes()?;
        self.static_pk
            .verify(&bytes, &signature)
            .map_err(|_| DiscoveryError::InvalidSignature)
    }
}

fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
