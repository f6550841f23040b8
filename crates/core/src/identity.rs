// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Device identity: signing and verifying changes by DID.
//!
//! Each device owns an Ed25519 key. Its DID embeds the public key
//! (`did:key:ed25519:<hex>`), so any peer can verify a signature from the
//! DID alone without a registry lookup.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::protocol::Change;

/// DID method prefix for Ed25519 public keys.
pub const DID_PREFIX: &str = "did:key:ed25519:";

/// A named identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub did: String,
    pub display_name: String,
}

/// Signs on behalf of the local identity and verifies any identity's signatures.
pub trait IdentityService: Send + Sync {
    /// The identity this device signs as.
    fn default_identity(&self) -> Identity;

    /// Signs `payload`, returning a hex-encoded signature.
    fn sign(&self, payload: &[u8]) -> String;

    /// Checks that `signature` over `payload` was produced by `did`.
    fn verify(&self, signature: &str, payload: &[u8], did: &str) -> bool;
}

/// Stamps `change` with the local identity and signs it.
pub fn sign_change(identity: &dyn IdentityService, change: &mut Change) -> Result<()> {
    change.author_did = identity.default_identity().did;
    change.signature = identity.sign(&change.signing_payload()?);
    Ok(())
}

/// Verifies the author signature of an inbound change.
pub fn verify_change(identity: &dyn IdentityService, change: &Change) -> Result<()> {
    let payload = change.signing_payload()?;
    if identity.verify(&change.signature, &payload, &change.author_did) {
        Ok(())
    } else {
        Err(Error::SignatureVerification {
            author: change.author_did.clone(),
            resource: change.resource_key().to_string(),
        })
    }
}

/// Returns the DID naming `key`.
pub fn did_for(key: &VerifyingKey) -> String {
    format!("{DID_PREFIX}{}", hex::encode(key.to_bytes()))
}

/// Extracts the public key embedded in a DID.
pub fn parse_did(did: &str) -> Result<VerifyingKey> {
    let encoded = did
        .strip_prefix(DID_PREFIX)
        .ok_or_else(|| Error::Identity(format!("unsupported DID method: {did}")))?;
    let bytes: [u8; 32] = hex::decode(encoded)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Identity(format!("malformed DID key: {did}")))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::Identity(format!("invalid DID key: {e}")))
}

/// On-disk form of a device key.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyFile {
    secret_key: String,
    display_name: String,
}

/// An Ed25519 device identity.
pub struct KeyIdentity {
    signing_key: SigningKey,
    display_name: String,
}

impl KeyIdentity {
    /// Generates a fresh key.
    pub fn generate(display_name: impl Into<String>) -> Self {
        KeyIdentity {
            signing_key: SigningKey::generate(&mut OsRng),
            display_name: display_name.into(),
        }
    }

    pub fn from_secret(secret: [u8; 32], display_name: impl Into<String>) -> Self {
        KeyIdentity { signing_key: SigningKey::from_bytes(&secret), display_name: display_name.into() }
    }

    pub fn did(&self) -> String {
        did_for(&self.signing_key.verifying_key())
    }

    /// Loads a key file written by [`KeyIdentity::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: KeyFile = serde_json::from_str(&content)?;
        let secret: [u8; 32] = hex::decode(&file.secret_key)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::Identity(format!("malformed key file: {}", path.display())))?;
        Ok(Self::from_secret(secret, file.display_name))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = KeyFile {
            secret_key: hex::encode(self.signing_key.to_bytes()),
            display_name: self.display_name.clone(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Loads the key at `path`, generating and saving one on first use.
    pub fn load_or_generate(path: &Path, display_name: Option<&str>) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let name = display_name.map(str::to_string).unwrap_or_else(default_display_name);
        let identity = Self::generate(name);
        identity.save(path)?;
        tracing::info!(did = %identity.did(), path = %path.display(), "generated device identity");
        Ok(identity)
    }
}

impl std::fmt::Debug for KeyIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyIdentity")
            .field("did", &self.did())
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

impl IdentityService for KeyIdentity {
    fn default_identity(&self) -> Identity {
        Identity { did: self.did(), display_name: self.display_name.clone() }
    }

    fn sign(&self, payload: &[u8]) -> String {
        hex::encode(self.signing_key.sign(payload).to_bytes())
    }

    fn verify(&self, signature: &str, payload: &[u8], did: &str) -> bool {
        let Ok(key) = parse_did(did) else {
            return false;
        };
        let Some(bytes) = hex::decode(signature).ok().and_then(|b| <[u8; 64]>::try_from(b).ok())
        else {
            return false;
        };
        key.verify(payload, &Signature::from_bytes(&bytes)).is_ok()
    }
}

/// Display name for a freshly generated identity.
///
/// Names the machine the key was generated on, as `user@host` when both
/// are known. System accounts are left out.
pub fn default_display_name() -> String {
    device_name(unix_username().as_deref(), hostname().as_deref())
}

fn device_name(user: Option<&str>, host: Option<&str>) -> String {
    let user = user.filter(|u| !is_system_account(u));
    match (user, host) {
        (Some(user), Some(host)) => format!("{user}@{host}"),
        (None, Some(host)) => host.to_string(),
        (Some(user), None) => user.to_string(),
        (None, None) => "device".to_string(),
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

fn unix_username() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .filter(|s| !s.is_empty())
}

fn is_system_account(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "root" | "system" | "administrator" | "admin" | "daemon" | "nobody"
    )
}

#[cfg(test)]
#[path = "identity_tests.rs"]
mod tests;
