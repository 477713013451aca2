//! Signed publisher identity records.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::model::{ChainId, Hash256, ItemId, PublisherId};

const RECORD_DOMAIN: &[u8] = b"feed-reconciler/publisher-identity/v1";

/// Display profile a trusted record contributes to feed entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherProfile {
    pub info_id: ItemId,
    pub publisher_id: PublisherId,
    pub name: String,
    pub alias: String,
}

/// Self-describing record naming a publisher.
///
/// The record is content-addressed: `id` is the digest of the signed body
/// plus signature. It is only trusted once its signature verifies and its
/// back-reference names the publisher the referencing item claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherIdentityRecord {
    pub id: ItemId,
    pub chain_id: ChainId,
    /// Publisher this record claims to describe
    pub publisher_ref: PublisherId,
    pub name: String,
    pub alias: String,
    #[serde(with = "hex_array")]
    pub public_key: [u8; 32],
    #[serde(with = "hex_array")]
    pub signature: [u8; 64],
}

impl PublisherIdentityRecord {
    /// Build and sign a record with `key`.
    pub fn sign(
        key: &SigningKey,
        chain_id: ChainId,
        publisher_ref: PublisherId,
        name: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let alias = alias.into();
        let public_key = key.verifying_key().to_bytes();
        let body = signing_bytes(&chain_id, &publisher_ref, &name, &alias, &public_key);
        let signature = key.sign(&body).to_bytes();

        Self {
            id: content_address(&body, &signature),
            chain_id,
            publisher_ref,
            name,
            alias,
            public_key,
            signature,
        }
    }

    fn body(&self) -> Vec<u8> {
        signing_bytes(
            &self.chain_id,
            &self.publisher_ref,
            &self.name,
            &self.alias,
            &self.public_key,
        )
    }

    /// Whether `id` is the digest of the record's content.
    pub fn verify_content_address(&self) -> bool {
        content_address(&self.body(), &self.signature) == self.id
    }

    /// Whether the signature over the record body verifies under its key.
    pub fn verify_signature(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.public_key) else {
            return false;
        };
        let signature = Signature::from_bytes(&self.signature);
        key.verify_strict(&self.body(), &signature).is_ok()
    }

    /// Publisher the record claims to describe.
    pub fn back_reference(&self) -> &PublisherId {
        &self.publisher_ref
    }

    pub fn profile(&self) -> PublisherProfile {
        PublisherProfile {
            info_id: self.id,
            publisher_id: self.publisher_ref,
            name: self.name.clone(),
            alias: self.alias.clone(),
        }
    }
}

fn signing_bytes(
    chain_id: &ChainId,
    publisher_ref: &PublisherId,
    name: &str,
    alias: &str,
    public_key: &[u8; 32],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_DOMAIN.len() + 104 + name.len() + alias.len());
    out.extend_from_slice(RECORD_DOMAIN);
    out.extend_from_slice(chain_id.as_bytes());
    out.extend_from_slice(publisher_ref.as_bytes());
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&(alias.len() as u32).to_le_bytes());
    out.extend_from_slice(alias.as_bytes());
    out.extend_from_slice(public_key);
    out
}

fn content_address(body: &[u8], signature: &[u8; 64]) -> ItemId {
    let mut buf = Vec::with_capacity(body.len() + signature.len());
    buf.extend_from_slice(body);
    buf.extend_from_slice(signature);
    Hash256::digest(&buf)
}

/// Fixed-size byte arrays as hex strings.
mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {N} bytes")))
    }
}
