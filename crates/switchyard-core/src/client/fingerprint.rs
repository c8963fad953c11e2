//! Request fingerprint: stable hash identifying a request for caching.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::AgentId;
use crate::ports::RequestDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

#[derive(Serialize)]
struct Canonical<'a> {
    agent: &'a AgentId,
    request: &'a RequestDescriptor,
}

impl Fingerprint {
    /// SHA-256 over the JSON encoding of `(agent, request)`.
    ///
    /// `serde_json` maps are key-sorted and `options` is a `BTreeMap`, so the
    /// encoding does not depend on insertion order.
    pub fn of(agent: &AgentId, request: &RequestDescriptor) -> Self {
        let canonical = Canonical { agent, request };
        let bytes = serde_json::to_vec(&canonical).unwrap_or_else(|_| {
            // only reachable with non-string map keys, which the types above rule out
            format!("{agent}:{request:?}").into_bytes()
        });
        Fingerprint(hex::encode(Sha256::digest(&bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}
