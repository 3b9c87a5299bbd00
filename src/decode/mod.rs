//! Event-signature matching for freshly written logs.

use crate::store::{DecodedEvent, LogRecord};
use alloy::primitives::{keccak256, B256};
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Decoder invoked once per stored log with the assigned log id.
pub trait LogDecoder: Send + Sync {
    /// Match a log against known event signatures. `None` when the log does
    /// not correspond to a configured event.
    fn decode(&self, log_id: i64, log: &LogRecord) -> Option<DecodedEvent>;
}

#[derive(Debug, Deserialize)]
struct AbiConfig {
    events: Vec<String>,
}

#[derive(Debug, Clone)]
struct EventSpec {
    name: String,
    signature: String,
}

/// Event registry keyed by topic0.
#[derive(Debug, Default)]
pub struct EventRegistry {
    events: HashMap<B256, EventSpec>,
}

impl EventRegistry {
    /// Registry that matches nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a registry from canonical event signatures such as
    /// `Transfer(address,address,uint256)`.
    pub fn from_signatures<S: AsRef<str>>(signatures: &[S]) -> Result<Self> {
        let mut events = HashMap::with_capacity(signatures.len());
        for signature in signatures {
            let signature = signature.as_ref().trim();
            let name = signature
                .split('(')
                .next()
                .filter(|name| !name.is_empty())
                .ok_or_else(|| eyre!("malformed event signature: {signature}"))?;
            if !signature.ends_with(')') {
                return Err(eyre!("malformed event signature: {signature}"));
            }
            let topic0 = keccak256(signature.as_bytes());
            events.insert(
                topic0,
                EventSpec {
                    name: name.to_string(),
                    signature: signature.to_string(),
                },
            );
        }
        Ok(Self { events })
    }

    /// Load a registry from a JSON file of the shape
    /// `{ "events": ["Transfer(address,address,uint256)", ...] }`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read ABI config {}", path.display()))?;
        let config: AbiConfig = serde_json::from_str(&raw)
            .wrap_err_with(|| format!("failed to parse ABI config {}", path.display()))?;
        Self::from_signatures(&config.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl LogDecoder for EventRegistry {
    fn decode(&self, log_id: i64, log: &LogRecord) -> Option<DecodedEvent> {
        let topic0 = log.topics[0]?;
        let spec = self.events.get(&topic0)?;
        Some(DecodedEvent {
            log_id,
            address: log.address,
            name: spec.name.clone(),
            signature: spec.signature.clone(),
        })
    }
}
