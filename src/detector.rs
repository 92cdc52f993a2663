// Transaction Detector - finds pool transactions not yet settled

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::chain::{AddressHistory, ChainIndexer};
use crate::error::AppResult;
use crate::settlement::retry::bounded;

/// A transaction seen on the pool address that has not been settled yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedEvent {
    pub transaction_id: String,
}

/// New events plus the history they were derived from
#[derive(Debug, Clone)]
pub struct Detection {
    pub events: Vec<DetectedEvent>,
    pub history: AddressHistory,
}

pub struct TransactionDetector {
    indexer: Arc<dyn ChainIndexer>,
    address: String,
    timeout: Duration,
}

impl TransactionDetector {
    pub fn new(indexer: Arc<dyn ChainIndexer>, address: &str, timeout: Duration) -> Self {
        Self {
            indexer,
            address: address.to_string(),
            timeout,
        }
    }

    /// Diff the indexer's history against `known_ids`, keeping indexer order
    pub async fn detect(&self, known_ids: &BTreeSet<String>) -> AppResult<Detection> {
        let history = bounded(
            self.timeout,
            "address history",
            self.indexer.address_history(&self.address),
        )
        .await?;

        let events = Self::new_events(&history.transaction_ids, known_ids);

        debug!(
            "🔍 {} transactions in history, {} new",
            history.transaction_ids.len(),
            events.len()
        );

        Ok(Detection { events, history })
    }

    fn new_events(history: &[String], known_ids: &BTreeSet<String>) -> Vec<DetectedEvent> {
        let mut emitted = HashSet::new();

        history
            .iter()
            .filter(|txid| !known_ids.contains(txid.as_str()))
            .filter(|txid| emitted.insert(txid.as_str()))
            .map(|txid| DetectedEvent {
                transaction_id: txid.clone(),
            })
            .collect()
    }
}
