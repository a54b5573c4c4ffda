//! JSON fixture loading into a [`HotStore`]

use crate::hot::HotStore;
use crate::{EventId, StorageError, StoredEventEntry, StoredMessage};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// On-disk fixture document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    #[serde(default)]
    pub events: Vec<StoredEventEntry>,
    #[serde(default)]
    pub messages: Vec<FixtureMessage>,
}

/// A raw message together with the events it is attached to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureMessage {
    pub message: StoredMessage,
    #[serde(default)]
    pub attached_event_ids: Vec<EventId>,
}

impl Fixture {
    /// Parse a fixture from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::FixtureFormat`] when the document is not a valid fixture.
    pub fn from_json(path: &Path, text: &str) -> Result<Self, StorageError> {
        serde_json::from_str(text).map_err(|source| StorageError::FixtureFormat {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Append every record to `store`.
    pub fn apply(self, store: &HotStore) {
        for entry in self.events {
            store.store_entry(entry);
        }
        for FixtureMessage {
            message,
            attached_event_ids,
        } in self.messages
        {
            store.store_message(message, attached_event_ids);
        }
    }
}

/// Load a fixture file into a fresh store.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid fixture.
pub fn load_file(path: impl AsRef<Path>) -> Result<HotStore, StorageError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| StorageError::FixtureIo {
        path: path.to_path_buf(),
        source,
    })?;

    let fixture = Fixture::from_json(path, &text)?;
    let store = HotStore::new();
    fixture.apply(&store);

    info!(
        path = %path.display(),
        entries = store.entry_count(),
        messages = store.message_count(),
        "Loaded storage fixture"
    );
    Ok(store)
}
