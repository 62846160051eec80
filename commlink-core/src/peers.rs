//! Known-peer set of a server transport
//!
//! Advisory history only: the server accepts any peer whether or not it is
//! listed here.

use crate::error::{CommError, CommResult};
use crate::store::ParameterStore;
use serde_json::Value;

/// Append-only, de-duplicated list of remote addresses that have connected
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownPeers {
    entries: Vec<String>,
}

impl KnownPeers {
    /// File holding the list under the configuration root
    pub const FILE_NAME: &'static str = "peers.json";

    pub fn new() -> Self {
        Self::default()
    }

    /// Record `address`; returns `true` if it was not known yet
    pub fn insert(&mut self, address: &str) -> bool {
        if self.contains(address) {
            return false;
        }
        self.entries.push(address.to_string());
        true
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.iter().any(|entry| entry == address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.entries.clone()
    }

    /// Load the list from `store`; a missing file yields an empty list
    ///
    /// Duplicate entries in a hand-edited file are collapsed.
    ///
    /// # Errors
    /// Returns an error if the file exists but is not a JSON array of strings.
    pub fn load(store: &ParameterStore) -> CommResult<Self> {
        let mut peers = Self::new();
        match store.read_document(Self::FILE_NAME)? {
            None => {}
            Some(Value::Array(items)) => {
                for item in items {
                    match item {
                        Value::String(address) => {
                            peers.insert(&address);
                        }
                        other => {
                            return Err(CommError::Store(format!(
                                "{} holds a non-string entry: {}",
                                Self::FILE_NAME,
                                other
                            )))
                        }
                    }
                }
            }
            Some(_) => {
                return Err(CommError::Store(format!(
                    "{} does not hold a JSON array",
                    Self::FILE_NAME
                )))
            }
        }
        Ok(peers)
    }

    /// Rewrite the persisted list
    pub fn save(&self, store: &ParameterStore) -> CommResult<()> {
        let items = self.entries.iter().cloned().map(Value::String).collect();
        store.write_document(Self::FILE_NAME, &Value::Array(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_insert_deduplicates() {
        let mut peers = KnownPeers::new();
        assert!(peers.insert("10.0.0.1"));
        assert!(peers.insert("10.0.0.2"));
        assert!(!peers.insert("10.0.0.1"));
        assert_eq!(peers.len(), 2);
        assert_eq!(peers.iter().collect::<Vec<_>>(), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let store = ParameterStore::new(temp_dir.path());
        assert!(KnownPeers::load(&store).unwrap().is_empty());

        let mut peers = KnownPeers::new();
        peers.insert("127.0.0.1");
        peers.insert("192.168.1.20");
        peers.save(&store).unwrap();

        let loaded = KnownPeers::load(&store).unwrap();
        assert_eq!(loaded, peers);
    }

    #[test]
    fn test_load_collapses_duplicates_and_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let store = ParameterStore::new(temp_dir.path());
        let path = temp_dir.path().join(KnownPeers::FILE_NAME);

        fs::write(&path, r#"["a", "b", "a"]"#).unwrap();
        assert_eq!(KnownPeers::load(&store).unwrap().len(), 2);

        fs::write(&path, r#"["a", 7]"#).unwrap();
        assert!(KnownPeers::load(&store).is_err());

        fs::write(&path, r#"{"a": 1}"#).unwrap();
        assert!(KnownPeers::load(&store).is_err());
    }
}
