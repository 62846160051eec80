//! Parameter persistence under a configuration root directory

use crate::error::{CommError, CommResult};
use crate::fs::verify_directory;
use crate::params::ParameterSection;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Key-value store for transport parameters
///
/// Each [`ParameterSection`] lives in its own pretty-printed JSON file under
/// the root directory, e.g. `client.json`:
///
/// ```json
/// {
///   "Client": {
///     "IP": "127.0.0.1",
///     "Port": 1234,
///     "Retry": { "Enabled": true, "Count": 10, "TimeOut": 10000, "Interval": 100 }
///   }
/// }
/// ```
///
/// Saving a section rewrites only that key; any other top-level keys already
/// present in the file are preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterStore {
    root: PathBuf,
}

impl ParameterStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path of a file under the root
    pub fn path_of(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// Load a section, falling back to defaults for a missing file, a missing
    /// section or missing keys
    ///
    /// # Errors
    /// - `CommError::Store` if the root directory cannot be created
    /// - `CommError::Serialization` if the file is not valid JSON or a value has the wrong type
    /// - any validation error of the loaded section
    pub fn load<S: ParameterSection>(&self) -> CommResult<S> {
        let section = match self.read_document(S::FILE_NAME)? {
            Some(Value::Object(mut map)) => match map.remove(S::SECTION) {
                Some(value) => serde_json::from_value::<S>(value)?,
                None => S::default(),
            },
            Some(_) => {
                return Err(CommError::Store(format!(
                    "{} does not hold a JSON object",
                    S::FILE_NAME
                )))
            }
            None => S::default(),
        };
        section.validate()?;
        Ok(section)
    }

    /// Save a section, keeping other sections of the same file
    ///
    /// # Errors
    /// - any validation error of `section` (nothing is written)
    /// - `CommError::Store` / `CommError::Connection` on filesystem failures
    pub fn save<S: ParameterSection>(&self, section: &S) -> CommResult<()> {
        section.validate()?;
        let mut map = match self.read_document(S::FILE_NAME) {
            Ok(Some(Value::Object(map))) => map,
            Ok(_) => Map::new(),
            Err(e) => {
                log::warn!("Overwriting unreadable {}: {}", S::FILE_NAME, e);
                Map::new()
            }
        };
        map.insert(S::SECTION.to_string(), serde_json::to_value(section)?);
        self.write_document(S::FILE_NAME, &Value::Object(map))
    }

    /// Read and parse a JSON document; `Ok(None)` if the file does not exist or is empty
    pub fn read_document(&self, file_name: &str) -> CommResult<Option<Value>> {
        self.verify_root()?;
        let path = self.path_of(file_name);
        if !path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Write a JSON document, replacing the file atomically
    pub fn write_document(&self, file_name: &str, value: &Value) -> CommResult<()> {
        self.verify_root()?;
        let path = self.path_of(file_name);
        let staging = self.path_of(&format!("{}.tmp", file_name));
        let text = serde_json::to_string_pretty(value)?;
        fs::write(&staging, text)?;
        fs::rename(&staging, &path)?;
        log::debug!("Saved {}", path.display());
        Ok(())
    }

    fn verify_root(&self) -> CommResult<()> {
        if verify_directory(&self.root) {
            Ok(())
        } else {
            Err(CommError::Store(format!(
                "Configuration root is not usable: {}",
                self.root.display()
            )))
        }
    }
}
