// Static override table: diagnosis → drugs known to be outdated for it.
// Read once at start-up; entries always win over the model's verdict.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;

use crate::config::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutdatedMedications {
    table: HashMap<String, Vec<String>>,
}

impl OutdatedMedications {
    /// Build from raw entries, normalizing keys and names to trimmed lowercase.
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: IntoIterator,
        V::Item: AsRef<str>,
    {
        let mut table: HashMap<String, Vec<String>> = HashMap::new();
        for (diagnosis, drugs) in entries {
            let bucket = table
                .entry(diagnosis.as_ref().trim().to_lowercase())
                .or_default();
            for drug in drugs {
                let drug = drug.as_ref().trim().to_lowercase();
                if !drug.is_empty() && !bucket.contains(&drug) {
                    bucket.push(drug);
                }
            }
        }
        Self { table }
    }

    /// Load the table from a JSON object of string arrays.
    /// A missing file is an empty table; an unreadable or malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No outdated-medication table, using empty table");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let entries: HashMap<String, Vec<String>> =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Malformed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let table = Self::from_entries(entries);
        tracing::info!(diagnoses = table.len(), "Outdated-medication table loaded");
        Ok(table)
    }

    /// Outdated drugs for `diagnosis`; empty when the diagnosis is not listed.
    pub fn for_diagnosis(&self, diagnosis: &str) -> &[String] {
        self.table
            .get(&diagnosis.trim().to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
