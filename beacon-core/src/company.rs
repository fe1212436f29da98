//! Bluetooth SIG company identifier table.
//!
//! Loaded once at startup from a two-column text file:
//!
//! ```text
//! 76,Apple, Inc.
//! 6,Microsoft
//! ```
//!
//! The name is everything after the first comma, trimmed. Blank lines and
//! lines whose id does not parse are skipped.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::types::{BeaconError, CompanyDescriptor, Result};

#[derive(Debug, Clone, Default)]
pub struct CompanyTable {
    names: HashMap<i32, String>,
}

impl CompanyTable {
    pub fn new() -> Self {
        CompanyTable::default()
    }

    /// Parse table text. Never fails; bad lines are dropped.
    pub fn parse(text: &str) -> Self {
        let mut names = HashMap::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Some((id, name)) = line.split_once(',') else {
                continue;
            };
            if let Ok(id) = id.trim().parse::<i32>() {
                names.insert(id, name.trim().to_string());
            }
        }
        CompanyTable { names }
    }

    /// Load from a file; a missing file is `MissingResource`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BeaconError::MissingResource(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        let table = CompanyTable::parse(&text);
        debug!(path = %path.display(), entries = table.len(), "loaded company table");
        Ok(table)
    }

    /// Load from a file, falling back to an empty table with a warning.
    pub fn load_or_empty(path: &Path) -> Self {
        match CompanyTable::load(path) {
            Ok(table) => table,
            Err(e) => {
                warn!("company table unavailable, names will be empty: {e}");
                CompanyTable::new()
            }
        }
    }

    pub fn insert(&mut self, id: i32, name: &str) {
        self.names.insert(id, name.to_string());
    }

    /// Vendor name for a descriptor, or `""` if unknown.
    pub fn lookup_company_name(&self, descriptor: &CompanyDescriptor) -> &str {
        self.name_of(descriptor.company_id)
    }

    pub fn name_of(&self, company_id: i32) -> &str {
        if company_id < 0 {
            return "";
        }
        self.names.get(&company_id).map(String::as_str).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
