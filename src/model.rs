//! Lazily resolved metadata about the code units under mutation.
//!
//! Units are fetched on first lookup from a [`CodeSource`] and memoized in a
//! [`CodeRepository`]. Parent links (super and outer units) are stored by name
//! and resolved through the repository, so the class graph is never built
//! eagerly and cycles cannot leak.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fully-qualified name of a code unit, e.g. `com.example.Calculator`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeUnitName(String);

impl CodeUnitName {
    /// Wrap a fully-qualified name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the raw name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Everything before the last `.`; empty for unqualified names.
    pub fn package(&self) -> &str {
        self.0.rsplit_once('.').map(|(pkg, _)| pkg).unwrap_or("")
    }

    /// Everything after the last `.`.
    pub fn simple_name(&self) -> &str {
        self.0.rsplit_once('.').map(|(_, name)| name).unwrap_or(&self.0)
    }
}

impl fmt::Display for CodeUnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CodeUnitName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CodeUnitName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw bytes.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Hash an ordered sequence of hashes into one.
    pub fn combine<'a>(parts: impl IntoIterator<Item = &'a ContentHash>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.0.as_bytes());
            hasher.update(b"\n");
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Borrow the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw description of a code unit as produced by a [`CodeSource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnitData {
    /// Unit identity.
    pub name: CodeUnitName,
    /// Lines carrying executable code.
    pub lines: BTreeSet<u32>,
    /// Direct supertype, if any.
    pub super_unit: Option<CodeUnitName>,
    /// Enclosing unit for nested units.
    pub outer_unit: Option<CodeUnitName>,
    /// Abstract units cannot be instantiated directly.
    pub is_abstract: bool,
    /// Interfaces carry no mutable bodies of their own.
    pub is_interface: bool,
    /// Hash over the unit's own body.
    pub content_hash: ContentHash,
}

/// Immutable, cached view of one code unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeUnit {
    data: CodeUnitData,
}

impl CodeUnit {
    /// Build a unit from source data.
    pub fn new(data: CodeUnitData) -> Self {
        Self { data }
    }

    pub fn name(&self) -> &CodeUnitName {
        &self.data.name
    }

    pub fn lines(&self) -> &BTreeSet<u32> {
        &self.data.lines
    }

    pub fn is_code_line(&self, line: u32) -> bool {
        self.data.lines.contains(&line)
    }

    pub fn number_of_code_lines(&self) -> usize {
        self.data.lines.len()
    }

    pub fn super_unit(&self) -> Option<&CodeUnitName> {
        self.data.super_unit.as_ref()
    }

    pub fn outer_unit(&self) -> Option<&CodeUnitName> {
        self.data.outer_unit.as_ref()
    }

    pub fn is_top_level(&self) -> bool {
        self.data.outer_unit.is_none()
    }

    pub fn is_abstract(&self) -> bool {
        self.data.is_abstract
    }

    pub fn is_interface(&self) -> bool {
        self.data.is_interface
    }

    pub fn content_hash(&self) -> &ContentHash {
        &self.data.content_hash
    }

    /// Underlying source data.
    pub fn data(&self) -> &CodeUnitData {
        &self.data
    }
}

/// Identity of a unit at a point in time: its own hash plus the hash that
/// also covers its supertypes and enclosing unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HierarchicalId {
    /// Unit name.
    pub name: CodeUnitName,
    /// Hash of the unit body.
    pub content_hash: ContentHash,
    /// Hash of the body combined with supertypes and the outer unit.
    pub hierarchical_hash: ContentHash,
}

/// Supplier of code unit metadata.
pub trait CodeSource: Send + Sync {
    /// Look up one unit by name.
    fn fetch(&self, name: &CodeUnitName) -> Option<CodeUnitData>;

    /// Names of every unit this source knows about, in a stable order.
    fn unit_names(&self) -> Vec<CodeUnitName>;
}

/// Memoizing repository over a [`CodeSource`].
///
/// Entries are created on first lookup and live until the repository is
/// dropped. Misses are cached too.
pub struct CodeRepository {
    source: Arc<dyn CodeSource>,
    cache: Mutex<HashMap<CodeUnitName, Option<Arc<CodeUnit>>>>,
}

impl fmt::Debug for CodeRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("CodeRepository")
            .field("cached", &cached)
            .finish()
    }
}

impl CodeRepository {
    /// Create an empty repository over `source`.
    pub fn new(source: Arc<dyn CodeSource>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a unit, consulting the source at most once per name.
    pub fn fetch(&self, name: &CodeUnitName) -> Option<Arc<CodeUnit>> {
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return hit.clone();
        }

        let fetched = self.source.fetch(name).map(|data| Arc::new(CodeUnit::new(data)));
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.clone())
            .or_insert(fetched)
            .clone()
    }

    /// Every unit known to the source.
    pub fn all_units(&self) -> Vec<Arc<CodeUnit>> {
        self.source
            .unit_names()
            .iter()
            .filter_map(|name| self.fetch(name))
            .collect()
    }

    pub fn super_of(&self, unit: &CodeUnit) -> Option<Arc<CodeUnit>> {
        unit.super_unit().and_then(|name| self.fetch(name))
    }

    pub fn outer_of(&self, unit: &CodeUnit) -> Option<Arc<CodeUnit>> {
        unit.outer_unit().and_then(|name| self.fetch(name))
    }

    /// Hash covering the unit body, its whole supertype chain and its outer
    /// unit. A change anywhere up the chain changes this hash.
    pub fn hierarchical_hash(&self, name: &CodeUnitName) -> Option<ContentHash> {
        let mut visited = HashSet::new();
        self.hierarchical_hash_inner(name, &mut visited)
    }

    fn hierarchical_hash_inner(
        &self,
        name: &CodeUnitName,
        visited: &mut HashSet<CodeUnitName>,
    ) -> Option<ContentHash> {
        if !visited.insert(name.clone()) {
            return None;
        }
        let unit = self.fetch(name)?;

        let mut parts = vec![unit.content_hash().clone()];
        if let Some(parent) = unit.super_unit() {
            if let Some(parent_hash) = self.hierarchical_hash_inner(parent, visited) {
                parts.push(parent_hash);
            }
        }
        if let Some(outer) = self.outer_of(&unit) {
            parts.push(outer.content_hash().clone());
        }
        Some(ContentHash::combine(&parts))
    }

    /// Name plus both hashes for a unit.
    pub fn hierarchical_id(&self, name: &CodeUnitName) -> Option<HierarchicalId> {
        let unit = self.fetch(name)?;
        let hierarchical_hash = self.hierarchical_hash(name)?;
        Some(HierarchicalId {
            name: name.clone(),
            content_hash: unit.content_hash().clone(),
            hierarchical_hash,
        })
    }

    /// True when `ancestor` appears anywhere in the supertype chain of `name`.
    pub fn descends_from(&self, name: &CodeUnitName, ancestor: &CodeUnitName) -> bool {
        let mut visited = HashSet::new();
        let mut current = self.fetch(name);
        while let Some(unit) = current {
            if !visited.insert(unit.name().clone()) {
                return false;
            }
            match unit.super_unit() {
                Some(parent) if parent == ancestor => return true,
                Some(_) => current = self.super_of(&unit),
                None => return false,
            }
        }
        false
    }
}
