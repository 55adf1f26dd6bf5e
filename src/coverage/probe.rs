//! Probe registry scoped to a single coverage run.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::model::CodeUnitName;

/// One probe visit reported by an instrumented test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProbeHit {
    /// Unit the probe belongs to.
    pub unit: CodeUnitName,
    /// Line the probe marks.
    pub line: u32,
}

impl ProbeHit {
    pub fn new(unit: impl Into<CodeUnitName>, line: u32) -> Self {
        Self {
            unit: unit.into(),
            line,
        }
    }

    /// Parse the `<unit>:<line>` form written by instrumented tests.
    pub fn parse(raw: &str) -> Option<Self> {
        let (unit, line) = raw.trim().rsplit_once(':')?;
        let unit = unit.trim();
        if unit.is_empty() {
            return None;
        }
        let line = line.trim().parse().ok()?;
        Some(Self::new(unit, line))
    }
}

/// Registered probes for one coverage run.
///
/// Created when the run starts and dropped with it. Hits that name an
/// unregistered unit or line are discarded and counted.
#[derive(Debug, Default)]
pub struct ProbeRegistry {
    probes: HashMap<CodeUnitName, BTreeSet<u32>>,
    dropped: usize,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the code lines of a unit.
    pub fn register(&mut self, unit: CodeUnitName, lines: impl IntoIterator<Item = u32>) {
        self.probes.entry(unit).or_default().extend(lines);
    }

    pub fn accepts(&self, hit: &ProbeHit) -> bool {
        self.probes
            .get(&hit.unit)
            .is_some_and(|lines| lines.contains(&hit.line))
    }

    /// Keep valid hits, deduplicated and sorted.
    pub fn filter(&mut self, hits: impl IntoIterator<Item = ProbeHit>) -> Vec<ProbeHit> {
        let mut kept = BTreeSet::new();
        for hit in hits {
            if self.accepts(&hit) {
                kept.insert(hit);
            } else {
                self.dropped += 1;
            }
        }
        kept.into_iter().collect()
    }

    /// Number of invalid hits discarded so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn unit_count(&self) -> usize {
        self.probes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_qualified_names_and_rejects_garbage() {
        assert_eq!(ProbeHit::parse("a.b.C:12"), Some(ProbeHit::new("a.b.C", 12)));
        assert_eq!(ProbeHit::parse("  C:3 \n"), Some(ProbeHit::new("C", 3)));
        assert_eq!(ProbeHit::parse("C"), None);
        assert_eq!(ProbeHit::parse(":3"), None);
        assert_eq!(ProbeHit::parse("C:x"), None);
    }

    #[test]
    fn unknown_probes_are_dropped_and_counted() {
        let mut registry = ProbeRegistry::new();
        registry.register("a.A".into(), [1, 2]);

        let kept = registry.filter(vec![
            ProbeHit::new("a.A", 2),
            ProbeHit::new("a.A", 2),
            ProbeHit::new("a.A", 9),
            ProbeHit::new("a.Missing", 1),
        ]);
        assert_eq!(kept, vec![ProbeHit::new("a.A", 2)]);
        assert_eq!(registry.dropped(), 2);
    }
}
