use crate::exclude::ExclusionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Why an object belongs to the closure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Markers {
    /// Reported by the dynamic linker for some discovered object.
    pub needed: bool,
    /// Named by a `dlopen`-style string in some entry point.
    pub dlopen: bool,
}

impl Markers {
    pub fn is_marked(self) -> bool {
        self.needed || self.dlopen
    }
}

/// Working set of the resolver, keyed by in-root path.
///
/// Paths removed by the exclusion policy are remembered and never re-added.
#[derive(Debug, Clone, Default)]
pub struct ElfObjectSet {
    objects: BTreeMap<PathBuf, Markers>,
    excluded: BTreeSet<PathBuf>,
}

impl ElfObjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unmarked object. Returns false if it was present or excluded.
    pub fn insert(&mut self, path: PathBuf) -> bool {
        if self.excluded.contains(&path) || self.objects.contains_key(&path) {
            return false;
        }
        self.objects.insert(path, Markers::default());
        true
    }

    pub fn mark_needed(&mut self, path: PathBuf) -> bool {
        self.mark(path, |m| m.needed = true)
    }

    pub fn mark_dlopen(&mut self, path: PathBuf) -> bool {
        self.mark(path, |m| m.dlopen = true)
    }

    fn mark(&mut self, path: PathBuf, f: impl FnOnce(&mut Markers)) -> bool {
        if self.excluded.contains(&path) {
            return false;
        }
        f(self.objects.entry(path).or_default());
        true
    }

    /// Remove every entry the policy matches. Returns the newly removed paths.
    pub fn apply_exclusion(&mut self, policy: &ExclusionPolicy) -> Vec<PathBuf> {
        let removed: Vec<PathBuf> = self
            .objects
            .keys()
            .filter(|p| policy.matches(p))
            .cloned()
            .collect();
        for p in &removed {
            self.objects.remove(p);
            self.excluded.insert(p.clone());
        }
        removed
    }

    /// Marked entries: what must be materialized.
    pub fn closure(&self) -> BTreeMap<PathBuf, Markers> {
        self.objects
            .iter()
            .filter(|(_, m)| m.is_marked())
            .map(|(p, m)| (p.clone(), *m))
            .collect()
    }

    pub fn get(&self, path: &Path) -> Option<Markers> {
        self.objects.get(path).copied()
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.excluded.contains(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.objects.keys()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
