//! Category reconciliation between classifier proposals and known names.
//!
//! The classifier proposes a free-form category; before anything is written
//! to disk or to the library the proposal goes through [`CategoryResolver`]:
//!
//! 1. normalize (case, punctuation, whitespace) and apply synonyms;
//! 2. an exact key match reuses the known display name;
//! 3. otherwise `strict` picks the closest known name by normalized
//!    Levenshtein similarity (or the fallback), while `permissive` registers
//!    the proposal as a new category.

use crate::config::{CategoryPolicy, FilterConfig};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::debug;

pub struct CategoryResolver {
    policy: CategoryPolicy,
    fallback: String,
    threshold: f64,
    /// Normalized alias → canonical display name.
    synonyms: HashMap<String, String>,
    /// Normalized key → display name.
    known: Mutex<BTreeMap<String, String>>,
}

impl CategoryResolver {
    pub fn new(config: &FilterConfig) -> Self {
        let synonyms = config
            .synonyms
            .iter()
            .map(|(alias, canonical)| (normalize_key(alias), display_name(canonical)))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect();
        let resolver = Self {
            policy: config.category_policy,
            fallback: display_name(&config.fallback_category),
            threshold: config.category_similarity,
            synonyms,
            known: Mutex::new(BTreeMap::new()),
        };
        resolver.register_all(config.known_categories.iter().map(String::as_str));
        resolver
    }

    /// Add names that already exist (config, library collections).
    pub fn register_all<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let mut known = self.lock();
        for name in names {
            let display = display_name(name);
            let key = normalize_key(&display);
            if !key.is_empty() {
                known.entry(key).or_insert(display);
            }
        }
    }

    /// Display names currently known, sorted.
    pub fn known(&self) -> Vec<String> {
        self.lock().values().cloned().collect()
    }

    /// Reconcile a proposal into the category the paper will be filed under.
    pub fn resolve(&self, proposed: &str) -> String {
        let mut label = display_name(proposed);
        let mut key = normalize_key(&label);
        if let Some(canonical) = self.synonyms.get(&key) {
            label = canonical.clone();
            key = normalize_key(canonical);
        }
        if key.is_empty() {
            return self.fallback_registered();
        }

        let mut known = self.lock();
        if let Some(existing) = known.get(&key) {
            return existing.clone();
        }

        match self.policy {
            CategoryPolicy::Permissive => {
                debug!("Registering new category '{}'", label);
                known.insert(key, label.clone());
                label
            }
            CategoryPolicy::Strict => {
                let proposal = label.to_lowercase();
                let best = known
                    .values()
                    .map(|name| (strsim::normalized_levenshtein(&proposal, &name.to_lowercase()), name))
                    .max_by(|a, b| a.0.total_cmp(&b.0));
                match best {
                    Some((score, name)) if score >= self.threshold => {
                        debug!("Category '{}' mapped to '{}' ({:.2})", proposed, name, score);
                        name.clone()
                    }
                    _ => {
                        debug!("Category '{}' has no close match, using '{}'", proposed, self.fallback);
                        let fb_key = normalize_key(&self.fallback);
                        known.entry(fb_key).or_insert_with(|| self.fallback.clone()).clone()
                    }
                }
            }
        }
    }

    fn fallback_registered(&self) -> String {
        let mut known = self.lock();
        known
            .entry(normalize_key(&self.fallback))
            .or_insert_with(|| self.fallback.clone())
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.known.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Lowercase alphanumerics only: `"Multi-Modal  LLMs"` → `"multimodalllms"`.
pub fn normalize_key(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Name as it appears in directories and collections: whitespace collapsed,
/// path-illegal characters removed.
pub fn display_name(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| !PATH_ILLEGAL.contains(*c)).collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

const PATH_ILLEGAL: &str = r#"\/*?:"<>|"#;
