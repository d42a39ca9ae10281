//! Repository rewrites.
//!
//! Applies per-registry regex rewrites to the repository portion of an
//! image reference before any mirror endpoint is contacted. Patterns are
//! evaluated in sorted order so results are reproducible; a pattern that
//! fails to compile is logged once and skipped without affecting the rest.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;

use super::Registry;
use crate::reference::ImageReference;

/// Compiles and applies mirror rewrites, caching compiled patterns for the
/// process lifetime. Patterns that fail to compile are cached as `None` so
/// each is compiled (and warned about) at most once.
#[derive(Default)]
pub(crate) struct Rewriter {
    cache: Mutex<HashMap<String, Option<Regex>>>,
}

impl Rewriter {
    /// Rewrite the repository of `reference` according to the mirror
    /// configured for its registry, if any. Only an exact-host mirror entry
    /// is consulted; the wildcard mirror never rewrites.
    pub(crate) fn rewrite(
        &self,
        registry: &Registry,
        reference: &ImageReference,
    ) -> ImageReference {
        let Some(mirror) = registry.mirror_for(&reference.registry) else {
            return reference.clone();
        };

        let mut patterns: Vec<&String> = mirror.rewrites.keys().collect();
        patterns.sort();

        for pattern in patterns {
            let compiled = {
                let mut cache = self.cache.lock().expect("rewrite cache poisoned");
                match cache.get(pattern.as_str()) {
                    Some(compiled) => compiled.clone(),
                    None => {
                        let compiled = match Regex::new(pattern) {
                            Ok(re) => Some(re),
                            Err(e) => {
                                tracing::warn!(
                                    pattern = %pattern,
                                    error = %e,
                                    "Skipping rewrite with invalid pattern"
                                );
                                None
                            }
                        };
                        cache.insert(pattern.clone(), compiled.clone());
                        compiled
                    }
                }
            };

            let Some(re) = compiled else { continue };
            if re.is_match(&reference.repository) {
                let replacement = &mirror.rewrites[pattern.as_str()];
                let rewritten = replace_all(&re, &reference.repository, replacement);
                tracing::debug!(
                    repository = %reference.repository,
                    rewritten = %rewritten,
                    pattern = %pattern,
                    "Rewrote repository"
                );
                return reference.with_repository(rewritten);
            }
        }

        reference.clone()
    }
}

/// Replace every match of `re` in `haystack`, expanding `$1`-style
/// backreferences, but skip an empty match that immediately follows a
/// previous match. Without the skip, patterns like `(.*)` would apply a
/// second time to the empty string at the end of the input.
fn replace_all(re: &Regex, haystack: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(haystack.len());
    let mut last_match_end = 0;
    let mut last_copy = 0;

    for caps in re.captures_iter(haystack) {
        let m = caps.get(0).expect("capture group 0 always present");
        out.push_str(&haystack[last_copy..m.start()]);
        if m.end() > last_match_end || m.start() == 0 {
            caps.expand(replacement, &mut out);
        }
        last_match_end = m.end();
        last_copy = m.end();
    }
    out.push_str(&haystack[last_copy..]);
    out
}
