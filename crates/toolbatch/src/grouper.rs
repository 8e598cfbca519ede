//! Partition a batch into per-tool index groups.
//!
//! Actions tagged with an explicit `tool` slug are grouped directly. The
//! rest are classified against an ordered [`RuleTable`] in fixed-size chunks
//! on the parse pool; the first matching rule wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use regex::{Regex, RegexBuilder};
use tracing::{debug, error, info};

use crate::batch::{Metadata, TOOL_KEY, metadata_string};
use crate::lanes::BlockingPool;

/// Built-in detection rules, matched case-insensitively in this order.
pub const DEFAULT_RULES: &[(&str, &str)] = &[
    (r"search\s*\(", "search_engine"),
    (r"calculate\s*\(", "calculator"),
    (r"translate\s*\(", "translator"),
    (r"image\s*\(", "image_processing"),
    (r"geo\s*\(", "geospatial_compute"),
    (r"analyze\s*\(", "data_analysis"),
    (r"ml\s*\(", "ml_inference"),
];

// ── Rule table ────────────────────────────────────────────────────

/// A single `(matcher, slug)` detection rule.
#[derive(Debug, Clone)]
pub struct DetectionRule {
    pattern: Regex,
    slug: String,
}

impl DetectionRule {
    /// Compile a case-insensitive rule.
    pub fn new(pattern: &str, slug: impl Into<String>) -> Result<Self, String> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| format!("invalid detection pattern '{pattern}': {e}"))?;
        Ok(Self {
            pattern,
            slug: slug.into(),
        })
    }

    /// Use an already compiled matcher as-is.
    pub fn from_regex(pattern: Regex, slug: impl Into<String>) -> Self {
        Self {
            pattern,
            slug: slug.into(),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }
}

/// Ordered detection rules. First match wins; no match means undetectable.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<DetectionRule>,
}

impl RuleTable {
    /// An empty table: every unspecified action is undetectable.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Compile a table from `(pattern, slug)` pairs.
    pub fn from_patterns(pairs: &[(&str, &str)]) -> Result<Self, String> {
        let rules = pairs
            .iter()
            .map(|(pattern, slug)| DetectionRule::new(pattern, *slug))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Append a rule (builder pattern).
    pub fn with_rule(mut self, rule: DetectionRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Slug of the first rule matching `action`.
    pub fn detect(&self, action: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(action))
            .map(|rule| rule.slug.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::from_patterns(DEFAULT_RULES).unwrap_or_else(|e| {
            error!("Default detection rules failed to compile: {e}");
            Self::empty()
        })
    }
}

// ── Grouping ──────────────────────────────────────────────────────

/// Result of grouping a batch.
///
/// Every index appears in exactly one of `groups`, `undetected`, or
/// `failed`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grouping {
    /// Slug to ascending original indices.
    pub groups: BTreeMap<String, Vec<usize>>,
    /// Unspecified actions no rule matched.
    pub undetected: Vec<usize>,
    /// Indices whose classification chunk failed.
    pub failed: Vec<usize>,
}

impl Grouping {
    /// Number of indices covered.
    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum::<usize>() + self.undetected.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Classification of one chunk: detected `(slug, index)` pairs and the
/// undetectable indices.
#[derive(Debug, Default)]
struct ChunkResult {
    detected: Vec<(String, usize)>,
    undetected: Vec<usize>,
}

fn classify_chunk(rules: &RuleTable, items: &[(usize, String)]) -> ChunkResult {
    let mut result = ChunkResult::default();
    for (idx, action) in items {
        match rules.detect(action) {
            Some(slug) => result.detected.push((slug.to_string(), *idx)),
            None => result.undetected.push(*idx),
        }
    }
    result
}

/// Explicit tool slug from an action's metadata, if any.
pub fn explicit_tool(meta: Option<&Metadata>) -> Option<String> {
    meta.and_then(|m| m.get(TOOL_KEY)).and_then(metadata_string)
}

/// Group a batch by tool slug.
///
/// Unspecified actions are classified in chunks of `chunk_size` on `pool`.
/// A chunk that fails is logged and its indices land in
/// [`Grouping::failed`].
pub async fn group_actions(
    actions: &[String],
    metadata: &[Metadata],
    rules: &Arc<RuleTable>,
    pool: &BlockingPool,
    chunk_size: usize,
    trace_id: &str,
) -> Grouping {
    let mut grouping = Grouping::default();
    let mut unspecified = Vec::new();

    for idx in 0..actions.len() {
        match explicit_tool(metadata.get(idx)) {
            Some(slug) => grouping.groups.entry(slug).or_default().push(idx),
            None => unspecified.push(idx),
        }
    }

    if unspecified.is_empty() {
        return grouping;
    }

    info!(
        "[{trace_id}] Parsing {} unspecified actions",
        unspecified.len()
    );

    let chunks: Vec<Vec<usize>> = unspecified
        .chunks(chunk_size.max(1))
        .map(<[usize]>::to_vec)
        .collect();

    let handles = chunks.iter().map(|chunk| {
        let rules = Arc::clone(rules);
        let items: Vec<(usize, String)> = chunk
            .iter()
            .filter_map(|&idx| actions.get(idx).map(|a| (idx, a.clone())))
            .collect();
        pool.spawn(move || classify_chunk(&rules, &items))
    });
    let results = join_all(handles).await;

    for (chunk, result) in chunks.into_iter().zip(results) {
        let outcome = match result {
            Ok(inner) => inner,
            Err(e) => Err(crate::lanes::join_error_message(e)),
        };
        match outcome {
            Ok(classified) => {
                for (slug, idx) in classified.detected {
                    grouping.groups.entry(slug).or_default().push(idx);
                }
                grouping.undetected.extend(classified.undetected);
            }
            Err(e) => {
                error!("[{trace_id}] Parse chunk failed: {e}");
                grouping.failed.extend(chunk);
            }
        }
    }

    for indices in grouping.groups.values_mut() {
        indices.sort_unstable();
    }
    grouping.undetected.sort_unstable();
    grouping.failed.sort_unstable();

    debug!(
        "[{trace_id}] Grouped into {} tools, {} undetected, {} failed",
        grouping.groups.len(),
        grouping.undetected.len(),
        grouping.failed.len()
    );
    grouping
}
