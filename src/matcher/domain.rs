//! The compiled domain matcher.
//!
//! A [`DomainMatcher`] is an immutable snapshot compiled from a flat rule
//! list. Lookup order: catch-all, exact set, then the reverse-label radix
//! walk for wildcards. See the module docs for the data-structure rationale.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use radix_trie::Trie;
use tracing::debug;

use super::bloom::BloomFilter;
use super::normalize::{normalize_domain, reverse_labels};

/// Rule count above which the bloom prefilter is instantiated.
pub const BLOOM_THRESHOLD: usize = 10_000;

/// The prefilter is sized for this multiple of the rule count.
const BLOOM_CAPACITY_FACTOR: usize = 4;

/// Target false positive rate for the prefilter.
const BLOOM_FP_RATE: f64 = 1e-4;

/// How a rule matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// The query equals the rule domain.
    Exact,
    /// The query is strictly beneath a wildcard base (or the catch-all hit).
    Wildcard,
}

/// A successful policy match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRule {
    /// The rule in its original syntax: the domain itself, `*.base`, or `*`.
    pub rule: String,
    /// Whether the match was exact or wildcard.
    pub kind: RuleKind,
}

/// A wildcard rule as stored in the radix tree.
#[derive(Debug)]
struct WildcardRule {
    /// Canonical base, forward orientation.
    base: String,
    /// Label count of the base, precomputed for the apex-exclusion guard.
    labels: usize,
}

/// Prefilter counters, updated on the query path.
#[derive(Debug, Default)]
struct MatcherStats {
    bloom_probes: AtomicU64,
    bloom_misses: AtomicU64,
}

/// Snapshot of matcher statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatcherStatsSnapshot {
    /// Queries that probed the bloom prefilter.
    pub bloom_probes: u64,
    /// Probes the prefilter reported as definitely-absent.
    pub bloom_misses: u64,
}

/// An immutable, compiled rule set.
///
/// Built once per policy update and shared by reference; never mutated after
/// construction. Replacement happens by whole-snapshot swap through
/// [`super::MatcherHolder`].
///
/// # Example
///
/// ```
/// use dnsmesh::matcher::{DomainMatcher, RuleKind};
///
/// let matcher = DomainMatcher::from_rules(["example.com", "*.ads.net"]);
///
/// assert_eq!(matcher.evaluate("example.com").unwrap().kind, RuleKind::Exact);
/// assert_eq!(matcher.evaluate("a.ads.net").unwrap().rule, "*.ads.net");
/// assert!(matcher.evaluate("ads.net").is_none());
/// ```
pub struct DomainMatcher {
    /// Canonical domains for exact rules.
    exact: HashSet<String>,
    /// Wildcard rules keyed by the reverse-labelled canonical base.
    wildcards: Trie<String, WildcardRule>,
    /// Count of wildcard rules (the trie counts nodes, not values).
    wildcard_count: usize,
    /// Advisory prefilter over all rule bases; only for large rule sets.
    prefilter: Option<BloomFilter>,
    /// Set iff the literal rule `*` appeared.
    match_all: bool,
    /// Prefilter counters.
    stats: MatcherStats,
}

impl DomainMatcher {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> DomainMatcherBuilder {
        DomainMatcherBuilder::new()
    }

    /// An empty matcher that matches nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            exact: HashSet::new(),
            wildcards: Trie::new(),
            wildcard_count: 0,
            prefilter: None,
            match_all: false,
            stats: MatcherStats::default(),
        }
    }

    /// Compile a matcher from a flat rule list.
    ///
    /// Rule syntax per line: empty (skipped), `*` (catch-all), `*.<name>`
    /// (wildcard subtree excluding the apex), `<name>` (exact). Rules that
    /// fail normalization are skipped. Duplicates are idempotent and input
    /// order is irrelevant.
    pub fn from_rules<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = Self::builder();
        for rule in rules {
            builder = builder.add_rule(rule.as_ref());
        }
        builder.build()
    }

    /// Classify a query name against the rule set.
    ///
    /// Returns `None` for unmatched or empty-normalizing names. The query is
    /// normalized with the same procedure as rule bases, so case, trailing
    /// dots and IDNA forms are all equivalent.
    ///
    /// Lookup order:
    ///
    /// 1. catch-all (`*`) dominates every non-empty query,
    /// 2. exact set,
    /// 3. reverse-label radix walk: each label-boundary prefix of the
    ///    reversed query is probed; hits must have strictly fewer labels
    ///    than the query (the wildcard excludes its apex) and the longest
    ///    prefix wins.
    #[must_use]
    pub fn evaluate(&self, query: &str) -> Option<MatchedRule> {
        let (q, _registrable) = normalize_domain(query);
        if q.is_empty() {
            return None;
        }

        if self.match_all {
            return Some(MatchedRule {
                rule: "*".to_string(),
                kind: RuleKind::Wildcard,
            });
        }

        // Advisory prefilter: a miss proves no rule base equals q, but
        // wildcard hits live at suffix depth, so the walk below still runs.
        if let Some(prefilter) = &self.prefilter {
            self.stats.bloom_probes.fetch_add(1, Ordering::Relaxed);
            if !prefilter.contains(&q) {
                self.stats.bloom_misses.fetch_add(1, Ordering::Relaxed);
            }
        }

        if self.exact.contains(&q) {
            return Some(MatchedRule {
                rule: q,
                kind: RuleKind::Exact,
            });
        }

        let rev = reverse_labels(&q);
        let query_labels = q.split('.').count();

        let mut best: Option<&WildcardRule> = None;
        let mut best_len = 0usize;

        let mut prefix = String::with_capacity(rev.len());
        for label in rev.split('.') {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(label);

            if let Some(rule) = self.wildcards.get(&prefix) {
                // Equal label counts mean the query IS the wildcard base;
                // `*.name` does not cover `name` itself.
                if query_labels > rule.labels && prefix.len() > best_len {
                    best_len = prefix.len();
                    best = Some(rule);
                }
            }
        }

        best.map(|rule| MatchedRule {
            rule: format!("*.{}", rule.base),
            kind: RuleKind::Wildcard,
        })
    }

    /// Whether the catch-all rule is active.
    #[must_use]
    pub fn is_match_all(&self) -> bool {
        self.match_all
    }

    /// Whether the matcher has any rules (including the catch-all).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.match_all && self.rule_count() == 0
    }

    /// Total number of exact and wildcard rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.exact.len() + self.wildcard_count
    }

    /// Number of exact rules.
    #[must_use]
    pub fn exact_count(&self) -> usize {
        self.exact.len()
    }

    /// Number of wildcard rules.
    #[must_use]
    pub fn wildcard_count(&self) -> usize {
        self.wildcard_count
    }

    /// Whether the bloom prefilter was instantiated for this rule set.
    #[must_use]
    pub fn has_prefilter(&self) -> bool {
        self.prefilter.is_some()
    }

    /// Snapshot of the prefilter counters.
    #[must_use]
    pub fn stats(&self) -> MatcherStatsSnapshot {
        MatcherStatsSnapshot {
            bloom_probes: self.stats.bloom_probes.load(Ordering::Relaxed),
            bloom_misses: self.stats.bloom_misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DomainMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainMatcher")
            .field("exact", &self.exact.len())
            .field("wildcards", &self.wildcard_count)
            .field("match_all", &self.match_all)
            .field("prefilter", &self.prefilter.is_some())
            .finish()
    }
}

/// Builder collecting raw rules before compilation.
///
/// # Example
///
/// ```
/// use dnsmesh::matcher::DomainMatcherBuilder;
///
/// let matcher = DomainMatcherBuilder::new()
///     .add_rule("example.com")
///     .add_rule("*.ads.net")
///     .build();
/// assert_eq!(matcher.rule_count(), 2);
/// ```
#[derive(Debug, Default)]
pub struct DomainMatcherBuilder {
    raw: Vec<String>,
}

impl DomainMatcherBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one raw rule line.
    #[must_use]
    pub fn add_rule(mut self, rule: impl Into<String>) -> Self {
        self.raw.push(rule.into());
        self
    }

    /// Compile the collected rules.
    #[must_use]
    pub fn build(self) -> DomainMatcher {
        let mut matcher = DomainMatcher::empty();

        if self.raw.len() > BLOOM_THRESHOLD {
            matcher.prefilter = Some(BloomFilter::with_capacity(
                self.raw.len() * BLOOM_CAPACITY_FACTOR,
                BLOOM_FP_RATE,
            ));
        }

        for raw in &self.raw {
            let rule = raw.trim();
            if rule.is_empty() {
                continue;
            }

            if rule == "*" {
                matcher.match_all = true;
                continue;
            }

            let (is_wildcard, base) = match rule.strip_prefix("*.") {
                Some(base) => (true, base),
                None => (false, rule),
            };

            let (canonical, _registrable) = normalize_domain(base);
            if canonical.is_empty() {
                debug!(rule = %rule, "skipping rule that failed normalization");
                continue;
            }

            if is_wildcard {
                let record = WildcardRule {
                    labels: canonical.split('.').count(),
                    base: canonical.clone(),
                };
                let key = reverse_labels(&canonical);
                if matcher.wildcards.insert(key, record).is_none() {
                    matcher.wildcard_count += 1;
                }
            } else {
                matcher.exact.insert(canonical.clone());
            }

            if let Some(prefilter) = matcher.prefilter.as_mut() {
                prefilter.insert(&canonical);
            }
        }

        matcher
    }

    /// Number of raw rules collected so far.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.raw.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Exact Match Tests
    // ========================================================================

    #[test]
    fn exact_match_basic() {
        let matcher = DomainMatcher::from_rules(["example.com"]);

        let hit = matcher.evaluate("example.com").unwrap();
        assert_eq!(hit.rule, "example.com");
        assert_eq!(hit.kind, RuleKind::Exact);
    }

    #[test]
    fn exact_match_no_subdomain() {
        let matcher = DomainMatcher::from_rules(["example.com"]);

        assert!(matcher.evaluate("www.example.com").is_none());
        assert!(matcher.evaluate("deep.sub.example.com").is_none());
    }

    #[test]
    fn exact_match_case_and_dot_insensitive() {
        let matcher = DomainMatcher::from_rules(["Example.COM."]);

        assert!(matcher.evaluate("example.com").is_some());
        assert!(matcher.evaluate("EXAMPLE.COM").is_some());
        assert!(matcher.evaluate("example.com.").is_some());
    }

    #[test]
    fn duplicates_are_idempotent() {
        let matcher =
            DomainMatcher::from_rules(["example.com", "example.com", "*.ads.net", "*.ads.net"]);

        assert_eq!(matcher.exact_count(), 1);
        assert_eq!(matcher.wildcard_count(), 1);
    }

    // ========================================================================
    // Wildcard Match Tests
    // ========================================================================

    #[test]
    fn wildcard_matches_subtree() {
        let matcher = DomainMatcher::from_rules(["*.example.com"]);

        let hit = matcher.evaluate("a.example.com").unwrap();
        assert_eq!(hit.rule, "*.example.com");
        assert_eq!(hit.kind, RuleKind::Wildcard);

        assert!(matcher.evaluate("deep.b.example.com").is_some());
    }

    #[test]
    fn wildcard_excludes_apex() {
        let matcher = DomainMatcher::from_rules(["*.example.com"]);

        assert!(matcher.evaluate("example.com").is_none());
    }

    #[test]
    fn wildcard_requires_label_boundary() {
        let matcher = DomainMatcher::from_rules(["*.ads.net"]);

        assert!(matcher.evaluate("badads.net").is_none());
        assert!(matcher.evaluate("ads.net.evil.org").is_none());
    }

    #[test]
    fn exact_beats_wildcard_for_apex() {
        let matcher = DomainMatcher::from_rules(["example.com", "*.com"]);

        let hit = matcher.evaluate("example.com").unwrap();
        assert_eq!(hit.kind, RuleKind::Exact);
        assert_eq!(hit.rule, "example.com");
    }

    #[test]
    fn longest_suffix_wins() {
        let matcher = DomainMatcher::from_rules(["*.com", "*.example.com"]);

        let hit = matcher.evaluate("x.example.com").unwrap();
        assert_eq!(hit.rule, "*.example.com");

        // A name under .com but not under example.com takes the shorter rule.
        let hit = matcher.evaluate("x.other.com").unwrap();
        assert_eq!(hit.rule, "*.com");
    }

    #[test]
    fn overlapping_wildcards_deep_name() {
        let matcher = DomainMatcher::from_rules(["*.com", "*.example.com", "*.a.example.com"]);

        let hit = matcher.evaluate("x.a.example.com").unwrap();
        assert_eq!(hit.rule, "*.a.example.com");
    }

    // ========================================================================
    // Catch-All Tests
    // ========================================================================

    #[test]
    fn catch_all_dominates() {
        let matcher = DomainMatcher::from_rules(["*", "example.com"]);

        let hit = matcher.evaluate("anything.test").unwrap();
        assert_eq!(hit.rule, "*");
        assert_eq!(hit.kind, RuleKind::Wildcard);

        // Even names with their own exact rule report the catch-all.
        let hit = matcher.evaluate("example.com").unwrap();
        assert_eq!(hit.rule, "*");
    }

    #[test]
    fn catch_all_only() {
        let matcher = DomainMatcher::from_rules(["*"]);

        assert!(matcher.is_match_all());
        assert!(matcher.evaluate("anything.test").is_some());
        assert!(matcher.evaluate("").is_none());
    }

    // ========================================================================
    // Normalization Equivalence Tests
    // ========================================================================

    #[test]
    fn build_perturbation_equivalence() {
        let plain = DomainMatcher::from_rules(["example.com", "*.ads.net"]);
        let perturbed = DomainMatcher::from_rules(["Example.COM.", "*.ADS.net."]);

        for name in ["example.com", "www.example.com", "x.ads.net", "ads.net"] {
            assert_eq!(
                plain.evaluate(name).is_some(),
                perturbed.evaluate(name).is_some(),
                "divergence on {name}"
            );
        }
    }

    #[test]
    fn idna_equivalence() {
        let matcher = DomainMatcher::from_rules(["bücher.de"]);

        let unicode = matcher.evaluate("bücher.de");
        let punycode = matcher.evaluate("xn--bcher-kva.de");
        assert_eq!(unicode, punycode);
        assert!(unicode.is_some());
    }

    #[test]
    fn idna_wildcard_equivalence() {
        let matcher = DomainMatcher::from_rules(["*.bücher.de"]);

        assert!(matcher.evaluate("shop.xn--bcher-kva.de").is_some());
        assert!(matcher.evaluate("shop.bücher.de").is_some());
        assert!(matcher.evaluate("xn--bcher-kva.de").is_none());
    }

    // ========================================================================
    // Edge Cases
    // ========================================================================

    #[test]
    fn empty_query_never_matches() {
        let matcher = DomainMatcher::from_rules(["*", "example.com", "*.ads.net"]);
        assert!(matcher.evaluate("").is_none());
        assert!(matcher.evaluate("   ").is_none());
    }

    #[test]
    fn empty_matcher_matches_nothing() {
        let matcher = DomainMatcher::empty();
        assert!(matcher.is_empty());
        assert!(matcher.evaluate("example.com").is_none());
    }

    #[test]
    fn blank_and_invalid_rules_are_skipped() {
        let matcher = DomainMatcher::from_rules(["", "  ", "example.com", "*."]);
        assert_eq!(matcher.rule_count(), 1);
    }

    #[test]
    fn ordering_is_irrelevant() {
        let forward = DomainMatcher::from_rules(["*.com", "*.example.com", "a.b"]);
        let backward = DomainMatcher::from_rules(["a.b", "*.example.com", "*.com"]);

        for name in ["x.example.com", "y.com", "a.b", "other.org"] {
            assert_eq!(forward.evaluate(name), backward.evaluate(name));
        }
    }

    // ========================================================================
    // Prefilter Tests
    // ========================================================================

    #[test]
    fn prefilter_only_above_threshold() {
        let small = DomainMatcher::from_rules(["example.com"]);
        assert!(!small.has_prefilter());

        let rules: Vec<String> = (0..=BLOOM_THRESHOLD)
            .map(|i| format!("domain{i}.example.com"))
            .collect();
        let large = DomainMatcher::from_rules(&rules);
        assert!(large.has_prefilter());
    }

    #[test]
    fn prefilter_is_advisory_only() {
        let mut rules: Vec<String> = (0..=BLOOM_THRESHOLD)
            .map(|i| format!("domain{i}.example.com"))
            .collect();
        rules.push("*.ads.net".to_string());
        let matcher = DomainMatcher::from_rules(&rules);

        // A wildcard subtree name is absent from the prefilter (only bases
        // are inserted) yet must still match through the radix walk.
        assert!(matcher.evaluate("banner.ads.net").is_some());
        assert!(matcher.evaluate("domain17.example.com").is_some());

        let stats = matcher.stats();
        assert!(stats.bloom_probes >= 2);
    }

    #[test]
    fn prefilter_miss_counter_advances() {
        let rules: Vec<String> = (0..=BLOOM_THRESHOLD)
            .map(|i| format!("domain{i}.example.com"))
            .collect();
        let matcher = DomainMatcher::from_rules(&rules);

        for name in ["absent-one.org", "absent-two.org", "absent-three.org"] {
            assert!(matcher.evaluate(name).is_none());
        }

        let stats = matcher.stats();
        assert_eq!(stats.bloom_probes, 3);
        // At a 1e-4 false positive rate, three absent probes cannot all hit.
        assert!(stats.bloom_misses >= 1);
    }
}
