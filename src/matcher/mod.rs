//! Domain policy matcher.
//!
//! This module decides, per query, whether a domain is covered by the active
//! block policy. It supports three rule shapes:
//!
//! - **Exact**: `example.com` matches only `example.com`
//! - **Wildcard subtree**: `*.example.com` matches any name strictly beneath
//!   `example.com`, excluding the apex itself
//! - **Catch-all**: the literal `*` matches every non-empty name
//!
//! # Architecture
//!
//! Wildcard resolution is the interesting part. Rule bases are stored in a
//! radix tree keyed by their **reverse-labelled** form (`a.b.c` → `c.b.a`),
//! which turns suffix matching into prefix matching: a query enumerates the
//! label-boundary prefixes of its own reversed name and probes the tree once
//! per depth. Among the hits that pass the label-count guard (the wildcard
//! excludes its apex), the longest prefix wins, which is the longest suffix
//! in forward orientation.
//!
//! Rule sets above [`BLOOM_THRESHOLD`] entries additionally carry a bloom
//! prefilter over all rule bases. The probe is advisory: a miss is recorded
//! in the matcher statistics but never short-circuits the exact/radix
//! lookups.
//!
//! A built [`DomainMatcher`] is immutable. Replacement is a whole-snapshot
//! swap through [`MatcherHolder`], so concurrent queries always observe a
//! consistent rule set.
//!
//! # Example
//!
//! ```
//! use dnsmesh::matcher::{DomainMatcher, RuleKind};
//!
//! let matcher = DomainMatcher::from_rules(["example.com", "*.ads.net"]);
//!
//! let hit = matcher.evaluate("banner.ads.net").unwrap();
//! assert_eq!(hit.rule, "*.ads.net");
//! assert_eq!(hit.kind, RuleKind::Wildcard);
//!
//! // The wildcard excludes its own apex.
//! assert!(matcher.evaluate("ads.net").is_none());
//! ```

mod bloom;
mod domain;
mod holder;
mod normalize;

pub use bloom::BloomFilter;
pub use domain::{
    DomainMatcher, DomainMatcherBuilder, MatchedRule, MatcherStatsSnapshot, RuleKind,
    BLOOM_THRESHOLD,
};
pub use holder::MatcherHolder;
pub use normalize::{normalize_domain, reverse_labels};
