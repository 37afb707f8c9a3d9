//! Lock-free publication of the active matcher.

use std::sync::Arc;

use arc_swap::ArcSwap;

use super::domain::DomainMatcher;

/// Holds the active [`DomainMatcher`] snapshot.
///
/// `current()` never blocks a publisher and never observes a torn pointer;
/// a query captures one `Arc` at entry and keeps using that reference for
/// the rest of the request, so a swap mid-query cannot split its view. The
/// previous snapshot is reclaimed once the last in-flight reader drops its
/// guard.
///
/// # Example
///
/// ```
/// use dnsmesh::matcher::{DomainMatcher, MatcherHolder};
///
/// let holder = MatcherHolder::new(DomainMatcher::empty());
/// assert!(holder.current().evaluate("example.com").is_none());
///
/// holder.publish(DomainMatcher::from_rules(["example.com"]));
/// assert!(holder.current().evaluate("example.com").is_some());
/// ```
pub struct MatcherHolder {
    current: ArcSwap<DomainMatcher>,
}

impl MatcherHolder {
    /// Create a holder with an initial snapshot.
    #[must_use]
    pub fn new(initial: DomainMatcher) -> Self {
        Self {
            current: ArcSwap::new(Arc::new(initial)),
        }
    }

    /// Publish a new snapshot, replacing the previous one whole.
    pub fn publish(&self, matcher: DomainMatcher) {
        self.current.store(Arc::new(matcher));
    }

    /// Get the current snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<DomainMatcher> {
        self.current.load_full()
    }
}

impl std::fmt::Debug for MatcherHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatcherHolder")
            .field("rules", &self.current.load().rule_count())
            .finish()
    }
}

impl Default for MatcherHolder {
    fn default() -> Self {
        Self::new(DomainMatcher::empty())
    }
}
