//! Domain name canonicalization.
//!
//! Rule bases and query names go through the same normalization so that
//! `Example.COM.`, `example.com` and an IDNA form like `bücher.de` all land
//! on one canonical spelling before they ever reach the matcher.

use tracing::trace;

/// Canonicalize a domain name.
///
/// The procedure: trim surrounding whitespace, strip a single trailing dot,
/// lowercase, then IDNA-map to ASCII (punycode). The second element is the
/// effective TLD+1 under the public suffix list, best-effort.
///
/// An empty canonical form means "do not match; do not insert". It is
/// produced for empty input and for names the IDNA mapping rejects.
///
/// # Example
///
/// ```
/// use dnsmesh::matcher::normalize_domain;
///
/// let (canonical, registrable) = normalize_domain("WWW.Example.COM.");
/// assert_eq!(canonical, "www.example.com");
/// assert_eq!(registrable.as_deref(), Some("example.com"));
///
/// let (canonical, _) = normalize_domain("bücher.de");
/// assert_eq!(canonical, "xn--bcher-kva.de");
/// ```
#[must_use]
pub fn normalize_domain(raw: &str) -> (String, Option<String>) {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return (String::new(), None);
    }

    let lowered = trimmed.to_lowercase();
    let canonical = match idna::domain_to_ascii(&lowered) {
        Ok(ascii) => ascii,
        Err(e) => {
            trace!(domain = %lowered, error = %e, "IDNA mapping failed");
            String::new()
        }
    };

    if canonical.is_empty() {
        return (String::new(), None);
    }

    let registrable = psl::domain_str(&canonical).map(str::to_owned);
    (canonical, registrable)
}

/// Reverse the label order of a domain: `a.b.c` → `c.b.a`.
///
/// Storing wildcard bases under their reversed form turns suffix matching
/// into prefix matching on the radix tree.
#[must_use]
pub fn reverse_labels(domain: &str) -> String {
    let mut parts: Vec<&str> = domain.split('.').collect();
    parts.reverse();
    parts.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_strips_trailing_dot() {
        let (canonical, _) = normalize_domain("Example.COM.");
        assert_eq!(canonical, "example.com");
    }

    #[test]
    fn bare_dot_yields_empty() {
        let (canonical, _) = normalize_domain(".");
        assert_eq!(canonical, "");
    }

    #[test]
    fn trims_whitespace() {
        let (canonical, _) = normalize_domain("  example.com  ");
        assert_eq!(canonical, "example.com");
    }

    #[test]
    fn empty_input_yields_empty_canonical() {
        let (canonical, registrable) = normalize_domain("");
        assert_eq!(canonical, "");
        assert!(registrable.is_none());

        let (canonical, _) = normalize_domain("   ");
        assert_eq!(canonical, "");
    }

    #[test]
    fn idna_maps_to_punycode() {
        let (canonical, _) = normalize_domain("bücher.de");
        assert_eq!(canonical, "xn--bcher-kva.de");

        // Already-encoded names pass through unchanged.
        let (canonical, _) = normalize_domain("xn--bcher-kva.de");
        assert_eq!(canonical, "xn--bcher-kva.de");
    }

    #[test]
    fn registrable_domain_under_psl() {
        let (_, registrable) = normalize_domain("deep.sub.example.co.uk");
        assert_eq!(registrable.as_deref(), Some("example.co.uk"));
    }

    #[test]
    fn registrable_absent_for_bare_suffix() {
        let (_, registrable) = normalize_domain("com");
        assert!(registrable.is_none());
    }

    #[test]
    fn reverse_labels_roundtrip() {
        assert_eq!(reverse_labels("a.b.c"), "c.b.a");
        assert_eq!(reverse_labels("example.com"), "com.example");
        assert_eq!(reverse_labels("single"), "single");
        assert_eq!(reverse_labels(&reverse_labels("mail.google.com")), "mail.google.com");
    }
}
