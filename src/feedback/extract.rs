//! Recovering the failed recipient address from a bounce body.
//!
//! Patterns are ordered from most to least structured; the first valid
//! hit wins. Addresses belonging to mail infrastructure itself are never
//! returned, since a transcript usually mentions the relay alongside the
//! failed recipient.

use std::sync::LazyLock;

use regex::Regex;

static FINAL_RECIPIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^(?:final|original)-recipient:\s*(?:rfc822;)?\s*<?([^\s<>;]+@[^\s<>;]+)>?")
        .expect("static pattern")
});

static ANGLE_BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^\s<>]+@[^\s<>]+)>").expect("static pattern"));

static TO_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^to:\s*<?([^\s<>]+@[^\s<>]+?)>?\s*$").expect("static pattern")
});

static BARE_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9][A-Za-z0-9._%+-]*@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
        .expect("static pattern")
});

static INFRASTRUCTURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(mailer[-_]?daemon|postmaster|no[-_.]?reply|abuse|bounces?)@")
        .expect("static pattern")
});

/// Pulls the failed recipient address out of bounce text.
#[derive(Debug, Default)]
pub struct AddressExtractor;

impl AddressExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract the most plausible failed-recipient address, or `None`
    /// when nothing usable is present (the caller stores the signal
    /// unresolved in that case).
    pub fn extract(&self, body: &str) -> Option<String> {
        if let Some(addr) = first_capture(&FINAL_RECIPIENT, body) {
            return Some(addr);
        }
        if let Some(addr) = first_capture(&ANGLE_BRACKETED, body) {
            return Some(addr);
        }
        if let Some(addr) = first_capture(&TO_LINE, body) {
            return Some(addr);
        }
        BARE_ADDRESS
            .find_iter(body)
            .map(|m| m.as_str())
            .find(|addr| usable(addr))
            .map(|addr| addr.trim_end_matches(['.', ',']).to_lowercase())
    }
}

fn first_capture(pattern: &Regex, body: &str) -> Option<String> {
    pattern
        .captures_iter(body)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .find(|addr| usable(addr))
        .map(|addr| addr.trim_end_matches(['.', ',']).to_lowercase())
}

fn usable(addr: &str) -> bool {
    addr.contains('@') && !INFRASTRUCTURE.is_match(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_final_recipient_wins() {
        let body = "Reporting-MTA: dns; mx.example.com\n\
                    Final-Recipient: rfc822; jobs@acme.example\n\
                    Action: failed\n\
                    Diagnostic-Code: smtp; 550 5.1.1 <other@elsewhere.example> user unknown\n";
        let addr = AddressExtractor::new().extract(body);
        assert_eq!(addr.as_deref(), Some("jobs@acme.example"));
    }

    #[test]
    fn angle_brackets_next() {
        let body = "The following address failed:\n  <Jobs@Acme.Example>\n550 User unknown";
        let addr = AddressExtractor::new().extract(body);
        assert_eq!(addr.as_deref(), Some("jobs@acme.example"));
    }

    #[test]
    fn to_line_prefix() {
        let body = "Delivery failed for the message below.\nTo: careers@globex.example\n";
        let addr = AddressExtractor::new().extract(body);
        assert_eq!(addr.as_deref(), Some("careers@globex.example"));
    }

    #[test]
    fn bare_scan_skips_infrastructure() {
        let body = "mailer-daemon@mx.example.com could not deliver to jobs@acme.example.";
        let addr = AddressExtractor::new().extract(body);
        assert_eq!(addr.as_deref(), Some("jobs@acme.example"));
    }

    #[test]
    fn nothing_usable_is_none() {
        let extractor = AddressExtractor::new();
        assert_eq!(extractor.extract("delivery failed, see attached"), None);
        assert_eq!(
            extractor.extract("contact postmaster@mx.example.com for details"),
            None
        );
        assert_eq!(extractor.extract(""), None);
    }
}
