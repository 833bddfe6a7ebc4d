//! Split tunneling policy

use std::collections::BTreeSet;

/// Applications whose traffic must not enter the tunnel
///
/// Always contains `self_id`, so the client's own connection to the server
/// never loops back through the interface. Any installed application whose
/// identifier starts with one of `bypass_prefixes` (trimmed, case-sensitive)
/// is added as well. Blank prefixes are ignored.
pub fn disallowed_applications(
    self_id: &str,
    installed: &[String],
    bypass_prefixes: &[String],
) -> BTreeSet<String> {
    let prefixes: Vec<&str> = bypass_prefixes
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();

    let mut disallowed = BTreeSet::new();
    disallowed.insert(self_id.to_string());

    for app in installed {
        if prefixes.iter().any(|prefix| app.starts_with(prefix)) {
            disallowed.insert(app.clone());
        }
    }

    tracing::debug!("Bypass applications: {:?}", disallowed);
    disallowed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_self_always_included() {
        let set = disallowed_applications("vtunnel", &[], &[]);
        assert_eq!(set.len(), 1);
        assert!(set.contains("vtunnel"));
    }

    #[test]
    fn test_prefix_match_is_trimmed() {
        let installed = strings(&["com.bank.mobile", "com.bankrupt", "org.mail"]);
        let set = disallowed_applications("vtunnel", &installed, &strings(&["  com.bank.  "]));
        assert!(set.contains("com.bank.mobile"));
        assert!(!set.contains("com.bankrupt"));
        assert!(!set.contains("org.mail"));
    }

    #[test]
    fn test_prefix_match_is_case_sensitive() {
        let installed = strings(&["Com.Bank.mobile"]);
        let set = disallowed_applications("vtunnel", &installed, &strings(&["com.bank"]));
        assert!(!set.contains("Com.Bank.mobile"));
    }

    #[test]
    fn test_blank_prefix_matches_nothing() {
        let installed = strings(&["org.mail"]);
        let set = disallowed_applications("vtunnel", &installed, &strings(&["   "]));
        assert_eq!(set.len(), 1);
    }
}
