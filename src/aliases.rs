//! Static alias table mapping free-text role strings to canonical role names.

/// Lowercase alias -> canonical display name.
pub const ROLE_ALIASES: &[(&str, &str)] = &[
    ("owner", "Owner"),
    ("admin", "Administrator"),
    ("administrator", "Administrator"),
    ("member", "Member"),
    ("user", "Member"),
    ("employee", "Member"),
    ("manager", "Manager"),
    ("hr", "HR"),
    ("lead", "Lead"),
];

/// Map a raw role string to its canonical name. Strings absent from the
/// table pass through unchanged (trimmed).
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let key = trimmed.to_lowercase();
    ROLE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

/// Distinct canonical names in table order.
pub fn canonical_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Vec::new();
    for (_, canonical) in ROLE_ALIASES {
        if !names.contains(canonical) {
            names.push(canonical);
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_case_insensitive() {
        assert_eq!(normalize("Owner"), "Owner");
        assert_eq!(normalize("owner"), "Owner");
        assert_eq!(normalize("OWNER"), "Owner");
    }

    #[test]
    fn unmapped_aliases_pass_through() {
        assert_eq!(normalize("Pilot"), "Pilot");
        assert_eq!(normalize("pilot"), "pilot");
    }

    #[test]
    fn synonyms_collapse_to_one_name() {
        assert_eq!(normalize("admin"), "Administrator");
        assert_eq!(normalize("Administrator"), "Administrator");
        assert_eq!(normalize("user"), "Member");
        assert_eq!(normalize("employee"), "Member");
        assert_eq!(normalize(" hr "), "HR");
    }

    #[test]
    fn canonical_names_are_distinct() {
        assert_eq!(
            canonical_names(),
            vec!["Owner", "Administrator", "Member", "Manager", "HR", "Lead"]
        );
    }
}
