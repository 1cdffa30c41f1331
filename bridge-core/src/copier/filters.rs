// bridge-core/src/copier/filters.rs
//
// Pure per-follower filtering: magic-number allow/deny and the ordered
// symbol mapping pipeline.

use crate::models::FollowerConfig;

/// Magic-number filter. Whitelist is checked first, then blacklist; both
/// empty means allow-all. A missing magic number counts as 0.
pub fn magic_allows(follower: &FollowerConfig, magic: Option<i64>) -> bool {
    let magic = magic.unwrap_or(0);
    if !follower.magic_number_whitelist.is_empty()
        && !follower.magic_number_whitelist.contains(&magic)
    {
        return false;
    }
    if !follower.magic_number_blacklist.is_empty()
        && follower.magic_number_blacklist.contains(&magic)
    {
        return false;
    }
    true
}

/// Map a leader symbol onto the follower's broker, in order:
/// 1. strip the leader's configured suffix,
/// 2. blacklist (base or raw) -> None,
/// 3. whitelist non-empty and neither base nor raw in it -> None,
/// 4. alias match (base or raw) -> the alias target, suffix NOT applied,
/// 5. otherwise base + follower suffix.
pub fn map_symbol(leader_suffix: &str, follower: &FollowerConfig, raw: &str) -> Option<String> {
    let base = if !leader_suffix.is_empty() {
        raw.strip_suffix(leader_suffix).unwrap_or(raw)
    } else {
        raw
    };

    let matches_entry = |entry: &String| entry == base || entry == raw;

    if follower.symbol_blacklist.iter().any(matches_entry) {
        return None;
    }
    if !follower.symbol_whitelist.is_empty()
        && !follower.symbol_whitelist.iter().any(matches_entry)
    {
        return None;
    }
    if let Some(alias) = follower
        .symbol_aliases
        .iter()
        .find(|a| a.master_symbol == base || a.master_symbol == raw)
    {
        return Some(alias.slave_symbol.clone());
    }
    Some(format!("{}{}", base, follower.symbol_suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SymbolAlias;

    fn follower() -> FollowerConfig {
        serde_json::from_str(r#"{"id":"f1","accountId":"200555"}"#).unwrap()
    }

    #[test]
    fn test_magic_allow_all_by_default() {
        assert!(magic_allows(&follower(), Some(777)));
        assert!(magic_allows(&follower(), None));
    }

    #[test]
    fn test_magic_whitelist_only() {
        let mut f = follower();
        f.magic_number_whitelist = vec![111, 222];
        assert!(magic_allows(&f, Some(111)));
        assert!(!magic_allows(&f, Some(333)));
        assert!(!magic_allows(&f, None));
    }

    #[test]
    fn test_magic_blacklist_only() {
        let mut f = follower();
        f.magic_number_blacklist = vec![666];
        assert!(magic_allows(&f, Some(1)));
        assert!(!magic_allows(&f, Some(666)));
    }

    #[test]
    fn test_magic_whitelist_checked_before_blacklist() {
        let mut f = follower();
        f.magic_number_whitelist = vec![111];
        f.magic_number_blacklist = vec![111];
        // in the whitelist, but the blacklist still rejects it
        assert!(!magic_allows(&f, Some(111)));
        // not whitelisted at all
        assert!(!magic_allows(&f, Some(222)));
    }

    #[test]
    fn test_symbol_suffix_strip_and_append() {
        let mut f = follower();
        f.symbol_suffix = ".m".to_string();
        assert_eq!(
            map_symbol(".pro", &f, "EURUSD.pro"),
            Some("EURUSD.m".to_string())
        );
        // leader suffix absent on the symbol: passthrough of the raw name
        assert_eq!(map_symbol(".pro", &f, "EURUSD"), Some("EURUSD.m".to_string()));
    }

    #[test]
    fn test_symbol_blacklist_wins() {
        let mut f = follower();
        f.symbol_blacklist = vec!["XAUUSD".to_string()];
        assert_eq!(map_symbol(".pro", &f, "XAUUSD.pro"), None);
        assert_eq!(map_symbol("", &f, "XAUUSD"), None);
        assert!(map_symbol("", &f, "EURUSD").is_some());
    }

    #[test]
    fn test_symbol_whitelist_filters() {
        let mut f = follower();
        f.symbol_whitelist = vec!["EURUSD".to_string()];
        assert!(map_symbol("", &f, "EURUSD").is_some());
        assert_eq!(map_symbol("", &f, "GBPUSD"), None);
        // raw name also satisfies the whitelist
        f.symbol_whitelist = vec!["EURUSD.pro".to_string()];
        assert!(map_symbol(".pro", &f, "EURUSD.pro").is_some());
    }

    #[test]
    fn test_alias_skips_suffix() {
        let mut f = follower();
        f.symbol_suffix = ".m".to_string();
        f.symbol_aliases = vec![SymbolAlias {
            master_symbol: "XAUUSD".to_string(),
            slave_symbol: "GOLD-ECN".to_string(),
        }];
        assert_eq!(
            map_symbol(".raw", &f, "XAUUSD.raw"),
            Some("GOLD-ECN".to_string())
        );
        // non-aliased symbols still get the suffix
        assert_eq!(
            map_symbol(".raw", &f, "EURUSD.raw"),
            Some("EURUSD.m".to_string())
        );
    }
}
