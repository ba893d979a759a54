//! Rule engine: hostname-pattern-matched proxy/header/mirror policy.
//!
//! Rules are read once per fetch attempt into a `RulesSnapshot` so a
//! mid-flight edit to the rule set never changes behavior for a download
//! that is already running (see the copy-on-read guarantee in the
//! concurrency model).

use zdmr_types::{HeaderMode, Rule, RuleKind, Settings};

/// An immutable copy of the rule set and settings a single fetch attempt
/// resolves its policy against.
#[derive(Debug, Clone)]
pub struct RulesSnapshot {
    rules: Vec<Rule>,
    settings: Settings,
}

impl RulesSnapshot {
    pub fn new(rules: Vec<Rule>, settings: Settings) -> Self {
        Self { rules, settings }
    }

    /// Resolve the proxy URL to use for `host`, if any.
    ///
    /// Per-host proxy rules are consulted independently of
    /// `Settings::global_proxy_enabled` — a matching rule with
    /// `use_proxy: true` applies even when the global flag is off, and
    /// the global flag only supplies a default for hosts with no
    /// matching rule.
    pub fn resolve_proxy(&self, host: &str) -> Option<String> {
        for rule in self.matching_rules(host) {
            if let RuleKind::Proxy { proxy_url, use_proxy } = &rule.kind {
                return if *use_proxy { Some(proxy_url.clone()) } else { None };
            }
        }
        if self.settings.global_proxy_enabled {
            return self.settings.default_proxy_url.clone();
        }
        None
    }

    /// Resolve the extra headers that should accompany every request for
    /// `host`. Rules are applied in ascending-id order: `Override` always
    /// replaces whatever value is currently set for that header name;
    /// `AddIfMissing` only sets a value when that name isn't set yet.
    pub fn resolve_headers(&self, host: &str) -> Vec<(String, String)> {
        let mut order = Vec::new();
        let mut headers: std::collections::HashMap<String, (String, String)> = std::collections::HashMap::new();
        for rule in self.matching_rules(host) {
            if let RuleKind::Header { name, value, mode } = &rule.kind {
                let key = name.to_ascii_lowercase();
                match mode {
                    HeaderMode::Override => {
                        if !headers.contains_key(&key) {
                            order.push(key.clone());
                        }
                        headers.insert(key, (name.clone(), value.clone()));
                    }
                    HeaderMode::AddIfMissing => {
                        if !headers.contains_key(&key) {
                            order.push(key.clone());
                            headers.insert(key, (name.clone(), value.clone()));
                        }
                    }
                }
            }
        }
        order.into_iter().map(|key| headers.remove(&key).unwrap()).collect()
    }

    /// Resolve mirror base hosts to try, in order, for `host`. Rules are
    /// consulted in ascending-id order and each rule's hosts are tried in
    /// the list order it declares them, deduping repeats across rules.
    pub fn resolve_mirrors(&self, host: &str) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut mirrors = Vec::new();
        for rule in self.matching_rules(host) {
            if let RuleKind::Mirror { mirror_hosts } = &rule.kind {
                for mirror_host in mirror_hosts {
                    if seen.insert(mirror_host.clone()) {
                        mirrors.push(mirror_host.clone());
                    }
                }
            }
        }
        mirrors
    }

    fn matching_rules(&self, host: &str) -> impl Iterator<Item = &Rule> {
        self.rules
            .iter()
            .filter(|r| r.enabled && host_matches(&r.host_pattern, host))
    }
}

/// Hostname pattern match. A pattern of `*` matches any host. A pattern
/// starting with `*.` matches the literal suffix after the `*` (so
/// `*.example.com` matches `cdn.example.com` and `example.com` itself).
/// Any other pattern must match the host exactly, case-insensitively.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();

    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    pattern == host
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, pattern: &str, kind: RuleKind) -> Rule {
        Rule {
            id,
            host_pattern: pattern.to_string(),
            enabled: true,
            kind,
        }
    }

    #[test]
    fn wildcard_suffix_matches_subdomains_and_apex() {
        assert!(host_matches("*.example.com", "cdn.example.com"));
        assert!(host_matches("*.example.com", "example.com"));
        assert!(!host_matches("*.example.com", "notexample.com"));
    }

    #[test]
    fn exact_pattern_is_case_insensitive() {
        assert!(host_matches("Example.COM", "example.com"));
        assert!(!host_matches("example.com", "example.org"));
    }

    #[test]
    fn proxy_rule_applies_even_if_global_proxy_disabled() {
        let mut settings = Settings::default();
        settings.global_proxy_enabled = false;
        let rules = vec![rule(
            1,
            "*.example.com",
            RuleKind::Proxy {
                proxy_url: "http://proxy.local:8080".into(),
                use_proxy: true,
            },
        )];
        let snapshot = RulesSnapshot::new(rules, settings);
        assert_eq!(
            snapshot.resolve_proxy("cdn.example.com").as_deref(),
            Some("http://proxy.local:8080")
        );
    }

    #[test]
    fn header_rules_dedupe_by_name_later_override_wins() {
        let rules = vec![
            rule(
                1,
                "*.example.com",
                RuleKind::Header {
                    name: "X-Token".into(),
                    value: "first".into(),
                    mode: HeaderMode::Override,
                },
            ),
            rule(
                2,
                "*",
                RuleKind::Header {
                    name: "X-Token".into(),
                    value: "second".into(),
                    mode: HeaderMode::Override,
                },
            ),
        ];
        let snapshot = RulesSnapshot::new(rules, Settings::default());
        let headers = snapshot.resolve_headers("cdn.example.com");
        assert_eq!(headers, vec![("X-Token".to_string(), "second".to_string())]);
    }

    #[test]
    fn add_if_missing_does_not_clobber_an_earlier_value() {
        let rules = vec![
            rule(
                1,
                "*.example.com",
                RuleKind::Header {
                    name: "X-Token".into(),
                    value: "explicit".into(),
                    mode: HeaderMode::Override,
                },
            ),
            rule(
                2,
                "*",
                RuleKind::Header {
                    name: "X-Token".into(),
                    value: "fallback".into(),
                    mode: HeaderMode::AddIfMissing,
                },
            ),
        ];
        let snapshot = RulesSnapshot::new(rules, Settings::default());
        let headers = snapshot.resolve_headers("cdn.example.com");
        assert_eq!(headers, vec![("X-Token".to_string(), "explicit".to_string())]);
    }

    #[test]
    fn add_if_missing_sets_value_when_nothing_else_does() {
        let rules = vec![rule(
            1,
            "*",
            RuleKind::Header {
                name: "X-Token".into(),
                value: "fallback".into(),
                mode: HeaderMode::AddIfMissing,
            },
        )];
        let snapshot = RulesSnapshot::new(rules, Settings::default());
        let headers = snapshot.resolve_headers("cdn.example.com");
        assert_eq!(headers, vec![("X-Token".to_string(), "fallback".to_string())]);
    }

    #[test]
    fn mirrors_collected_in_rule_order() {
        let rules = vec![
            rule(
                1,
                "example.com",
                RuleKind::Mirror {
                    mirror_hosts: vec!["mirror-a.example.net".into(), "mirror-b.example.net".into()],
                },
            ),
            rule(
                2,
                "example.com",
                RuleKind::Mirror {
                    mirror_hosts: vec!["mirror-b.example.net".into(), "mirror-c.example.net".into()],
                },
            ),
        ];
        let snapshot = RulesSnapshot::new(rules, Settings::default());
        assert_eq!(
            snapshot.resolve_mirrors("example.com"),
            vec!["mirror-a.example.net", "mirror-b.example.net", "mirror-c.example.net"]
        );
    }
}
