//! Outbound path resolution
//!
//! Pure, stateless resolver built once from configuration. Maps the inbound
//! path to the path used against forward targets, reporting which rule fired.

use crate::config::PathStrategySettings;
use regex::Regex;
use tracing::warn;

/// Result of resolving an inbound path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: String,
    /// Name of the rule that fired; empty when the path passed through
    pub rule_name: String,
}

#[derive(Debug)]
enum RewriteMatcher {
    /// Literal prefix splice: keep the remainder after the prefix and
    /// concatenate it onto the replacement
    Literal { prefix: String, replacement: String },
    /// Full regex match/replace over the whole path
    Pattern { regex: Regex, replacement: String },
}

#[derive(Debug)]
pub struct RewriteRule {
    name: String,
    matcher: RewriteMatcher,
}

/// Configurable transformation applied to the request path before forwarding
#[derive(Debug, Default)]
pub enum PathStrategy {
    /// Use the original path unmodified
    #[default]
    Append,
    /// Remove a configured prefix when present, pass through otherwise
    StripPrefix { prefix: String },
    /// Ordered rewrite rules, first match wins
    Rewrite { rules: Vec<RewriteRule> },
}

impl PathStrategy {
    /// Build from configuration; invalid rules are skipped with a warning.
    /// An absent mode is equivalent to "append".
    pub fn from_settings(settings: &PathStrategySettings) -> Self {
        match settings.mode.as_deref() {
            None | Some("append") | Some("") => Self::Append,
            Some("strip-prefix") => {
                let prefix = settings.prefix.clone().unwrap_or_default();
                if prefix.is_empty() {
                    warn!("strip-prefix path mode without a prefix; treating as append");
                    Self::Append
                } else {
                    Self::StripPrefix { prefix }
                }
            }
            Some("rewrite") => {
                let mut rules = Vec::with_capacity(settings.rules.len());
                for rule in &settings.rules {
                    if rule.is_regex {
                        let Some(replacement) = rule.replacement.clone() else {
                            warn!(rule = %rule.name, "Skipping regex rewrite rule without a replacement");
                            continue;
                        };
                        match Regex::new(&rule.match_pattern) {
                            Ok(regex) => rules.push(RewriteRule {
                                name: rule.name.clone(),
                                matcher: RewriteMatcher::Pattern { regex, replacement },
                            }),
                            Err(e) => {
                                warn!(rule = %rule.name, error = %e, "Skipping rewrite rule with invalid regex");
                            }
                        }
                    } else {
                        if rule.match_pattern.is_empty() {
                            warn!(rule = %rule.name, "Skipping literal rewrite rule with an empty match");
                            continue;
                        }
                        rules.push(RewriteRule {
                            name: rule.name.clone(),
                            matcher: RewriteMatcher::Literal {
                                prefix: rule.match_pattern.clone(),
                                replacement: rule.replacement.clone().unwrap_or_default(),
                            },
                        });
                    }
                }
                Self::Rewrite { rules }
            }
            Some(other) => {
                warn!(mode = other, "Unknown path strategy mode; treating as append");
                Self::Append
            }
        }
    }

    /// Resolve the outbound path for an inbound path
    pub fn resolve(&self, path: &str) -> ResolvedPath {
        match self {
            Self::Append => ResolvedPath {
                path: normalize_path(path),
                rule_name: String::new(),
            },
            Self::StripPrefix { prefix } => {
                let normalized = normalize_path(path);
                match normalized.strip_prefix(prefix.as_str()) {
                    Some(rest) => ResolvedPath {
                        path: normalize_path(rest),
                        rule_name: "strip-prefix".to_string(),
                    },
                    None => ResolvedPath {
                        path: normalized,
                        rule_name: String::new(),
                    },
                }
            }
            Self::Rewrite { rules } => {
                for rule in rules {
                    match &rule.matcher {
                        RewriteMatcher::Literal {
                            prefix,
                            replacement,
                        } => {
                            if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                                return ResolvedPath {
                                    path: normalize_path(&format!("{replacement}{rest}")),
                                    rule_name: rule.name.clone(),
                                };
                            }
                        }
                        RewriteMatcher::Pattern { regex, replacement } => {
                            if regex.is_match(path) {
                                let rewritten =
                                    regex.replace(path, replacement.as_str()).into_owned();
                                return ResolvedPath {
                                    path: normalize_path(&rewritten),
                                    rule_name: rule.name.clone(),
                                };
                            }
                        }
                    }
                }
                ResolvedPath {
                    path: normalize_path(path),
                    rule_name: String::new(),
                }
            }
        }
    }
}

/// Enforce a leading slash and resolve `.`/`..` segments
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RewriteRuleSettings;
    use rstest::rstest;

    fn rewrite_settings(rules: Vec<RewriteRuleSettings>) -> PathStrategySettings {
        PathStrategySettings {
            mode: Some("rewrite".to_string()),
            prefix: None,
            rules,
        }
    }

    fn rule(name: &str, pattern: &str, replacement: Option<&str>, is_regex: bool) -> RewriteRuleSettings {
        RewriteRuleSettings {
            name: name.to_string(),
            match_pattern: pattern.to_string(),
            replacement: replacement.map(str::to_string),
            is_regex,
        }
    }

    #[test]
    fn test_append_passes_path_through() {
        let strategy = PathStrategy::default();
        let resolved = strategy.resolve("/hooks/github");
        assert_eq!(resolved.path, "/hooks/github");
        assert_eq!(resolved.rule_name, "");
    }

    #[test]
    fn test_strip_prefix_removes_configured_prefix() {
        let strategy = PathStrategy::from_settings(&PathStrategySettings {
            mode: Some("strip-prefix".to_string()),
            prefix: Some("/api".to_string()),
            rules: vec![],
        });

        let hit = strategy.resolve("/api/v1/users");
        assert_eq!(hit.path, "/v1/users");
        assert_eq!(hit.rule_name, "strip-prefix");

        let miss = strategy.resolve("/other");
        assert_eq!(miss.path, "/other");
        assert_eq!(miss.rule_name, "");
    }

    #[test]
    fn test_strip_prefix_whole_path_becomes_root() {
        let strategy = PathStrategy::from_settings(&PathStrategySettings {
            mode: Some("strip-prefix".to_string()),
            prefix: Some("/api".to_string()),
            rules: vec![],
        });
        assert_eq!(strategy.resolve("/api").path, "/");
    }

    #[test]
    fn test_rewrite_regex_rule() {
        let strategy = PathStrategy::from_settings(&rewrite_settings(vec![rule(
            "tenant",
            "^/tenant/(.*)$",
            Some("/$1"),
            true,
        )]));

        let resolved = strategy.resolve("/tenant/acme/orders");
        assert_eq!(resolved.path, "/acme/orders");
        assert_eq!(resolved.rule_name, "tenant");
    }

    #[test]
    fn test_rewrite_literal_splice() {
        let strategy = PathStrategy::from_settings(&rewrite_settings(vec![rule(
            "legacy",
            "/v1",
            Some("/v2"),
            false,
        )]));

        let resolved = strategy.resolve("/v1/users");
        assert_eq!(resolved.path, "/v2/users");
        assert_eq!(resolved.rule_name, "legacy");
    }

    #[test]
    fn test_rewrite_first_match_wins() {
        let strategy = PathStrategy::from_settings(&rewrite_settings(vec![
            rule("broad", "/a", Some("/first"), false),
            rule("narrow", "/a/b", Some("/second"), false),
        ]));
        assert_eq!(strategy.resolve("/a/b").rule_name, "broad");
    }

    #[test]
    fn test_invalid_rules_are_skipped_at_build() {
        let strategy = PathStrategy::from_settings(&rewrite_settings(vec![
            rule("no-replacement", "^/x/(.*)$", None, true),
            rule("empty-literal", "", Some("/y"), false),
            rule("bad-regex", "([", Some("/z"), true),
            rule("good", "/keep", Some("/kept"), false),
        ]));
        match strategy {
            PathStrategy::Rewrite { ref rules } => assert_eq!(rules.len(), 1),
            _ => panic!("expected rewrite strategy"),
        }
        assert_eq!(strategy.resolve("/keep/it").rule_name, "good");
    }

    #[rstest]
    #[case("", "/")]
    #[case("relative", "/relative")]
    #[case("/a/./b", "/a/b")]
    #[case("/a/b/../c", "/a/c")]
    #[case("/../..", "/")]
    #[case("//double//slash", "/double/slash")]
    fn test_normalize_path(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_path(input), expected);
    }
}
