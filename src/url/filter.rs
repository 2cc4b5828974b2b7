//! URL allow/deny predicate
//!
//! The crawl engine only needs a synchronous yes/no answer per URL. Callers can
//! plug in any closure, or use the declarative [`FilterRules`] loaded from the
//! `[[filter]]` tables of the configuration file.

use crate::ConfigError;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use url::Url;

/// Decides whether a discovered URL is mirrored or left pointing at the remote site
pub trait UrlFilter: Send + Sync {
    /// Returns true if the URL should be downloaded into the local tree
    fn allows(&self, url: &Url) -> bool;
}

impl<F> UrlFilter for F
where
    F: Fn(&Url) -> bool + Send + Sync,
{
    fn allows(&self, url: &Url) -> bool {
        self(url)
    }
}

/// Matches a lowercase host against `example.com` or `*.example.com`
///
/// The wildcard form also admits the bare domain itself.
fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(base) => {
            host == base
                || host
                    .strip_suffix(base)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        }
        None => host == pattern,
    }
}

/// Allows every URL on one host (or host pattern such as `*.example.com`)
#[derive(Debug, Clone)]
pub struct SameHostFilter {
    pattern: String,
}

impl SameHostFilter {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into().to_lowercase(),
        }
    }

    /// Builds a filter admitting only the host of the given entry URL
    pub fn for_entry(entry: &Url) -> Self {
        Self::new(entry.host_str().unwrap_or_default())
    }
}

impl UrlFilter for SameHostFilter {
    fn allows(&self, url: &Url) -> bool {
        url.host_str()
            .map(|host| host_matches(&self.pattern, &host.to_lowercase()))
            .unwrap_or(false)
    }
}

/// The URL component a rule looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterTarget {
    Host,
    Path,
    Query,
    Port,
}

/// A literal a rule compares against; TOML lets users write numbers bare
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{}", s),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
        }
    }
}

/// One `[[filter]]` entry as written in the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct FilterRuleConfig {
    #[serde(rename = "type")]
    pub target: FilterTarget,

    /// Query parameter name, required for `type = "query"`
    #[serde(default)]
    pub key: Option<String>,

    #[serde(default)]
    pub value: Option<FilterValue>,

    /// One of `=`, `==`, `===`, `!=`, `!==`, `<`, `>`, `<=`, `>=`
    #[serde(default)]
    pub comparison: Option<String>,

    /// Regular expression tested against the component
    #[serde(default)]
    pub test: Option<String>,

    #[serde(default, rename = "match")]
    pub on_match: Option<bool>,

    #[serde(default, rename = "nomatch")]
    pub on_nomatch: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
}

impl Comparison {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "=" | "==" | "===" => Some(Self::Equal),
            "!=" | "!==" => Some(Self::NotEqual),
            "<" => Some(Self::Less),
            ">" => Some(Self::Greater),
            "<=" => Some(Self::LessOrEqual),
            ">=" => Some(Self::GreaterOrEqual),
            _ => None,
        }
    }

    fn apply(self, actual: &str, expected: &str) -> bool {
        let numbers = || -> Option<(f64, f64)> {
            Some((actual.trim().parse().ok()?, expected.trim().parse().ok()?))
        };
        match self {
            Self::Equal => actual == expected,
            Self::NotEqual => actual != expected,
            Self::Less => numbers().is_some_and(|(a, b)| a < b),
            Self::Greater => numbers().is_some_and(|(a, b)| a > b),
            Self::LessOrEqual => numbers().is_some_and(|(a, b)| a <= b),
            Self::GreaterOrEqual => numbers().is_some_and(|(a, b)| a >= b),
        }
    }
}

#[derive(Debug, Clone)]
enum Test {
    Pattern(Regex),
    Compare(Comparison, String),
    Always,
}

#[derive(Debug, Clone, Copy)]
enum Verdict {
    OnMatch(bool),
    OnNoMatch(bool),
}

/// A compiled filter rule
#[derive(Debug, Clone)]
pub struct FilterRule {
    target: FilterTarget,
    key: Option<String>,
    test: Test,
    verdict: Verdict,
}

impl FilterRule {
    /// Compiles a rule from its configuration form
    pub fn compile(config: &FilterRuleConfig) -> Result<Self, ConfigError> {
        let key = match (config.target, &config.key) {
            (FilterTarget::Query, None) => {
                return Err(ConfigError::InvalidFilter(
                    "query filters require a 'key'".to_string(),
                ))
            }
            (FilterTarget::Query, Some(k)) => Some(k.clone()),
            _ => None,
        };

        let comparison = match &config.comparison {
            Some(op) => Some(Comparison::parse(op).ok_or_else(|| {
                ConfigError::InvalidFilter(format!("invalid comparison operator '{}'", op))
            })?),
            None => None,
        };

        let test = if let Some(pattern) = &config.test {
            let regex = Regex::new(pattern).map_err(|e| {
                ConfigError::InvalidFilter(format!("invalid test pattern '{}': {}", pattern, e))
            })?;
            Test::Pattern(regex)
        } else if let Some(value) = &config.value {
            Test::Compare(comparison.unwrap_or(Comparison::Equal), value.to_string())
        } else {
            Test::Always
        };

        let verdict = match (config.on_match, config.on_nomatch) {
            (Some(m), _) => Verdict::OnMatch(m),
            (None, Some(n)) => Verdict::OnNoMatch(n),
            (None, None) => Verdict::OnMatch(true),
        };

        Ok(Self {
            target: config.target,
            key,
            test,
            verdict,
        })
    }

    fn component(&self, url: &Url) -> Option<String> {
        match self.target {
            FilterTarget::Host => url.host_str().map(|h| h.to_lowercase()),
            FilterTarget::Path => Some(url.path().to_string()),
            FilterTarget::Port => url.port_or_known_default().map(|p| p.to_string()),
            FilterTarget::Query => {
                let key = self.key.as_deref()?;
                url.query_pairs()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.into_owned())
            }
        }
    }

    /// Returns `Some(allow)` if this rule has an opinion about the URL
    pub fn evaluate(&self, url: &Url) -> Option<bool> {
        let value = self.component(url)?;

        let passed = match &self.test {
            Test::Pattern(regex) => regex.is_match(&value),
            Test::Compare(Comparison::Equal, expected) if self.target == FilterTarget::Host => {
                host_matches(&expected.to_lowercase(), &value)
            }
            Test::Compare(op, expected) => op.apply(&value, expected),
            Test::Always => true,
        };

        match self.verdict {
            Verdict::OnMatch(allow) if passed => Some(allow),
            Verdict::OnNoMatch(allow) if !passed => Some(allow),
            _ => None,
        }
    }
}

/// An ordered rule set; the first rule with an opinion decides
#[derive(Debug, Clone, Default)]
pub struct FilterRules {
    rules: Vec<FilterRule>,
}

impl FilterRules {
    pub fn compile(configs: &[FilterRuleConfig]) -> Result<Self, ConfigError> {
        let rules = configs
            .iter()
            .map(FilterRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

impl UrlFilter for FilterRules {
    fn allows(&self, url: &Url) -> bool {
        for rule in &self.rules {
            if let Some(allow) = rule.evaluate(url) {
                return allow;
            }
        }
        tracing::trace!("No filter rule matched {}, denying", url);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(toml_src: &str) -> FilterRules {
        #[derive(Deserialize)]
        struct Wrapper {
            filter: Vec<FilterRuleConfig>,
        }
        let wrapper: Wrapper = toml::from_str(toml_src).unwrap();
        FilterRules::compile(&wrapper.filter).unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_host_rule_allows_matching_host() {
        let filter = rules(
            r#"
[[filter]]
type = "host"
value = "localhost"
match = true
"#,
        );
        assert!(filter.allows(&url("http://localhost:8080/a.html")));
        assert!(!filter.allows(&url("http://example.com/")));
    }

    #[test]
    fn test_first_opinion_wins() {
        let filter = rules(
            r#"
[[filter]]
type = "path"
test = "^/private"
match = false

[[filter]]
type = "host"
value = "*.example.com"
"#,
        );
        assert!(filter.allows(&url("https://www.example.com/public")));
        assert!(!filter.allows(&url("https://www.example.com/private/x")));
        assert!(!filter.allows(&url("https://other.org/public")));
    }

    #[test]
    fn test_nomatch_verdict() {
        let filter = rules(
            r#"
[[filter]]
type = "host"
value = "example.com"
nomatch = false

[[filter]]
type = "path"
"#,
        );
        assert!(!filter.allows(&url("https://other.org/")));
        assert!(filter.allows(&url("https://example.com/anything")));
    }

    #[test]
    fn test_numeric_query_comparison() {
        let filter = rules(
            r#"
[[filter]]
type = "query"
key = "page"
comparison = ">"
value = 3
match = false

[[filter]]
type = "host"
value = "example.com"
"#,
        );
        assert!(filter.allows(&url("https://example.com/list?page=2")));
        assert!(!filter.allows(&url("https://example.com/list?page=10")));
        // Missing key: the query rule has no opinion
        assert!(filter.allows(&url("https://example.com/list")));
    }

    #[test]
    fn test_port_uses_scheme_default() {
        let filter = rules(
            r#"
[[filter]]
type = "port"
value = "443"
"#,
        );
        assert!(filter.allows(&url("https://example.com/")));
        assert!(!filter.allows(&url("http://example.com/")));
    }

    #[test]
    fn test_no_rules_denies() {
        let filter = FilterRules::default();
        assert!(filter.is_empty());
        assert!(!filter.allows(&url("https://example.com/")));
    }

    #[test]
    fn test_query_rule_requires_key() {
        let config = FilterRuleConfig {
            target: FilterTarget::Query,
            key: None,
            value: None,
            comparison: None,
            test: None,
            on_match: None,
            on_nomatch: None,
        };
        assert!(matches!(
            FilterRule::compile(&config),
            Err(ConfigError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_invalid_comparison_rejected() {
        let config = FilterRuleConfig {
            target: FilterTarget::Path,
            key: None,
            value: Some(FilterValue::Text("/".to_string())),
            comparison: Some("~=".to_string()),
            test: None,
            on_match: None,
            on_nomatch: None,
        };
        assert!(FilterRule::compile(&config).is_err());
    }

    #[test]
    fn test_same_host_filter() {
        let filter = SameHostFilter::for_entry(&url("http://localhost:8080/"));
        assert!(filter.allows(&url("http://localhost:8080/b.html")));
        assert!(!filter.allows(&url("http://cdn.example.com/b.js")));
    }

    #[test]
    fn test_host_wildcards() {
        assert!(host_matches("*.example.com", "example.com"));
        assert!(host_matches("*.example.com", "api.v2.example.com"));
        assert!(!host_matches("*.example.com", "myexample.com"));
        assert!(!host_matches("example.com", "blog.example.com"));
    }

    #[test]
    fn test_closure_filter() {
        let filter = |u: &Url| u.path().ends_with(".html");
        assert!(filter.allows(&url("http://x/a.html")));
        assert!(!filter.allows(&url("http://x/a.png")));
    }
}
