//! Module filtering: decide per module path whether requests are served
//! through the cache, refused, or sent straight to upstream.
//!
//! Rule file format, one rule per line:
//!
//! ```text
//! # comment
//! -                       default: exclude everything not matched below
//! + example.org/allowed   include
//! - example.org/private   exclude
//! D example.org/vendored  direct: bypass the cache
//! ```
//!
//! The most specific matching prefix wins; prefixes match whole path
//! elements, so `example.org/foo` does not cover `example.org/foobar`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterRule {
    /// Serve through the cache.
    Include,
    /// Refuse the request.
    Exclude,
    /// Send the client straight to upstream; nothing is cached.
    Direct,
}

impl FilterRule {
    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "+" => Some(FilterRule::Include),
            "-" => Some(FilterRule::Exclude),
            "D" | "d" => Some(FilterRule::Direct),
            _ => None,
        }
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FilterRule::Include => "include",
            FilterRule::Exclude => "exclude",
            FilterRule::Direct => "direct",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct FilterParseError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFilter {
    default: FilterRule,
    /// prefix -> rule
    rules: HashMap<String, FilterRule>,
}

impl Default for ModuleFilter {
    fn default() -> Self {
        Self::new(FilterRule::Include)
    }
}

impl ModuleFilter {
    pub fn new(default: FilterRule) -> Self {
        Self {
            default,
            rules: HashMap::new(),
        }
    }

    /// Read and parse a rule file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read filter file {}", path.display()))?;
        text.parse()
            .with_context(|| format!("invalid filter file {}", path.display()))
    }

    pub fn default_rule(&self) -> FilterRule {
        self.default
    }

    pub fn set_default(&mut self, rule: FilterRule) {
        self.default = rule;
    }

    /// Add or replace the rule for `prefix`.
    pub fn add_rule(&mut self, prefix: &str, rule: FilterRule) {
        self.rules.insert(prefix.trim_matches('/').to_string(), rule);
    }

    /// The rule for `module`: its longest matching prefix, else the default.
    pub fn rule(&self, module: &str) -> FilterRule {
        let module = module.trim_matches('/');
        let mut candidate = module;
        loop {
            if let Some(rule) = self.rules.get(candidate) {
                return *rule;
            }
            match candidate.rsplit_once('/') {
                Some((parent, _)) => candidate = parent,
                None => return self.default,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl FromStr for ModuleFilter {
    type Err = FilterParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut filter = ModuleFilter::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let symbol = fields.next().unwrap_or("");
            let rule = FilterRule::from_symbol(symbol).ok_or_else(|| FilterParseError {
                line: idx + 1,
                message: format!("unknown rule {symbol:?}, expected +, - or D"),
            })?;
            match (fields.next(), fields.next()) {
                (None, _) => filter.set_default(rule),
                (Some(prefix), None) => filter.add_rule(prefix, rule),
                (Some(_), Some(extra)) => {
                    return Err(FilterParseError {
                        line: idx + 1,
                        message: format!("unexpected {extra:?} after prefix"),
                    })
                }
            }
        }
        Ok(filter)
    }
}

/// Where a `Direct` request is sent: the upstream base joined with the
/// original request path.
pub fn redirect_url(upstream: &str, request_path: &str) -> String {
    format!(
        "{}/{}",
        upstream.trim_end_matches('/'),
        request_path.trim_start_matches('/')
    )
}
