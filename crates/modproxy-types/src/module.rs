//! Module paths and fetch keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// A validated, slash-delimited module path such as `example.org/foo/v2`.
///
/// Elements are non-empty, may not start or end with a dot, and only contain
/// ASCII letters, digits and `-._~`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModulePath(String);

impl ModulePath {
    pub fn parse(path: &str) -> Result<Self, ProxyError> {
        if path.is_empty() {
            return Err(ProxyError::invalid_module(path, "empty module path"));
        }
        if path.starts_with('/') || path.ends_with('/') {
            return Err(ProxyError::invalid_module(
                path,
                "leading or trailing slash",
            ));
        }
        for elem in path.split('/') {
            check_element(path, elem)?;
        }
        Ok(Self(path.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn elements(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Last path element, used to name the root directory of an archive.
    pub fn last_element(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Major version encoded by a trailing `/vN` element (N >= 2), else 0.
    pub fn major(&self) -> u64 {
        let last = self.last_element();
        if self.0.len() == last.len() {
            return 0;
        }
        let Some(digits) = last.strip_prefix('v') else {
            return 0;
        };
        if digits.is_empty()
            || digits.starts_with('0')
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return 0;
        }
        match digits.parse::<u64>() {
            Ok(n) if n >= 2 => n,
            _ => 0,
        }
    }

    pub fn parent(&self) -> Option<ModulePath> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| ModulePath(parent.to_string()))
    }

    /// Strict ancestors, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = ModulePath> {
        std::iter::successors(self.parent(), |p| p.parent())
    }

    /// Case-escaped form: every upper-case letter becomes `!` + lower-case.
    ///
    /// Keeps paths that differ only in case distinct on case-insensitive
    /// filesystems and in upstream URLs.
    pub fn escaped(&self) -> String {
        escape_case(&self.0)
    }
}

/// Replace every upper-case ASCII letter with `!` + its lower-case form.
/// Versions go through the same escaping in upstream URLs and on disk.
pub fn escape_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Inverse of [`escape_case`]. `None` when `s` holds an upper-case letter
/// or a `!` not followed by a lower-case one.
pub fn unescape_case(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '!' => match chars.next() {
                Some(next) if next.is_ascii_lowercase() => out.push(next.to_ascii_uppercase()),
                _ => return None,
            },
            c if c.is_ascii_uppercase() => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

fn check_element(path: &str, elem: &str) -> Result<(), ProxyError> {
    if elem.is_empty() {
        return Err(ProxyError::invalid_module(path, "empty path element"));
    }
    if elem.starts_with('.') || elem.ends_with('.') {
        return Err(ProxyError::invalid_module(
            path,
            format!("path element {elem:?} starts or ends with a dot"),
        ));
    }
    if let Some(bad) = elem
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')))
    {
        return Err(ProxyError::invalid_module(
            path,
            format!("invalid character {bad:?}"),
        ));
    }
    Ok(())
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ModulePath {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ModulePath {
    type Error = ProxyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ModulePath> for String {
    fn from(value: ModulePath) -> Self {
        value.0
    }
}

impl AsRef<str> for ModulePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The `(module, version)` pair identifying one cacheable artifact set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
    pub module: ModulePath,
    pub version: String,
}

impl FetchKey {
    pub fn new(module: ModulePath, version: impl Into<String>) -> Self {
        Self {
            module,
            version: version.into(),
        }
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.module, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_malformed_paths() {
        for bad in [
            "",
            "/example.org/foo",
            "example.org/foo/",
            "example.org//foo",
            "example.org/./foo",
            "example.org/../foo",
            "example.org/foo bar",
            "example.org/foo@v1",
        ] {
            assert!(ModulePath::parse(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(ModulePath::parse("example.org/foo_bar-baz.v1~x").is_ok());
    }

    #[test]
    fn test_major_suffix() {
        let m = |s: &str| ModulePath::parse(s).unwrap().major();
        assert_eq!(m("example.org/foo"), 0);
        assert_eq!(m("example.org/foo/v2"), 2);
        assert_eq!(m("example.org/foo/v10"), 10);
        assert_eq!(m("example.org/foo/v1"), 0);
        assert_eq!(m("example.org/foo/v02"), 0);
        assert_eq!(m("v3"), 0);
    }

    #[test]
    fn test_ancestors() {
        let sub = ModulePath::parse("example.org/samplelib/types/inner").unwrap();
        let ancestors: Vec<String> = sub.ancestors().map(String::from).collect();
        assert_eq!(
            ancestors,
            vec!["example.org/samplelib/types", "example.org/samplelib", "example.org"]
        );
        let top = ModulePath::parse("example.org").unwrap();
        assert_eq!(top.ancestors().count(), 0);
    }

    #[test]
    fn test_escape_round_trip() {
        let path = ModulePath::parse("github.com/Azure/Go-Sdk").unwrap();
        let escaped = path.escaped();
        assert_eq!(escaped, "github.com/!azure/!go-!sdk");
        assert_eq!(unescape_case(&escaped).as_deref(), Some("github.com/Azure/Go-Sdk"));
        assert_eq!(unescape_case("v1.0.0-!r!c1").as_deref(), Some("v1.0.0-RC1"));
        assert_eq!(unescape_case("github.com/Azure"), None);
        assert_eq!(unescape_case("github.com/azure!"), None);
        assert_eq!(unescape_case("v1!0"), None);
    }

    #[test]
    fn test_fetch_key_display() {
        let key = FetchKey::new(ModulePath::parse("example.org/baz").unwrap(), "v1.0.0");
        assert_eq!(key.to_string(), "example.org/baz@v1.0.0");
    }
}
