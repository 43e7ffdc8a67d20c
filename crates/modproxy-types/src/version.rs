//! Semantic versions and pseudo-versions.
//!
//! Versions are always written with a leading `v` and a full
//! `MAJOR.MINOR.PATCH` core. Ordering follows semantic-version precedence:
//! build metadata is ignored, a prerelease sorts below its release, and
//! numeric prerelease identifiers sort below alphanumeric ones.
//!
//! A pseudo-version names an untagged commit:
//!
//! ```text
//! vX.0.0-20180803171426-abc1234            (no earlier tag)
//! vX.Y.Z-pre.0.20180803171426-abc1234      (after a prerelease tag)
//! vX.Y.(Z+1)-0.20180803171426-abc1234      (after a release tag)
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::error::ProxyError;

const PSEUDO_TIME_FORMAT: &str = "%Y%m%d%H%M%S";
const PSEUDO_TIME_LEN: usize = 14;
/// Revision ids are abbreviated to this many characters in pseudo-versions.
pub const REVISION_ABBREV_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Identifier {
    Numeric(u64),
    Alpha(String),
}

/// A parsed module version.
///
/// `PartialEq`/`Ord` compare by precedence, so `v1.0.0+a == v1.0.0+b`.
/// Use [`Version::as_str`] when the exact spelling matters.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    major: u64,
    minor: u64,
    patch: u64,
    prerelease: Vec<Identifier>,
}

impl Version {
    pub fn parse(s: &str) -> Result<Self, ProxyError> {
        let invalid = |reason: &str| ProxyError::invalid_module(format!("version {s:?}"), reason);

        let rest = s
            .strip_prefix('v')
            .ok_or_else(|| invalid("missing leading 'v'"))?;
        let (rest, build) = match rest.split_once('+') {
            Some((rest, build)) => (rest, Some(build)),
            None => (rest, None),
        };
        let (core, prerelease) = match rest.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (rest, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid("expected MAJOR.MINOR.PATCH"));
        }
        let major = parse_numeric(parts[0]).ok_or_else(|| invalid("bad major version"))?;
        let minor = parse_numeric(parts[1]).ok_or_else(|| invalid("bad minor version"))?;
        let patch = parse_numeric(parts[2]).ok_or_else(|| invalid("bad patch version"))?;

        let prerelease = match prerelease {
            Some(pre) => pre
                .split('.')
                .map(parse_identifier)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| invalid("bad prerelease"))?,
            None => Vec::new(),
        };

        if let Some(build) = build {
            if !build.split('.').all(is_ident_chars) {
                return Err(invalid("bad build metadata"));
            }
        }

        Ok(Self {
            raw: s.to_string(),
            major,
            minor,
            patch,
            prerelease,
        })
    }

    /// Synthesize a pseudo-version for an untagged revision.
    pub fn pseudo(major: u64, time: DateTime<Utc>, revision: &str) -> Result<Self, ProxyError> {
        let abbrev: String = revision.chars().take(REVISION_ABBREV_LEN).collect();
        if abbrev.is_empty() || !abbrev.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ProxyError::invalid_module(
                format!("revision {revision:?}"),
                "revision id must be alphanumeric",
            ));
        }
        Self::parse(&format!(
            "v{major}.0.0-{}-{abbrev}",
            time.format(PSEUDO_TIME_FORMAT)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn is_pseudo(&self) -> bool {
        self.pseudo_parts().is_some()
    }

    /// Commit time encoded in a pseudo-version.
    pub fn pseudo_time(&self) -> Option<DateTime<Utc>> {
        let (ts, _) = self.pseudo_parts()?;
        NaiveDateTime::parse_from_str(ts, PSEUDO_TIME_FORMAT)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    /// Abbreviated revision id encoded in a pseudo-version.
    pub fn pseudo_revision(&self) -> Option<&str> {
        self.pseudo_parts().map(|(_, rev)| rev)
    }

    fn pseudo_parts(&self) -> Option<(&str, &str)> {
        let last = match self.prerelease.last()? {
            Identifier::Alpha(s) => s.as_str(),
            Identifier::Numeric(_) => return None,
        };
        let (ts, rev) = last.split_once('-')?;
        if ts.len() != PSEUDO_TIME_LEN
            || !ts.bytes().all(|b| b.is_ascii_digit())
            || rev.is_empty()
            || !rev.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return None;
        }
        let base_ok = match self.prerelease.len() {
            1 => self.minor == 0 && self.patch == 0,
            n => self.prerelease[n - 2] == Identifier::Numeric(0),
        };
        base_ok.then_some((ts, rev))
    }
}

fn parse_numeric(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if part.len() > 1 && part.starts_with('0') {
        return None;
    }
    part.parse().ok()
}

fn is_ident_chars(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn parse_identifier(part: &str) -> Option<Identifier> {
    if !is_ident_chars(part) {
        return None;
    }
    if part.bytes().all(|b| b.is_ascii_digit()) {
        parse_numeric(part).map(Identifier::Numeric)
    } else {
        Some(Identifier::Alpha(part.to_string()))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (self.prerelease.is_empty(), other.prerelease.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.prerelease.cmp(&other.prerelease),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Sort ascending by precedence; equal precedence falls back to the spelling
/// so the output is deterministic.
pub fn sort_ascending(versions: &mut [Version]) {
    versions.sort_by(|a, b| a.cmp(b).then_with(|| a.as_str().cmp(b.as_str())));
}
