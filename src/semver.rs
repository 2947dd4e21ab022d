//! Semantic version handling for update checks

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// `major.minor.patch[-prerelease][+build]`. The patch component is
/// optional on input since upstream version strings sometimes omit it.
///
/// Ordering follows semver precedence: a prerelease sorts before its
/// release, numeric prerelease identifiers compare numerically and sort
/// before alphanumeric ones, and when one prerelease is a prefix of the
/// other the shorter one sorts first. Build metadata never affects
/// ordering or equality.
#[derive(Debug, Clone, Eq)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
}

impl SemVer {
    pub const EMPTY: SemVer = SemVer {
        major: 0,
        minor: 0,
        patch: 0,
        prerelease: None,
        build: None,
    };

    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
            build: None,
        }
    }

    /// Parse, falling back to `EMPTY` on malformed input. Used when
    /// decoding remote data where a bad version must not fail the
    /// whole response.
    pub fn parse_lossy(version: &str) -> Self {
        version.parse().unwrap_or(Self::EMPTY)
    }
}

fn parse_component(component: &str) -> Result<u64> {
    component
        .parse()
        .map_err(|_| Error::Decode(format!("invalid version component `{component}`")))
}

fn valid_identifiers(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|id| {
            !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

impl FromStr for SemVer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (rest, build) = match s.split_once('+') {
            Some((rest, build)) => (rest, Some(build)),
            None => (s, None),
        };
        let (core, prerelease) = match rest.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (rest, None),
        };

        let mut numbers = core.split('.');
        let major = parse_component(
            numbers
                .next()
                .ok_or_else(|| Error::Decode(format!("invalid version `{s}`")))?,
        )?;
        let minor = parse_component(
            numbers
                .next()
                .ok_or_else(|| Error::Decode(format!("invalid version `{s}`")))?,
        )?;
        let patch = match numbers.next() {
            Some(patch) => parse_component(patch)?,
            None => 0,
        };
        if numbers.next().is_some() {
            return Err(Error::Decode(format!("invalid version `{s}`")));
        }

        for part in [prerelease, build].into_iter().flatten() {
            if !valid_identifiers(part) {
                return Err(Error::Decode(format!("invalid version `{s}`")));
            }
        }

        Ok(SemVer {
            major,
            minor,
            patch,
            prerelease: prerelease.map(str::to_string),
            build: build.map(str::to_string),
        })
    }
}

fn compare_prerelease(left: &str, right: &str) -> Ordering {
    let left: Vec<&str> = left.split('.').collect();
    let right: Vec<&str> = right.split('.').collect();
    for (l, r) in left.iter().zip(right.iter()) {
        let ord = match (l.parse::<u64>().ok(), r.parse::<u64>().ok()) {
            (Some(l), Some(r)) => l.cmp(&r),
            // numeric identifiers sort before alphanumeric ones
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => l.cmp(r),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

impl Ord for SemVer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
            .then_with(|| self.patch.cmp(&other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(left), Some(right)) => compare_prerelease(left, right),
            })
    }
}

impl PartialOrd for SemVer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SemVer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl std::hash::Hash for SemVer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.major.hash(state);
        self.minor.hash(state);
        self.patch.hash(state);
        self.prerelease.hash(state);
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{pre}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> SemVer {
        s.parse().unwrap()
    }

    #[test]
    fn parses_full_and_partial_versions() {
        let version = v("1.2.3-alpha.1+build.5");
        assert_eq!(version.major, 1);
        assert_eq!(version.minor, 2);
        assert_eq!(version.patch, 3);
        assert_eq!(version.prerelease.as_deref(), Some("alpha.1"));
        assert_eq!(version.build.as_deref(), Some("build.5"));

        // patch is optional
        assert_eq!(v("1.21"), SemVer::new(1, 21, 0));
    }

    #[test]
    fn rejects_malformed_versions() {
        assert!("".parse::<SemVer>().is_err());
        assert!("1".parse::<SemVer>().is_err());
        assert!("1.2.3.4".parse::<SemVer>().is_err());
        assert!("1.x.0".parse::<SemVer>().is_err());
        assert!("1.2.0-".parse::<SemVer>().is_err());
        assert!("1.2.0-a..b".parse::<SemVer>().is_err());
        assert_eq!(SemVer::parse_lossy("not a version"), SemVer::EMPTY);
    }

    #[test]
    fn prerelease_sorts_before_release() {
        assert!(v("1.2.0-alpha") < v("1.2.0"));
        assert!(v("1.2.0-rc.1") < v("1.2.0"));
        assert!(v("1.2.0") < v("1.2.1-alpha"));
    }

    #[test]
    fn prerelease_identifier_ordering() {
        assert!(v("1.2.0-alpha.1") < v("1.2.0-alpha.2"));
        assert!(v("1.2.0-alpha.2") < v("1.2.0-alpha.10"));
        // numeric sorts before alphanumeric at the same position
        assert!(v("1.0.0-1") < v("1.0.0-a"));
        assert!(v("1.0.0-alpha.1") < v("1.0.0-alpha.beta"));
        // shorter prerelease loses when it is a prefix of the longer
        assert!(v("1.0.0-alpha") < v("1.0.0-alpha.1"));
    }

    #[test]
    fn build_metadata_is_ignored() {
        assert_eq!(v("1.0.0+linux"), v("1.0.0+windows"));
        assert!(!(v("1.0.0+a") < v("1.0.0+b")));
    }

    #[test]
    fn display_round_trip() {
        for s in ["1.2.3", "1.2.3-alpha.1", "1.2.3-rc.2+build.7"] {
            assert_eq!(v(s).to_string(), s);
        }
    }
}
