use crate::error::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A semantic version `major.minor.patch[+build]`.
///
/// Versions identify both symbols and the runtime's own interface tables. Two versions are
/// compared with [`Version::compatible_with`] when resolving an import, never with equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u64,
}

/// Construct the [`Version`] of the crate this macro is invoked from.
#[macro_export]
macro_rules! version {
    () => {
        $crate::Version::from_pkg(
            env!("CARGO_PKG_VERSION_MAJOR"),
            env!("CARGO_PKG_VERSION_MINOR"),
            env!("CARGO_PKG_VERSION_PATCH"),
        )
    };
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Version {
        Version {
            major,
            minor,
            patch,
            build: 0,
        }
    }

    pub const fn new_with_build(major: u32, minor: u32, patch: u32, build: u64) -> Version {
        Version {
            major,
            minor,
            patch,
            build,
        }
    }

    /// Build a version from the decimal strings Cargo places in `CARGO_PKG_VERSION_*`.
    ///
    /// Non-digit characters are skipped, so this is only suitable for those variables.
    pub const fn from_pkg(major: &str, minor: &str, patch: &str) -> Version {
        Version::new(const_digits(major), const_digits(minor), const_digits(patch))
    }

    /// The same version with the build number cleared.
    pub const fn without_build(self) -> Version {
        Version::new(self.major, self.minor, self.patch)
    }

    /// Whether a symbol or interface at version `self` can stand in for one at `required`.
    ///
    /// The major numbers must match, the minor numbers must match while the major is `0`, and
    /// `self` must not be older than `required` once build numbers are ignored.
    pub fn compatible_with(&self, required: &Version) -> bool {
        if self.major != required.major {
            return false;
        }
        if self.major == 0 && self.minor != required.minor {
            return false;
        }
        self.without_build() >= required.without_build()
    }
}

const fn const_digits(s: &str) -> u32 {
    let bytes = s.as_bytes();
    let mut acc = 0u32;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b >= b'0' && b <= b'9' {
            acc = acc * 10 + (b - b'0') as u32;
        }
        i += 1;
    }
    acc
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Version) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Version) -> Ordering {
        (self.major, self.minor, self.patch, self.build).cmp(&(
            other.major,
            other.minor,
            other.patch,
            other.build,
        ))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.build != 0 {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}

fn parse_component<T: FromStr>(input: &str, part: Option<&str>) -> Result<T, Error> {
    let part = part.ok_or_else(|| Error::VersionParse {
        input: input.to_owned(),
        reason: "missing component",
    })?;
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::VersionParse {
            input: input.to_owned(),
            reason: "components must be unsigned decimal numbers",
        });
    }
    part.parse().map_err(|_| Error::VersionParse {
        input: input.to_owned(),
        reason: "component out of range",
    })
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (triple, build) = match s.find('+') {
            Some(idx) => (&s[..idx], Some(&s[idx + 1..])),
            None => (s, None),
        };

        let mut parts = triple.split('.');
        let major = parse_component(s, parts.next())?;
        let minor = parse_component(s, parts.next())?;
        let patch = parse_component(s, parts.next())?;
        if parts.next().is_some() {
            return Err(Error::VersionParse {
                input: s.to_owned(),
                reason: "too many components",
            });
        }
        let build = match build {
            Some(b) => parse_component(s, Some(b))?,
            None => 0,
        };

        Ok(Version::new_with_build(major, minor, patch, build))
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
