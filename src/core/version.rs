use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Versions strictly below this carry the defect.
pub const MITIGATION_THRESHOLD: ComponentVersion = ComponentVersion::new(1, 41, 0, 0);

/// `major.minor.build.revision`, ordered field by field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unable to determine version from folder name: {input}")]
pub struct VersionParseError {
    pub input: String,
}

impl ComponentVersion {
    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    pub fn requires_mitigation(&self) -> bool {
        *self < MITIGATION_THRESHOLD
    }
}

impl fmt::Display for ComponentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

impl FromStr for ComponentVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionParseError {
            input: s.to_string(),
        };

        let mut fields = [0u32; 4];
        let mut parts = s.split('.');
        for field in &mut fields {
            let part = parts.next().ok_or_else(err)?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err());
            }
            *field = part.parse::<u32>().map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }

        let [major, minor, build, revision] = fields;
        Ok(Self::new(major, minor, build, revision))
    }
}

impl Serialize for ComponentVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ComponentVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

pub fn parse_version(folder_name: &str) -> Result<ComponentVersion, VersionParseError> {
    folder_name.parse()
}

pub fn compare(a: &ComponentVersion, b: &ComponentVersion) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ComponentVersion {
        parse_version(s).expect("valid version")
    }

    #[test]
    fn compares_numerically_not_as_strings() {
        assert_eq!(compare(&v("1.9.0.0"), &v("1.10.0.0")), Ordering::Less);
        assert_eq!(compare(&v("1.10.0.0"), &v("1.9.0.0")), Ordering::Greater);
        assert_eq!(compare(&v("2.0.0.0"), &v("1.99.99.99")), Ordering::Greater);
        assert_eq!(compare(&v("1.41.0.0"), &v("1.41.0.0")), Ordering::Equal);
        assert_eq!(compare(&v("1.41.0.2"), &v("1.41.0.10")), Ordering::Less);
    }

    #[test]
    fn ordering_is_total_over_a_sample() {
        let mut sample = vec![
            v("1.41.0.0"),
            v("1.9.0.0"),
            v("1.10.0.0"),
            v("0.0.0.1"),
            v("1.40.9.999"),
            v("1.41.0.0"),
        ];
        sample.sort();
        for pair in sample.windows(2) {
            assert_ne!(compare(&pair[0], &pair[1]), Ordering::Greater);
        }
        assert_eq!(sample.first().map(ToString::to_string).as_deref(), Some("0.0.0.1"));
        assert_eq!(sample.last().map(ToString::to_string).as_deref(), Some("1.41.0.0"));
    }

    #[test]
    fn threshold_gates_mitigation() {
        assert!(!v("1.41.0.0").requires_mitigation());
        assert!(!v("1.42.0.0").requires_mitigation());
        assert!(v("1.40.0.0").requires_mitigation());
        assert!(v("1.39.0.0").requires_mitigation());
        assert!(v("1.40.999.999").requires_mitigation());
    }

    #[test]
    fn rejects_anything_but_four_numeric_fields() {
        for bad in [
            "",
            "1.41.0",
            "1.41.0.0.0",
            "1.41.0.x",
            "v1.41.0.0",
            "1..0.0",
            "1.41.0.-1",
            " 1.41.0.0",
            "Microsoft.Azure.Monitor",
            "99999999999.0.0.0",
        ] {
            let err = parse_version(bad).expect_err(bad);
            assert_eq!(err.input, bad);
        }
    }

    #[test]
    fn display_round_trips() {
        assert_eq!(v("1.39.0.0").to_string(), "1.39.0.0");
        assert_eq!(v("01.039.0.0").to_string(), "1.39.0.0");
    }
}
