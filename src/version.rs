use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;

use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::err::{Fallible, FlagError};

/// 32-bit checksum used for version vectors and audit records: CRC-32
/// (IEEE) over the UTF-8 payload bytes, rendered as 8 lowercase hex chars.
/// This is an error-detection code, not a signature; the function is fixed
/// for interop and must not change.
pub(crate) fn checksum32(payload: &str) -> String {
    format!("{:08x}", crc32fast::hash(payload.as_bytes()))
}

/// Monotone version tag providing a total order across replicas.
///
/// Ordering is `version`, then `timestamp`, then `node_id`, then `checksum`
/// (both lexicographic), so any two vectors compare deterministically even
/// when produced concurrently on different nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionVector {
    pub version: u64,
    pub timestamp: i64,
    pub node_id: String,
    pub checksum: String,
}

impl VersionVector {
    /// First version for a node. The node id must not contain a colon, the
    /// wire format's field separator.
    pub fn make(node_id: &str, seed: &str, now: i64) -> Fallible<VersionVector> {
        if node_id.contains(':') {
            return Err(FlagError::parse(format!(
                "node id '{}' must not contain ':'",
                node_id
            )));
        }
        Ok(VersionVector {
            version: 1,
            timestamp: now,
            node_id: node_id.to_string(),
            checksum: checksum32(seed),
        })
    }

    /// Next version on the same node. `seed` is the payload that motivated
    /// the increment; its checksum rides along for corruption detection.
    pub fn increment(&self, seed: &str, now: i64) -> VersionVector {
        VersionVector {
            version: self.version + 1,
            timestamp: now,
            node_id: self.node_id.clone(),
            checksum: checksum32(seed),
        }
    }

    /// Total order: version, then timestamp, then node id, then checksum.
    pub fn compare(&self, other: &VersionVector) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.node_id.cmp(&other.node_id))
            .then_with(|| self.checksum.cmp(&other.checksum))
    }

    pub fn is_newer(&self, other: &VersionVector) -> bool {
        self.compare(other) == Ordering::Greater
    }

    /// Reconciles two vectors for the same entry: the winner of `compare`
    /// contributes node id and checksum, and the merged version jumps past
    /// both inputs so the merge itself is visible as a new version.
    pub fn merge(&self, remote: &VersionVector, now: i64) -> VersionVector {
        let winner = if self.compare(remote) == Ordering::Less {
            remote
        } else {
            self
        };
        VersionVector {
            version: self.version.max(remote.version) + 1,
            timestamp: now,
            node_id: winner.node_id.clone(),
            checksum: winner.checksum.clone(),
        }
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.version, self.timestamp, self.node_id, self.checksum
        )
    }
}

impl FromStr for VersionVector {
    type Err = FlagError;

    fn from_str(s: &str) -> Fallible<VersionVector> {
        let parts: Vec<&str> = s.split(':').collect();
        let [version, timestamp, node_id, checksum] = parts.as_slice() else {
            return Err(FlagError::parse(format!(
                "version vector '{}' must have 4 colon-separated fields",
                s
            )));
        };
        let version = version
            .parse::<u64>()
            .map_err(|_| FlagError::parse(format!("bad version number in '{}'", s)))?;
        let timestamp = timestamp
            .parse::<i64>()
            .map_err(|_| FlagError::parse(format!("bad timestamp in '{}'", s)))?;
        if node_id.is_empty() {
            return Err(FlagError::parse(format!("empty node id in '{}'", s)));
        }
        if checksum.len() != 8 || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FlagError::parse(format!("bad checksum in '{}'", s)));
        }
        Ok(VersionVector {
            version,
            timestamp,
            node_id: node_id.to_string(),
            checksum: checksum.to_string(),
        })
    }
}

// On the wire a version vector is its colon-joined string form.
impl Serialize for VersionVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: FlagError| de::Error::custom(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vv(version: u64, timestamp: i64, node_id: &str, checksum: &str) -> VersionVector {
        VersionVector {
            version,
            timestamp,
            node_id: node_id.to_string(),
            checksum: checksum.to_string(),
        }
    }

    #[test]
    fn checksum_is_crc32_hex() {
        assert_eq!(checksum32("init"), "c674e474");
        assert_eq!(checksum32("merge"), "eb699759");
        assert_eq!(checksum32("dark_mode"), "eece9a15");
        assert_eq!(checksum32(""), "00000000");
    }

    #[test]
    fn make_then_increment_is_monotone() {
        let v1 = VersionVector::make("node-a", "init", 10).unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v1.checksum, "c674e474");

        let v2 = v1.increment("dark_mode", 20);
        assert_eq!(v2.version, 2);
        assert_eq!(v2.node_id, "node-a");
        assert_eq!(v2.checksum, "eece9a15");
        assert!(v2.is_newer(&v1));
    }

    #[test]
    fn node_id_must_not_contain_colon() {
        assert!(VersionVector::make("node:a", "init", 0).is_err());
    }

    #[test]
    fn compare_is_a_total_order_with_tiebreaks() {
        // primary key: version
        assert!(vv(3, 5, "b", "y").is_newer(&vv(2, 10, "a", "x")));
        // tiebreak: timestamp
        assert!(vv(2, 11, "a", "x").is_newer(&vv(2, 10, "b", "y")));
        // tiebreak: node id, lexicographic
        assert!(vv(2, 10, "b", "x").is_newer(&vv(2, 10, "a", "y")));
        // tiebreak: checksum, lexicographic
        assert!(vv(2, 10, "a", "y").is_newer(&vv(2, 10, "a", "x")));
        // equality
        assert_eq!(
            vv(2, 10, "a", "x").compare(&vv(2, 10, "a", "x")),
            Ordering::Equal
        );
    }

    #[test]
    fn merge_takes_winner_fields_and_jumps_past_both() {
        let local = vv(2, 10, "a", "aaaaaaaa");
        let remote = vv(3, 5, "b", "bbbbbbbb");

        let merged = local.merge(&remote, 99);
        assert_eq!(merged.version, 4);
        assert_eq!(merged.timestamp, 99);
        assert_eq!(merged.node_id, "b");
        assert_eq!(merged.checksum, "bbbbbbbb");

        // symmetric when local wins
        let merged = remote.merge(&local, 99);
        assert_eq!(merged.version, 4);
        assert_eq!(merged.node_id, "b");
    }

    #[test]
    fn string_round_trip() {
        let v = vv(7, 1700000000000, "node-a", "deadbeef");
        assert_eq!(v.to_string(), "7:1700000000000:node-a:deadbeef");
        let back: VersionVector = v.to_string().parse().unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn parse_rejects_wrong_shapes() {
        assert!("".parse::<VersionVector>().is_err());
        assert!("1:2:node".parse::<VersionVector>().is_err());
        assert!("1:2:node:deadbeef:extra".parse::<VersionVector>().is_err());
        assert!("x:2:node:deadbeef".parse::<VersionVector>().is_err());
        assert!("1:y:node:deadbeef".parse::<VersionVector>().is_err());
        assert!("1:2::deadbeef".parse::<VersionVector>().is_err());
        assert!("1:2:node:zzzzzzzz".parse::<VersionVector>().is_err());
        assert!("1:2:node:dead".parse::<VersionVector>().is_err());
    }

    #[test]
    fn serde_uses_the_wire_string() {
        let v = vv(7, 42, "node-a", "deadbeef");
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#""7:42:node-a:deadbeef""#);
        let back: VersionVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
