use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GtidError {
    #[error("Invalid GTID set '{0}'")]
    InvalidSet(String),

    #[error("Invalid GTID '{0}'")]
    InvalidGtid(String),
}

/// A single global transaction identifier, `source:gno`.
///
/// `source` is the server uuid, optionally followed by `:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gtid {
    pub source: String,
    pub gno: u64,
}

impl FromStr for Gtid {
    type Err = GtidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (source, gno) = s
            .rsplit_once(':')
            .ok_or_else(|| GtidError::InvalidGtid(s.to_string()))?;
        let gno = gno
            .parse::<u64>()
            .map_err(|_| GtidError::InvalidGtid(s.to_string()))?;
        if source.is_empty() || gno == 0 {
            return Err(GtidError::InvalidGtid(s.to_string()));
        }
        Ok(Gtid {
            source: source.to_ascii_lowercase(),
            gno,
        })
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.gno)
    }
}

/// A set of GTIDs stored as merged, inclusive intervals per source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    sources: BTreeMap<String, Vec<(u64, u64)>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn add(&mut self, gtid: &Gtid) {
        self.add_interval(&gtid.source, gtid.gno, gtid.gno);
    }

    pub fn add_interval(&mut self, source: &str, start: u64, end: u64) {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        let intervals = self
            .sources
            .entry(source.to_ascii_lowercase())
            .or_default();
        intervals.push((start, end));
        normalize(intervals);
    }

    pub fn contains(&self, gtid: &Gtid) -> bool {
        self.sources
            .get(&gtid.source)
            .is_some_and(|ivs| ivs.iter().any(|&(s, e)| s <= gtid.gno && gtid.gno <= e))
    }

    /// Every transaction in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &GtidSet) -> bool {
        self.sources.iter().all(|(source, intervals)| {
            let Some(theirs) = other.sources.get(source) else {
                return intervals.is_empty();
            };
            intervals
                .iter()
                .all(|&(s, e)| theirs.iter().any(|&(ts, te)| ts <= s && e <= te))
        })
    }

    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn merge(&mut self, other: &GtidSet) {
        for (source, intervals) in &other.sources {
            let entry = self.sources.entry(source.clone()).or_default();
            entry.extend(intervals.iter().copied());
            normalize(entry);
        }
    }

    /// Transactions in `self` that are not in `other`.
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut out = GtidSet::new();
        for (source, intervals) in &self.sources {
            let theirs = other.sources.get(source).cloned().unwrap_or_default();
            for &(s, e) in intervals {
                let mut cursor = s;
                for &(ts, te) in &theirs {
                    if te < cursor || ts > e {
                        continue;
                    }
                    if ts > cursor {
                        out.add_interval(source, cursor, ts - 1);
                    }
                    cursor = te.saturating_add(1);
                    if cursor > e {
                        break;
                    }
                }
                if cursor <= e {
                    out.add_interval(source, cursor, e);
                }
            }
        }
        out
    }

    /// Number of transactions in the set.
    pub fn count(&self) -> u64 {
        self.sources
            .values()
            .flat_map(|ivs| ivs.iter())
            .map(|&(s, e)| e - s + 1)
            .sum()
    }
}

fn normalize(intervals: &mut Vec<(u64, u64)>) {
    intervals.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
    for &(s, e) in intervals.iter() {
        match merged.last_mut() {
            Some(last) if s <= last.1.saturating_add(1) => last.1 = last.1.max(e),
            _ => merged.push((s, e)),
        }
    }
    *intervals = merged;
}

impl FromStr for GtidSet {
    type Err = GtidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = GtidSet::new();
        let invalid = || GtidError::InvalidSet(s.to_string());

        for member in s.split(',') {
            let member: String = member.chars().filter(|c| !c.is_whitespace()).collect();
            if member.is_empty() {
                continue;
            }

            let mut parts = member.split(':');
            let uuid = parts.next().filter(|u| !u.is_empty()).ok_or_else(invalid)?;
            let mut source = uuid.to_string();
            let mut saw_interval = false;

            for part in parts {
                if let Some((start, end)) = parse_interval(part) {
                    if start == 0 {
                        return Err(invalid());
                    }
                    set.add_interval(&source, start, end);
                    saw_interval = true;
                } else if !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    source = format!("{uuid}:{part}");
                } else {
                    return Err(invalid());
                }
            }

            if !saw_interval {
                return Err(invalid());
            }
        }

        Ok(set)
    }
}

fn parse_interval(part: &str) -> Option<(u64, u64)> {
    match part.split_once('-') {
        Some((s, e)) => Some((s.parse().ok()?, e.parse().ok()?)),
        None => part.parse().ok().map(|n| (n, n)),
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (source, intervals) in &self.sources {
            if intervals.is_empty() {
                continue;
            }
            if !first {
                f.write_str(",\n")?;
            }
            first = false;
            f.write_str(source)?;
            for &(s, e) in intervals {
                if s == e {
                    write!(f, ":{s}")?;
                } else {
                    write!(f, ":{s}-{e}")?;
                }
            }
        }
        Ok(())
    }
}

impl Serialize for GtidSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for GtidSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const B: &str = "5a0bc2d4-1f12-11ee-a4c2-0242ac110002";

    fn set(s: &str) -> GtidSet {
        s.parse().unwrap()
    }

    #[test]
    fn parses_and_merges_intervals() {
        let s = set(&format!("{A}:1-5:6-8:10, {B}:3"));
        assert_eq!(s.to_string(), format!("{A}:1-8:10,\n{B}:3"));
        assert_eq!(s.count(), 10);
    }

    #[test]
    fn empty_string_is_empty_set() {
        assert!(set("").is_empty());
        assert!(set(" \n").is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!("nope".parse::<GtidSet>().is_err());
        assert!(format!("{A}:0-3").parse::<GtidSet>().is_err());
        assert!(format!("{A}:x-y").parse::<GtidSet>().is_err());
    }

    #[test]
    fn subset_and_contains() {
        let small = set(&format!("{A}:2-4"));
        let big = set(&format!("{A}:1-10,{B}:1"));
        assert!(small.is_subset_of(&big));
        assert!(!big.is_subset_of(&small));
        assert!(GtidSet::new().is_subset_of(&small));
        assert!(big.contains(&format!("{B}:1").parse().unwrap()));
        assert!(!big.contains(&format!("{B}:2").parse().unwrap()));
    }

    #[test]
    fn subtract_splits_intervals() {
        let all = set(&format!("{A}:1-10"));
        let some = set(&format!("{A}:3-4:8"));
        assert_eq!(all.subtract(&some).to_string(), format!("{A}:1-2:5-7:9-10"));
        assert!(some.subtract(&all).is_empty());
    }

    #[test]
    fn tagged_sources_are_distinct() {
        let s = set(&format!("{A}:1-3:tag1:5"));
        assert!(s.contains(&format!("{A}:2").parse().unwrap()));
        assert!(s.contains(&format!("{A}:tag1:5").parse().unwrap()));
        assert!(!s.contains(&format!("{A}:5").parse().unwrap()));
    }
}
