//! Ensemble member file format.
//!
//! Each member is one JSON document, optionally gzip-compressed:
//!
//! ```json
//! {
//!   "member_id": 3,
//!   "variable": "streamflow",
//!   "time": [1672531200, "2023-01-01T01:00:00Z"],
//!   "missing": {"missing_value": -9999.0},
//!   "reaches": {"1001": [1.5, null], "1002": [0.2, 0.3]}
//! }
//! ```
//!
//! Parsing is selective. A scan only measures the reach arrays, and a batch load materialises
//! just the reaches it was asked for; everything else is skipped inside the deserialiser so a
//! member's unused reaches never occupy memory.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserializer, Serialize};

use crate::compression::{self, Compression};
use crate::models::ReachId;
use crate::types::{Missing, Timestamp};

/// Which reach arrays to keep while parsing.
#[derive(Clone, Copy, Debug)]
pub enum ReachFilter<'a> {
    /// Keep only the length of every reach array.
    Lengths,
    /// Keep the values of the listed reaches.
    Only(&'a BTreeSet<ReachId>),
    /// Keep every reach.
    All,
}

/// A reach array as kept by the parser.
#[derive(Clone, Debug, PartialEq)]
pub enum ReachValues {
    Length(usize),
    Values(Vec<Option<f64>>),
}

impl ReachValues {
    pub fn len(&self) -> usize {
        match self {
            ReachValues::Length(len) => *len,
            ReachValues::Values(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A parsed member file.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedMember {
    /// Embedded member label, informational only.
    pub label: Option<String>,
    pub variable: Option<String>,
    pub time: Vec<Timestamp>,
    pub missing: Option<Missing>,
    pub reaches: BTreeMap<ReachId, ReachValues>,
}

impl ParsedMember {
    /// Check the internal consistency of the member.
    pub fn validate(&self) -> Result<(), String> {
        if self.time.is_empty() {
            return Err("time grid is empty".to_string());
        }
        if let Some(pair) = self.time.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(format!(
                "time grid is not strictly increasing at {}",
                pair[1]
            ));
        }
        if let Some((reach, values)) = self
            .reaches
            .iter()
            .find(|(_, values)| values.len() != self.time.len())
        {
            return Err(format!(
                "reach {} has {} values for {} time steps",
                reach,
                values.len(),
                self.time.len()
            ));
        }
        if let Some(missing) = &self.missing {
            missing.validate().map_err(|err| err.to_string())?;
        }
        Ok(())
    }
}

/// Serialisable form of a member file, for producers of ensemble output.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MemberFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    pub time: Vec<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Missing>,
    pub reaches: BTreeMap<ReachId, Vec<Option<f64>>>,
}

impl MemberFile {
    /// Write the member to `path`, gzip-compressed if the path ends in `.gz`.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec(self)?;
        let data = match Compression::from_path(path) {
            Some(compression) => compression::compress(compression, &json)?,
            None => json,
        };
        std::fs::write(path, data)
    }
}

/// Parse member JSON, keeping the reaches selected by `filter`.
pub fn parse_member(data: &[u8], filter: ReachFilter<'_>) -> Result<ParsedMember, serde_json::Error> {
    let mut deserializer = serde_json::Deserializer::from_slice(data);
    let member = MemberSeed { filter }.deserialize(&mut deserializer)?;
    deserializer.end()?;
    Ok(member)
}

/// Read, decompress, parse and validate a member file.
///
/// Returns a human-readable reason on failure; callers attach the member identity.
pub fn read_member(path: &Path, filter: ReachFilter<'_>) -> Result<ParsedMember, String> {
    let data = std::fs::read(path).map_err(|err| err.to_string())?;
    let data = match Compression::from_path(path) {
        Some(compression) => {
            compression::decompress(compression, &data).map_err(|err| {
                let causes = crate::error::error_chain(&err).join(": ");
                format!("{}: {}", err, causes)
            })?
        }
        None => data,
    };
    let member = parse_member(&data, filter).map_err(|err| err.to_string())?;
    member.validate()?;
    Ok(member)
}

struct MemberSeed<'a> {
    filter: ReachFilter<'a>,
}

impl<'de, 'a> DeserializeSeed<'de> for MemberSeed<'a> {
    type Value = ParsedMember;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(MemberVisitor {
            filter: self.filter,
        })
    }
}

struct MemberVisitor<'a> {
    filter: ReachFilter<'a>,
}

impl<'de, 'a> Visitor<'de> for MemberVisitor<'a> {
    type Value = ParsedMember;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an ensemble member object")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut label = None;
        let mut variable = None;
        let mut time = None;
        let mut missing = None;
        let mut reaches = None;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "member_id" => {
                    label = match map.next_value::<serde_json::Value>()? {
                        serde_json::Value::Null => None,
                        serde_json::Value::String(text) => Some(text),
                        other => Some(other.to_string()),
                    }
                }
                "variable" => variable = map.next_value::<Option<String>>()?,
                "time" => time = Some(map.next_value::<Vec<Timestamp>>()?),
                "missing" => missing = map.next_value::<Option<Missing>>()?,
                "reaches" => {
                    reaches = Some(map.next_value_seed(ReachesSeed {
                        filter: self.filter,
                    })?)
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        let time = time.ok_or_else(|| de::Error::missing_field("time"))?;
        let reaches = reaches.ok_or_else(|| de::Error::missing_field("reaches"))?;
        Ok(ParsedMember {
            label,
            variable,
            time,
            missing,
            reaches,
        })
    }
}

struct ReachesSeed<'a> {
    filter: ReachFilter<'a>,
}

impl<'de, 'a> DeserializeSeed<'de> for ReachesSeed<'a> {
    type Value = BTreeMap<ReachId, ReachValues>;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(ReachesVisitor {
            filter: self.filter,
        })
    }
}

struct ReachesVisitor<'a> {
    filter: ReachFilter<'a>,
}

impl<'de, 'a> Visitor<'de> for ReachesVisitor<'a> {
    type Value = BTreeMap<ReachId, ReachValues>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map from reach id to an array of values")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut reaches = BTreeMap::new();
        while let Some(reach) = map.next_key::<ReachId>()? {
            match self.filter {
                ReachFilter::Lengths => {
                    let len = map.next_value_seed(SeqLength)?;
                    reaches.insert(reach, ReachValues::Length(len));
                }
                ReachFilter::Only(wanted) if !wanted.contains(&reach) => {
                    map.next_value::<IgnoredAny>()?;
                }
                ReachFilter::Only(_) | ReachFilter::All => {
                    let values = map.next_value::<Vec<Option<f64>>>()?;
                    reaches.insert(reach, ReachValues::Values(values));
                }
            }
        }
        Ok(reaches)
    }
}

/// Counts the elements of a numeric array without storing them.
struct SeqLength;

impl<'de> DeserializeSeed<'de> for SeqLength {
    type Value = usize;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for SeqLength {
    type Value = usize;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an array of numbers or nulls")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut len = 0;
        while seq.next_element::<Option<f64>>()?.is_some() {
            len += 1;
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMBER: &str = r#"{
        "member_id": 3,
        "variable": "streamflow",
        "time": [0, "1970-01-01T01:00:00Z"],
        "missing": {"missing_value": -9999.0},
        "attributes": {"model": "t-route"},
        "reaches": {"1001": [1.5, null], "1002": [0.2, -9999.0]}
    }"#;

    #[test]
    fn parse_lengths() {
        let member = parse_member(MEMBER.as_bytes(), ReachFilter::Lengths).unwrap();
        assert_eq!(Some("3".to_string()), member.label);
        assert_eq!(Some("streamflow".to_string()), member.variable);
        assert_eq!(
            vec![Timestamp::from_seconds(0), Timestamp::from_seconds(3600)],
            member.time
        );
        assert_eq!(Some(Missing::MissingValue(-9999.0)), member.missing);
        assert_eq!(
            Some(&ReachValues::Length(2)),
            member.reaches.get(&ReachId::from("1001"))
        );
        member.validate().unwrap();
    }

    #[test]
    fn parse_only_selected_reaches() {
        let wanted = BTreeSet::from([ReachId::from("1002")]);
        let member = parse_member(MEMBER.as_bytes(), ReachFilter::Only(&wanted)).unwrap();
        assert_eq!(1, member.reaches.len());
        assert_eq!(
            Some(&ReachValues::Values(vec![Some(0.2), Some(-9999.0)])),
            member.reaches.get(&ReachId::from("1002"))
        );
    }

    #[test]
    fn parse_all_reaches() {
        let member = parse_member(MEMBER.as_bytes(), ReachFilter::All).unwrap();
        assert_eq!(
            Some(&ReachValues::Values(vec![Some(1.5), None])),
            member.reaches.get(&ReachId::from("1001"))
        );
    }

    #[test]
    fn parse_missing_time() {
        let err = parse_member(br#"{"reaches": {}}"#, ReachFilter::All).unwrap_err();
        assert!(err.to_string().contains("missing field `time`"));
    }

    #[test]
    fn parse_bad_values_while_scanning() {
        let data = br#"{"time": [0], "reaches": {"1": ["high"]}}"#;
        assert!(parse_member(data, ReachFilter::Lengths).is_err());
    }

    #[test]
    fn parse_trailing_garbage() {
        let data = br#"{"time": [0], "reaches": {}} trailing"#;
        assert!(parse_member(data, ReachFilter::Lengths).is_err());
    }

    #[test]
    fn validate_non_increasing_grid() {
        let data = br#"{"time": [10, 10], "reaches": {}}"#;
        let member = parse_member(data, ReachFilter::Lengths).unwrap();
        assert_eq!(
            Err("time grid is not strictly increasing at 1970-01-01T00:00:10Z".to_string()),
            member.validate()
        );
    }

    #[test]
    fn validate_length_mismatch() {
        let data = br#"{"time": [0, 1], "reaches": {"R1": [1.0]}}"#;
        let member = parse_member(data, ReachFilter::Lengths).unwrap();
        assert_eq!(
            Err("reach R1 has 1 values for 2 time steps".to_string()),
            member.validate()
        );
    }

    #[test]
    fn write_then_read_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("member_0.json.gz");
        let file = MemberFile {
            time: vec![Timestamp::from_seconds(0)],
            reaches: BTreeMap::from([(ReachId::from("R1"), vec![Some(2.5)])]),
            ..Default::default()
        };
        file.write(&path).unwrap();
        let member = read_member(&path, ReachFilter::All).unwrap();
        assert_eq!(
            Some(&ReachValues::Values(vec![Some(2.5)])),
            member.reaches.get(&ReachId::from("R1"))
        );
    }

    #[test]
    fn read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_member(&dir.path().join("nope.json"), ReachFilter::Lengths).is_err());
    }
}
