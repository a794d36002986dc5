// Copyright 2020 Joyent, Inc.

//! Hierarchical `Key=Value` field sets.
//!
//! Every FCP message body is a field set: an ordered list of `Key=Value`
//! lines where a dotted key such as `Files.3.Name` addresses a value nested
//! inside the `Files` and `3` subsets. Within one level, plain values and
//! subsets live in separate namespaces, so `Files=x` and `Files.0.Name=y` can
//! coexist. Serialization writes the values of a level in insertion order
//! followed by its subsets in insertion order, so `parse(serialize(fs)) == fs`.

use std::fmt;
use std::str::FromStr;

use indexmap::map::Entry;
use indexmap::IndexMap;

use crate::errors::FieldSetError;

pub const KEY_SEPARATOR: char = '.';
pub const VALUE_SEPARATOR: char = '=';

#[derive(Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    values: IndexMap<String, String>,
    subsets: IndexMap<String, FieldSet>,
}

fn validate_segment(key: &str, segment: &str) -> Result<(), FieldSetError> {
    if segment.is_empty()
        || segment.contains(VALUE_SEPARATOR)
        || segment.contains('\n')
        || segment.contains('\r')
        || segment.trim() != segment
    {
        Err(FieldSetError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

impl FieldSet {
    pub fn new() -> FieldSet {
        FieldSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.subsets.is_empty()
    }

    /// Walks `path` (all segments but the last) creating subsets as needed and
    /// returns the level that should hold the final segment.
    fn level_mut(
        &mut self,
        key: &str,
        create: bool,
    ) -> Result<Option<(&mut FieldSet, String)>, FieldSetError> {
        let mut segments: Vec<&str> = key.split(KEY_SEPARATOR).collect();
        for segment in &segments {
            validate_segment(key, segment)?;
        }
        let last = match segments.pop() {
            Some(last) => last.to_string(),
            None => return Err(FieldSetError::InvalidKey(key.to_string())),
        };

        let mut level = self;
        for segment in segments {
            if !create && !level.subsets.contains_key(segment) {
                return Ok(None);
            }
            level = level
                .subsets
                .entry(segment.to_string())
                .or_insert_with(FieldSet::new);
        }
        Ok(Some((level, last)))
    }

    fn level<'a, 'k>(&'a self, key: &'k str) -> Option<(&'a FieldSet, &'k str)> {
        let mut level = self;
        let mut segments = key.split(KEY_SEPARATOR).peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                return Some((level, segment));
            }
            level = level.subsets.get(segment)?;
        }
        None
    }

    /// Adds a value, failing if the key is already present at its level.
    pub fn put_single<V: ToString>(
        &mut self,
        key: &str,
        value: V,
    ) -> Result<(), FieldSetError> {
        let value = value.to_string();
        if value.contains('\n') || value.contains('\r') {
            return Err(FieldSetError::InvalidValue {
                key: key.to_string(),
            });
        }
        // Checked up front so a failed put never leaves empty subsets behind.
        if self.get(key).is_some() {
            return Err(FieldSetError::DuplicateKey(key.to_string()));
        }
        if let Some((level, last)) = self.level_mut(key, true)? {
            level.values.insert(last, value);
        }
        Ok(())
    }

    /// Adds or replaces a value.
    pub fn put_overwrite<V: ToString>(
        &mut self,
        key: &str,
        value: V,
    ) -> Result<(), FieldSetError> {
        let value = value.to_string();
        if value.contains('\n') || value.contains('\r') {
            return Err(FieldSetError::InvalidValue {
                key: key.to_string(),
            });
        }
        if let Some((level, last)) = self.level_mut(key, true)? {
            level.values.insert(last, value);
        }
        Ok(())
    }

    /// Grafts `subset` under `key`. An empty subset is dropped since it has
    /// no wire representation.
    pub fn put_subset(
        &mut self,
        key: &str,
        subset: FieldSet,
    ) -> Result<(), FieldSetError> {
        if subset.is_empty() {
            return Ok(());
        }
        if let Some((level, last)) = self.level_mut(key, true)? {
            match level.subsets.entry(last) {
                Entry::Occupied(_) => {
                    return Err(FieldSetError::DuplicateKey(key.to_string()))
                }
                Entry::Vacant(v) => {
                    v.insert(subset);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.level(key)
            .and_then(|(level, last)| level.values.get(last))
            .map(String::as_str)
    }

    /// Like [`get`](FieldSet::get) but an empty value counts as absent.
    pub fn get_nonempty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str, FieldSetError> {
        self.get_nonempty(key)
            .ok_or_else(|| FieldSetError::MissingField(key.to_string()))
    }

    pub fn subset(&self, key: &str) -> Option<&FieldSet> {
        self.level(key)
            .and_then(|(level, last)| level.subsets.get(last))
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        match self.level_mut(key, false) {
            Ok(Some((level, last))) => level.values.shift_remove(&last),
            _ => None,
        }
    }

    pub fn remove_subset(&mut self, key: &str) -> Option<FieldSet> {
        match self.level_mut(key, false) {
            Ok(Some((level, last))) => level.subsets.shift_remove(&last),
            _ => None,
        }
    }

    /// Top-level plain values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Top-level subsets in insertion order.
    pub fn subsets(&self) -> impl Iterator<Item = (&str, &FieldSet)> {
        self.subsets.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Parses a numeric value. An absent or empty value is `Ok(None)`; a
    /// present but malformed one is an error, never a silent default.
    pub fn get_number<T: FromStr>(
        &self,
        key: &str,
    ) -> Result<Option<T>, FieldSetError> {
        match self.get_nonempty(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                FieldSetError::NumberParse {
                    key: key.to_string(),
                    value: raw.to_string(),
                }
            }),
        }
    }

    pub fn get_number_or<T: FromStr>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, FieldSetError> {
        self.get_number(key).map(|v| v.unwrap_or(default))
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, FieldSetError> {
        match self.get_nonempty(key) {
            None => Ok(None),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => Ok(Some(true)),
                "false" | "no" => Ok(Some(false)),
                _ => Err(FieldSetError::BooleanParse {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
            },
        }
    }

    pub fn get_bool_or(
        &self,
        key: &str,
        default: bool,
    ) -> Result<bool, FieldSetError> {
        self.get_bool(key).map(|v| v.unwrap_or(default))
    }

    fn write_lines(&self, prefix: &str, out: &mut String) {
        for (key, value) in &self.values {
            out.push_str(prefix);
            out.push_str(key);
            out.push(VALUE_SEPARATOR);
            out.push_str(value);
            out.push('\n');
        }
        for (key, subset) in &self.subsets {
            let nested = format!("{}{}{}", prefix, key, KEY_SEPARATOR);
            subset.write_lines(&nested, out);
        }
    }

    /// Renders every value as a `Key=Value\n` line. No end marker is written.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.write_lines("", &mut out);
        out
    }

    /// Applies one body line. Returns `Ok(Some(marker))` when the line is an
    /// end marker (any non-blank line without a `=`), `Ok(None)` otherwise.
    /// Surrounding whitespace on keys and markers is ignored, as is a
    /// trailing carriage return.
    pub fn read_line(
        &mut self,
        line: &str,
    ) -> Result<Option<String>, FieldSetError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            return Ok(None);
        }
        match line.find(VALUE_SEPARATOR) {
            Some(idx) => {
                let key = line[..idx].trim();
                let value = &line[idx + 1..];
                self.put_single(key, value)?;
                Ok(None)
            }
            None => Ok(Some(line.trim().to_string())),
        }
    }

    /// Parses one complete body, returning it with its end marker. Lines
    /// after the marker are ignored.
    pub fn parse(text: &str) -> Result<(FieldSet, String), FieldSetError> {
        let mut fs = FieldSet::new();
        for line in text.split('\n') {
            if let Some(marker) = fs.read_line(line)? {
                return Ok((fs, marker));
            }
        }
        Err(FieldSetError::MissingEndMarker)
    }
}

impl fmt::Debug for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut map = f.debug_map();
        let mut lines = String::new();
        self.write_lines("", &mut lines);
        for line in lines.lines() {
            if let Some(idx) = line.find(VALUE_SEPARATOR) {
                map.entry(&&line[..idx], &&line[idx + 1..]);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, Arbitrary, Gen};
    use rand::Rng;

    const SEGMENTS: &[&str] = &[
        "Identifier",
        "URI",
        "Files",
        "0",
        "1",
        "2",
        "Name",
        "Metadata",
        "ContentType",
        "Errors",
        "Count",
    ];

    fn arbitrary_value<G: Gen>(g: &mut G) -> String {
        let raw = String::arbitrary(g);
        raw.chars().filter(|c| *c != '\n' && *c != '\r').collect()
    }

    impl Arbitrary for FieldSet {
        fn arbitrary<G: Gen>(g: &mut G) -> FieldSet {
            let mut fs = FieldSet::new();
            let count = g.gen_range(0, 12);
            for _ in 0..count {
                let depth = g.gen_range(1, 4);
                let key: Vec<&str> = (0..depth)
                    .map(|_| SEGMENTS[g.gen_range(0, SEGMENTS.len())])
                    .collect();
                let _ = fs.put_single(&key.join("."), arbitrary_value(g));
            }
            fs
        }
    }

    #[test]
    fn nested_keys_build_subsets() {
        let mut fs = FieldSet::new();
        fs.put_single("Files.3.Name", "foo").unwrap();
        fs.put_single("Files.3.UploadFrom", "direct").unwrap();
        fs.put_single("Identifier", "x").unwrap();

        let files = fs.subset("Files").unwrap();
        assert_eq!(files.subset("3").unwrap().get("Name"), Some("foo"));
        assert_eq!(fs.get("Files.3.UploadFrom"), Some("direct"));
        assert_eq!(
            fs.serialize(),
            "Identifier=x\nFiles.3.Name=foo\nFiles.3.UploadFrom=direct\n"
        );
    }

    #[test]
    fn duplicate_keys_rejected() {
        let mut fs = FieldSet::new();
        fs.put_single("A.B", "1").unwrap();
        assert_eq!(
            fs.put_single("A.B", "2"),
            Err(FieldSetError::DuplicateKey("A.B".into()))
        );
        fs.put_overwrite("A.B", "2").unwrap();
        assert_eq!(fs.get("A.B"), Some("2"));
    }

    #[test]
    fn values_and_subsets_share_names() {
        let (fs, marker) =
            FieldSet::parse("Files=7\nFiles.0.Name=a\nEnd\n").unwrap();
        assert_eq!(marker, "End");
        assert_eq!(fs.get("Files"), Some("7"));
        assert_eq!(fs.get("Files.0.Name"), Some("a"));
    }

    #[test]
    fn invalid_keys_and_values() {
        let mut fs = FieldSet::new();
        assert!(fs.put_single("a..b", "x").is_err());
        assert!(fs.put_single("", "x").is_err());
        assert!(fs.put_single("a", "x\ny").is_err());
        assert!(fs.is_empty());
    }

    #[test]
    fn typed_getters_fail_on_garbage() {
        let (fs, _) = FieldSet::parse(
            "Verbosity=abc\nPriorityClass=3\nGlobal=maybe\nDSOnly=yes\nEmpty=\nEnd",
        )
        .unwrap();
        assert!(fs.get_number::<u32>("Verbosity").is_err());
        assert_eq!(fs.get_number::<u8>("PriorityClass"), Ok(Some(3)));
        assert!(fs.get_bool("Global").is_err());
        assert_eq!(fs.get_bool("DSOnly"), Ok(Some(true)));
        assert_eq!(fs.get_number::<u32>("Empty"), Ok(None));
        assert_eq!(fs.get_number_or::<u32>("Missing", 9), Ok(9));
    }

    #[test]
    fn whitespace_and_blank_lines_tolerated() {
        let (fs, marker) =
            FieldSet::parse("  Name = tester\r\n\n   \nEndMessage \r\n")
                .unwrap();
        assert_eq!(fs.get("Name"), Some(" tester"));
        assert_eq!(marker, "EndMessage");
    }

    #[test]
    fn missing_marker() {
        assert_eq!(
            FieldSet::parse("A=1\nB=2\n"),
            Err(FieldSetError::MissingEndMarker)
        );
    }

    #[test]
    fn remove_values_and_subsets() {
        let mut fs = FieldSet::new();
        fs.put_single("A", "1").unwrap();
        fs.put_single("B.C", "2").unwrap();
        assert_eq!(fs.remove("A"), Some("1".to_string()));
        assert_eq!(fs.remove("B.X"), None);
        assert!(fs.remove_subset("B").is_some());
        assert!(fs.is_empty());
    }

    quickcheck! {
        fn prop_parse_inverts_serialize(fs: FieldSet) -> bool {
            let mut text = fs.serialize();
            text.push_str("End\n");
            match FieldSet::parse(&text) {
                Ok((parsed, marker)) => {
                    parsed == fs
                        && marker == "End"
                        && parsed.serialize() == fs.serialize()
                }
                Err(_) => false,
            }
        }
    }
}
