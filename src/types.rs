//! Core data types: points, tags, series keys and composite keys
//!
//! The cache, WAL and TSM files all key values by a *composite key*: the
//! series key (measurement name plus sorted tag pairs) joined with the field
//! name through the fixed four-byte separator `#!~#`.

use std::collections::HashMap;

use crate::value::{FieldValue, Value};

/// Separates the series key from the field name in a composite key
pub const KEY_FIELD_SEPARATOR: &str = "#!~#";

/// Byte form of [`KEY_FIELD_SEPARATOR`]
pub const KEY_FIELD_SEPARATOR_BYTES: &[u8] = KEY_FIELD_SEPARATOR.as_bytes();

/// Smallest time representable by the query layer; normalized to
/// [`i64::MIN`] before reaching the engine
pub const QUERY_MIN_TIME: i64 = i64::MIN + 2;

/// Largest time representable by the query layer; normalized to
/// [`i64::MAX`] before reaching the engine
pub const QUERY_MAX_TIME: i64 = i64::MAX - 1;

/// Values keyed by composite key, the unit of multi-key writes
pub type ValuesMap = HashMap<Vec<u8>, Vec<Value>>;

/// Normalizes query-layer time bounds to the engine's full i64 range.
pub fn normalize_time_range(min: i64, max: i64) -> (i64, i64) {
    let min = if min == QUERY_MIN_TIME { i64::MIN } else { min };
    let max = if max == QUERY_MAX_TIME { i64::MAX } else { max };
    (min, max)
}

/// Combines a series key and field name into a composite key.
pub fn series_field_key(series_key: &[u8], field: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(series_key.len() + KEY_FIELD_SEPARATOR.len() + field.len());
    key.extend_from_slice(series_key);
    key.extend_from_slice(KEY_FIELD_SEPARATOR_BYTES);
    key.extend_from_slice(field);
    key
}

/// Splits a composite key at the first occurrence of the separator,
/// returning the series key and the field name.
///
/// If the key carries no separator the whole key is returned as the series
/// component and the field is empty.
pub fn series_and_field_from_composite_key(key: &[u8]) -> (&[u8], &[u8]) {
    match key
        .windows(KEY_FIELD_SEPARATOR_BYTES.len())
        .position(|w| w == KEY_FIELD_SEPARATOR_BYTES)
    {
        Some(sep) => (&key[..sep], &key[sep + KEY_FIELD_SEPARATOR_BYTES.len()..]),
        None => (key, &[]),
    }
}

/// Sorted key/value metadata tags identifying a series
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tags(Vec<(Vec<u8>, Vec<u8>)>);

impl Tags {
    /// Create an empty tag set
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a tag set from pairs; the pairs are sorted by key
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Vec<u8>>,
        V: Into<Vec<u8>>,
    {
        let mut tags: Vec<(Vec<u8>, Vec<u8>)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        tags.sort();
        Self(tags)
    }

    /// Iterate over the tag pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = &(Vec<u8>, Vec<u8>)> {
        self.0.iter()
    }

    /// True if the tag set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of tag pairs
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Builds a series key from a measurement name and tag set.
///
/// Layout: `name,tagk=tagv,...` with tags in key order.
pub fn make_key(name: &[u8], tags: &Tags) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + tags.len() * 16);
    key.extend_from_slice(name);
    for (k, v) in tags.iter() {
        key.push(b',');
        key.extend_from_slice(k);
        key.push(b'=');
        key.extend_from_slice(v);
    }
    key
}

/// Splits a series key back into its measurement name and tags.
pub fn parse_key(key: &[u8]) -> (Vec<u8>, Tags) {
    let mut parts = key.split(|&b| b == b',');
    let name = parts.next().unwrap_or_default().to_vec();
    let mut pairs = Vec::new();
    for part in parts {
        match part.iter().position(|&b| b == b'=') {
            Some(eq) => pairs.push((part[..eq].to_vec(), part[eq + 1..].to_vec())),
            None => pairs.push((part.to_vec(), Vec::new())),
        }
    }
    (name, Tags(pairs))
}

/// A single measurement point: a series key, a timestamp and one or more
/// typed field values
#[derive(Debug, Clone)]
pub struct Point {
    key: Vec<u8>,
    time: i64,
    fields: Vec<(Vec<u8>, FieldValue)>,
}

impl Point {
    /// Create a point for the series identified by `name` and `tags`
    pub fn new(name: &[u8], tags: &Tags, time: i64) -> Self {
        Self {
            key: make_key(name, tags),
            time,
            fields: Vec::new(),
        }
    }

    /// Create a point from a raw series key
    pub fn from_series_key(key: impl Into<Vec<u8>>, time: i64) -> Self {
        Self {
            key: key.into(),
            time,
            fields: Vec::new(),
        }
    }

    /// Add a field to the point
    pub fn with_field(mut self, name: impl Into<Vec<u8>>, value: FieldValue) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    /// Series key of the point
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Timestamp in nanoseconds since the unix epoch
    pub fn time(&self) -> i64 {
        self.time
    }

    /// Field name/value pairs
    pub fn fields(&self) -> &[(Vec<u8>, FieldValue)] {
        &self.fields
    }
}
