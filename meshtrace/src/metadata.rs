// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Out-of-band call metadata.

use opentelemetry::propagation::{Extractor, Injector};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Key/value metadata attached to a single call.
///
/// Keys are case-insensitive and stored lower-cased; every key maps to one or more values.
/// Metadata travels with the request frame and is the only channel used to move a trace
/// context across the process boundary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    entries: BTreeMap<String, Vec<String>>,
}

fn normalize_owned(key: impl Into<String>) -> String {
    let mut key = key.into();
    key.make_ascii_lowercase();
    key
}

fn normalize(key: &str) -> Cow<'_, str> {
    if key.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(key.to_ascii_lowercase())
    } else {
        Cow::Borrowed(key)
    }
}

impl Metadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    /// Returns every value stored under `key`, empty if the key is absent.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries.get(normalize(key).as_ref()).map(Vec::as_slice).unwrap_or_default()
    }

    /// Replaces all values of `key` with `value`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(normalize_owned(key), vec![value.into()]);
    }

    /// Appends `value` to the values of `key`.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.entry(normalize_owned(key)).or_default().push(value.into());
    }

    /// Removes `key`, returning its values.
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.entries.remove(normalize(key).as_ref())
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(normalize(key).as_ref())
    }

    /// Iterates over the keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterates over `(key, values)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut md = Metadata::new();
        md.extend(iter);
        md
    }
}

impl<K, V> Extend<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.append(k, v);
        }
    }
}

impl Injector for Metadata {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key, value);
    }
}

impl Extractor for Metadata {
    fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::Metadata;

    #[test]
    fn keys_are_case_insensitive() {
        let mut md = Metadata::new();
        md.insert("Test-Key", "a");
        assert_eq!(md.get("test-key"), Some("a"));
        assert_eq!(md.get("TEST-KEY"), Some("a"));
        assert!(md.contains_key("test-KEY"));
        assert_eq!(md.keys().collect::<Vec<_>>(), vec!["test-key"]);
    }

    #[test]
    fn insert_replaces_and_append_accumulates() {
        let mut md: Metadata = [("foo", "1"), ("foo", "2")].into_iter().collect();
        assert_eq!(md.get_all("foo"), ["1", "2"]);
        assert_eq!(md.get("foo"), Some("1"));

        md.insert("foo", "3");
        assert_eq!(md.get_all("foo"), ["3"]);

        assert_eq!(md.remove("FOO"), Some(vec!["3".to_string()]));
        assert!(md.is_empty());
        assert!(md.get_all("foo").is_empty());
    }
}
