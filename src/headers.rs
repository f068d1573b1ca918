use std::collections::BTreeMap;

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Header mapping with case-insensitive names.
///
/// Names are stored lowercased. A header may carry several values; stored tapes render a
/// single value as a string and several values as an array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> Option<&[String]> {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// Replaces every value of `name`.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.0
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut headers = Self::new();
        for (name, value) in map {
            headers.append(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }
        headers
    }

    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.0.len());
        for (name, values) in &self.0 {
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                tracing::debug!(header = %name, "skipping invalid header name");
                continue;
            };
            for value in values {
                let Ok(header_value) = HeaderValue::from_str(value) else {
                    tracing::debug!(header = %name, "skipping invalid header value");
                    continue;
                };
                map.append(header_name.clone(), header_value);
            }
        }
        map
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.append(name.as_ref(), value);
        }
        headers
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StoredHeaderValue {
    One(String),
    Many(Vec<String>),
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let stored: BTreeMap<&str, StoredHeaderValue> = self
            .0
            .iter()
            .map(|(name, values)| {
                let value = match values.as_slice() {
                    [single] => StoredHeaderValue::One(single.clone()),
                    many => StoredHeaderValue::Many(many.to_vec()),
                };
                (name.as_str(), value)
            })
            .collect();
        stored.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stored = BTreeMap::<String, StoredHeaderValue>::deserialize(deserializer)?;
        let mut headers = Self::new();
        for (name, value) in stored {
            match value {
                StoredHeaderValue::One(value) => headers.append(&name, value),
                StoredHeaderValue::Many(values) => {
                    for value in values {
                        headers.append(&name, value);
                    }
                }
            }
        }
        Ok(headers)
    }
}
