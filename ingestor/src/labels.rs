use std::{fmt, ops::Index, sync::Arc};

use serde::{
    de::{self, Deserialize, Deserializer, MapAccess, Visitor},
    ser::{Serialize, SerializeMap, Serializer},
};

/// Reserved label holding the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Label is a key/value pair of strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("duplicate label name {0:?}")]
    DuplicateName(String),
    #[error("empty label name")]
    EmptyName,
    #[error("missing metric name label `{METRIC_NAME_LABEL}`")]
    MissingMetricName,
}

/// `LabelSet` is a sorted set of `Label`s with unique names.
///
/// A label set cannot be modified once built; [`LabelSet::without`] returns a
/// new set. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelSet(Arc<[Label]>);

impl Default for LabelSet {
    fn default() -> Self {
        Self(Arc::from(Vec::new()))
    }
}

impl LabelSet {
    pub fn try_new<I, N, V>(labels: I) -> Result<Self, LabelError>
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        let mut labels = labels
            .into_iter()
            .map(|(name, value)| Label {
                name: name.into(),
                value: value.into(),
            })
            .collect::<Vec<_>>();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        if labels.iter().any(|label| label.name.is_empty()) {
            return Err(LabelError::EmptyName);
        }
        if let Some(w) = labels.windows(2).find(|w| w[0].name == w[1].name) {
            return Err(LabelError::DuplicateName(w[0].name.clone()));
        }
        Ok(Self(labels.into()))
    }

    /// Returns the value of the label with given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by_key(&name, |label| label.name.as_str())
            .ok()
            .map(|index| self.0[index].value.as_str())
    }

    /// Returns the metric name, failing if `__name__` is absent or empty.
    pub fn metric(&self) -> Result<&str, LabelError> {
        match self.get(METRIC_NAME_LABEL) {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(LabelError::MissingMetricName),
        }
    }

    /// Returns a copy of this set without the label `name`.
    pub fn without(&self, name: &str) -> Self {
        if self.get(name).is_none() {
            return self.clone();
        }
        Self(
            self.0
                .iter()
                .filter(|label| label.name != name)
                .cloned()
                .collect::<Vec<_>>()
                .into(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Blake3Fingerprinter.fingerprint(self)
    }
}

impl Index<&str> for LabelSet {
    type Output = str;

    fn index(&self, key: &str) -> &Self::Output {
        self.get(key)
            .unwrap_or_else(|| panic!("no label found for key {key:?}"))
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        f.write_str("}")
    }
}

impl Serialize for LabelSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for label in self.0.iter() {
            map.serialize_entry(&label.name, &label.value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LabelSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct LabelSetVisitor;

        impl<'de> Visitor<'de> for LabelSetVisitor {
            type Value = LabelSet;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of label names to values")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                // Collect every entry so duplicate keys surface as an error
                // instead of silently overwriting each other.
                let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(8));
                while let Some((name, value)) = access.next_entry::<String, String>()? {
                    pairs.push((name, value));
                }
                LabelSet::try_new(pairs).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_map(LabelSetVisitor)
    }
}

/// Deterministic hash of a canonicalized [`LabelSet`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        hex::encode(fp.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// Computes fingerprints for label sets.
///
/// The series cache is keyed by whatever this returns, so implementations
/// must map equal label sets to equal fingerprints.
pub trait Fingerprinter: fmt::Debug + Send + Sync {
    fn fingerprint(&self, labels: &LabelSet) -> Fingerprint;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Fingerprinter;

impl Fingerprinter for Blake3Fingerprinter {
    fn fingerprint(&self, labels: &LabelSet) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        // Labels are already sorted by name. Length prefixes keep
        // {"ab": "c"} and {"a": "bc"} apart.
        for label in labels.iter() {
            hasher.update(&(label.name.len() as u64).to_le_bytes());
            hasher.update(label.name.as_bytes());
            hasher.update(&(label.value.len() as u64).to_le_bytes());
            hasher.update(label.value.as_bytes());
        }
        Fingerprint(hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn test_labels() {
        let labels = LabelSet::try_new([("b", "1"), ("a", "2"), ("c", "2")]).unwrap();
        expect![[r#"
            LabelSet(
                [
                    Label {
                        name: "a",
                        value: "2",
                    },
                    Label {
                        name: "b",
                        value: "1",
                    },
                    Label {
                        name: "c",
                        value: "2",
                    },
                ],
            )
        "#]]
        .assert_debug_eq(&labels);

        expect![[r#"
            LabelSet(
                [],
            )
        "#]]
        .assert_debug_eq(&LabelSet::default());
    }

    #[test]
    fn test_labels_not_unique() {
        let err = LabelSet::try_new([("b", "1"), ("a", "2"), ("a", "3")]).unwrap_err();
        assert_eq!(err, LabelError::DuplicateName("a".to_owned()));
        let err = LabelSet::try_new([("", "1")]).unwrap_err();
        assert_eq!(err, LabelError::EmptyName);
    }

    #[test]
    fn test_labels_get_without() {
        let labels = LabelSet::try_new([("a", "1"), ("b", "2")]).unwrap();
        assert_eq!(labels.get("b"), Some("2"));
        assert!(labels.get("x").is_none());
        assert_eq!(&labels["a"], "1");

        let stripped = labels.without("b");
        assert!(stripped.get("b").is_none());
        assert_eq!(stripped.len(), 1);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.without("x"), labels);
    }

    #[test]
    fn test_labels_metric() {
        let labels = LabelSet::try_new([("__name__", "up"), ("job", "node")]).unwrap();
        assert_eq!(labels.metric(), Ok("up"));
        let labels = LabelSet::try_new([("job", "node")]).unwrap();
        assert_eq!(labels.metric(), Err(LabelError::MissingMetricName));
        let labels = LabelSet::try_new([("__name__", "")]).unwrap();
        assert_eq!(labels.metric(), Err(LabelError::MissingMetricName));
    }

    #[test]
    #[should_panic]
    fn test_labels_index_not_found() {
        let labels = LabelSet::try_new([("a", "1")]).unwrap();
        let _ = &labels["b"];
    }

    #[test]
    fn test_fingerprint_order_independent() {
        let a = LabelSet::try_new([("b", "2"), ("a", "1"), ("c", "3")]).unwrap();
        let b = LabelSet::try_new([("c", "3"), ("a", "1"), ("b", "2")]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(String::from(a.fingerprint()).len(), 64);

        let c = LabelSet::try_new([("a", "1"), ("b", "2")]).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_fingerprint_is_length_prefixed() {
        let a = LabelSet::try_new([("ab", "c")]).unwrap();
        let b = LabelSet::try_new([("a", "bc")]).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_labels_serde() {
        let labels = LabelSet::try_new([("b", "1"), ("a", "2"), ("c", "2")]).unwrap();
        expect![[r#"
            {
              "a": "2",
              "b": "1",
              "c": "2"
            }"#]]
        .assert_eq(&serde_json::to_string_pretty(&labels).unwrap());

        let parsed: LabelSet = serde_json::from_str(r#"{"c":"2","a":"2","b":"1"}"#).unwrap();
        assert_eq!(parsed, labels);

        let err = serde_json::from_str::<LabelSet>(r#"{"a":"1","a":"2"}"#).unwrap_err();
        assert!(err.to_string().contains("duplicate label name"), "{err}");
    }

    #[test]
    fn test_labels_display() {
        let labels = LabelSet::try_new([("__name__", "up"), ("job", "node")]).unwrap();
        assert_eq!(labels.to_string(), r#"{__name__="up", job="node"}"#);
    }
}
