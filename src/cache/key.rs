/**
 * Structured cache keys
 *
 * A key is a resource name plus an ordered parameter list. Equality is deep
 * and structural, and object parameters are normalized by sorted field name,
 * so two keys built from the same logical identity always compare equal.
 */
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyParam {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<KeyParam>),
    Map(BTreeMap<String, KeyParam>),
}

impl From<&str> for KeyParam {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for KeyParam {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for KeyParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for KeyParam {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Value> for KeyParam {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            // Floats and u64 beyond i64 keep their textual form
            Value::Number(n) => n.as_i64().map_or_else(|| Self::Text(n.to_string()), Self::Int),
            Value::String(s) => Self::Text(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(fields) => Self::Map(
                fields
                    .into_iter()
                    .map(|(name, value)| (name, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for KeyParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{name}={value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Logical identity of a cached resource, e.g. `links:list` or `notifications:userA`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    resource: String,
    params: Vec<KeyParam>,
}

impl CacheKey {
    #[must_use]
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_parts<I, T>(resource: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<KeyParam>,
    {
        Self {
            resource: resource.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Append a parameter, returning the extended key.
    #[must_use]
    pub fn with(mut self, param: impl Into<KeyParam>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Parse the colon-separated form used in logs and on the command line.
    ///
    /// The first segment is the resource; remaining segments become `Int`
    /// params when they parse as integers and `Text` otherwise. Returns
    /// `None` for an empty resource name.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let mut segments = raw.split(':');
        let resource = segments.next().filter(|s| !s.is_empty())?;

        let params = segments
            .map(|segment| {
                segment
                    .parse::<i64>()
                    .map_or_else(|_| KeyParam::Text(segment.to_string()), KeyParam::Int)
            })
            .collect();

        Some(Self {
            resource: resource.to_string(),
            params,
        })
    }

    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    #[must_use]
    pub fn params(&self) -> &[KeyParam] {
        &self.params
    }

    /// True iff `prefix` names the same resource and its params are a leading
    /// subsequence of this key's params. Every key matches itself.
    #[must_use]
    pub fn matches_prefix(&self, prefix: &Self) -> bool {
        self.resource == prefix.resource && self.params.starts_with(&prefix.params)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)?;
        for param in &self.params {
            write!(f, ":{param}")?;
        }
        Ok(())
    }
}
