//! Column addressing.
//!
//! A [`ColumnKey`] names either one fully-qualified column (`info:email`) or
//! an entire family (`info`). Keys order by family first, with the
//! family-level key sorting before every qualified column of that family.

use crate::error::ColumnKeyParseError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Family plus optional qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnKey {
    family: String,
    qualifier: Option<String>,
}

impl ColumnKey {
    /// A fully-qualified column.
    pub fn column(family: impl Into<String>, qualifier: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            qualifier: Some(qualifier.into()),
        }
    }

    /// A whole family.
    pub fn family(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            qualifier: None,
        }
    }

    pub fn family_name(&self) -> &str {
        &self.family
    }

    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }

    /// Returns true if this key names a whole family.
    pub fn is_family(&self) -> bool {
        self.qualifier.is_none()
    }

    /// Returns true if this key names a single column.
    pub fn is_qualified(&self) -> bool {
        self.qualifier.is_some()
    }

    /// The family-level key owning this column (itself if already a family).
    pub fn family_key(&self) -> ColumnKey {
        ColumnKey::family(self.family.clone())
    }

    /// Returns true if `other` is this key, or this is a family key and
    /// `other` is a column inside it.
    pub fn covers(&self, other: &ColumnKey) -> bool {
        match &self.qualifier {
            Some(_) => self == other,
            None => self.family == other.family,
        }
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(qualifier) => write!(f, "{}:{}", self.family, qualifier),
            None => write!(f, "{}", self.family),
        }
    }
}

impl FromStr for ColumnKey {
    type Err = ColumnKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| ColumnKeyParseError {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (family, qualifier) = match s.split_once(':') {
            Some((family, qualifier)) => (family, Some(qualifier)),
            None => (s, None),
        };

        if family.trim().is_empty() {
            return Err(fail("family must not be empty"));
        }
        match qualifier {
            Some(q) if q.is_empty() => Err(fail("qualifier must not be empty after ':'")),
            Some(q) => Ok(ColumnKey::column(family, q)),
            None => Ok(ColumnKey::family(family)),
        }
    }
}

impl Serialize for ColumnKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ColumnKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
