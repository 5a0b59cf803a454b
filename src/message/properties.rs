//! Typed message properties

use super::codec::FormatError;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Longest accepted property name
pub const MAX_PROPERTY_NAME: usize = 128;

/// Value of a single message property
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Bytes),
    Null,
}

impl PropertyValue {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int8(_) => 2,
            PropertyValue::Int16(_) => 3,
            PropertyValue::Int32(_) => 4,
            PropertyValue::Int64(_) => 5,
            PropertyValue::Float32(_) => 6,
            PropertyValue::Float64(_) => 7,
            PropertyValue::String(_) => 8,
            PropertyValue::Bytes(_) => 9,
            PropertyValue::Null => 10,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Any integer variant widened to i64
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            PropertyValue::Int8(v) => Some(v.into()),
            PropertyValue::Int16(v) => Some(v.into()),
            PropertyValue::Int32(v) => Some(v.into()),
            PropertyValue::Int64(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int32(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int64(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float64(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<Bytes> for PropertyValue {
    fn from(v: Bytes) -> Self {
        PropertyValue::Bytes(v)
    }
}

/// Property map with unique, validated names in a stable order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    entries: BTreeMap<String, PropertyValue>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, returning the previous value under that name
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Result<Option<PropertyValue>, FormatError> {
        let name = name.into();
        validate_property_name(&name)?;
        Ok(self.entries.insert(name, value.into()))
    }

    /// Insert a property that must not already exist; used by the decoder
    pub(crate) fn insert_unique(
        &mut self,
        name: String,
        value: PropertyValue,
    ) -> Result<(), FormatError> {
        validate_property_name(&name)?;
        if self.entries.contains_key(&name) {
            return Err(FormatError::DuplicateProperty(name));
        }
        self.entries.insert(name, value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.entries.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Names start with a letter or underscore and continue with letters, digits,
/// underscores or dots
pub fn validate_property_name(name: &str) -> Result<(), FormatError> {
    let invalid = || FormatError::InvalidPropertyName(name.to_string());

    if name.is_empty() || name.len() > MAX_PROPERTY_NAME {
        return Err(invalid());
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return Err(invalid()),
    }

    if chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        Ok(())
    } else {
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_replace() {
        let mut props = Properties::new();
        assert_eq!(props.set("region", "eu").unwrap(), None);
        assert_eq!(
            props.set("region", "us").unwrap(),
            Some(PropertyValue::String("eu".into()))
        );
        assert_eq!(props.len(), 1);
        assert_eq!(props.get("region").and_then(|v| v.as_str()), Some("us"));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_property_name("order.total").is_ok());
        assert!(validate_property_name("_hidden").is_ok());
        assert!(validate_property_name("").is_err());
        assert!(validate_property_name("1st").is_err());
        assert!(validate_property_name("has space").is_err());
        assert!(validate_property_name(&"a".repeat(MAX_PROPERTY_NAME + 1)).is_err());
    }

    #[test]
    fn test_insert_unique_rejects_duplicates() {
        let mut props = Properties::new();
        props.insert_unique("a".into(), PropertyValue::Null).unwrap();
        assert_eq!(
            props.insert_unique("a".into(), PropertyValue::Bool(true)),
            Err(FormatError::DuplicateProperty("a".into()))
        );
    }

    #[test]
    fn test_integer_widening() {
        assert_eq!(PropertyValue::Int8(-3).as_i64(), Some(-3));
        assert_eq!(PropertyValue::Int32(7).as_i64(), Some(7));
        assert_eq!(PropertyValue::Float64(1.0).as_i64(), None);
    }
}
