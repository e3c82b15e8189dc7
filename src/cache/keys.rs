//! Query key definitions.
//!
//! A [`QueryKey`] identifies one logical read: a resource kind plus the
//! parameters that scope it (page, size, search term, record id). Keys are
//! compared by deep equality, and invalidation matches by prefix: a
//! [`KeyPrefix`] for `patients` hits every key of that resource, while a
//! prefix carrying leading parameters only hits keys that start with them.

use std::fmt;

use uuid::Uuid;

/// One parameter inside a query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamValue {
    U32(u32),
    U64(u64),
    Str(String),
    Uuid(Uuid),
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::U32(value)
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        Self::U64(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Uuid> for ParamValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U32(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v:?}"),
            Self::Uuid(v) => write!(f, "{v}"),
        }
    }
}

/// Composite identifier of a cached read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    resource: &'static str,
    params: Vec<ParamValue>,
}

impl QueryKey {
    pub fn new(resource: &'static str, params: Vec<ParamValue>) -> Self {
        Self { resource, params }
    }

    /// Key with no parameters (singleton reads such as the health probe).
    pub fn bare(resource: &'static str) -> Self {
        Self::new(resource, Vec::new())
    }

    pub fn resource(&self) -> &'static str {
        self.resource
    }

    pub fn params(&self) -> &[ParamValue] {
        &self.params
    }

    /// True if this key is covered by `prefix`.
    pub fn starts_with(&self, prefix: &KeyPrefix) -> bool {
        self.resource == prefix.resource
            && self.params.len() >= prefix.params.len()
            && self.params[..prefix.params.len()] == prefix.params[..]
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.resource)?;
        for param in &self.params {
            write!(f, ", {param}")?;
        }
        write!(f, ")")
    }
}

/// Invalidation pattern: matches every key of `resource` whose leading
/// parameters equal `params`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPrefix {
    resource: &'static str,
    params: Vec<ParamValue>,
}

impl KeyPrefix {
    /// Prefix matching every key of the given resource.
    pub fn resource(resource: &'static str) -> Self {
        Self {
            resource,
            params: Vec::new(),
        }
    }

    /// Narrow the prefix by one leading parameter.
    #[must_use]
    pub fn with(mut self, param: impl Into<ParamValue>) -> Self {
        self.params.push(param.into());
        self
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.resource)?;
        for param in &self.params {
            write!(f, ", {param}")?;
        }
        write!(f, ", ..)")
    }
}
