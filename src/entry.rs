//! Local directory entries and the server collaborators the engine reads
//! them through.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::PtaError;

pub const CACHED_PASSWORD_ATTRIBUTE: &str = "ds-pta-cached-password";
pub const CACHED_PASSWORD_TIME_ATTRIBUTE: &str = "ds-pta-cached-password-time";

/// An attribute type as known to the schema: a primary name plus aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeType {
    names: Vec<String>,
}

impl AttributeType {
    pub fn new(name: &str) -> Self {
        Self {
            names: vec![name.to_string()],
        }
    }

    pub fn with_aliases(name: &str, aliases: &[&str]) -> Self {
        let mut names = vec![name.to_string()];
        names.extend(aliases.iter().map(|a| a.to_string()));
        Self { names }
    }

    pub fn name(&self) -> &str {
        &self.names[0]
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

/// Read-only attribute type lookup.
pub trait Schema: Send + Sync {
    fn attribute_type(&self, name: &str) -> Option<AttributeType>;
}

/// Schema that knows a fixed set of types and, optionally, synthesizes a
/// plain type for any unknown name.
#[derive(Debug, Clone, Default)]
pub struct StaticSchema {
    types: HashMap<String, AttributeType>,
    allow_unknown: bool,
}

impl StaticSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// A schema that accepts every attribute name as its own type.
    pub fn permissive() -> Self {
        Self {
            types: HashMap::new(),
            allow_unknown: true,
        }
    }

    pub fn with_type(mut self, attribute_type: AttributeType) -> Self {
        for name in &attribute_type.names {
            self.types
                .insert(name.to_ascii_lowercase(), attribute_type.clone());
        }
        self
    }
}

impl Schema for StaticSchema {
    fn attribute_type(&self, name: &str) -> Option<AttributeType> {
        match self.types.get(&name.to_ascii_lowercase()) {
            Some(t) => Some(t.clone()),
            None if self.allow_unknown => Some(AttributeType::new(name)),
            None => None,
        }
    }
}

/// A local directory entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    dn: String,
    attributes: Vec<(String, Vec<String>)>,
}

impl Entry {
    pub fn new(dn: &str) -> Self {
        Self {
            dn: dn.to_string(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, values: &[&str]) -> Self {
        self.add_values(name, values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn add_values(&mut self, name: &str, values: Vec<String>) {
        match self
            .attributes
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => existing.extend(values),
            None => self.attributes.push((name.to_string(), values)),
        }
    }

    pub fn replace_values(&mut self, name: &str, values: Vec<String>) {
        self.attributes.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        if !values.is_empty() {
            self.attributes.push((name.to_string(), values));
        }
    }

    /// Values of every attribute stored under any name of `attribute_type`.
    pub fn values(&self, attribute_type: &AttributeType) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|(n, _)| attribute_type.has_name(n))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
            .collect()
    }

    pub fn first_value(&self, attribute_type: &AttributeType) -> Option<&str> {
        self.values(attribute_type).into_iter().next()
    }
}

/// Write access to local entries, used to persist cached passwords.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Replace the listed attributes of the entry named `dn`.
    async fn replace_attributes(
        &self,
        dn: &str,
        attributes: Vec<(String, Vec<String>)>,
    ) -> Result<(), PtaError>;
}
