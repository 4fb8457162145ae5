use std::sync::Arc;
use tracing::debug;

use crate::config::{MappingPolicy, PolicyConfig};
use crate::connection::{FailoverConnection, FailoverGroup, SearchScope};
use crate::entry::{AttributeType, Entry, Schema};
use crate::error::{PtaError, ResultCode};

const PLACEHOLDER: &str = "%s";

/// Escape a value for use inside a search filter.
pub fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\5c")
        .replace('*', "\\2a")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\0', "\\00")
}

/// Wrap a template in parentheses unless it already is.
fn normalize_template(template: &str) -> String {
    let trimmed = template.trim();
    if trimmed.starts_with('(') {
        trimmed.to_string()
    } else {
        format!("({})", trimmed)
    }
}

/// A filter template must hold exactly one `%s` and parse as a filter once a
/// value is substituted for it.
pub fn validate_filter_template(template: &str) -> Result<(), String> {
    let placeholders = template.matches(PLACEHOLDER).count();
    if placeholders != 1 {
        return Err(format!(
            "filter template {} must contain exactly one {} placeholder, found {}",
            template, PLACEHOLDER, placeholders
        ));
    }
    let sample = normalize_template(template).replacen(PLACEHOLDER, "value", 1);
    let mut parser = FilterParser::new(&sample);
    parser
        .parse()
        .map_err(|e| format!("filter template {} is not a valid search filter: {}", template, e))
}

/// Syntax-only check of a string search filter.
struct FilterParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> FilterParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn parse(&mut self) -> Result<(), String> {
        self.filter()?;
        if self.pos != self.input.len() {
            return Err(format!("unexpected trailing input at offset {}", self.pos));
        }
        Ok(())
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), String> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!("expected '{}' at offset {}", byte as char, self.pos))
        }
    }

    fn filter(&mut self) -> Result<(), String> {
        self.expect(b'(')?;
        match self.peek() {
            Some(b'&') | Some(b'|') => {
                self.pos += 1;
                self.filter()?;
                while self.peek() == Some(b'(') {
                    self.filter()?;
                }
            }
            Some(b'!') => {
                self.pos += 1;
                self.filter()?;
            }
            _ => self.item()?,
        }
        self.expect(b')')
    }

    fn item(&mut self) -> Result<(), String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b';' | b'.' | b':') {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(format!("missing attribute description at offset {}", start));
        }
        match self.peek() {
            Some(b'~') | Some(b'>') | Some(b'<') => {
                self.pos += 1;
                self.expect(b'=')?;
            }
            Some(b'=') => self.pos += 1,
            _ => return Err(format!("missing filter operator at offset {}", self.pos)),
        }
        while let Some(b) = self.peek() {
            match b {
                b'(' => return Err(format!("unescaped '(' at offset {}", self.pos)),
                b')' => break,
                b'\\' => {
                    let hex = self.input.get(self.pos + 1..self.pos + 3);
                    match hex {
                        Some(h) if h.iter().all(u8::is_ascii_hexdigit) => self.pos += 3,
                        _ => return Err(format!("invalid escape at offset {}", self.pos)),
                    }
                }
                _ => self.pos += 1,
            }
        }
        Ok(())
    }
}

/// Maps a local entry to the DN it binds as on the remote servers.
pub struct IdentityMapper {
    policy: MappingPolicy,
    attributes: Vec<AttributeType>,
    base_dns: Vec<String>,
    template: Option<String>,
    search: Option<Arc<FailoverGroup>>,
}

impl IdentityMapper {
    /// Attribute names are resolved through `schema` once, here.
    pub fn new(
        config: &PolicyConfig,
        schema: &dyn Schema,
        search: Option<Arc<FailoverGroup>>,
    ) -> Result<Self, String> {
        let attributes = resolve_attributes(&config.mapped_attributes, schema)?;
        Ok(Self {
            policy: config.mapping_policy,
            attributes,
            base_dns: config.mapped_search_base_dns.clone(),
            template: config
                .mapped_search_filter_template
                .as_deref()
                .map(normalize_template),
            search,
        })
    }

    pub fn policy(&self) -> MappingPolicy {
        self.policy
    }

    fn attribute_names(&self) -> String {
        self.attributes
            .iter()
            .map(AttributeType::name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// The remote DN for `entry`.
    ///
    /// [`PtaError::Mapping`] means the entry has no usable remote identity;
    /// any other error means the remote servers could not answer.
    pub async fn map(&self, entry: &Entry) -> Result<String, PtaError> {
        match self.policy {
            MappingPolicy::Unmapped => Ok(entry.dn().to_string()),
            MappingPolicy::MappedBind => self
                .attributes
                .iter()
                .find_map(|at| entry.first_value(at))
                .map(str::to_string)
                .ok_or_else(|| {
                    PtaError::Mapping(format!(
                        "entry {} has none of the mapped attributes {}",
                        entry.dn(),
                        self.attribute_names()
                    ))
                }),
            MappingPolicy::MappedSearch => self.search(entry).await,
        }
    }

    /// The filter matching `entry` on the remote servers, or None when the
    /// entry has no mapped attribute values.
    pub fn search_filter(&self, entry: &Entry) -> Option<String> {
        let mut terms = Vec::new();
        for at in &self.attributes {
            for value in entry.values(at) {
                let value = escape_filter_value(value);
                terms.push(match &self.template {
                    Some(template) => template.replacen(PLACEHOLDER, &value, 1),
                    None => format!("({}={})", at.name(), value),
                });
            }
        }
        match terms.len() {
            0 => None,
            1 => terms.pop(),
            _ => Some(format!("(|{})", terms.concat())),
        }
    }

    async fn search(&self, entry: &Entry) -> Result<String, PtaError> {
        let filter = self.search_filter(entry).ok_or_else(|| {
            PtaError::Mapping(format!(
                "entry {} has none of the mapped attributes {}",
                entry.dn(),
                self.attribute_names()
            ))
        })?;
        let group = self
            .search
            .as_ref()
            .ok_or_else(|| PtaError::Mapping("no search servers are configured".to_string()))?;

        let mut connection = group.get_connection().await?;
        let result = self.search_base_dns(&mut connection, entry, &filter).await;
        connection.release().await;
        result
    }

    async fn search_base_dns(
        &self,
        connection: &mut FailoverConnection,
        entry: &Entry,
        filter: &str,
    ) -> Result<String, PtaError> {
        for base_dn in &self.base_dns {
            match connection.search(base_dn, SearchScope::WholeSubtree, filter).await {
                Ok(dn) => {
                    debug!("Mapped {} to remote entry {}", entry.dn(), dn);
                    return Ok(dn);
                }
                Err(e) => match e.result_code() {
                    ResultCode::NoSuchObject | ResultCode::ClientSideNoResultsReturned => {
                        debug!("No entry matching {} under {}", filter, base_dn);
                    }
                    ResultCode::ClientSideMoreResultsToReturn => {
                        return Err(PtaError::Mapping(format!(
                            "more than one entry matching {} under {} for {}",
                            filter,
                            base_dn,
                            entry.dn()
                        )));
                    }
                    _ => return Err(e),
                },
            }
        }
        Err(PtaError::Mapping(format!(
            "no remote entry matches {} for {}",
            filter,
            entry.dn()
        )))
    }
}

fn resolve_attributes(names: &[String], schema: &dyn Schema) -> Result<Vec<AttributeType>, String> {
    names
        .iter()
        .map(|name| {
            schema
                .attribute_type(name)
                .ok_or_else(|| format!("mapped attribute {} is not defined in the schema", name))
        })
        .collect()
}

/// Whether every mapped attribute is known to `schema`.
pub fn check_mapped_attributes(config: &PolicyConfig, schema: &dyn Schema) -> Result<(), String> {
    resolve_attributes(&config.mapped_attributes, schema).map(|_| ())
}
