use std::path::PathBuf;

/// Where the mapped-search bind password comes from.
///
/// The password is always stored in the clear at its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordSource {
    Direct(String),
    Environment(String),
    /// First line of the file.
    File(PathBuf),
    Property(String),
}

impl PasswordSource {
    pub fn resolve(&self, property: &dyn Fn(&str) -> Option<String>) -> Result<String, String> {
        match self {
            PasswordSource::Direct(password) => Ok(password.clone()),
            PasswordSource::Environment(name) => std::env::var(name)
                .map_err(|_| format!("environment variable {} is not set", name)),
            PasswordSource::Property(name) => {
                property(name).ok_or_else(|| format!("property {} is not set", name))
            }
            PasswordSource::File(path) => {
                if !path.exists() {
                    return Err(format!("password file {} does not exist", path.display()));
                }
                let content = std::fs::read_to_string(path)
                    .map_err(|e| format!("cannot read password file {}: {}", path.display(), e))?;
                match content.lines().next() {
                    Some(line) if !line.is_empty() => Ok(line.to_string()),
                    _ => Err(format!("password file {} is empty", path.display())),
                }
            }
        }
    }
}
