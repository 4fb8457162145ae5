use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use bcrypt::{hash, verify, DEFAULT_COST};
use scrypt::Scrypt;
use serde::{Deserialize, Serialize};

/// bcrypt only reads this many bytes of a password and ignores the rest.
pub const BCRYPT_MAX_PASSWORD_LEN: usize = 72;

/// Salted hash schemes usable for cached passwords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageScheme {
    #[serde(rename = "argon2")]
    Argon2,
    #[serde(rename = "bcrypt")]
    Bcrypt,
    #[serde(rename = "scrypt")]
    Scrypt,
}

impl StorageScheme {
    pub fn name(&self) -> &'static str {
        match self {
            StorageScheme::Argon2 => "ARGON2",
            StorageScheme::Bcrypt => "BCRYPT",
            StorageScheme::Scrypt => "SCRYPT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "ARGON2" => Some(StorageScheme::Argon2),
            "BCRYPT" => Some(StorageScheme::Bcrypt),
            "SCRYPT" => Some(StorageScheme::Scrypt),
            _ => None,
        }
    }

    /// Hash `password` and prefix the scheme name: `{SCHEME}hash`.
    pub fn encode_with_scheme(&self, password: &[u8]) -> Result<String, String> {
        let hashed = match self {
            StorageScheme::Argon2 => {
                let salt = SaltString::generate(&mut OsRng);
                Argon2::default()
                    .hash_password(password, &salt)
                    .map_err(|e| format!("failed to hash password: {}", e))?
                    .to_string()
            }
            StorageScheme::Bcrypt => {
                if password.len() > BCRYPT_MAX_PASSWORD_LEN {
                    return Err(format!(
                        "password is longer than the {} bytes bcrypt can hash",
                        BCRYPT_MAX_PASSWORD_LEN
                    ));
                }
                hash(password, DEFAULT_COST).map_err(|e| format!("failed to hash password: {}", e))?
            }
            StorageScheme::Scrypt => {
                let salt = SaltString::generate(&mut OsRng);
                Scrypt
                    .hash_password(password, &salt)
                    .map_err(|e| format!("failed to hash password: {}", e))?
                    .to_string()
            }
        };
        Ok(format!("{{{}}}{}", self.name(), hashed))
    }

    pub fn verify(&self, password: &[u8], hashed: &str) -> bool {
        match self {
            StorageScheme::Argon2 => verify_argon2(password, hashed),
            StorageScheme::Bcrypt => verify_bcrypt(password, hashed),
            StorageScheme::Scrypt => verify_scrypt(password, hashed),
        }
    }
}

/// Split a `{SCHEME}value` user password into its scheme and value.
pub fn decode_user_password(encoded: &str) -> Option<(StorageScheme, &str)> {
    let rest = encoded.strip_prefix('{')?;
    let (name, value) = rest.split_once('}')?;
    if value.is_empty() {
        return None;
    }
    Some((StorageScheme::from_name(name)?, value))
}

/// Whether `password` matches an encoded `{SCHEME}value` string, whatever
/// scheme it was written with.
pub fn password_matches_encoded(password: &[u8], encoded: &str) -> bool {
    match decode_user_password(encoded) {
        Some((scheme, value)) => scheme.verify(password, value),
        None => false,
    }
}

pub fn verify_argon2(password: &[u8], hash: &str) -> bool {
    if let Ok(parsed_hash) = PasswordHash::new(hash) {
        Argon2::default().verify_password(password, &parsed_hash).is_ok()
    } else {
        false
    }
}

/// Passwords bcrypt would truncate never match.
pub fn verify_bcrypt(password: &[u8], hash: &str) -> bool {
    if password.len() > BCRYPT_MAX_PASSWORD_LEN {
        return false;
    }
    verify(password, hash).unwrap_or(false)
}

pub fn verify_scrypt(password: &[u8], hash: &str) -> bool {
    if let Ok(parsed_hash) = PasswordHash::new(hash) {
        Scrypt.verify_password(password, &parsed_hash).is_ok()
    } else {
        false
    }
}
