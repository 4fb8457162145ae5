use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::utils::{password_matches_encoded, StorageScheme};
use crate::entry::{
    AttributeType, Entry, EntryStore, CACHED_PASSWORD_ATTRIBUTE, CACHED_PASSWORD_TIME_ATTRIBUTE,
};
use crate::error::PtaError;

const GENERALIZED_TIME: &str = "%Y%m%d%H%M%SZ";
const GENERALIZED_TIME_FRACTION: &str = "%Y%m%d%H%M%S%.fZ";

pub fn format_generalized_time(time: DateTime<Utc>) -> String {
    time.format(GENERALIZED_TIME).to_string()
}

pub fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, GENERALIZED_TIME)
        .or_else(|_| NaiveDateTime::parse_from_str(value, GENERALIZED_TIME_FRACTION))
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Last validated password, hashed and timestamped on the local entry.
pub struct PasswordCache {
    scheme: StorageScheme,
    ttl: Duration,
    store: Arc<dyn EntryStore>,
    password_type: AttributeType,
    time_type: AttributeType,
}

impl PasswordCache {
    pub fn new(scheme: StorageScheme, ttl: Duration, store: Arc<dyn EntryStore>) -> Self {
        Self {
            scheme,
            ttl,
            store,
            password_type: AttributeType::new(CACHED_PASSWORD_ATTRIBUTE),
            time_type: AttributeType::new(CACHED_PASSWORD_TIME_ATTRIBUTE),
        }
    }

    /// Whether the cache entry was written less than one TTL before `now`.
    /// A missing or unparseable time is never fresh.
    pub fn is_fresh(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        let Some(value) = entry.first_value(&self.time_type) else {
            return false;
        };
        let Some(cached) = parse_generalized_time(value) else {
            debug!("Ignoring unparseable cached password time {} on {}", value, entry.dn());
            return false;
        };
        let expiry = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| cached.checked_add_signed(ttl));
        match expiry {
            Some(expiry) => expiry > now,
            None => true,
        }
    }

    /// Whether `password` matches a fresh cached password on `entry`.
    ///
    /// Hash verification runs on the blocking pool.
    pub async fn matches(&self, entry: &Entry, password: &[u8], now: DateTime<Utc>) -> bool {
        if !self.is_fresh(entry, now) {
            trace!("No fresh cached password for {}", entry.dn());
            return false;
        }
        let Some(encoded) = entry.first_value(&self.password_type) else {
            return false;
        };
        let encoded = encoded.to_string();
        let password = password.to_vec();

        let result = tokio::task::spawn_blocking(move || {
            password_matches_encoded(&password, &encoded)
        })
        .await;
        match result {
            Ok(matched) => matched,
            Err(e) => {
                warn!("Cached password check for {} did not complete: {}", entry.dn(), e);
                false
            }
        }
    }

    /// Hash `password` and write it with `time` to the entry, both in the
    /// store and in memory.
    pub async fn store(
        &self,
        entry: &mut Entry,
        password: &[u8],
        time: DateTime<Utc>,
    ) -> Result<(), PtaError> {
        let scheme = self.scheme;
        let owned = password.to_vec();
        let encoded = tokio::task::spawn_blocking(move || scheme.encode_with_scheme(&owned))
            .await
            .map_err(|e| PtaError::Cache(format!("password hashing did not complete: {}", e)))?
            .map_err(PtaError::Cache)?;
        let time = format_generalized_time(time);

        self.store
            .replace_attributes(
                entry.dn(),
                vec![
                    (CACHED_PASSWORD_ATTRIBUTE.to_string(), vec![encoded.clone()]),
                    (CACHED_PASSWORD_TIME_ATTRIBUTE.to_string(), vec![time.clone()]),
                ],
            )
            .await?;

        entry.replace_values(CACHED_PASSWORD_ATTRIBUTE, vec![encoded]);
        entry.replace_values(CACHED_PASSWORD_TIME_ATTRIBUTE, vec![time]);
        debug!("Cached password updated for {}", entry.dn());
        Ok(())
    }
}
