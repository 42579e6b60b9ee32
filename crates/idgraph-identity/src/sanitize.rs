//! Record defaults and validation.

use std::collections::BTreeMap;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{IdentityError, Result};
use crate::memdb::Tables;
use crate::types::{Alias, Entity, Metadata};
use crate::IdentityStore;

pub const MAX_METADATA_PAIRS: usize = 64;
pub const MAX_METADATA_KEY_LEN: usize = 128;
pub const MAX_METADATA_VALUE_LEN: usize = 512;

const MAX_NAME_ATTEMPTS: usize = 10;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn random_name(prefix: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &salt[..8])
}

fn valid_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '=' | '/' | '+' | '_' | '-')
}

/// Check metadata against the size, charset and reserved-prefix rules.
pub fn validate_metadata(metadata: &Metadata, reserved_prefix: &str) -> Result<()> {
    if metadata.len() > MAX_METADATA_PAIRS {
        return Err(IdentityError::invalid(format!(
            "metadata cannot contain more than {} key/value pairs",
            MAX_METADATA_PAIRS
        )));
    }
    for (key, value) in metadata {
        if key.is_empty() {
            return Err(IdentityError::invalid("metadata key cannot be empty"));
        }
        if key.chars().count() > MAX_METADATA_KEY_LEN {
            return Err(IdentityError::invalid(format!(
                "metadata key {:?} exceeds {} characters",
                key, MAX_METADATA_KEY_LEN
            )));
        }
        if !key.chars().all(valid_key_char) {
            return Err(IdentityError::invalid(format!(
                "metadata key {:?} contains invalid characters",
                key
            )));
        }
        if !reserved_prefix.is_empty() && key.starts_with(reserved_prefix) {
            return Err(IdentityError::invalid(format!(
                "metadata key {:?} uses the reserved prefix {:?}",
                key, reserved_prefix
            )));
        }
        if value.chars().count() > MAX_METADATA_VALUE_LEN {
            return Err(IdentityError::invalid(format!(
                "metadata value for key {:?} exceeds {} characters",
                key, MAX_METADATA_VALUE_LEN
            )));
        }
    }
    Ok(())
}

/// Parse `key=value` pairs into metadata.
pub fn parse_metadata_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<Metadata> {
    let mut metadata = BTreeMap::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let Some((key, value)) = pair.split_once('=') else {
            return Err(IdentityError::invalid(format!(
                "metadata {:?} is not in key=value form",
                pair
            )));
        };
        metadata.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(metadata)
}

/// Trim, drop empties, deduplicate and sort policy names.
pub fn sanitize_policies(policies: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = policies
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Deduplicate IDs keeping first-seen order
pub fn dedup_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter()
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

/// Validate an alias and fill in its ID and timestamps.
pub fn sanitize_alias(alias: &mut Alias, reserved_prefix: &str) -> Result<()> {
    if alias.canonical_id.is_empty() {
        return Err(IdentityError::invalid("missing alias canonical ID"));
    }
    if alias.name.is_empty() {
        return Err(IdentityError::invalid("missing alias name"));
    }
    validate_metadata(&alias.metadata, reserved_prefix)?;

    if alias.id.is_empty() {
        alias.id = new_id();
    }
    let now = Utc::now();
    if alias.creation_time.is_none() {
        alias.creation_time = Some(now);
    }
    alias.last_update_time = Some(now);
    Ok(())
}

impl IdentityStore {
    /// Generate an `<prefix>_<8 hex>` name not yet taken in `taken`.
    pub(crate) fn unique_name(
        &self,
        prefix: &str,
        taken: impl Fn(&str) -> Result<bool>,
    ) -> Result<String> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = random_name(prefix);
            if !taken(&name)? {
                return Ok(name);
            }
        }
        Err(IdentityError::internal(format!(
            "failed to generate a unique {} name",
            prefix
        )))
    }

    /// Fill in an entity's ID, bucket key hash, name and timestamps.
    pub(crate) fn sanitize_entity(&self, tables: &Tables, entity: &mut Entity) -> Result<()> {
        if entity.id.is_empty() {
            entity.id = new_id();
        }
        if entity.bucket_key_hash.is_empty() {
            entity.bucket_key_hash = self.entity_packer.bucket_key_hash_by_item_id(&entity.id);
        }
        if entity.name.is_empty() {
            entity.name = self.unique_name("entity", |name| {
                Ok(tables.entity_by_name(name)?.is_some())
            })?;
        }
        validate_metadata(&entity.metadata, &self.config.reserved_metadata_prefix)?;
        entity.policies = sanitize_policies(std::mem::take(&mut entity.policies));

        let now = Utc::now();
        if entity.creation_time.is_none() {
            entity.creation_time = Some(now);
        }
        entity.last_update_time = Some(now);
        Ok(())
    }
}
