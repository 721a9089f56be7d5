use thiserror::Error;
use uuid::Uuid;

/// Maximum length for a Postgres replication slot name in bytes.
const MAX_SLOT_NAME_LENGTH: usize = 63;

/// Prefix of every slot created by a migration job.
pub const JOB_SLOT_PREFIX: &str = "pipeline";

/// Hex characters of the job hash kept in the slot name.
const JOB_HASH_LENGTH: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplicationSlotNameError {
    #[error("invalid slot name length: {0}")]
    InvalidSlotNameLength(String),
}

/// Builds the replication slot name of a job shard item.
///
/// The name is `pipeline_<database>_<hash>`, where the database part is lowercased with
/// every character outside `[a-z0-9_]` replaced by `_` and truncated to fit the 63 byte
/// limit, and the hash is derived from the job id and shard item. The same inputs always
/// yield the same name across processes.
pub fn job_slot_name(
    database: &str,
    job_id: &str,
    shard_item: u32,
) -> Result<String, ReplicationSlotNameError> {
    let hash = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{job_id}/{shard_item}").as_bytes(),
    )
    .simple()
    .to_string();

    let max_database_len = MAX_SLOT_NAME_LENGTH - JOB_SLOT_PREFIX.len() - JOB_HASH_LENGTH - 2;
    let database: String = database
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '_') => c,
            _ => '_',
        })
        .take(max_database_len)
        .collect();

    let slot_name = format!("{JOB_SLOT_PREFIX}_{database}_{}", &hash[..JOB_HASH_LENGTH]);

    if slot_name.len() > MAX_SLOT_NAME_LENGTH {
        return Err(ReplicationSlotNameError::InvalidSlotNameLength(slot_name));
    }

    Ok(slot_name)
}
