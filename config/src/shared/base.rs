use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
    /// A field holds a value outside of its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// A job references a shard item that has no shard definition.
    #[error("job `{job_id}` has no shard definition for item {shard_item}")]
    UnknownShardItem { job_id: String, shard_item: u32 },
}

impl ValidationError {
    pub(crate) fn must_be_positive(field: &str) -> Self {
        Self::InvalidFieldValue {
            field: field.to_string(),
            constraint: "must be greater than 0".to_string(),
        }
    }
}
