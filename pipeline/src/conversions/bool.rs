use crate::bail;
use crate::error::{ErrorKind, PipelineResult};

/// Parses the boolean spellings printed by Postgres-family servers.
pub fn parse_bool(s: &str) -> PipelineResult<bool> {
    match s {
        "t" | "true" | "TRUE" | "1" => Ok(true),
        "f" | "false" | "FALSE" | "0" => Ok(false),
        _ => bail!(
            ErrorKind::InvalidData,
            "Invalid boolean value",
            format!("Boolean value must be 't', 'f', 'true' or 'false' (received: {s})")
        ),
    }
}
