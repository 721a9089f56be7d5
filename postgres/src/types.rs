use std::str::FromStr;

use thiserror::Error;
use tokio_postgres::types::PgLsn;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid postgres lsn `{0}`")]
pub struct ParseLsnError(pub String);

/// Parses an LSN in the `X/X` text form used by Postgres, e.g. `16/B374D848`.
pub fn parse_lsn(value: &str) -> Result<PgLsn, ParseLsnError> {
    PgLsn::from_str(value.trim()).map_err(|_| ParseLsnError(value.to_string()))
}

/// Parses an LSN into its raw 64 bit value.
pub fn parse_lsn_u64(value: &str) -> Result<u64, ParseLsnError> {
    parse_lsn(value).map(u64::from)
}

/// Formats a raw LSN value as `X/X`.
pub fn format_lsn(lsn: u64) -> String {
    PgLsn::from(lsn).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_text_form_is_preserved() {
        let lsn = parse_lsn_u64("16/B374D848").unwrap();
        assert_eq!(lsn, (0x16 << 32) | 0xB374D848);
        assert_eq!(format_lsn(lsn), "16/B374D848");
    }

    #[test]
    fn invalid_lsn_is_rejected() {
        assert_eq!(
            parse_lsn("not-an-lsn"),
            Err(ParseLsnError("not-an-lsn".to_string()))
        );
    }
}
