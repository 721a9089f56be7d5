use crate::bail;
use crate::error::{ErrorKind, PipelineResult};

/// Decodes a Postgres `bytea` value in hex output format (`\x` followed by hex digit
/// pairs) into bytes.
pub fn parse_bytea_hex(bytea_hex_string: &str) -> PipelineResult<Vec<u8>> {
    let Some(digits) = bytea_hex_string.strip_prefix("\\x") else {
        bail!(
            ErrorKind::ConversionError,
            "Could not convert from bytea hex string to byte array",
            "The prefix '\\x' is missing"
        );
    };

    let digits = digits.as_bytes();
    if digits.len() % 2 != 0 {
        bail!(
            ErrorKind::ConversionError,
            "Could not convert from bytea hex string to byte array",
            "The number of digits is odd"
        );
    }

    digits
        .chunks_exact(2)
        .map(|pair| Ok((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
        .collect()
}

fn hex_digit(byte: u8) -> PipelineResult<u8> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => bail!(
            ErrorKind::ConversionError,
            "Could not convert from bytea hex string to byte array",
            format!("Invalid hex digit {:?}", byte as char)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bytea_hex_empty() {
        assert_eq!(parse_bytea_hex("\\x").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn parse_bytea_hex_mixed_case() {
        assert_eq!(parse_bytea_hex("\\xaBcD").unwrap(), vec![0xab, 0xcd]);
        assert_eq!(parse_bytea_hex("\\xff00ab").unwrap(), vec![0xff, 0x00, 0xab]);
    }

    #[test]
    fn parse_bytea_hex_missing_prefix() {
        let err = parse_bytea_hex("0x41").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConversionError);
        assert!(err.to_string().contains("prefix '\\x' is missing"));
    }

    #[test]
    fn parse_bytea_hex_odd_length() {
        let err = parse_bytea_hex("\\x41424").unwrap_err();
        assert!(err.to_string().contains("number of digits is odd"));
    }

    #[test]
    fn parse_bytea_hex_rejects_non_hex_input() {
        assert!(parse_bytea_hex("\\x4g").is_err());
        assert!(parse_bytea_hex("\\x4 1").is_err());
        // Four byte character keeps the length even.
        assert!(parse_bytea_hex("\\x🤔").is_err());
    }
}
