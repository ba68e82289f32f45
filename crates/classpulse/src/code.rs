//! Session codes, the short identifiers students type to join.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Number of letters in a session code.
pub const CODE_LEN: usize = 8;

const ALPHABET: &[u8; 26] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// An eight-letter uppercase session code.
///
/// Codes are drawn uniformly from the 26^8 space. Uniqueness among live
/// sessions is the engine's job (it redraws on collision at claim time),
/// not the generator's.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCode(String);

impl SessionCode {
    /// Draw a fresh random code. Does not consult any registry.
    pub fn generate(rng: &mut impl Rng) -> Self {
        let code = (0..CODE_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reason a hand-typed session code failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session code {0:?}")]
pub struct ParseCodeError(String);

impl FromStr for SessionCode {
    type Err = ParseCodeError;

    /// Parses a hand-typed code: trims surrounding whitespace, uppercases,
    /// then requires exactly eight ASCII letters.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        if code.len() == CODE_LEN && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code))
        } else {
            Err(ParseCodeError(s.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_eight_uppercase_letters() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let code = SessionCode::generate(&mut rng);
            assert_eq!(code.as_str().len(), CODE_LEN);
            assert!(code.as_str().bytes().all(|b| b.is_ascii_uppercase()));
        }
    }

    #[test]
    fn parse_normalizes_case_and_whitespace() {
        let code: SessionCode = " abcdwxyz ".parse().unwrap();
        assert_eq!(code.as_str(), "ABCDWXYZ");
    }

    #[test]
    fn parse_rejects_malformed_codes() {
        assert!("".parse::<SessionCode>().is_err());
        assert!("ABC".parse::<SessionCode>().is_err());
        assert!("ABCDEFGHI".parse::<SessionCode>().is_err());
        assert!("ABCD123Z".parse::<SessionCode>().is_err());
        assert!("ABCD EFG".parse::<SessionCode>().is_err());
    }

    #[test]
    fn display_roundtrips_through_parse() {
        let code: SessionCode = "QWERTYUI".parse().unwrap();
        assert_eq!(code.to_string().parse::<SessionCode>().unwrap(), code);
    }

    #[test]
    fn serializes_as_a_bare_string() {
        let code: SessionCode = "ABCDEFGH".parse().unwrap();
        insta::assert_json_snapshot!(code, @r#""ABCDEFGH""#);
    }
}
