use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::ResolverError;

pub const CODE_LEN: usize = 6;

/// Generation alphabet: no 0/O, 1/I/L.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// A normalized (upper-case) party code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartyCode(String);

impl PartyCode {
    /// Normalize user input: trim, upper-case, require six ASCII letters or
    /// digits. Codes issued by the server may use any alphanumeric.
    pub fn parse(input: &str) -> Result<Self, ResolverError> {
        let normalized = input.trim().to_ascii_uppercase();
        let valid = normalized.len() == CODE_LEN
            && normalized.chars().all(|c| c.is_ascii_alphanumeric());
        if valid {
            Ok(Self(normalized))
        } else {
            Err(ResolverError::Malformed(input.to_string()))
        }
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let code = (0..CODE_LEN)
            .map(|_| *CODE_ALPHABET.choose(rng).unwrap_or(&b'A') as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PartyCode {
    type Error = ResolverError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PartyCode> for String {
    fn from(code: PartyCode) -> Self {
        code.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_parse_normalizes_case_and_whitespace() {
        let code = PartyCode::parse("  abc123 ").unwrap();
        assert_eq!(code.as_str(), "ABC123");
        assert_eq!(PartyCode::parse("AbC123").unwrap(), code);
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(PartyCode::parse("ABC12").is_err());
        assert!(PartyCode::parse("ABC1234").is_err());
        assert!(PartyCode::parse("ABC-12").is_err());
        assert!(PartyCode::parse("ÄBC123").is_err());
    }

    #[test]
    fn test_random_uses_unambiguous_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let code = PartyCode::random(&mut rng);
            assert_eq!(code.as_str().len(), CODE_LEN);
            assert!(code.as_str().bytes().all(|b| CODE_ALPHABET.contains(&b)));
            assert!(PartyCode::parse(code.as_str()).is_ok());
        }
    }
}
