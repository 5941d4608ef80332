//! Party join codes.
//!
//! Codes are six characters, generated from an alphabet without visually
//! ambiguous characters, and accepted case-insensitively on input.

pub mod code;
pub mod resolver;

pub use code::{PartyCode, CODE_ALPHABET, CODE_LEN};
pub use resolver::{PartyCodeResolver, PartyRef, ResolverError};
