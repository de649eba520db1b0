//! Decoding of compact message signature strings.
//!
//! A signature is an optional leading integer (the message's
//! since-version when greater than 1) followed by one character per
//! wire argument:
//!
//! | char | argument                                   |
//! |------|--------------------------------------------|
//! | `i`  | 32-bit signed integer                      |
//! | `u`  | 32-bit unsigned integer                    |
//! | `f`  | 24.8 signed fixed point                    |
//! | `s`  | length-prefixed, NUL-terminated string     |
//! | `o`  | object id                                  |
//! | `n`  | new object id                              |
//! | `a`  | length-prefixed byte array                 |
//! | `h`  | file descriptor (ancillary channel only)   |
//!
//! A `?` immediately before `s`, `o`, `n` or `a` marks the argument as
//! nullable. A new_id without a pre-declared interface expands to
//! `sun` on the wire (interface name, version, id).

use crate::protocol::ArgumentType;

/// One argument position decoded from a signature string.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ArgSpec {
    /// Kind of the argument.
    pub kind: ArgumentType,
    /// Whether the wire may carry a null value for it.
    pub nullable: bool,
}

/// Error raised when a signature contains an unknown character.
#[derive(Copy, Clone, Debug)]
pub struct InvalidSignature(pub char);

impl std::error::Error for InvalidSignature {}

impl std::fmt::Display for InvalidSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown signature character {:?}", self.0)
    }
}

/// Iterate over the argument positions of a signature string.
pub fn signature_args(signature: &str) -> SignatureArgs<'_> {
    SignatureArgs { chars: signature.chars() }
}

/// Iterator returned by [`signature_args`].
#[derive(Clone, Debug)]
pub struct SignatureArgs<'a> {
    chars: std::str::Chars<'a>,
}

impl Iterator for SignatureArgs<'_> {
    type Item = Result<ArgSpec, InvalidSignature>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut nullable = false;
        loop {
            let kind = match self.chars.next()? {
                '?' => {
                    nullable = true;
                    continue;
                }
                // the since-version prefix
                '0'..='9' => continue,
                'i' => ArgumentType::Int,
                'u' => ArgumentType::Uint,
                'f' => ArgumentType::Fixed,
                's' => ArgumentType::Str,
                'o' => ArgumentType::Object,
                'n' => ArgumentType::NewId,
                'a' => ArgumentType::Array,
                'h' => ArgumentType::Fd,
                other => return Some(Err(InvalidSignature(other))),
            };
            return Some(Ok(ArgSpec { kind, nullable }));
        }
    }
}

/// Since-version encoded in the leading integer of a signature.
///
/// Defaults to 1 when the signature has no version prefix.
pub fn since_version(signature: &str) -> u32 {
    let digits = signature.split(|c: char| !c.is_ascii_digit()).next().unwrap_or("");
    digits.parse().unwrap_or(1)
}

/// Number of wire arguments described by a signature.
///
/// Characters that do not form a valid argument are counted as well,
/// so that a malformed signature is detected while iterating rather
/// than silently truncated.
pub fn arg_count(signature: &str) -> usize {
    signature_args(signature).count()
}
