//! Binary wire encoding
//!
//! The leaf of the protocol stack: message prefixes and the deterministic
//! body encoding every message type implements. Framing and the
//! prefix/type registry live in `network`.

pub mod encoding;
pub mod error;
pub mod prefix;

pub use encoding::{decode_exact, encode_to_bytes, ensure_remaining, WireEncode};
pub use error::{WireError, WireResult};
pub use prefix::{MessagePrefix, PREFIX_SIZE};
