//! ICAP wire parsing.
//!
//! Split in three layers:
//! - [`wire`]: the framing-aware reader that pulls exactly one ICAP message
//!   off a live stream;
//! - [`icap`]: the ICAP message parse and the RFC 3507 offset-based
//!   decomposition of the encapsulated payload;
//! - [`http_embed`]: reconstruction of the embedded HTTP request/response
//!   header blocks.

pub mod http_embed;
pub mod icap;
pub mod wire;

pub use icap::{ParsedMessage, find_double_crlf, parse_encapsulated, parse_message, split_encapsulated};
pub use wire::{FramedMessage, read_icap_message};
