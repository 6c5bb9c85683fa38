//! Shared media domain types.
//!
//! Pure data and byte-level helpers with no I/O: the media kind taxonomy,
//! picture dimensions, the extension/MIME table and magic-number sniffing.

mod format;
mod kind;
mod resolution;
pub mod sniff;

pub use format::{Format, FORMATS, by_extension, by_mime, extension_of, is_known_extension};
pub use kind::MediaKind;
pub use resolution::Resolution;
