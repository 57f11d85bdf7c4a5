//! Content validators applied to uploads before they are accepted.
//!
//! Both validators are pure: they never touch storage and can run on the
//! request path, in the completion worker, or in a preflight check.

pub mod filename;
pub mod signature;

pub use filename::{
    FilenameIssue, FilenameValidation, SanitizeOptions, SuffixStyle, sanitize, validate_filename,
};
pub use signature::{BytePattern, SignatureTable};
