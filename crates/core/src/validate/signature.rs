//! File signature ("magic byte") verification.

use std::collections::BTreeMap;
use std::sync::LazyLock;

/// A byte-prefix pattern; `None` matches any byte at that offset.
pub type BytePattern = Vec<Option<u8>>;

macro_rules! sig {
    (@byte _) => { None };
    (@byte $b:literal) => { Some($b) };
    ($($b:tt),+ $(,)?) => { &[$(sig!(@byte $b)),+] };
}

const ZIP: &[&[Option<u8>]] = &[
    sig!(0x50, 0x4B, 0x03, 0x04),
    sig!(0x50, 0x4B, 0x05, 0x06),
    sig!(0x50, 0x4B, 0x07, 0x08),
];

const OLE2: &[&[Option<u8>]] = &[sig!(0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1)];

const BUILTIN: &[(&str, &[&[Option<u8>]])] = &[
    // Images
    ("image/jpeg", &[sig!(0xFF, 0xD8, 0xFF)]),
    (
        "image/png",
        &[sig!(0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A)],
    ),
    (
        "image/gif",
        &[
            sig!(0x47, 0x49, 0x46, 0x38, 0x37, 0x61),
            sig!(0x47, 0x49, 0x46, 0x38, 0x39, 0x61),
        ],
    ),
    (
        "image/webp",
        &[sig!(0x52, 0x49, 0x46, 0x46, _, _, _, _, 0x57, 0x45, 0x42, 0x50)],
    ),
    ("image/bmp", &[sig!(0x42, 0x4D)]),
    (
        "image/tiff",
        &[sig!(0x49, 0x49, 0x2A, 0x00), sig!(0x4D, 0x4D, 0x00, 0x2A)],
    ),
    ("image/x-icon", &[sig!(0x00, 0x00, 0x01, 0x00)]),
    // Documents
    ("application/pdf", &[sig!(0x25, 0x50, 0x44, 0x46, 0x2D)]),
    ("application/msword", OLE2),
    ("application/vnd.ms-excel", OLE2),
    ("application/vnd.ms-powerpoint", OLE2),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ZIP,
    ),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ZIP,
    ),
    (
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        ZIP,
    ),
    ("application/rtf", &[sig!(0x7B, 0x5C, 0x72, 0x74, 0x66)]),
    // Archives
    ("application/zip", ZIP),
    ("application/gzip", &[sig!(0x1F, 0x8B)]),
    (
        "application/x-7z-compressed",
        &[sig!(0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C)],
    ),
    (
        "application/vnd.rar",
        &[sig!(0x52, 0x61, 0x72, 0x21, 0x1A, 0x07)],
    ),
    // Audio
    (
        "audio/mpeg",
        &[
            sig!(0x49, 0x44, 0x33),
            sig!(0xFF, 0xFB),
            sig!(0xFF, 0xF3),
            sig!(0xFF, 0xF2),
        ],
    ),
    (
        "audio/wav",
        &[sig!(0x52, 0x49, 0x46, 0x46, _, _, _, _, 0x57, 0x41, 0x56, 0x45)],
    ),
    ("audio/ogg", &[sig!(0x4F, 0x67, 0x67, 0x53)]),
    ("audio/flac", &[sig!(0x66, 0x4C, 0x61, 0x43)]),
    // Video
    ("video/mp4", &[sig!(_, _, _, _, 0x66, 0x74, 0x79, 0x70)]),
    (
        "video/quicktime",
        &[sig!(_, _, _, _, 0x66, 0x74, 0x79, 0x70, 0x71, 0x74)],
    ),
    ("video/webm", &[sig!(0x1A, 0x45, 0xDF, 0xA3)]),
    (
        "video/x-msvideo",
        &[sig!(0x52, 0x49, 0x46, 0x46, _, _, _, _, 0x41, 0x56, 0x49, 0x20)],
    ),
];

static BUILTIN_TABLE: LazyLock<SignatureTable> = LazyLock::new(|| {
    let mut table = SignatureTable::new();
    for (mime, patterns) in BUILTIN {
        table.register(mime, patterns.iter().map(|p| p.to_vec()).collect());
    }
    table
});

/// Registered signatures per MIME type.
///
/// Immutable once built; share it behind an `Arc` or clone it.
#[derive(Clone, Debug, Default)]
pub struct SignatureTable {
    signatures: BTreeMap<String, Vec<BytePattern>>,
    strict: bool,
    max_len: usize,
}

/// Normalize a MIME type for lookup: lowercase, parameters removed.
fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn pattern_matches(pattern: &[Option<u8>], bytes: &[u8]) -> bool {
    bytes.len() >= pattern.len()
        && pattern
            .iter()
            .zip(bytes)
            .all(|(expected, actual)| expected.is_none_or(|b| b == *actual))
}

impl SignatureTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in table of common image, document, archive, audio and video types.
    pub fn builtin() -> Self {
        BUILTIN_TABLE.clone()
    }

    /// Parse a table from JSON: `{"mime/type": [[byte|null, ...], ...]}`.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let raw: BTreeMap<String, Vec<BytePattern>> = serde_json::from_str(json)
            .map_err(|e| crate::Error::SignatureTable(e.to_string()))?;
        let mut table = Self::new();
        for (mime, patterns) in raw {
            if patterns.iter().any(|p| p.is_empty()) {
                return Err(crate::Error::SignatureTable(format!(
                    "empty signature pattern for {mime}"
                )));
            }
            table.register(&mime, patterns);
        }
        Ok(table)
    }

    /// Add patterns for a MIME type, extending any already registered.
    ///
    /// An empty list registers nothing, so the type stays unknown.
    pub fn register(&mut self, mime: &str, patterns: Vec<BytePattern>) {
        if patterns.is_empty() {
            return;
        }
        let longest = patterns.iter().map(Vec::len).max().unwrap_or(0);
        self.max_len = self.max_len.max(longest);
        self.signatures
            .entry(normalize_mime(mime))
            .or_default()
            .extend(patterns);
    }

    /// Merge another table into this one.
    pub fn merge(mut self, other: SignatureTable) -> Self {
        for (mime, patterns) in other.signatures {
            self.register(&mime, patterns);
        }
        self
    }

    /// Reject declared types that have no registered signatures.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Number of leading bytes the verifier ever inspects.
    pub fn max_signature_len(&self) -> usize {
        self.max_len
    }

    pub fn signatures_for(&self, mime: &str) -> Option<&[BytePattern]> {
        self.signatures
            .get(&normalize_mime(mime))
            .filter(|patterns| !patterns.is_empty())
            .map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Check that `bytes` begin with a signature registered for `declared`.
    ///
    /// Types without registered signatures pass unless the table is strict.
    pub fn verify_type(&self, bytes: &[u8], declared: &str) -> bool {
        let head = &bytes[..bytes.len().min(self.max_len)];
        match self.signatures_for(declared) {
            Some(patterns) => patterns.iter().any(|p| pattern_matches(p, head)),
            None => !self.strict,
        }
    }

    /// First candidate whose signatures match `bytes`.
    ///
    /// Candidates without registered signatures are skipped.
    pub fn detect_type<'a>(&self, bytes: &[u8], candidates: &[&'a str]) -> Option<&'a str> {
        let head = &bytes[..bytes.len().min(self.max_len)];
        candidates.iter().copied().find(|mime| {
            self.signatures_for(mime)
                .is_some_and(|patterns| patterns.iter().any(|p| pattern_matches(p, head)))
        })
    }

    /// Any registered type whose signatures match `bytes`.
    ///
    /// When several types share a signature (zip-based office formats), the
    /// alphabetically first one is returned.
    pub fn detect_any(&self, bytes: &[u8]) -> Option<&str> {
        let head = &bytes[..bytes.len().min(self.max_len)];
        self.signatures
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| pattern_matches(p, head)))
            .map(|(mime, _)| mime.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00];
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];

    #[test]
    fn test_verify_matching_prefix() {
        let table = SignatureTable::builtin();
        assert!(table.verify_type(PNG, "image/png"));
        assert!(table.verify_type(JPEG, "image/jpeg"));
        assert!(table.verify_type(JPEG, "IMAGE/JPEG; charset=binary"));
    }

    #[test]
    fn test_verify_rejects_mismatch() {
        let table = SignatureTable::builtin();
        assert!(!table.verify_type(PNG, "image/jpeg"));
        assert!(!table.verify_type(b"<?php echo 1; ?>", "image/png"));
    }

    #[test]
    fn test_short_input_never_matches() {
        let table = SignatureTable::builtin();
        assert!(!table.verify_type(&PNG[..4], "image/png"));
        assert!(!table.verify_type(&[], "image/jpeg"));
    }

    #[test]
    fn test_wildcards() {
        let mut webp = b"RIFF".to_vec();
        webp.extend_from_slice(&[0x12, 0x34, 0x56, 0x78]);
        webp.extend_from_slice(b"WEBPVP8 ");
        let table = SignatureTable::builtin();
        assert!(table.verify_type(&webp, "image/webp"));
        assert!(!table.verify_type(&webp, "audio/wav"));

        let mut mp4 = vec![0x00, 0x00, 0x00, 0x20];
        mp4.extend_from_slice(b"ftypisom");
        assert!(table.verify_type(&mp4, "video/mp4"));
    }

    #[test]
    fn test_unknown_type_permissive_by_default() {
        let table = SignatureTable::builtin();
        assert!(table.verify_type(b"anything", "text/plain"));
        assert!(!table.clone().strict().verify_type(b"anything", "text/plain"));
    }

    #[test]
    fn test_empty_pattern_list_leaves_type_unknown() {
        let table = SignatureTable::from_json(r#"{"text/csv": []}"#).unwrap();
        assert!(table.signatures_for("text/csv").is_none());
        assert!(table.is_empty());
        assert!(table.verify_type(b"a,b,c", "text/csv"));
        assert!(!table.clone().strict().verify_type(b"a,b,c", "text/csv"));

        let mut table = SignatureTable::builtin();
        table.register("text/csv", Vec::new());
        assert!(table.verify_type(b"a,b,c", "text/csv"));
        assert_eq!(table.detect_type(b"a,b,c", &["text/csv"]), None);
    }

    #[test]
    fn test_detect_type_among_candidates() {
        let table = SignatureTable::builtin();
        assert_eq!(
            table.detect_type(PNG, &["image/jpeg", "image/png"]),
            Some("image/png")
        );
        assert_eq!(table.detect_type(PNG, &["image/jpeg", "text/plain"]), None);
        assert_eq!(table.detect_any(JPEG), Some("image/jpeg"));
    }

    #[test]
    fn test_from_json() {
        let table = SignatureTable::from_json(r#"{"application/x-demo": [[68, 69, null, 79]]}"#)
            .unwrap();
        assert!(table.verify_type(b"DEMO", "application/x-demo"));
        assert!(table.verify_type(b"DExO", "application/x-demo"));
        assert!(!table.verify_type(b"XEMO", "application/x-demo"));
        assert_eq!(table.max_signature_len(), 4);

        assert!(SignatureTable::from_json(r#"{"a/b": [[]]}"#).is_err());
        assert!(SignatureTable::from_json(r#"{"a/b": [[300]]}"#).is_err());
    }

    #[test]
    fn test_merge_extends_builtin() {
        let custom = SignatureTable::from_json(r#"{"image/png": [[1, 2, 3]]}"#).unwrap();
        let table = SignatureTable::builtin().merge(custom);
        assert!(table.verify_type(PNG, "image/png"));
        assert!(table.verify_type(&[1, 2, 3], "image/png"));
    }

    #[test]
    fn test_max_signature_len_covers_builtin() {
        assert_eq!(SignatureTable::builtin().max_signature_len(), 12);
    }
}
