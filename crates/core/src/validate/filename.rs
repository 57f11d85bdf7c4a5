//! Filename sanitization and validation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default maximum length of a sanitized filename.
pub const DEFAULT_MAX_LENGTH: usize = 200;

/// Extensions that are executable or interpreted on common server and
/// desktop platforms.
pub const DANGEROUS_EXTENSIONS: &[&str] = &[
    "php", "php3", "php4", "php5", "php7", "phtml", "phar", "pht", "asp", "aspx", "jsp", "jspx",
    "cgi", "pl", "py", "rb", "sh", "bash", "zsh", "ps1", "psm1", "bat", "cmd", "com", "exe",
    "dll", "msi", "scr", "vbs", "vbe", "js", "jse", "wsf", "wsh", "hta", "jar", "htaccess",
    "shtml",
];

/// Device names reserved by Windows, with or without an extension.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Characters kept verbatim by the sanitizer.
fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn is_dangerous_extension(ext: &str) -> bool {
    DANGEROUS_EXTENSIONS
        .iter()
        .any(|d| d.eq_ignore_ascii_case(ext))
}

fn is_reserved_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name).trim();
    RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(stem))
}

/// How the collision-resistant suffix is generated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuffixStyle {
    /// 8 random hex characters.
    #[default]
    Random,
    /// Unix timestamp in milliseconds.
    Timestamp,
}

/// Options controlling [`sanitize`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizeOptions {
    /// Replacement for characters outside `[A-Za-z0-9._-]`.
    #[serde(default = "default_replacement")]
    pub replacement: char,
    /// Keep a denylisted final extension instead of folding it into the name.
    #[serde(default)]
    pub preserve_extension: bool,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_true")]
    pub append_suffix: bool,
    #[serde(default)]
    pub suffix_style: SuffixStyle,
}

fn default_replacement() -> char {
    '_'
}

fn default_max_length() -> usize {
    DEFAULT_MAX_LENGTH
}

fn default_true() -> bool {
    true
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self {
            replacement: default_replacement(),
            preserve_extension: false,
            max_length: default_max_length(),
            append_suffix: true,
            suffix_style: SuffixStyle::default(),
        }
    }
}

fn random_token() -> String {
    format!("{:08x}", rand::random::<u32>())
}

fn suffix(style: SuffixStyle) -> String {
    match style {
        SuffixStyle::Random => random_token(),
        SuffixStyle::Timestamp => {
            let millis = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
            millis.to_string()
        }
    }
}

fn generated_name() -> String {
    format!("file_{}", random_token())
}

/// Produce a filename that is safe to use as a storage key segment.
///
/// The result never contains a path separator or a `..` sequence, is never
/// longer than `options.max_length`, and carries no denylisted extension
/// unless `options.preserve_extension` is set.
pub fn sanitize(name: &str, options: &SanitizeOptions) -> String {
    let replacement = if is_safe_char(options.replacement) && options.replacement != '.' {
        options.replacement
    } else {
        '_'
    };

    let cleaned: String = name.chars().filter(|c| !c.is_control()).collect();
    let last = cleaned.rsplit(['/', '\\']).next().unwrap_or("");
    let reserved = is_reserved_name(last);

    let mut replaced = String::with_capacity(last.len());
    for c in last.trim().trim_start_matches('.').chars() {
        let c = if is_safe_char(c) { c } else { replacement };
        // Runs of dots collapse so `..` never survives.
        if c == '.' && replaced.ends_with('.') {
            continue;
        }
        replaced.push(c);
    }

    let mut segments: Vec<String> = replaced
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let mut extension = if segments.len() > 1 {
        segments.pop()
    } else {
        None
    };

    for segment in segments.iter_mut().skip(1) {
        if is_dangerous_extension(segment) {
            segment.push('_');
        }
    }

    let mut base = segments.join(".");
    if let Some(ext) = extension.take() {
        if is_dangerous_extension(&ext) && !options.preserve_extension {
            base = format!("{base}{replacement}{ext}");
        } else {
            extension = Some(ext);
        }
    }

    let generated = reserved || base.is_empty();
    if generated {
        base = generated_name();
    }

    let mut suffix = if options.append_suffix && !generated {
        Some(suffix(options.suffix_style))
    } else {
        None
    };

    let max = options.max_length;
    let suffix_len = |s: &Option<String>| s.as_ref().map_or(0, |s| s.len() + 1);
    let ext_len = |e: &Option<String>| e.as_ref().map_or(0, |e| e.len() + 1);

    if ext_len(&extension) + suffix_len(&suffix) >= max {
        extension = None;
    }
    if suffix_len(&suffix) >= max {
        suffix = None;
    }
    let budget = max.saturating_sub(ext_len(&extension) + suffix_len(&suffix));
    if base.len() > budget {
        base.truncate(budget);
        while base.ends_with('.') {
            base.pop();
        }
    }

    let mut out = base;
    if let Some(s) = suffix {
        out.push('_');
        out.push_str(&s);
    }
    if let Some(ext) = extension {
        out.push('.');
        out.push_str(&ext);
    }
    out.truncate(max);
    // Truncation can expose a denylisted segment that was folded or
    // suffixed before the cut.
    defuse_segments(&out, replacement, options.preserve_extension)
}

/// Join every denylisted extension segment onto its predecessor with
/// `replacement`. The output has the same length as the input.
fn defuse_segments(name: &str, replacement: char, keep_last: bool) -> String {
    let segments: Vec<&str> = name.split('.').collect();
    let last = segments.len() - 1;
    let mut out = String::with_capacity(name.len());
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            let allowed = keep_last && i == last;
            if is_dangerous_extension(segment) && !allowed {
                out.push(replacement);
            } else {
                out.push('.');
            }
        }
        out.push_str(segment);
    }
    out
}

/// A problem found by [`validate_filename`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilenameIssue {
    Empty,
    TooLong,
    NullByte,
    ControlCharacter,
    PathTraversal,
    AbsolutePath,
    ReservedName,
    DangerousExtension,
    DoubleExtension,
    InvalidCharacters,
    LeadingDot,
}

impl FilenameIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::TooLong => "too_long",
            Self::NullByte => "null_byte",
            Self::ControlCharacter => "control_character",
            Self::PathTraversal => "path_traversal",
            Self::AbsolutePath => "absolute_path",
            Self::ReservedName => "reserved_name",
            Self::DangerousExtension => "dangerous_extension",
            Self::DoubleExtension => "double_extension",
            Self::InvalidCharacters => "invalid_characters",
            Self::LeadingDot => "leading_dot",
        }
    }

    /// Issues that reject an upload outright instead of being sanitized away.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::Empty
                | Self::NullByte
                | Self::ControlCharacter
                | Self::PathTraversal
                | Self::AbsolutePath
                | Self::DangerousExtension
                | Self::DoubleExtension
        )
    }
}

impl fmt::Display for FilenameIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`validate_filename`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilenameValidation {
    pub valid: bool,
    pub errors: Vec<FilenameIssue>,
}

impl FilenameValidation {
    /// Issues that [`FilenameIssue::is_blocking`] marks as fatal.
    pub fn blocking(&self) -> impl Iterator<Item = FilenameIssue> + '_ {
        self.errors.iter().copied().filter(FilenameIssue::is_blocking)
    }
}

/// Check a filename without modifying it.
pub fn validate_filename(name: &str) -> FilenameValidation {
    let mut errors = Vec::new();
    let mut flag = |issue: FilenameIssue| {
        if !errors.contains(&issue) {
            errors.push(issue);
        }
    };

    if name.trim().is_empty() {
        flag(FilenameIssue::Empty);
    }
    if name.len() > DEFAULT_MAX_LENGTH {
        flag(FilenameIssue::TooLong);
    }
    if name.contains('\0') {
        flag(FilenameIssue::NullByte);
    }
    if name.chars().any(|c| c.is_control() && c != '\0') {
        flag(FilenameIssue::ControlCharacter);
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        flag(FilenameIssue::PathTraversal);
    }
    let bytes = name.as_bytes();
    let drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if name.starts_with('/') || name.starts_with('\\') || drive {
        flag(FilenameIssue::AbsolutePath);
    }

    let last = name.rsplit(['/', '\\']).next().unwrap_or("");
    if is_reserved_name(last) {
        flag(FilenameIssue::ReservedName);
    }
    if name.trim_start().starts_with('.') || last.starts_with('.') {
        flag(FilenameIssue::LeadingDot);
    }

    let segments: Vec<&str> = last.split('.').filter(|s| !s.is_empty()).collect();
    if segments.len() > 1 {
        if let Some(ext) = segments.last()
            && is_dangerous_extension(ext)
        {
            flag(FilenameIssue::DangerousExtension);
        }
        let inner = &segments[1..segments.len() - 1];
        if inner.iter().any(|s| is_dangerous_extension(s)) {
            flag(FilenameIssue::DoubleExtension);
        }
    }

    if name
        .chars()
        .any(|c| !is_safe_char(c) && !c.is_control() && c != '/' && c != '\\')
    {
        flag(FilenameIssue::InvalidCharacters);
    }

    FilenameValidation {
        valid: errors.is_empty(),
        errors,
    }
}
