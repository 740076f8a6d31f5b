//! File-extension parsing shared by the renamer, conditions, and export.
//!
//! Item names are plain file names (`Dawn.jpg`, `archive.xcf.gz`). The
//! renamer strips or keeps extensions depending on field arguments, the
//! `matching_file_extension` condition compares them, and export appends the
//! target extension. All three go through the two functions here so the
//! rules stay identical:
//!
//! - Extensions are compared lowercase.
//! - A leading dot does not start an extension (`.hidden` has none).
//! - A few compound extensions are recognized as one unit (`xcf.gz`).

/// Extensions made of two dot-separated parts that are treated as one.
const COMPOUND_EXTENSIONS: &[&str] = &["tar.gz", "tar.bz2", "tar.xz", "xcf.gz", "xcf.bz2", "xcf.xz"];

/// Byte offset of the dot that starts the extension of `name`, if any.
fn extension_dot(name: &str) -> Option<usize> {
    for compound in COMPOUND_EXTENSIONS {
        let suffix_len = compound.len() + 1;
        if name.len() > suffix_len && name.is_char_boundary(name.len() - suffix_len) {
            let dot = name.len() - suffix_len;
            if name.as_bytes()[dot] == b'.' && name[dot + 1..].eq_ignore_ascii_case(compound) {
                return Some(dot);
            }
        }
    }
    match name.rfind('.') {
        Some(0) | None => None,
        Some(dot) if dot + 1 == name.len() => None,
        Some(dot) => Some(dot),
    }
}

/// Return the lowercase file extension of `name`, or an empty string.
///
/// - `"Dawn.JPG"` → `"jpg"`
/// - `"scan.xcf.gz"` → `"xcf.gz"`
/// - `"notes"` → `""`
/// - `".hidden"` → `""`
/// - `"trailing."` → `""`
pub fn file_extension(name: &str) -> String {
    extension_dot(name)
        .map(|dot| name[dot + 1..].to_lowercase())
        .unwrap_or_default()
}

/// Return `name` without its file extension (and without the separating dot).
///
/// - `"Dawn.jpg"` → `"Dawn"`
/// - `"scan.xcf.gz"` → `"scan"`
/// - `"notes"` → `"notes"`
pub fn filename_root(name: &str) -> String {
    match extension_dot(name) {
        Some(dot) => name[..dot].to_string(),
        None => name.to_string(),
    }
}

/// Replace (or add) the extension of `name`. An empty `ext` strips it.
///
/// - `("Dawn.jpg", "png")` → `"Dawn.png"`
/// - `("Dawn", "png")` → `"Dawn.png"`
/// - `("Dawn.jpg", "")` → `"Dawn"`
pub fn with_extension(name: &str, ext: &str) -> String {
    let root = filename_root(name);
    let ext = ext.trim_start_matches('.');
    if ext.is_empty() {
        root
    } else {
        format!("{root}.{ext}")
    }
}
