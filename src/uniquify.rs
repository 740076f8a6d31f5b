//! Making strings, file paths, and item names unique.
//!
//! Every scheme is the same loop: if the candidate is taken, insert the next
//! suffix from a sequence at a fixed position and try again. Only the suffix
//! sequence differs:
//!
//! | Use | Sequence |
//! |-----|----------|
//! | Command names in a registry | `_2`, `_3`, … |
//! | Command display names | ` (2)`, ` (3)`, … |
//! | Procedure argument names | `-2`, `-3`, … |
//! | Output files and item names | ` (1)`, ` (2)`, … |

use crate::itemtree::{Item, ItemId};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Return `s` unchanged if `is_unique(s)`, otherwise insert numbered
/// suffixes at `position` (in chars; `None` = end) until a unique candidate
/// is found. `template` must contain `{}` where the number goes; numbering
/// starts at `start`.
///
/// Each candidate is built from the original `s`, not from the previous
/// candidate: `a`, `a (1)`, `a (2)`, never `a (1) (2)`.
pub fn uniquify_with<F>(
    s: &str,
    mut is_unique: F,
    position: Option<usize>,
    template: &str,
    start: usize,
) -> String
where
    F: FnMut(&str) -> bool,
{
    if is_unique(s) {
        return s.to_string();
    }

    let split = match position {
        Some(pos) => s.char_indices().nth(pos).map(|(i, _)| i).unwrap_or(s.len()),
        None => s.len(),
    };
    let (head, tail) = s.split_at(split);

    let mut number = start;
    loop {
        let suffix = template.replacen("{}", &number.to_string(), 1);
        let candidate = format!("{head}{suffix}{tail}");
        if is_unique(&candidate) {
            return candidate;
        }
        number += 1;
    }
}

/// Uniquify `s` against `existing` with the default ` (1)`, ` (2)`, … sequence.
pub fn uniquify_string<'a, I>(s: &str, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let existing: HashSet<&str> = existing.into_iter().collect();
    uniquify_with(s, |c| !existing.contains(c), None, " ({})", 1)
}

/// Command-name scheme: `autocrop`, `autocrop_2`, `autocrop_3`, ….
pub fn uniquify_name<'a, I>(name: &str, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let existing: HashSet<&str> = existing.into_iter().collect();
    uniquify_with(name, |c| !existing.contains(c), None, "_{}", 2)
}

/// Display-name scheme: `Autocrop`, `Autocrop (2)`, `Autocrop (3)`, ….
pub fn uniquify_display_name<'a, I>(display_name: &str, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let existing: HashSet<&str> = existing.into_iter().collect();
    uniquify_with(display_name, |c| !existing.contains(c), None, " ({})", 2)
}

/// Argument-name scheme: `radius`, `radius-2`, `radius-3`, ….
pub fn uniquify_argument_name<'a, I>(name: &str, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let existing: HashSet<&str> = existing.into_iter().collect();
    uniquify_with(name, |c| !existing.contains(c), None, "-{}", 2)
}

/// Return `path` unchanged if nothing exists there, otherwise insert ` (1)`,
/// ` (2)`, … before the file extension until the path is free.
pub fn uniquify_path(path: &Path) -> PathBuf {
    let file_name = match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return path.to_path_buf(),
    };
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let root_len = crate::naming::filename_root(&file_name).chars().count();

    let unique = uniquify_with(
        &file_name,
        |candidate| !parent.join(candidate).exists(),
        Some(root_len),
        " ({})",
        1,
    );
    parent.join(unique)
}

/// Makes item names unique among items sharing the same parent.
///
/// Passing the same item twice returns the name it was given the first
/// time it was seen without uniquifying again. Call [`reset`](Self::reset)
/// to forget visited items.
#[derive(Debug, Default)]
pub struct ItemUniquifier {
    visited: HashMap<Option<ItemId>, HashMap<ItemId, String>>,
    taken: HashMap<Option<ItemId>, HashSet<String>>,
}

impl ItemUniquifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a name for `item` unique under its parent.
    ///
    /// `name` overrides `item.name` (e.g. a name with the export extension
    /// already applied). `position` is where the suffix goes, in chars;
    /// `None` appends.
    pub fn uniquify(&mut self, item: &Item, name: Option<&str>, position: Option<usize>) -> String {
        let name = name.unwrap_or(&item.name);
        let visited = self.visited.entry(item.parent).or_default();
        if let Some(previous) = visited.get(&item.id) {
            return previous.clone();
        }

        let taken = self.taken.entry(item.parent).or_default();
        let unique = uniquify_with(
            name,
            |candidate| !taken.contains(candidate),
            position,
            " ({})",
            1,
        );
        taken.insert(unique.clone());
        visited.insert(item.id, unique.clone());
        unique
    }

    pub fn reset(&mut self) {
        self.visited.clear();
        self.taken.clear();
    }
}
