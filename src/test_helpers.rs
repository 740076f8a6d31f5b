//! Shared test utilities for the batcher test suite.
//!
//! Provides item-tree builders from an indented outline, lookup helpers
//! that panic with a clear message, and a call log for asserting command
//! invocation order.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tree = build_tree("
//!     Body/
//!       Hands/
//!         Left.jpg
//!       Torso.jpg
//!     cover.png
//! ");
//! let left = find_item(&tree, "Left.jpg");
//! assert_eq!(left.depth, 2);
//!
//! let log = CallLog::default();
//! invoker.add(logging_function(&log, "resize"), AddOptions::default());
//! invoker.invoke(InvokeOptions::default()).unwrap();
//! assert_eq!(log.entries(), vec!["resize []"]);
//! ```

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use tempfile::TempDir;

use crate::invoker::Function;
use crate::itemtree::{Item, ItemId, ItemKind, ItemTree};

// =========================================================================
// Tree outlines
// =========================================================================

/// Parse an outline into `(depth, name, kind)` rows. Two spaces per level,
/// relative to the least-indented line; a trailing `/` marks a folder.
fn outline_rows(outline: &str) -> Vec<(usize, String, ItemKind)> {
    let lines: Vec<&str> = outline.lines().filter(|l| !l.trim().is_empty()).collect();
    let base = lines
        .iter()
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    lines
        .iter()
        .map(|line| {
            let depth = (line.len() - line.trim_start().len() - base) / 2;
            let entry = line.trim();
            match entry.strip_suffix('/') {
                Some(folder) => (depth, folder.to_string(), ItemKind::Folder),
                None => (depth, entry.to_string(), ItemKind::File),
            }
        })
        .collect()
}

/// Build an in-memory tree from an indented outline.
pub fn build_tree(outline: &str) -> ItemTree {
    let mut tree = ItemTree::new();
    let mut stack: Vec<ItemId> = Vec::new();
    for (depth, name, kind) in outline_rows(outline) {
        stack.truncate(depth);
        let id = tree.insert(&name, kind, stack.last().copied());
        if kind == ItemKind::Folder {
            stack.push(id);
        }
    }
    tree
}

/// Create the outline as real files and folders in a temp directory.
///
/// Each file's content is its own name, so copies can be told apart.
pub fn setup_source(outline: &str) -> TempDir {
    let tmp = TempDir::new().unwrap();
    let mut stack: Vec<std::path::PathBuf> = Vec::new();
    for (depth, name, kind) in outline_rows(outline) {
        stack.truncate(depth);
        let parent = stack.last().cloned().unwrap_or_else(|| tmp.path().to_path_buf());
        let path = parent.join(&name);
        match kind {
            ItemKind::Folder => {
                std::fs::create_dir_all(&path).unwrap();
                stack.push(path);
            }
            ItemKind::File => std::fs::write(&path, name.as_bytes()).unwrap(),
        }
    }
    tmp
}

/// List every file under `root` as a sorted relative path with `/` separators.
pub fn list_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}

// =========================================================================
// Tree lookups (panics with a clear message on miss)
// =========================================================================

/// Find an item by original name. Panics if not found.
pub fn find_item<'a>(tree: &'a ItemTree, name: &str) -> &'a Item {
    tree.iter().find(|i| i.orig_name == name).unwrap_or_else(|| {
        let names: Vec<&str> = tree.iter().map(|i| i.orig_name.as_str()).collect();
        panic!("item '{name}' not found. Available: {names:?}")
    })
}

/// Current names of all items, in tree order.
pub fn names(tree: &ItemTree) -> Vec<String> {
    tree.iter().map(|i| i.name.clone()).collect()
}

// =========================================================================
// Invocation log
// =========================================================================

/// An ordered log shared between test commands and assertions.
#[derive(Clone, Default)]
pub struct CallLog(Rc<RefCell<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

/// A command that logs `"{label} {args as JSON}"` and returns null.
pub fn logging_function(log: &CallLog, label: &str) -> Function {
    let log = log.clone();
    let label = label.to_string();
    Function::new(move |args, _| {
        let args = serde_json::to_string(args).unwrap();
        log.push(format!("{label} {args}"));
        Ok(serde_json::Value::Null.into())
    })
}
