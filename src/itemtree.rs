//! The tree of files and folders a batch run processes.
//!
//! Items are stored in pre-order: every folder precedes its contents, and
//! siblings are sorted by file name. IDs are indices into that order and stay
//! valid for the lifetime of the tree; renaming an item changes `name` but
//! never `orig_name`, `id`, or the tree shape.
//!
//! ```text
//! content/                 (root, not an item)
//! ├── Body/                id 0, depth 0, folder
//! │   ├── Hands/           id 1, depth 1, folder
//! │   │   └── Left.jpg     id 2, depth 2
//! │   └── Torso.jpg        id 3, depth 1
//! └── cover.png            id 4, depth 0
//! ```

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),
}

pub type ItemId = usize;

/// Shared handle used while a batch run mutates names.
pub type SharedTree = Rc<RefCell<ItemTree>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: ItemId,
    /// Current name; actions such as rename replace it.
    pub name: String,
    /// Name the item had when the tree was built.
    pub orig_name: String,
    pub kind: ItemKind,
    pub parent: Option<ItemId>,
    /// 0 for top-level items.
    pub depth: usize,
    /// Source path on disk. Empty for trees built in memory.
    pub path: PathBuf,
}

impl Item {
    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }
}

#[derive(Debug, Clone, Default)]
pub struct ItemTree {
    items: Vec<Item>,
    children: HashMap<Option<ItemId>, Vec<ItemId>>,
    root: PathBuf,
}

impl ItemTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from the contents of `root` (the root itself is not an item).
    ///
    /// Hidden entries (names starting with `.`) and everything below them are
    /// skipped. Symlinks are not followed.
    pub fn from_dir(root: &Path) -> Result<Self, TreeError> {
        Self::from_dir_excluding(root, &[])
    }

    /// Like [`ItemTree::from_dir`], leaving out `excluded` paths and their
    /// contents. Paths are compared as given, so pass them in the same form
    /// as `root` (both canonical or both relative).
    pub fn from_dir_excluding(root: &Path, excluded: &[PathBuf]) -> Result<Self, TreeError> {
        if !root.is_dir() {
            return Err(TreeError::NotADirectory(root.to_path_buf()));
        }

        let mut tree = ItemTree {
            root: root.to_path_buf(),
            ..Default::default()
        };
        let mut ids_by_path: HashMap<PathBuf, ItemId> = HashMap::new();

        let walker = WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                !e.file_name().to_string_lossy().starts_with('.') && !excluded.iter().any(|x| x == e.path())
            });

        for entry in walker {
            let entry = entry?;
            let path = entry.path().to_path_buf();
            let parent = path.parent().and_then(|p| ids_by_path.get(p).copied());
            let kind = if entry.file_type().is_dir() {
                ItemKind::Folder
            } else {
                ItemKind::File
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let id = tree.push(name, kind, parent, path.clone());
            if kind == ItemKind::Folder {
                ids_by_path.insert(path, id);
            }
        }

        Ok(tree)
    }

    /// Directory the tree was built from, if any.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append an item under `parent` (or at top level).
    ///
    /// Pre-order holds as long as a folder's contents are inserted before
    /// anything that follows the folder, which is how both `from_dir` and the
    /// test tree builder insert.
    pub fn insert(&mut self, name: &str, kind: ItemKind, parent: Option<ItemId>) -> ItemId {
        let path = match parent.and_then(|p| self.items.get(p)) {
            Some(p) if !p.path.as_os_str().is_empty() => p.path.join(name),
            _ => PathBuf::new(),
        };
        self.push(name.to_string(), kind, parent, path)
    }

    fn push(&mut self, name: String, kind: ItemKind, parent: Option<ItemId>, path: PathBuf) -> ItemId {
        let id = self.items.len();
        let depth = parent
            .and_then(|p| self.items.get(p))
            .map(|p| p.depth + 1)
            .unwrap_or(0);
        self.items.push(Item {
            id,
            orig_name: name.clone(),
            name,
            kind,
            parent,
            depth,
            path,
        });
        self.children.entry(parent).or_default().push(id);
        id
    }

    pub fn get(&self, id: ItemId) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: ItemId) -> Option<&mut Item> {
        self.items.get_mut(id)
    }

    /// Rename an item. Unknown IDs are ignored.
    pub fn set_name(&mut self, id: ItemId, name: impl Into<String>) {
        if let Some(item) = self.items.get_mut(id) {
            item.name = name.into();
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All items, folders included, in pre-order.
    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.items.iter()
    }

    /// Files only, in pre-order.
    pub fn files(&self) -> impl Iterator<Item = &Item> {
        self.items.iter().filter(|i| !i.is_folder())
    }

    /// Direct children of `parent` (`None` = top level), in order.
    pub fn children(&self, parent: Option<ItemId>) -> &[ItemId] {
        self.children.get(&parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ancestors of `id`, outermost first. Empty for top-level items.
    pub fn parents(&self, id: ItemId) -> Vec<ItemId> {
        let mut parents = Vec::new();
        let mut current = self.items.get(id).and_then(|i| i.parent);
        while let Some(p) = current {
            parents.push(p);
            current = self.items.get(p).and_then(|i| i.parent);
        }
        parents.reverse();
        parents
    }

    /// Path of `id` relative to the tree root, built from original names.
    pub fn relative_path(&self, id: ItemId) -> PathBuf {
        let mut path = PathBuf::new();
        for p in self.parents(id) {
            path.push(&self.items[p].orig_name);
        }
        if let Some(item) = self.items.get(id) {
            path.push(&item.orig_name);
        }
        path
    }

    /// Count the items of `scope` at `depth` whose parent is `parent`.
    pub fn count_siblings(&self, scope: &[ItemId], depth: usize, parent: Option<ItemId>) -> usize {
        scope
            .iter()
            .filter_map(|&id| self.items.get(id))
            .filter(|i| i.depth == depth && i.parent == parent)
            .count()
    }

    /// `items` with their ancestor folders interleaved: each folder appears
    /// once, immediately before the first item it contains.
    pub fn with_parents(&self, items: &[ItemId]) -> Vec<ItemId> {
        let mut visited = HashSet::new();
        let mut result = Vec::with_capacity(items.len());
        for &id in items {
            for parent in self.parents(id) {
                if visited.insert(parent) {
                    result.push(parent);
                }
            }
            result.push(id);
        }
        result
    }
}
