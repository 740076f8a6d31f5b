//! # Batcher
//!
//! A batch-processing core for files and folders: a pipeline of user
//! configured actions and conditions runs over every matching item of a
//! directory tree, renaming items with a filename pattern and exporting them
//! to an output directory.
//!
//! # Architecture: Three Layers
//!
//! ```text
//! 1. Invoker    commands in named groups, invoked in order (with generators)
//! 2. Registry   the pipeline as data: action and condition descriptors
//! 3. Batcher    one invoker per run, built from the registry, driven per item
//! ```
//!
//! The invoker knows nothing about items or files. The registry knows nothing
//! about how commands run. The batcher connects the two and owns the run's
//! shared state (the item tree, the matching items, the export records).
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`invoker`] | Grouped command engine: ordering, nesting, generators, for-each wrappers |
//! | [`commands`] | Command registry: descriptors, events, JSON persistence |
//! | [`pdb`] | Procedure database and procedure-to-descriptor mapping |
//! | [`pattern`] | `StringPattern`, the `[field, args]` template language |
//! | [`renamer`] | `ItemRenamer` and the built-in name fields |
//! | [`itemtree`] | The files and folders being processed |
//! | [`uniquify`] | Unique names for items, paths and registry entries |
//! | [`naming`] | File extension helpers |
//! | [`builtins`] | Built-in actions (rename, export) and conditions |
//! | [`batcher`] | Runs a pipeline over an item tree |
//! | [`config`] | `batcher.toml` loading, merging, and validation |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Single-Threaded Shared State
//!
//! Commands added to an invoker may add, remove and reorder commands on the
//! invoker that is running them. Handles are `Rc<RefCell<..>>` and every
//! operation takes `&self`, so a command can hold a clone of the invoker it
//! lives in. A run is single-threaded from start to finish.
//!
//! ## Generators as Coroutines
//!
//! A command may return a [`invoker::Coroutine`] instead of a value. The
//! invoker keeps it per group and resumes it on every later invocation, which
//! is how renaming keeps its numbering state across the items of a run.
//!
//! ## Fail-Soft Patterns
//!
//! A pattern never fails to produce a name. A field with bad arguments, an
//! unknown field, or a field function error leaves the field's text as typed,
//! so a typo shows up in the output name instead of aborting the run.

pub mod batcher;
pub mod builtins;
pub mod commands;
pub mod config;
pub mod invoker;
pub mod itemtree;
pub mod naming;
pub mod output;
pub mod pattern;
pub mod pdb;
pub mod renamer;
pub mod uniquify;

#[cfg(test)]
pub(crate) mod test_helpers;
