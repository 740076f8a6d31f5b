//! Built-in actions and conditions.
//!
//! Every built-in is a command function over the current run's
//! [`RunState`]. The batcher passes the current item's ID as the first
//! positional argument and the command's arguments as keyword arguments.
//!
//! | Name | Kind | Arguments |
//! |------|------|-----------|
//! | `rename` | action | `pattern`, `rename_files`, `rename_folders` |
//! | `export` | action | `file_extension`, `overwrite` |
//! | `matching_file_extension` | condition | |
//! | `matching_text` | condition | `match_mode`, `text`, `ignore_case` |
//! | `top_level` | condition | |

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::debug;

use crate::batcher::{ExportRecord, RunState};
use crate::commands::{ArgumentDict, Command, CommandDict, CommandKind};
use crate::invoker::{CommandError, Coroutine, Function, Kwargs, Outcome, Resume, Step};
use crate::itemtree::{Item, ItemId};
use crate::naming::file_extension;
use crate::renamer::ItemRenamer;
use crate::uniquify::{ItemUniquifier, uniquify_path};

pub const RENAME: &str = "rename";
pub const EXPORT: &str = "export";
pub const MATCHING_FILE_EXTENSION: &str = "matching_file_extension";
pub const MATCHING_TEXT: &str = "matching_text";
pub const TOP_LEVEL: &str = "top_level";

pub const DEFAULT_PATTERN: &str = "[image name]";
pub const DEFAULT_FILE_EXTENSION: &str = "png";

/// What export does when the output file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwriteMode {
    /// Leave the existing file and do not export.
    Skip,
    Replace,
    /// Export under a new name such as `photo (1).png`.
    #[default]
    RenameNew,
}

impl OverwriteMode {
    pub const ALL: [OverwriteMode; 3] = [OverwriteMode::Skip, OverwriteMode::Replace, OverwriteMode::RenameNew];

    pub fn as_str(self) -> &'static str {
        match self {
            OverwriteMode::Skip => "skip",
            OverwriteMode::Replace => "replace",
            OverwriteMode::RenameNew => "rename_new",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.as_str() == value)
    }
}

impl fmt::Display for OverwriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `matching_text` compares the item name with the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    StartsWith,
    DoesNotStartWith,
    #[default]
    Contains,
    DoesNotContain,
    EndsWith,
    DoesNotEndWith,
    Regex,
}

impl MatchMode {
    pub const ALL: [MatchMode; 7] = [
        MatchMode::StartsWith,
        MatchMode::DoesNotStartWith,
        MatchMode::Contains,
        MatchMode::DoesNotContain,
        MatchMode::EndsWith,
        MatchMode::DoesNotEndWith,
        MatchMode::Regex,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MatchMode::StartsWith => "starts_with",
            MatchMode::DoesNotStartWith => "does_not_start_with",
            MatchMode::Contains => "contains",
            MatchMode::DoesNotContain => "does_not_contain",
            MatchMode::EndsWith => "ends_with",
            MatchMode::DoesNotEndWith => "does_not_end_with",
            MatchMode::Regex => "regex",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.as_str() == value)
    }
}

// ============================================================================
// Descriptors
// ============================================================================

pub fn rename_dict(pattern: &str, rename_files: bool, rename_folders: bool) -> CommandDict {
    let mut pattern_arg = ArgumentDict::new("pattern", "name_pattern", DEFAULT_PATTERN);
    pattern_arg.value = Some(pattern.into());
    pattern_arg.display_name = Some("Filename pattern".to_string());
    let mut files_arg = ArgumentDict::new("rename_files", "bool", true);
    files_arg.value = Some(rename_files.into());
    files_arg.display_name = Some("Rename files".to_string());
    let mut folders_arg = ArgumentDict::new("rename_folders", "bool", false);
    folders_arg.value = Some(rename_folders.into());
    folders_arg.display_name = Some("Rename folders".to_string());

    CommandDict {
        display_name: Some("Rename".to_string()),
        menu_path: Some("File and Naming".to_string()),
        display_options_on_create: Some(true),
        arguments: vec![pattern_arg, files_arg, folders_arg],
        ..CommandDict::new(RENAME)
    }
}

pub fn export_dict(extension: &str, overwrite: OverwriteMode) -> CommandDict {
    let mut extension_arg = ArgumentDict::new("file_extension", "file_extension", DEFAULT_FILE_EXTENSION);
    extension_arg.value = Some(extension.into());
    extension_arg.display_name = Some("File extension".to_string());
    let mut overwrite_arg = ArgumentDict::new("overwrite", "choice", OverwriteMode::default().as_str());
    overwrite_arg.value = Some(overwrite.as_str().into());
    overwrite_arg.display_name = Some("If a file already exists".to_string());

    CommandDict {
        display_name: Some("Export".to_string()),
        menu_path: Some("File and Naming".to_string()),
        display_options_on_create: Some(true),
        arguments: vec![extension_arg, overwrite_arg],
        ..CommandDict::new(EXPORT)
    }
}

pub fn matching_file_extension_dict() -> CommandDict {
    CommandDict {
        display_name: Some("Matching File Extension".to_string()),
        menu_path: Some("File and Naming".to_string()),
        ..CommandDict::condition(MATCHING_FILE_EXTENSION)
    }
}

pub fn matching_text_dict(match_mode: MatchMode, text: &str, ignore_case: bool) -> CommandDict {
    let mut mode_arg = ArgumentDict::new("match_mode", "choice", MatchMode::default().as_str());
    mode_arg.value = Some(match_mode.as_str().into());
    mode_arg.display_name = Some("How to perform matching".to_string());
    let mut text_arg = ArgumentDict::new("text", "string", "image");
    text_arg.value = Some(text.into());
    text_arg.display_name = Some("Text to match".to_string());
    let mut case_arg = ArgumentDict::new("ignore_case", "bool", false);
    case_arg.value = Some(ignore_case.into());
    case_arg.display_name = Some("Ignore case sensitivity".to_string());

    CommandDict {
        display_name: Some("Matching Text...".to_string()),
        menu_path: Some("File and Naming".to_string()),
        display_options_on_create: Some(true),
        arguments: vec![mode_arg, text_arg, case_arg],
        ..CommandDict::condition(MATCHING_TEXT)
    }
}

pub fn top_level_dict() -> CommandDict {
    CommandDict {
        display_name: Some("Top-Level".to_string()),
        menu_path: Some("Folder".to_string()),
        ..CommandDict::condition(TOP_LEVEL)
    }
}

/// Descriptors of every built-in action with default arguments.
pub fn builtin_actions() -> Vec<CommandDict> {
    vec![
        rename_dict(DEFAULT_PATTERN, true, false),
        export_dict(DEFAULT_FILE_EXTENSION, OverwriteMode::default()),
    ]
}

/// Descriptors of every built-in condition with default arguments.
pub fn builtin_conditions() -> Vec<CommandDict> {
    vec![
        matching_file_extension_dict(),
        matching_text_dict(MatchMode::default(), "image", false),
        top_level_dict(),
    ]
}

/// The function behind a built-in command, bound to one run.
pub fn builtin_function(command: &Command, state: &Rc<RunState>) -> Option<Function> {
    let state = state.clone();
    match (command.kind, command.orig_name.as_str()) {
        (CommandKind::Action, RENAME) => Some(rename_action(state)),
        (CommandKind::Action, EXPORT) => Some(export_action(state)),
        (CommandKind::Condition, MATCHING_FILE_EXTENSION) => Some(condition(state, has_matching_file_extension)),
        (CommandKind::Condition, MATCHING_TEXT) => Some(condition(state, is_matching_text)),
        (CommandKind::Condition, TOP_LEVEL) => Some(condition(state, |item, _, _| Ok(item.depth == 0))),
        _ => None,
    }
}

// ============================================================================
// Arguments
// ============================================================================

/// The item a command runs for, passed first by the batcher.
pub fn item_arg(args: &[Value]) -> Result<ItemId, CommandError> {
    args.first()
        .and_then(Value::as_u64)
        .map(|id| id as ItemId)
        .ok_or_else(|| CommandError::new("missing item argument"))
}

fn kwarg_str<'a>(kwargs: &'a Kwargs, name: &str, default: &'a str) -> &'a str {
    kwargs.get(name).and_then(Value::as_str).unwrap_or(default)
}

fn kwarg_bool(kwargs: &Kwargs, name: &str, default: bool) -> bool {
    kwargs.get(name).and_then(Value::as_bool).unwrap_or(default)
}

fn item_in(state: &RunState, id: ItemId) -> Result<Item, CommandError> {
    state
        .tree
        .borrow()
        .get(id)
        .cloned()
        .ok_or_else(|| CommandError::new(format!("item {id} is not in the tree")))
}

// ============================================================================
// Rename
// ============================================================================

/// Renames one item per step. Numbering continues across items because the
/// same renamer is resumed for every item of the run.
struct RenameProcess {
    state: Rc<RunState>,
    renamer: ItemRenamer,
    renamed_parents: HashSet<ItemId>,
    first_item: Option<ItemId>,
}

impl RenameProcess {
    fn process(&mut self, item: ItemId) {
        let context = self.state.rename_context(item);

        if self.renamer.rename_folders() {
            let parents = self.state.tree.borrow().parents(item);
            for parent in parents {
                if self.renamed_parents.insert(parent) {
                    let name = self.renamer.rename(&context.for_item(parent));
                    self.state.tree.borrow_mut().set_name(parent, name);
                }
            }
        }

        if self.renamer.rename_files() {
            let name = self.renamer.rename(&context);
            debug!(target: "batcher::run", item, name = %name, "renamed");
            self.state.tree.borrow_mut().set_name(item, name);
        }
    }
}

impl Coroutine for RenameProcess {
    fn resume(&mut self, input: Resume<'_>) -> Result<Step, CommandError> {
        let item = match input {
            Resume::Start => self.first_item.take(),
            Resume::Send { args, .. } => Some(item_arg(args)?),
            Resume::Result(_) => None,
        };
        if let Some(item) = item {
            self.process(item);
        }
        Ok(Step::Yielded(Value::Null))
    }
}

fn rename_action(state: Rc<RunState>) -> Function {
    Function::new(move |args, kwargs| {
        let item = item_arg(args)?;
        let pattern = kwarg_str(kwargs, "pattern", DEFAULT_PATTERN);
        let renamer = ItemRenamer::new(
            pattern,
            kwarg_bool(kwargs, "rename_files", true),
            kwarg_bool(kwargs, "rename_folders", false),
        )
        .map_err(|e| CommandError::new(format!("invalid pattern \"{pattern}\"")).with_source(e))?;

        Ok(Outcome::Generator(Box::new(RenameProcess {
            state: state.clone(),
            renamer,
            renamed_parents: HashSet::new(),
            first_item: Some(item),
        })))
    })
}

// ============================================================================
// Export
// ============================================================================

/// Characters that cannot appear in a file name on common platforms.
const INVALID_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Replace characters invalid in file names with `_` and drop trailing
/// spaces and periods. An empty result becomes `Untitled`.
pub fn validate_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if INVALID_FILENAME_CHARS.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim_end_matches([' ', '.']).trim_start();
    if cleaned.is_empty() {
        "Untitled".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `name` with `.ext` appended, unless it already ends with it.
fn export_name(name: &str, ext: &str) -> String {
    if ext.is_empty() || file_extension(name) == ext.to_lowercase() {
        name.to_string()
    } else {
        format!("{name}.{ext}")
    }
}

fn export_action(state: Rc<RunState>) -> Function {
    let uniquifier = RefCell::new(ItemUniquifier::new());

    Function::new(move |args, kwargs| {
        let id = item_arg(args)?;
        let ext = kwarg_str(kwargs, "file_extension", &state.file_extension)
            .trim_start_matches('.')
            .to_string();
        let ext = if ext.is_empty() { state.file_extension.clone() } else { ext };
        let overwrite = kwarg_str(kwargs, "overwrite", state.overwrite.as_str());
        let overwrite = OverwriteMode::parse(overwrite)
            .ok_or_else(|| CommandError::new(format!("unknown overwrite mode \"{overwrite}\"")))?;

        let item = item_in(&state, id)?;
        let mut output_path = state.output_dir.clone();
        {
            let mut uniquifier = uniquifier.borrow_mut();
            for parent in state.tree.borrow().parents(id) {
                let Ok(parent) = item_in(&state, parent) else { continue };
                let name = validate_filename(&parent.name);
                output_path.push(uniquifier.uniquify(&parent, Some(&name), None));
            }
            let name = export_name(&validate_filename(&item.name), &ext);
            let ext_len = match file_extension(&name).chars().count() {
                0 => 0,
                n => n + 1,
            };
            let position = name.chars().count() - ext_len;
            output_path.push(uniquifier.uniquify(&item, Some(&name), Some(position)));
        }

        let record = if state.is_preview {
            ExportRecord { output_path, written: false }
        } else {
            write_export(&item, output_path, overwrite)?
        };
        let written = record.written;
        state.record_export(id, record);
        Ok(Value::Bool(written).into())
    })
}

fn write_export(item: &Item, output_path: PathBuf, overwrite: OverwriteMode) -> Result<ExportRecord, CommandError> {
    if item.path.as_os_str().is_empty() {
        return Err(CommandError::new(format!("\"{}\" has no source file", item.orig_name)));
    }

    let output_path = if output_path.exists() {
        match overwrite {
            OverwriteMode::Skip => {
                debug!(target: "batcher::run", path = %output_path.display(), "exists, skipped");
                return Ok(ExportRecord { output_path, written: false });
            }
            OverwriteMode::Replace => output_path,
            OverwriteMode::RenameNew => uniquify_path(&output_path),
        }
    } else {
        output_path
    };

    if let Some(dir) = output_path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| CommandError::new(format!("cannot create \"{}\"", dir.display())).with_source(e))?;
    }
    fs::copy(&item.path, &output_path).map_err(|e| {
        CommandError::new(format!("cannot export \"{}\"", item.orig_name)).with_source(e)
    })?;
    debug!(target: "batcher::run", path = %output_path.display(), "exported");

    Ok(ExportRecord { output_path, written: true })
}

// ============================================================================
// Conditions
// ============================================================================

type ConditionFn = fn(&Item, &RunState, &Kwargs) -> Result<bool, CommandError>;

fn condition(state: Rc<RunState>, check: ConditionFn) -> Function {
    Function::new(move |args, kwargs| {
        let item = item_in(&state, item_arg(args)?)?;
        Ok(Value::Bool(check(&item, &state, kwargs)?).into())
    })
}

fn has_matching_file_extension(item: &Item, state: &RunState, _kwargs: &Kwargs) -> Result<bool, CommandError> {
    Ok(file_extension(&item.orig_name) == state.file_extension.to_lowercase())
}

fn is_matching_text(item: &Item, _state: &RunState, kwargs: &Kwargs) -> Result<bool, CommandError> {
    let text = kwarg_str(kwargs, "text", "");
    if text.is_empty() {
        return Ok(true);
    }
    let mode = kwarg_str(kwargs, "match_mode", MatchMode::default().as_str());
    let mode = MatchMode::parse(mode).ok_or_else(|| {
        let modes: Vec<&str> = MatchMode::ALL.iter().map(|m| m.as_str()).collect();
        CommandError::new(format!("unrecognized match mode; must be one of: {}", modes.join(", ")))
    })?;
    let ignore_case = kwarg_bool(kwargs, "ignore_case", false);

    let (name, text) = if ignore_case {
        (item.orig_name.to_lowercase(), text.to_lowercase())
    } else {
        (item.orig_name.clone(), text.to_string())
    };

    Ok(match mode {
        MatchMode::StartsWith => name.starts_with(&text),
        MatchMode::DoesNotStartWith => !name.starts_with(&text),
        MatchMode::Contains => name.contains(&text),
        MatchMode::DoesNotContain => !name.contains(&text),
        MatchMode::EndsWith => name.ends_with(&text),
        MatchMode::DoesNotEndWith => !name.ends_with(&text),
        MatchMode::Regex => RegexBuilder::new(&text)
            .build()
            .map(|re| re.is_match(&name))
            .unwrap_or(false),
    })
}
