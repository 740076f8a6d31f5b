//! Running a pipeline of actions and conditions over an item tree.
//!
//! A [`Batcher`] turns the two command registries into one [`Invoker`] per
//! run and drives it through a fixed sequence of groups:
//!
//! ```text
//! default_conditions          collect filter rules
//! (filter)                    files passing every rule, plus their folders
//! before_process_items
//! for each matching file:
//!     before_process_item
//!     default_actions         rename, export, procedures, ...
//!     after_process_item
//! after_process_items
//! cleanup_contents            always, also after an error
//! ```
//!
//! Commands receive the current item's ID as their first positional
//! argument and their registry arguments as keyword arguments.
//!
//! ## Errors
//!
//! A command that returns a skip error is recorded and processing goes on.
//! Any other command error is recorded as failed and stops the run with
//! [`BatchError::Command`].
//!
//! ## Initial commands
//!
//! Commands added with [`Batcher::add_action`] and [`Batcher::add_condition`]
//! live in an initial invoker that is nested into every run's invoker, so
//! they run alongside the registry commands without being part of a saved
//! pipeline.

use serde_json::{Value, json};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::builtins::{self, OverwriteMode};
use crate::commands::{
    Command as RegistryCommand, CommandGroup, CommandKind, DEFAULT_ACTIONS_GROUP, DEFAULT_CONDITIONS_GROUP,
};
use crate::invoker::{
    AddOptions, Command, CommandError, CommandId, Coroutine, Function, Groups, InvokeOptions, Invoker,
    InvokerError, Kwargs, Outcome, Resume, Step,
};
use crate::itemtree::{ItemId, ItemTree, SharedTree};
use crate::pdb::ProcedureDatabase;
use crate::renamer::RenameContext;

pub const BEFORE_PROCESS_ITEMS: &str = "before_process_items";
pub const BEFORE_PROCESS_ITEM: &str = "before_process_item";
pub const AFTER_PROCESS_ITEM: &str = "after_process_item";
pub const AFTER_PROCESS_ITEMS: &str = "after_process_items";
pub const CLEANUP_CONTENTS: &str = "cleanup_contents";

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("command \"{command}\" failed{}: {source}", on_item(.item))]
    Command {
        command: String,
        item: Option<String>,
        #[source]
        source: CommandError,
    },
    #[error(transparent)]
    Invoker(InvokerError),
}

fn on_item(item: &Option<String>) -> String {
    item.as_ref().map(|i| format!(" on \"{i}\"")).unwrap_or_default()
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRecord {
    pub output_path: PathBuf,
    /// False in previews and when an existing file was skipped.
    pub written: bool,
}

/// One skipped or failed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    /// Original name of the item being processed, if any.
    pub item: Option<String>,
    pub message: String,
}

/// Issues keyed by command name, split by command kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandIssues {
    pub actions: BTreeMap<String, Vec<Issue>>,
    pub conditions: BTreeMap<String, Vec<Issue>>,
}

impl CommandIssues {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.conditions.is_empty()
    }

    fn push(&mut self, kind: CommandKind, command: &str, issue: Issue) {
        let map = match kind {
            CommandKind::Action => &mut self.actions,
            CommandKind::Condition => &mut self.conditions,
        };
        map.entry(command.to_string()).or_default().push(issue);
    }
}

/// A file or folder that took part in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedItem {
    pub id: ItemId,
    /// Path relative to the source directory, from original names.
    pub source: PathBuf,
    /// Name after the run.
    pub name: String,
    pub depth: usize,
    pub is_folder: bool,
    pub output_path: Option<PathBuf>,
    pub written: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Matching files and their folders, in tree order.
    pub items: Vec<ProcessedItem>,
    pub skipped: CommandIssues,
    pub failed: CommandIssues,
}

impl BatchReport {
    pub fn files(&self) -> impl Iterator<Item = &ProcessedItem> {
        self.items.iter().filter(|i| !i.is_folder)
    }

    pub fn written_count(&self) -> usize {
        self.items.iter().filter(|i| i.written).count()
    }
}

// ============================================================================
// Run state
// ============================================================================

/// A condition collected from `default_conditions`, applied to every file.
#[derive(Clone)]
struct FilterRule {
    name: String,
    function: Function,
    kwargs: Kwargs,
    apply_to_parents: bool,
    takes_item: bool,
}

/// State shared by every command of one run.
pub struct RunState {
    pub tree: SharedTree,
    pub output_dir: PathBuf,
    pub file_extension: String,
    pub overwrite: OverwriteMode,
    pub is_preview: bool,
    current_item: Cell<Option<ItemId>>,
    current_command: RefCell<Option<String>>,
    matching_items: RefCell<Option<Rc<[ItemId]>>>,
    matching_items_and_parents: RefCell<Option<Rc<[ItemId]>>>,
    rules: RefCell<Vec<FilterRule>>,
    exports: RefCell<HashMap<ItemId, ExportRecord>>,
    skipped: RefCell<CommandIssues>,
    failed: RefCell<CommandIssues>,
}

impl RunState {
    pub fn new(tree: SharedTree, output_dir: PathBuf, file_extension: String, is_preview: bool) -> Self {
        Self {
            tree,
            output_dir,
            file_extension,
            overwrite: OverwriteMode::default(),
            is_preview,
            current_item: Cell::new(None),
            current_command: RefCell::new(None),
            matching_items: RefCell::new(None),
            matching_items_and_parents: RefCell::new(None),
            rules: RefCell::new(Vec::new()),
            exports: RefCell::new(HashMap::new()),
            skipped: RefCell::new(CommandIssues::default()),
            failed: RefCell::new(CommandIssues::default()),
        }
    }

    pub fn current_item(&self) -> Option<ItemId> {
        self.current_item.get()
    }

    /// Name of the command that ran last.
    pub fn current_command(&self) -> Option<String> {
        self.current_command.borrow().clone()
    }

    /// Files that passed the conditions. `None` until filtering is done.
    pub fn matching_items(&self) -> Option<Rc<[ItemId]>> {
        self.matching_items.borrow().clone()
    }

    pub fn rename_context(&self, item: ItemId) -> RenameContext {
        RenameContext {
            matching_items: self.matching_items(),
            matching_items_and_parents: self.matching_items_and_parents.borrow().clone(),
            file_extension: self.file_extension.clone(),
            output_dir: self.output_dir.clone(),
            ..RenameContext::new(self.tree.clone(), item)
        }
    }

    pub fn record_export(&self, item: ItemId, record: ExportRecord) {
        self.exports.borrow_mut().insert(item, record);
    }

    pub fn export_record(&self, item: ItemId) -> Option<ExportRecord> {
        self.exports.borrow().get(&item).cloned()
    }

    fn current_item_name(&self) -> Option<String> {
        let id = self.current_item.get()?;
        self.tree.borrow().get(id).map(|i| i.orig_name.clone())
    }

    fn is_enabled(&self, command: &RegistryCommand) -> bool {
        command.enabled && (!self.is_preview || command.enabled_for_previews())
    }

    fn record_skipped(&self, kind: CommandKind, command: &str, message: &str) {
        let item = self.current_item_name();
        warn!(target: "batcher::run", command, item = item.as_deref(), "skipped: {message}");
        self.skipped.borrow_mut().push(
            kind,
            command,
            Issue {
                item,
                message: message.to_string(),
            },
        );
    }

    fn record_failed(&self, kind: CommandKind, command: &str, message: &str) {
        let item = self.current_item_name();
        warn!(target: "batcher::run", command, item = item.as_deref(), "failed: {message}");
        self.failed.borrow_mut().push(
            kind,
            command,
            Issue {
                item,
                message: message.to_string(),
            },
        );
    }

    fn report(&self) -> BatchReport {
        let tree = self.tree.borrow();
        let exports = self.exports.borrow();
        let ids = self.matching_items_and_parents.borrow().clone().unwrap_or_else(|| Rc::from([]));

        let items = ids
            .iter()
            .filter_map(|&id| {
                let item = tree.get(id)?;
                let export = exports.get(&id);
                Some(ProcessedItem {
                    id,
                    source: tree.relative_path(id),
                    name: item.name.clone(),
                    depth: item.depth,
                    is_folder: item.is_folder(),
                    output_path: export.map(|e| e.output_path.clone()),
                    written: export.is_some_and(|e| e.written),
                })
            })
            .collect();

        BatchReport {
            items,
            skipped: self.skipped.borrow().clone(),
            failed: self.failed.borrow().clone(),
        }
    }
}

// ============================================================================
// Command wrappers
// ============================================================================

/// Applies skip/fail bookkeeping to a resumable command on every step.
struct GuardedCoroutine {
    inner: Box<dyn Coroutine>,
    state: Rc<RunState>,
    command: String,
}

impl Coroutine for GuardedCoroutine {
    fn resume(&mut self, input: Resume<'_>) -> Result<Step, CommandError> {
        if matches!(input, Resume::Send { .. }) {
            *self.state.current_command.borrow_mut() = Some(self.command.clone());
        }
        match self.inner.resume(input) {
            Err(e) if e.is_skip() => {
                self.state.record_skipped(CommandKind::Action, &self.command, &e.message);
                Ok(Step::Yielded(Value::Null))
            }
            Err(e) => {
                self.state.record_failed(CommandKind::Action, &self.command, &e.message);
                Err(e)
            }
            ok => ok,
        }
    }
}

/// Wrap a registry command's function for the run invoker: check whether
/// it is enabled, turn conditions into filter rules, and record errors.
fn wrap_command(command: RegistryCommand, function: Function, state: Rc<RunState>) -> Function {
    let is_procedure = command.origin.is_procedure();

    Function::new(move |args, kwargs| {
        if !state.is_enabled(&command) {
            return Ok(Value::Bool(false).into());
        }
        *state.current_command.borrow_mut() = Some(command.name.clone());

        if command.kind == CommandKind::Condition {
            state.rules.borrow_mut().push(FilterRule {
                name: command.name.clone(),
                function: function.clone(),
                kwargs: kwargs.clone(),
                apply_to_parents: command.also_apply_to_parent_folders(),
                takes_item: !is_procedure,
            });
            return Ok(Value::Null.into());
        }

        let args = if is_procedure && !args.is_empty() { &args[1..] } else { args };
        match function.call(args, kwargs) {
            Ok(Outcome::Generator(inner)) => Ok(Outcome::Generator(Box::new(GuardedCoroutine {
                inner,
                state: state.clone(),
                command: command.name.clone(),
            }))),
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_skip() => {
                state.record_skipped(command.kind, &command.name, &e.message);
                Ok(Value::Null.into())
            }
            Err(e) => {
                state.record_failed(command.kind, &command.name, &e.message);
                Err(e)
            }
        }
    })
}

fn procedure_function(procedures: Rc<dyn ProcedureDatabase>, name: String) -> Function {
    Function::new(move |_args, kwargs| procedures.run(&name, kwargs).map(Outcome::Value))
}

/// Logs the start and finish of every action in `default_actions`.
struct ActionTrace {
    state: Rc<RunState>,
    item: Option<u64>,
}

impl Coroutine for ActionTrace {
    fn resume(&mut self, input: Resume<'_>) -> Result<Step, CommandError> {
        match input {
            Resume::Start => {
                debug!(target: "batcher::run", item = self.item, "action started");
                Ok(Step::Yielded(Value::Null))
            }
            Resume::Send { .. } | Resume::Result(_) => {
                let command = self.state.current_command();
                debug!(target: "batcher::run", item = self.item, command = command.as_deref(), "action finished");
                Ok(Step::Complete)
            }
        }
    }
}

fn action_trace(state: Rc<RunState>) -> Function {
    Function::new(move |args, _kwargs| {
        Ok(Outcome::Generator(Box::new(ActionTrace {
            state: state.clone(),
            item: args.first().and_then(Value::as_u64),
        })))
    })
}

/// Truthiness of a condition's return value.
fn is_truthy(outcome: &Outcome) -> bool {
    match outcome {
        Outcome::Value(Value::Null) => false,
        Outcome::Value(Value::Bool(b)) => *b,
        Outcome::Value(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Outcome::Value(Value::String(s)) => !s.is_empty(),
        Outcome::Value(Value::Array(a)) => !a.is_empty(),
        Outcome::Value(Value::Object(o)) => !o.is_empty(),
        Outcome::Generator(_) => true,
    }
}

fn invoke_if_present(invoker: &Invoker, group: &str, item: Option<ItemId>) -> Result<(), InvokerError> {
    if !invoker.has_group(group) {
        return Ok(());
    }
    let mut options = InvokeOptions::groups(Groups::only([group]));
    if let Some(id) = item {
        options = options.with_args(vec![json!(id)]).args_at(0);
    }
    invoker.invoke(options)
}

// ============================================================================
// Batcher
// ============================================================================

pub struct BatchOptions {
    pub output_dir: PathBuf,
    /// Target file extension, without the dot.
    pub file_extension: String,
    /// Used by export when its own `overwrite` argument is missing.
    pub overwrite: OverwriteMode,
    /// Run every command enabled for previews, but write nothing.
    pub is_preview: bool,
    /// Resolves `gimp_pdb` and `gegl` commands.
    pub procedures: Option<Rc<dyn ProcedureDatabase>>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            file_extension: builtins::DEFAULT_FILE_EXTENSION.to_string(),
            overwrite: OverwriteMode::default(),
            is_preview: false,
            procedures: None,
        }
    }
}

pub struct Batcher {
    tree: SharedTree,
    options: BatchOptions,
    initial_invoker: Invoker,
    active: Rc<RefCell<Option<Rc<RunState>>>>,
}

impl Batcher {
    pub fn new(tree: ItemTree, options: BatchOptions) -> Self {
        Self {
            tree: Rc::new(RefCell::new(tree)),
            options,
            initial_invoker: Invoker::new(),
            active: Rc::new(RefCell::new(None)),
        }
    }

    pub fn tree(&self) -> &SharedTree {
        &self.tree
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Add a command run on every run, before registry commands of the
    /// same group. Without explicit groups it goes to `default_actions`.
    pub fn add_action(&self, command: impl Into<Command>, mut options: AddOptions) -> Option<CommandId> {
        if options.groups == Groups::Default {
            options.groups = Groups::only([DEFAULT_ACTIONS_GROUP]);
        }
        self.initial_invoker.add(command, options)
    }

    /// Add a filter rule applied on every run. `function` is called with the
    /// item ID and `options.kwargs`; a falsy result excludes the item.
    pub fn add_condition(&self, name: &str, function: Function, mut options: AddOptions) -> Option<CommandId> {
        if options.groups == Groups::Default {
            options.groups = Groups::only([DEFAULT_CONDITIONS_GROUP]);
        }
        let active = self.active.clone();
        let name = name.to_string();
        let rule_adder = Function::new(move |_args, kwargs| {
            if let Some(state) = active.borrow().as_ref() {
                state.rules.borrow_mut().push(FilterRule {
                    name: name.clone(),
                    function: function.clone(),
                    kwargs: kwargs.clone(),
                    apply_to_parents: false,
                    takes_item: true,
                });
            }
            Ok(Value::Null.into())
        });
        self.initial_invoker.add(rule_adder, options)
    }

    pub fn remove_command(&self, id: CommandId, groups: impl Into<Groups>) -> Result<(), InvokerError> {
        self.initial_invoker.remove(id, groups, false)
    }

    pub fn reorder_command(&self, id: CommandId, position: isize, group: &str) -> Result<(), InvokerError> {
        self.initial_invoker.reorder(id, position, Some(group))
    }

    /// Process the tree with the commands of `actions` and `conditions`.
    ///
    /// Item names in the tree keep the values the run gave them, so a
    /// second run starts from the renamed tree.
    pub fn run(&self, actions: &CommandGroup, conditions: &CommandGroup) -> Result<BatchReport, BatchError> {
        let state = Rc::new(RunState {
            overwrite: self.options.overwrite,
            ..RunState::new(
                self.tree.clone(),
                self.options.output_dir.clone(),
                self.options.file_extension.clone(),
                self.options.is_preview,
            )
        });
        *self.active.borrow_mut() = Some(state.clone());

        let invoker = Invoker::new();
        let initial_groups = self.initial_invoker.list_groups(true);
        if !initial_groups.is_empty() {
            invoker.add(self.initial_invoker.clone(), AddOptions::groups(initial_groups));
        }
        invoker.add(
            Command::foreach_wrapper(action_trace(state.clone())),
            AddOptions::groups(DEFAULT_ACTIONS_GROUP),
        );

        let result = self
            .add_commands(&invoker, &state, actions.iter().chain(conditions.iter()))
            .and_then(|()| self.process_items(&invoker, &state));

        state.current_item.set(None);
        let cleanup = invoke_if_present(&invoker, CLEANUP_CONTENTS, None);
        *self.active.borrow_mut() = None;

        result?;
        cleanup.map_err(|e| batch_error(e, &state))?;

        let report = state.report();
        info!(
            target: "batcher::run",
            items = report.files().count(),
            written = report.written_count(),
            preview = state.is_preview,
            "run finished"
        );
        Ok(report)
    }

    fn add_commands<'a, I>(&self, invoker: &Invoker, state: &Rc<RunState>, commands: I) -> Result<(), BatchError>
    where
        I: IntoIterator<Item = &'a RegistryCommand>,
    {
        for command in commands {
            let function = if command.origin.is_procedure() {
                match &self.options.procedures {
                    Some(procedures) if procedures.contains(&command.function) => {
                        procedure_function(procedures.clone(), command.function.clone())
                    }
                    _ if !command.enabled => continue,
                    _ => {
                        let message = format!("procedure \"{}\" not found", command.function);
                        return Err(self.failed_to_resolve(state, command, message));
                    }
                }
            } else {
                match builtins::builtin_function(command, state) {
                    Some(function) => function,
                    None => {
                        let message = format!("unknown built-in {} \"{}\"", command.kind, command.orig_name);
                        return Err(self.failed_to_resolve(state, command, message));
                    }
                }
            };

            let groups = command.command_groups.clone().unwrap_or_else(|| {
                vec![match command.kind {
                    CommandKind::Action => DEFAULT_ACTIONS_GROUP.to_string(),
                    CommandKind::Condition => DEFAULT_CONDITIONS_GROUP.to_string(),
                }]
            });
            invoker.add(
                wrap_command(command.clone(), function, state.clone()),
                AddOptions::groups(groups).with_kwargs(command.kwargs()),
            );
            debug!(target: "batcher::run", command = %command.name, "added to run");
        }
        Ok(())
    }

    fn failed_to_resolve(&self, state: &RunState, command: &RegistryCommand, message: String) -> BatchError {
        state.record_failed(command.kind, &command.name, &message);
        BatchError::Command {
            command: command.name.clone(),
            item: None,
            source: CommandError::new(message),
        }
    }

    fn process_items(&self, invoker: &Invoker, state: &Rc<RunState>) -> Result<(), BatchError> {
        let run = |group: &str, item: Option<ItemId>| invoke_if_present(invoker, group, item).map_err(|e| batch_error(e, state));

        run(DEFAULT_CONDITIONS_GROUP, None)?;
        let matching = self.filter_items(state)?;
        info!(target: "batcher::run", items = matching.len(), "processing items");

        run(BEFORE_PROCESS_ITEMS, None)?;
        for &id in matching.iter() {
            state.current_item.set(Some(id));
            info!(target: "batcher::run", item = state.current_item_name().as_deref(), "processing");
            run(BEFORE_PROCESS_ITEM, Some(id))?;
            run(DEFAULT_ACTIONS_GROUP, Some(id))?;
            run(AFTER_PROCESS_ITEM, Some(id))?;
        }
        state.current_item.set(None);
        run(AFTER_PROCESS_ITEMS, None)
    }

    /// Apply the collected rules to every file and store the result.
    fn filter_items(&self, state: &RunState) -> Result<Rc<[ItemId]>, BatchError> {
        let rules = state.rules.borrow().clone();
        let files: Vec<ItemId> = state.tree.borrow().files().map(|i| i.id).collect();

        let mut matching = Vec::with_capacity(files.len());
        for id in files {
            state.current_item.set(Some(id));
            if self.passes(state, &rules, id)? {
                matching.push(id);
            }
        }
        state.current_item.set(None);

        let matching: Rc<[ItemId]> = matching.into();
        let with_parents: Rc<[ItemId]> = state.tree.borrow().with_parents(&matching).into();
        *state.matching_items.borrow_mut() = Some(matching.clone());
        *state.matching_items_and_parents.borrow_mut() = Some(with_parents);
        Ok(matching)
    }

    fn passes(&self, state: &RunState, rules: &[FilterRule], id: ItemId) -> Result<bool, BatchError> {
        for rule in rules {
            let mut targets = vec![id];
            if rule.apply_to_parents {
                targets.extend(state.tree.borrow().parents(id).into_iter().rev());
            }
            for target in targets {
                let args = if rule.takes_item { vec![json!(target)] } else { Vec::new() };
                match rule.function.call(&args, &rule.kwargs) {
                    Ok(outcome) if is_truthy(&outcome) => {}
                    Ok(_) => return Ok(false),
                    Err(e) if e.is_skip() => {
                        state.record_skipped(CommandKind::Condition, &rule.name, &e.message);
                        return Ok(false);
                    }
                    Err(e) => {
                        state.record_failed(CommandKind::Condition, &rule.name, &e.message);
                        return Err(BatchError::Command {
                            command: rule.name.clone(),
                            item: state.current_item_name(),
                            source: e,
                        });
                    }
                }
            }
        }
        Ok(true)
    }
}

fn batch_error(error: InvokerError, state: &RunState) -> BatchError {
    match error {
        InvokerError::Command(source) => BatchError::Command {
            command: state.current_command().unwrap_or_default(),
            item: state.current_item_name(),
            source,
        },
        other => BatchError::Invoker(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::{export_dict, matching_file_extension_dict, matching_text_dict, rename_dict, top_level_dict, MatchMode};
    use crate::commands::CommandDict;
    use crate::pdb::{InMemoryProcedureDatabase, Procedure, ProcedureKind};
    use crate::test_helpers::{CallLog, build_tree, list_files, logging_function, setup_source};
    use tempfile::TempDir;

    fn registries(actions: Vec<CommandDict>, conditions: Vec<CommandDict>) -> (CommandGroup, CommandGroup) {
        (
            CommandGroup::create("actions", actions).unwrap(),
            CommandGroup::create("conditions", conditions).unwrap(),
        )
    }

    fn preview(tree: ItemTree) -> Batcher {
        Batcher::new(
            tree,
            BatchOptions {
                is_preview: true,
                ..BatchOptions::default()
            },
        )
    }

    fn body_tree() -> ItemTree {
        build_tree(
            "
            Body/
              Hands/
                Left.jpg
                Right.png
              Torso.png
            cover.png
            notes.txt
            ",
        )
    }

    fn file_names(report: &BatchReport) -> Vec<&str> {
        report.files().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn run_without_conditions_processes_every_file() {
        let (actions, conditions) = registries(vec![rename_dict("[image name]", true, false)], vec![]);
        let report = preview(body_tree()).run(&actions, &conditions).unwrap();
        assert_eq!(file_names(&report), vec!["Left", "Right", "Torso", "cover", "notes"]);
        // folders are listed before their contents
        let all: Vec<&str> = report.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(all, vec!["Body", "Hands", "Left", "Right", "Torso", "cover", "notes"]);
    }

    #[test]
    fn conditions_filter_files() {
        let (actions, conditions) = registries(
            vec![rename_dict("[image name]", true, false)],
            vec![matching_file_extension_dict(), top_level_dict()],
        );
        let report = preview(body_tree()).run(&actions, &conditions).unwrap();
        assert_eq!(file_names(&report), vec!["cover"]);
    }

    #[test]
    fn condition_applied_to_parent_folders() {
        let mut text = matching_text_dict(MatchMode::DoesNotContain, "Hands", false);
        text.also_apply_to_parent_folders = Some(true);
        let (actions, conditions) = registries(vec![], vec![text]);
        let report = preview(body_tree()).run(&actions, &conditions).unwrap();
        let sources: Vec<String> = report.files().map(|i| i.source.display().to_string()).collect();
        assert_eq!(sources, vec!["Body/Torso.png", "cover.png", "notes.txt"]);
    }

    #[test]
    fn disabled_commands_do_nothing() {
        let mut rename = rename_dict("x", true, false);
        rename.enabled = Some(false);
        let mut condition = top_level_dict();
        condition.enabled = Some(false);
        let (actions, conditions) = registries(vec![rename], vec![condition]);
        let report = preview(body_tree()).run(&actions, &conditions).unwrap();
        assert_eq!(file_names(&report), vec!["Left.jpg", "Right.png", "Torso.png", "cover.png", "notes.txt"]);
    }

    #[test]
    fn commands_disabled_for_previews_only_run_for_real() {
        let mut rename = rename_dict("x", true, false);
        rename.enabled_for_previews = Some(false);
        let (actions, conditions) = registries(vec![rename], vec![]);
        let report = preview(build_tree("a.png")).run(&actions, &conditions).unwrap();
        assert_eq!(file_names(&report), vec!["a.png"]);
    }

    #[test]
    fn numbering_spans_the_whole_run() {
        let (actions, conditions) = registries(
            vec![rename_dict("img[000, %n, %d]", true, false)],
            vec![matching_file_extension_dict()],
        );
        let report = preview(body_tree()).run(&actions, &conditions).unwrap();
        assert_eq!(file_names(&report), vec!["img003", "img002", "img001"]);
    }

    #[test]
    fn initial_actions_run_for_each_item() {
        let log = CallLog::default();
        let batcher = preview(build_tree("a.png\nb.png"));
        batcher.add_action(logging_function(&log, "initial"), AddOptions::default());
        let (actions, conditions) = registries(vec![], vec![]);
        batcher.run(&actions, &conditions).unwrap();
        assert_eq!(log.entries(), vec!["initial [0]", "initial [1]"]);
    }

    #[test]
    fn initial_actions_can_target_lifecycle_groups() {
        let log = CallLog::default();
        let batcher = preview(build_tree("a.png"));
        for group in [BEFORE_PROCESS_ITEMS, AFTER_PROCESS_ITEM, CLEANUP_CONTENTS] {
            batcher.add_action(logging_function(&log, group), AddOptions::groups(group));
        }
        let (actions, conditions) = registries(vec![], vec![]);
        batcher.run(&actions, &conditions).unwrap();
        assert_eq!(
            log.entries(),
            vec!["before_process_items []", "after_process_item [0]", "cleanup_contents []"]
        );
    }

    #[test]
    fn initial_conditions_filter_items() {
        let batcher = preview(build_tree("keep.png\ndrop.png"));
        let tree = batcher.tree().clone();
        let only_keep = Function::new(move |args, _| {
            let id = args[0].as_u64().unwrap() as ItemId;
            let keep = tree.borrow().get(id).unwrap().orig_name.starts_with("keep");
            Ok(Value::Bool(keep).into())
        });
        batcher.add_condition("only keep", only_keep, AddOptions::default());
        let (actions, conditions) = registries(vec![], vec![]);
        let report = batcher.run(&actions, &conditions).unwrap();
        assert_eq!(file_names(&report), vec!["keep.png"]);
    }

    #[test]
    fn removed_initial_command_no_longer_runs() {
        let log = CallLog::default();
        let batcher = preview(build_tree("a.png"));
        let id = batcher
            .add_action(logging_function(&log, "gone"), AddOptions::default())
            .unwrap();
        batcher.remove_command(id, DEFAULT_ACTIONS_GROUP).unwrap();
        let (actions, conditions) = registries(vec![], vec![]);
        batcher.run(&actions, &conditions).unwrap();
        assert!(log.entries().is_empty());
    }

    #[test]
    fn skipped_commands_are_recorded_and_run_continues() {
        let log = CallLog::default();
        let mut db = InMemoryProcedureDatabase::new();
        db.register_with(
            Procedure {
                name: "plug-in-skip".to_string(),
                menu_label: None,
                blurb: None,
                kind: ProcedureKind::Gimp,
                arguments: vec![],
            },
            |_| Err(CommandError::skip("nothing to do")),
        );
        let db: Rc<dyn ProcedureDatabase> = Rc::new(db);
        let batcher = Batcher::new(
            build_tree("a.png\nb.png"),
            BatchOptions {
                procedures: Some(db.clone()),
                is_preview: true,
                ..BatchOptions::default()
            },
        );
        batcher.add_action(logging_function(&log, "after"), AddOptions::groups(AFTER_PROCESS_ITEM));
        let mut actions = CommandGroup::create("actions", vec![]).unwrap();
        actions.set_procedure_database(db);
        actions.add("plug-in-skip").unwrap();
        let conditions = CommandGroup::create("conditions", vec![]).unwrap();

        let report = batcher.run(&actions, &conditions).unwrap();
        assert_eq!(log.entries(), vec!["after [0]", "after [1]"]);
        let skipped = &report.skipped.actions["plug-in-skip"];
        assert_eq!(skipped.len(), 2);
        assert_eq!(skipped[0].item.as_deref(), Some("a.png"));
        assert_eq!(skipped[0].message, "nothing to do");
        assert!(report.failed.is_empty());
    }

    #[test]
    fn failing_command_aborts_and_still_cleans_up() {
        let log = CallLog::default();
        let mut db = InMemoryProcedureDatabase::new();
        db.register_with(
            Procedure {
                name: "plug-in-fail".to_string(),
                menu_label: None,
                blurb: None,
                kind: ProcedureKind::Gimp,
                arguments: vec![],
            },
            |_| Err(CommandError::new("broken")),
        );
        let db: Rc<dyn ProcedureDatabase> = Rc::new(db);
        let batcher = Batcher::new(
            build_tree("a.png\nb.png"),
            BatchOptions {
                procedures: Some(db.clone()),
                is_preview: true,
                ..BatchOptions::default()
            },
        );
        batcher.add_action(logging_function(&log, "cleanup"), AddOptions::groups(CLEANUP_CONTENTS));
        let mut actions = CommandGroup::create("actions", vec![]).unwrap();
        actions.set_procedure_database(db);
        actions.add("plug-in-fail").unwrap();
        let conditions = CommandGroup::create("conditions", vec![]).unwrap();

        let err = batcher.run(&actions, &conditions).unwrap_err();
        match err {
            BatchError::Command { command, item, source } => {
                assert_eq!(command, "plug-in-fail");
                assert_eq!(item.as_deref(), Some("a.png"));
                assert_eq!(source.message, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(log.entries(), vec!["cleanup []"]);
    }

    #[test]
    fn missing_procedure_fails_only_when_enabled() {
        let mut missing = CommandDict::new("plug-in-missing");
        missing.origin = Some(crate::commands::Origin::GimpPdb);
        missing.function = Some("plug-in-missing".to_string());
        let (actions, conditions) = registries(vec![missing.clone()], vec![]);
        let err = preview(build_tree("a.png")).run(&actions, &conditions).unwrap_err();
        assert!(err.to_string().contains("procedure \"plug-in-missing\" not found"));

        missing.enabled = Some(false);
        let (actions, conditions) = registries(vec![missing], vec![]);
        assert!(preview(build_tree("a.png")).run(&actions, &conditions).is_ok());
    }

    #[test]
    fn procedures_receive_keyword_arguments_only() {
        let seen = CallLog::default();
        let log = seen.clone();
        let mut db = InMemoryProcedureDatabase::new();
        db.register_with(
            Procedure {
                name: "plug-in-echo".to_string(),
                menu_label: Some("_Echo...".to_string()),
                blurb: None,
                kind: ProcedureKind::Gegl,
                arguments: vec![crate::pdb::ProcedureArgument {
                    name: "amount".to_string(),
                    blurb: None,
                    type_name: "int".to_string(),
                    default_value: Some(json!(3)),
                }],
            },
            move |kwargs| {
                log.push(serde_json::to_string(kwargs).unwrap());
                Ok(Value::Null)
            },
        );
        let db: Rc<dyn ProcedureDatabase> = Rc::new(db);
        let batcher = Batcher::new(
            build_tree("a.png"),
            BatchOptions {
                procedures: Some(db.clone()),
                is_preview: true,
                ..BatchOptions::default()
            },
        );
        let mut actions = CommandGroup::create("actions", vec![]).unwrap();
        actions.set_procedure_database(db);
        actions.add("plug-in-echo").unwrap();
        let conditions = CommandGroup::create("conditions", vec![]).unwrap();
        batcher.run(&actions, &conditions).unwrap();
        assert_eq!(seen.entries(), vec![r#"{"amount":3}"#]);
    }

    #[test]
    fn export_writes_renamed_files() {
        let src = setup_source(
            "
            Body/
              Left.png
            cover.png
            ",
        );
        let out = TempDir::new().unwrap();
        let batcher = Batcher::new(
            ItemTree::from_dir(src.path()).unwrap(),
            BatchOptions {
                output_dir: out.path().to_path_buf(),
                ..BatchOptions::default()
            },
        );
        let (actions, conditions) = registries(
            vec![
                rename_dict("[image path, _]", true, false),
                export_dict("png", OverwriteMode::RenameNew),
            ],
            vec![],
        );
        let report = batcher.run(&actions, &conditions).unwrap();

        assert_eq!(list_files(out.path()), vec!["Body/Body_Left.png", "cover.png"]);
        assert_eq!(report.written_count(), 2);
        let left = report.files().next().unwrap();
        assert_eq!(left.output_path.as_deref(), Some(out.path().join("Body/Body_Left.png").as_path()));
    }

    #[test]
    fn run_error_message_names_command_and_item() {
        let err = BatchError::Command {
            command: "export".to_string(),
            item: Some("a.png".to_string()),
            source: CommandError::new("disk full"),
        };
        assert_eq!(err.to_string(), "command \"export\" failed on \"a.png\": disk full");
    }
}
