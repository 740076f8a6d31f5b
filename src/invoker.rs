//! Group-based command execution engine.
//!
//! An [`Invoker`] keeps named, independently ordered groups of commands and
//! runs a group's commands in order on [`Invoker::invoke`]. Commands come in
//! three shapes (see [`Command`]):
//!
//! - **Functions** run once per invocation. A function that returns
//!   [`Outcome::Generator`] instead of a value becomes a *resumable* command:
//!   its first invocation in a group starts the coroutine, and every later
//!   invocation in that group resumes it one step, without calling the
//!   function again. When the coroutine completes, the command is removed
//!   from that group only.
//! - **For-each functions** wrap every other command of their group:
//!   "before" runs, the command runs, then "after" runs with the command's
//!   result.
//! - **Nested invokers** run their own commands of the same group.
//!
//! # Mutation during invocation
//!
//! `Invoker` is a cheaply cloneable handle and every method takes `&self`, so
//! a command may add, remove, or reorder commands of the invoker that is
//! running it. `invoke` walks a snapshot of the group and skips commands that
//! are no longer members when their turn comes.
//!
//! # Command IDs
//!
//! IDs come from one process-wide counter: they increase strictly and are
//! never reused, even across invokers. Once a command leaves its last group
//! its ID is forgotten.
//!
//! ```text
//! group "default":        [for-each: timer]   [commands: resize, rename, export]
//!
//! invoke("default"):      timer.before  resize  timer.after(result)
//!                         timer.before  rename  timer.after(result)
//!                         timer.before  export  timer.after(result)
//! ```

use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, trace};

/// Keyword arguments passed to commands.
pub type Kwargs = Map<String, Value>;

pub type CommandId = u64;

/// Name of the group used when no group is given.
pub const DEFAULT_GROUP: &str = "default";

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

fn next_command_id() -> CommandId {
    NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum InvokerError {
    #[error("command with ID {0} does not exist")]
    UnknownCommand(CommandId),
    #[error("group \"{0}\" does not exist")]
    UnknownGroup(String),
    #[error("command with ID {id} is not in group \"{group}\"")]
    NotInGroup { id: CommandId, group: String },
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Whether a failing command should abort processing or only be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandErrorKind {
    Failed,
    Skipped,
}

/// Error returned by a command function or coroutine.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CommandError {
    pub message: String,
    pub kind: CommandErrorKind,
    #[source]
    pub source: Option<Box<dyn std::error::Error + 'static>>,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: CommandErrorKind::Failed,
            source: None,
        }
    }

    /// The command does not apply to the current item; processing continues.
    pub fn skip(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: CommandErrorKind::Skipped,
            source: None,
        }
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + 'static>>,
    {
        self.source = Some(source.into());
        self
    }

    pub fn is_skip(&self) -> bool {
        self.kind == CommandErrorKind::Skipped
    }
}

/// Lets a command call back into an invoker with `?`. A wrapped command
/// error comes back out unchanged.
impl From<InvokerError> for CommandError {
    fn from(error: InvokerError) -> Self {
        match error {
            InvokerError::Command(error) => error,
            other => CommandError::new(other.to_string()).with_source(other),
        }
    }
}

// ============================================================================
// Commands and coroutines
// ============================================================================

/// Input to one step of a [`Coroutine`].
#[derive(Debug, Clone, Copy)]
pub enum Resume<'a> {
    /// First step, right after the coroutine was created.
    Start,
    /// A later invocation of a resumable command, with that invocation's arguments.
    Send { args: &'a [Value], kwargs: &'a Kwargs },
    /// For-each "after" phase: the result of the wrapped command.
    Result(&'a Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Yielded(Value),
    Complete,
}

/// An explicit resumable state machine; one `resume` is one step.
pub trait Coroutine {
    fn resume(&mut self, input: Resume<'_>) -> Result<Step, CommandError>;
}

impl<F> Coroutine for F
where
    F: FnMut(Resume<'_>) -> Result<Step, CommandError>,
{
    fn resume(&mut self, input: Resume<'_>) -> Result<Step, CommandError> {
        self(input)
    }
}

/// What a command function produced.
pub enum Outcome {
    Value(Value),
    Generator(Box<dyn Coroutine>),
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Value(value)
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Outcome::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

type FunctionBody = dyn Fn(&[Value], &Kwargs) -> Result<Outcome, CommandError>;

/// A callable command. Clones share identity, so a clone found in a group
/// counts as the same command for `contains`/`find`/`ignore_if_exists`.
#[derive(Clone)]
pub struct Function(Rc<FunctionBody>);

impl Function {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value], &Kwargs) -> Result<Outcome, CommandError> + 'static,
    {
        Function(Rc::new(f))
    }

    pub fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Outcome, CommandError> {
        (self.0)(args, kwargs)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        std::ptr::eq(
            Rc::as_ptr(&self.0) as *const (),
            Rc::as_ptr(&other.0) as *const (),
        )
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({:p})", Rc::as_ptr(&self.0) as *const ())
    }
}

/// A command run around every other command in its group.
#[derive(Clone, Debug)]
pub enum ForeachFunction {
    /// Called once after each command; the common case.
    After(Function),
    /// Returns a coroutine that is resumed with [`Resume::Start`] before the
    /// command and with [`Resume::Result`] after it. A coroutine that keeps
    /// yielding makes the command run again.
    Wrapper(Function),
}

impl ForeachFunction {
    fn function(&self) -> &Function {
        match self {
            ForeachFunction::After(f) | ForeachFunction::Wrapper(f) => f,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Command {
    Function(Function),
    Foreach(ForeachFunction),
    Invoker(Invoker),
}

impl Command {
    /// A plain for-each command: runs after every command in its group.
    pub fn foreach(f: Function) -> Self {
        Command::Foreach(ForeachFunction::After(f))
    }

    /// A for-each command whose function returns the wrapping coroutine.
    pub fn foreach_wrapper(f: Function) -> Self {
        Command::Foreach(ForeachFunction::Wrapper(f))
    }

    pub fn is_foreach(&self) -> bool {
        matches!(self, Command::Foreach(_))
    }

    /// Identity comparison: the same function or invoker, and the same kind.
    pub fn same_as(&self, other: &Command) -> bool {
        match (self, other) {
            (Command::Function(a), Command::Function(b)) => a.ptr_eq(b),
            (Command::Foreach(a), Command::Foreach(b)) => a.function().ptr_eq(b.function()),
            (Command::Invoker(a), Command::Invoker(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<Function> for Command {
    fn from(f: Function) -> Self {
        Command::Function(f)
    }
}

impl From<Invoker> for Command {
    fn from(invoker: Invoker) -> Self {
        Command::Invoker(invoker)
    }
}

/// Adapts a plain for-each function to the wrapper protocol: yield before
/// the command, call the function after it.
struct AfterEach {
    function: Function,
    args: Vec<Value>,
    kwargs: Kwargs,
}

impl Coroutine for AfterEach {
    fn resume(&mut self, input: Resume<'_>) -> Result<Step, CommandError> {
        match input {
            Resume::Start => Ok(Step::Yielded(Value::Null)),
            Resume::Send { .. } | Resume::Result(_) => {
                self.function.call(&self.args, &self.kwargs)?;
                Ok(Step::Complete)
            }
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// Which groups an operation targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Groups {
    /// The `"default"` group.
    #[default]
    Default,
    /// Every group that currently exists.
    All,
    Only(Vec<String>),
}

impl Groups {
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Groups::Only(names.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for Groups {
    fn from(name: &str) -> Self {
        match name {
            DEFAULT_GROUP => Groups::Default,
            "all" => Groups::All,
            other => Groups::Only(vec![other.to_string()]),
        }
    }
}

impl<const N: usize> From<[&str; N]> for Groups {
    fn from(names: [&str; N]) -> Self {
        Groups::only(names)
    }
}

impl From<Vec<String>> for Groups {
    fn from(names: Vec<String>) -> Self {
        Groups::Only(names)
    }
}

/// Options for [`Invoker::add`].
#[derive(Debug, Clone)]
pub struct AddOptions {
    pub groups: Groups,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    /// Return `None` without adding if the same command is already in at
    /// least one target group.
    pub ignore_if_exists: bool,
    /// Insertion index per group; `None` appends, negative counts from the end.
    pub position: Option<isize>,
    /// When false, a generator-producing function is called but its
    /// coroutine is discarded.
    pub run_generator: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            groups: Groups::Default,
            args: Vec::new(),
            kwargs: Kwargs::new(),
            ignore_if_exists: false,
            position: None,
            run_generator: true,
        }
    }
}

impl AddOptions {
    pub fn groups(groups: impl Into<Groups>) -> Self {
        Self {
            groups: groups.into(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn at(mut self, position: isize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn ignore_if_exists(mut self) -> Self {
        self.ignore_if_exists = true;
        self
    }

    pub fn run_generator(mut self, run: bool) -> Self {
        self.run_generator = run;
        self
    }
}

/// Options for [`Invoker::invoke`].
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub groups: Groups,
    pub additional_args: Vec<Value>,
    /// Win over a command's own kwargs on key collision.
    pub additional_kwargs: Kwargs,
    /// Splice `additional_args` into the bound args at this index instead of
    /// appending them.
    pub additional_args_position: Option<isize>,
}

impl InvokeOptions {
    pub fn groups(groups: impl Into<Groups>) -> Self {
        Self {
            groups: groups.into(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.additional_args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.additional_kwargs = kwargs;
        self
    }

    pub fn args_at(mut self, position: isize) -> Self {
        self.additional_args_position = Some(position);
        self
    }
}

// ============================================================================
// Internal state
// ============================================================================

struct CommandItem {
    command: Command,
    args: Vec<Value>,
    kwargs: Kwargs,
    groups: HashSet<String>,
    run_generator: bool,
    is_generator: bool,
    /// One live coroutine per group the command has started in.
    generators: HashMap<String, Box<dyn Coroutine>>,
}

#[derive(Default)]
struct Group {
    name: String,
    commands: Vec<CommandId>,
    foreach: Vec<CommandId>,
}

impl Group {
    fn list(&self, foreach: bool) -> &Vec<CommandId> {
        if foreach { &self.foreach } else { &self.commands }
    }

    fn list_mut(&mut self, foreach: bool) -> &mut Vec<CommandId> {
        if foreach {
            &mut self.foreach
        } else {
            &mut self.commands
        }
    }
}

#[derive(Default)]
struct InvokerState {
    items: HashMap<CommandId, CommandItem>,
    /// Kept in creation order; `Groups::All` resolves in this order.
    groups: Vec<Group>,
}

impl InvokerState {
    fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    fn group_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    fn ensure_group(&mut self, name: &str) -> &mut Group {
        let index = match self.groups.iter().position(|g| g.name == name) {
            Some(index) => index,
            None => {
                self.groups.push(Group {
                    name: name.to_string(),
                    ..Default::default()
                });
                self.groups.len() - 1
            }
        };
        &mut self.groups[index]
    }

    fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }

    fn resolve(&self, groups: &Groups) -> Vec<String> {
        match groups {
            Groups::Default => vec![DEFAULT_GROUP.to_string()],
            Groups::All => self.group_names(),
            Groups::Only(names) => names.clone(),
        }
    }

    fn insert_into_group(&mut self, id: CommandId, group: &str, position: Option<isize>) {
        let foreach = match self.items.get_mut(&id) {
            Some(item) => {
                item.groups.insert(group.to_string());
                item.command.is_foreach()
            }
            None => return,
        };
        let list = self.ensure_group(group).list_mut(foreach);
        match position {
            None => list.push(id),
            Some(pos) => {
                let index = insert_index(list.len(), pos);
                list.insert(index, id);
            }
        }
    }

    fn remove_from_group(&mut self, id: CommandId, group: &str) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        let foreach = item.command.is_foreach();
        item.groups.remove(group);
        item.generators.remove(group);
        let forget = item.groups.is_empty();

        if let Some(g) = self.group_mut(group) {
            g.list_mut(foreach).retain(|&other| other != id);
        }
        if forget {
            self.items.remove(&id);
        }
    }
}

/// Index for `list.insert(position, x)` semantics: negative counts from the
/// end, out-of-range values clamp.
fn insert_index(len: usize, position: isize) -> usize {
    if position < 0 {
        (len as isize + position).max(0) as usize
    } else {
        (position as usize).min(len)
    }
}

fn compose_args(bound: &[Value], additional: &[Value], position: Option<isize>) -> Vec<Value> {
    let mut args = bound.to_vec();
    match position {
        None => args.extend_from_slice(additional),
        Some(pos) => {
            let index = insert_index(args.len(), pos);
            args.splice(index..index, additional.iter().cloned());
        }
    }
    args
}

fn compose_kwargs(bound: &Kwargs, additional: &Kwargs) -> Kwargs {
    let mut kwargs = bound.clone();
    for (key, value) in additional {
        kwargs.insert(key.clone(), value.clone());
    }
    kwargs
}

/// Result of invoking one function command once.
struct Invoked {
    value: Value,
    /// The command's coroutine for this group completed.
    exhausted: bool,
}

// ============================================================================
// Invoker
// ============================================================================

#[derive(Clone, Default)]
pub struct Invoker {
    state: Rc<RefCell<InvokerState>>,
}

impl fmt::Debug for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Invoker")
            .field("groups", &state.group_names())
            .field("commands", &state.items.len())
            .finish()
    }
}

impl Invoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ptr_eq(&self, other: &Invoker) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    /// Add a command to the groups in `options`, creating missing groups.
    ///
    /// Returns the new command ID, or `None` when `ignore_if_exists` found
    /// the same command already present (no ID is consumed in that case).
    /// With `Groups::All` and no existing groups the command is added
    /// nowhere.
    pub fn add(&self, command: impl Into<Command>, options: AddOptions) -> Option<CommandId> {
        let command = command.into();
        if options.ignore_if_exists && self.contains(&command, options.groups.clone()) {
            return None;
        }

        let id = next_command_id();
        let mut state = self.state.borrow_mut();
        let targets = state.resolve(&options.groups);
        if targets.is_empty() {
            return Some(id);
        }

        let is_invoker = matches!(command, Command::Invoker(_));
        state.items.insert(
            id,
            CommandItem {
                command,
                args: if is_invoker { Vec::new() } else { options.args },
                kwargs: if is_invoker { Kwargs::new() } else { options.kwargs },
                groups: HashSet::new(),
                run_generator: options.run_generator && !is_invoker,
                is_generator: false,
                generators: HashMap::new(),
            },
        );
        for group in &targets {
            state.insert_into_group(id, group, options.position);
        }
        trace!(target: "batcher::invoker", id, groups = ?targets, "added command");
        Some(id)
    }

    /// Add an existing command to more groups. Groups it is already in are
    /// skipped; the ID stays the same.
    pub fn add_to_groups(
        &self,
        id: CommandId,
        groups: impl Into<Groups>,
        position: Option<isize>,
    ) -> Result<(), InvokerError> {
        let mut state = self.state.borrow_mut();
        let current = match state.items.get(&id) {
            Some(item) => item.groups.clone(),
            None => return Err(InvokerError::UnknownCommand(id)),
        };
        for group in state.resolve(&groups.into()) {
            if !current.contains(&group) {
                state.insert_into_group(id, &group, position);
            }
        }
        Ok(())
    }

    /// Invoke the commands of each target group in order.
    ///
    /// Fails with [`InvokerError::UnknownGroup`] before running anything if a
    /// named group does not exist. Errors from commands propagate
    /// immediately, leaving the rest of the group un-run.
    pub fn invoke(&self, options: InvokeOptions) -> Result<(), InvokerError> {
        let groups = {
            let state = self.state.borrow();
            let groups = state.resolve(&options.groups);
            if let Some(missing) = groups.iter().find(|g| state.group(g).is_none()) {
                return Err(InvokerError::UnknownGroup(missing.clone()));
            }
            groups
        };

        for group in groups {
            self.invoke_group(&group, &options)?;
        }
        Ok(())
    }

    fn invoke_group(&self, group: &str, options: &InvokeOptions) -> Result<(), InvokerError> {
        let snapshot = match self.state.borrow().group(group) {
            Some(g) => g.commands.clone(),
            None => return Ok(()),
        };
        debug!(target: "batcher::invoker", group, commands = snapshot.len(), "invoking group");

        for id in snapshot {
            let (nested, has_foreach) = {
                let state = self.state.borrow();
                let Some(g) = state.group(group) else {
                    return Ok(());
                };
                if !g.commands.contains(&id) {
                    continue;
                }
                let nested = match state.items.get(&id).map(|item| &item.command) {
                    Some(Command::Invoker(inner)) => Some(inner.clone()),
                    _ => None,
                };
                (nested, !g.foreach.is_empty())
            };

            if let Some(inner) = nested {
                // a nested invoker without this group has nothing to run
                if inner.has_group(group) {
                    inner.invoke_group(group, options)?;
                }
            } else if has_foreach {
                self.invoke_with_foreach(id, group, options)?;
            } else {
                let invoked = self.invoke_function(id, group, options)?;
                if invoked.exhausted {
                    self.state.borrow_mut().remove_from_group(id, group);
                    debug!(target: "batcher::invoker", id, group, "generator exhausted, removed from group");
                }
            }
        }
        Ok(())
    }

    fn invoke_function(
        &self,
        id: CommandId,
        group: &str,
        options: &InvokeOptions,
    ) -> Result<Invoked, InvokerError> {
        let (function, args, kwargs, generator, run_generator) = {
            let mut state = self.state.borrow_mut();
            let item = state
                .items
                .get_mut(&id)
                .ok_or(InvokerError::UnknownCommand(id))?;
            let function = match &item.command {
                Command::Function(f) => f.clone(),
                Command::Foreach(f) => f.function().clone(),
                Command::Invoker(_) => return Ok(Invoked { value: Value::Null, exhausted: false }),
            };
            let args = compose_args(&item.args, &options.additional_args, options.additional_args_position);
            let kwargs = compose_kwargs(&item.kwargs, &options.additional_kwargs);
            let generator = item.generators.remove(group);
            (function, args, kwargs, generator, item.run_generator)
        };

        if let Some(mut generator) = generator {
            let step = generator.resume(Resume::Send {
                args: &args,
                kwargs: &kwargs,
            })?;
            return Ok(match step {
                Step::Yielded(value) => {
                    self.store_generator(id, group, generator);
                    Invoked { value, exhausted: false }
                }
                Step::Complete => Invoked {
                    value: Value::Null,
                    exhausted: true,
                },
            });
        }

        match function.call(&args, &kwargs)? {
            Outcome::Value(value) => Ok(Invoked { value, exhausted: false }),
            Outcome::Generator(mut generator) => {
                if let Some(item) = self.state.borrow_mut().items.get_mut(&id) {
                    item.is_generator = true;
                }
                if !run_generator {
                    return Ok(Invoked {
                        value: Value::Null,
                        exhausted: false,
                    });
                }
                match generator.resume(Resume::Start)? {
                    Step::Yielded(value) => {
                        self.store_generator(id, group, generator);
                        Ok(Invoked { value, exhausted: false })
                    }
                    Step::Complete => Ok(Invoked {
                        value: Value::Null,
                        exhausted: true,
                    }),
                }
            }
        }
    }

    /// Put a coroutine back unless the command left the group meanwhile.
    fn store_generator(&self, id: CommandId, group: &str, generator: Box<dyn Coroutine>) {
        let mut state = self.state.borrow_mut();
        if let Some(item) = state.items.get_mut(&id) {
            if item.groups.contains(group) {
                item.generators.insert(group.to_string(), generator);
            }
        }
    }

    fn invoke_with_foreach(
        &self,
        id: CommandId,
        group: &str,
        options: &InvokeOptions,
    ) -> Result<(), InvokerError> {
        let mut wrappers = self.start_foreach_wrappers(group, options)?;
        advance_wrappers(&mut wrappers, Resume::Start)?;

        while !wrappers.is_empty() {
            if !self.has_command(id, Groups::only([group])) {
                return Ok(());
            }
            let invoked = self.invoke_function(id, group, options)?;
            advance_wrappers(&mut wrappers, Resume::Result(&invoked.value))?;

            if invoked.exhausted {
                self.state.borrow_mut().remove_from_group(id, group);
                debug!(target: "batcher::invoker", id, group, "generator exhausted, removed from group");
                return Ok(());
            }
        }
        Ok(())
    }

    fn start_foreach_wrappers(
        &self,
        group: &str,
        options: &InvokeOptions,
    ) -> Result<Vec<Box<dyn Coroutine>>, InvokerError> {
        let foreach: Vec<(ForeachFunction, Vec<Value>, Kwargs)> = {
            let state = self.state.borrow();
            let ids = state.group(group).map(|g| g.foreach.clone()).unwrap_or_default();
            ids.iter()
                .filter_map(|fid| state.items.get(fid))
                .filter_map(|item| match &item.command {
                    Command::Foreach(f) => Some((
                        f.clone(),
                        compose_args(&item.args, &options.additional_args, options.additional_args_position),
                        compose_kwargs(&item.kwargs, &options.additional_kwargs),
                    )),
                    _ => None,
                })
                .collect()
        };

        let mut wrappers: Vec<Box<dyn Coroutine>> = Vec::with_capacity(foreach.len());
        for (function, args, kwargs) in foreach {
            match function {
                ForeachFunction::After(function) => wrappers.push(Box::new(AfterEach {
                    function,
                    args,
                    kwargs,
                })),
                ForeachFunction::Wrapper(function) => {
                    // a wrapper that returns a plain value has already run to completion
                    if let Outcome::Generator(generator) = function.call(&args, &kwargs)? {
                        wrappers.push(generator);
                    }
                }
            }
        }
        Ok(wrappers)
    }

    /// True if the same command (by identity and kind) is in at least one of
    /// `groups`.
    pub fn contains(&self, command: &Command, groups: impl Into<Groups>) -> bool {
        !self.find_in(command, &groups.into(), true).is_empty()
    }

    /// IDs of every entry of `command` in the existing groups among `groups`.
    pub fn find(&self, command: &Command, groups: impl Into<Groups>) -> Vec<CommandId> {
        self.find_in(command, &groups.into(), false)
    }

    fn find_in(&self, command: &Command, groups: &Groups, first_only: bool) -> Vec<CommandId> {
        let state = self.state.borrow();
        let foreach = command.is_foreach();
        let mut found = Vec::new();
        for name in state.resolve(groups) {
            let Some(group) = state.group(&name) else {
                continue;
            };
            for id in group.list(foreach) {
                let matches = state
                    .items
                    .get(id)
                    .is_some_and(|item| item.command.same_as(command));
                if matches {
                    found.push(*id);
                    if first_only {
                        return found;
                    }
                }
            }
        }
        found
    }

    /// True if the command is in at least one of `groups`.
    pub fn has_command(&self, id: CommandId, groups: impl Into<Groups>) -> bool {
        let state = self.state.borrow();
        let Some(item) = state.items.get(&id) else {
            return false;
        };
        state
            .resolve(&groups.into())
            .iter()
            .any(|g| item.groups.contains(g))
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.state.borrow().group(group).is_some()
    }

    pub fn get_command(&self, id: CommandId) -> Option<Command> {
        self.state.borrow().items.get(&id).map(|item| item.command.clone())
    }

    /// Whether the command's function turned out to produce a coroutine.
    pub fn is_generator(&self, id: CommandId) -> bool {
        self.state.borrow().items.get(&id).is_some_and(|item| item.is_generator)
    }

    /// Position of the command within `group` (default group if `None`).
    pub fn get_position(&self, id: CommandId, group: Option<&str>) -> Result<usize, InvokerError> {
        let group = group.unwrap_or(DEFAULT_GROUP);
        let state = self.state.borrow();
        let item = state.items.get(&id).ok_or(InvokerError::UnknownCommand(id))?;
        let not_in_group = || InvokerError::NotInGroup {
            id,
            group: group.to_string(),
        };
        if !item.groups.contains(group) {
            return Err(not_in_group());
        }
        state
            .group(group)
            .and_then(|g| g.list(item.command.is_foreach()).iter().position(|&x| x == id))
            .ok_or_else(not_in_group)
    }

    /// Commands of `group` in invocation order, or `None` if the group does
    /// not exist.
    pub fn list_commands(&self, group: Option<&str>, foreach: bool) -> Option<Vec<Command>> {
        let state = self.state.borrow();
        let group = state.group(group.unwrap_or(DEFAULT_GROUP))?;
        Some(
            group
                .list(foreach)
                .iter()
                .filter_map(|id| state.items.get(id).map(|item| item.command.clone()))
                .collect(),
        )
    }

    pub fn list_groups(&self, include_empty: bool) -> Vec<String> {
        let state = self.state.borrow();
        state
            .groups
            .iter()
            .filter(|g| include_empty || !g.commands.is_empty() || !g.foreach.is_empty())
            .map(|g| g.name.clone())
            .collect()
    }

    /// Move a command within one group.
    ///
    /// `0` moves it first. Negative positions count from the end inclusively:
    /// `-1` is the last position, `-2` second to last. Positions past the
    /// end clamp to the end.
    pub fn reorder(&self, id: CommandId, position: isize, group: Option<&str>) -> Result<(), InvokerError> {
        let group = group.unwrap_or(DEFAULT_GROUP);
        let mut state = self.state.borrow_mut();
        let item = state.items.get(&id).ok_or(InvokerError::UnknownCommand(id))?;
        let foreach = item.command.is_foreach();
        let in_group = item.groups.contains(group);

        let list = match state.group_mut(group) {
            Some(g) => g.list_mut(foreach),
            None => return Err(InvokerError::UnknownGroup(group.to_string())),
        };
        if !in_group {
            return Err(InvokerError::NotInGroup {
                id,
                group: group.to_string(),
            });
        }
        list.retain(|&x| x != id);
        list.insert(reorder_index(list.len(), position), id);
        Ok(())
    }

    /// Remove a command from each of `groups`. Once it is in no group, its ID
    /// is forgotten.
    ///
    /// `ignore_if_not_exists` only covers an unknown ID; a named group that
    /// does not exist is always an error.
    pub fn remove(
        &self,
        id: CommandId,
        groups: impl Into<Groups>,
        ignore_if_not_exists: bool,
    ) -> Result<(), InvokerError> {
        let mut state = self.state.borrow_mut();
        if !state.items.contains_key(&id) {
            return if ignore_if_not_exists {
                Ok(())
            } else {
                Err(InvokerError::UnknownCommand(id))
            };
        }

        for group in state.resolve(&groups.into()) {
            if state.group(&group).is_none() {
                return Err(InvokerError::UnknownGroup(group));
            }
            let member = state.items.get(&id).is_some_and(|item| item.groups.contains(&group));
            if member {
                state.remove_from_group(id, &group);
                if !state.items.contains_key(&id) {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Delete whole groups, including their for-each commands. Groups that
    /// do not exist are skipped.
    pub fn remove_groups(&self, groups: impl Into<Groups>) {
        let mut state = self.state.borrow_mut();
        for name in state.resolve(&groups.into()) {
            let ids: Vec<CommandId> = match state.group(&name) {
                Some(g) => g.commands.iter().chain(g.foreach.iter()).copied().collect(),
                None => continue,
            };
            for id in ids {
                state.remove_from_group(id, &name);
            }
            state.groups.retain(|g| g.name != name);
        }
    }
}

/// Insertion index for [`Invoker::reorder`] after the command was taken out
/// of a list now `len` long.
pub(crate) fn reorder_index(len: usize, position: isize) -> usize {
    if position < 0 {
        (len as isize + position + 1).max(0) as usize
    } else {
        (position as usize).min(len)
    }
}

fn advance_wrappers(wrappers: &mut Vec<Box<dyn Coroutine>>, input: Resume<'_>) -> Result<(), CommandError> {
    let mut alive = Vec::with_capacity(wrappers.len());
    for mut wrapper in wrappers.drain(..) {
        if let Step::Yielded(_) = wrapper.resume(input)? {
            alive.push(wrapper);
        }
    }
    *wrappers = alive;
    Ok(())
}
