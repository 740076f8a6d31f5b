//! Command registry: the user-configured pipeline of actions and conditions.
//!
//! A [`CommandGroup`] is an ordered list of [`Command`] records, one registry
//! for actions and one for conditions. Commands are added from descriptors
//! ([`CommandDict`]), from procedure names looked up in a
//! [`ProcedureDatabase`], or as already-built records. Names are made unique
//! within a registry (`rename`, `rename_2`, …), and so are display names
//! (`Rename`, `Rename (2)`, …).
//!
//! ## Events
//!
//! Every mutation fires events to handlers connected with
//! [`CommandGroup::connect_event`], synchronously and in connection order:
//!
//! | Event | Payload |
//! |-------|---------|
//! | `before-add-command` | descriptor or record about to be added |
//! | `after-add-command` | added command, original descriptor (`None` for records and loads) |
//! | `before-reorder-command` | command, old position |
//! | `after-reorder-command` | command, old position, requested position |
//! | `before-remove-command` | command |
//! | `after-remove-command` | name of the removed command |
//! | `before-clear-commands` | |
//! | `after-clear-commands` | |
//!
//! ## Persistence
//!
//! Registries save to and load from JSON. Loading replaces the contents:
//! it clears without re-adding initial commands, then fires
//! `after-add-command` with no descriptor for each loaded command.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

use crate::invoker::{Kwargs, reorder_index};
use crate::pdb::{ProcedureDatabase, RUN_MODE_TYPE, command_dict_from_procedure};
use crate::uniquify::{uniquify_display_name, uniquify_name};

pub const DEFAULT_ACTIONS_GROUP: &str = "default_actions";
pub const DEFAULT_CONDITIONS_GROUP: &str = "default_conditions";

/// Tag for arguments shown only when "more options" is expanded.
pub const MORE_OPTIONS_TAG: &str = "more_options";

const VALID_TYPES: &[&str] = &["action", "condition"];

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("missing required field: \"{0}\"")]
    MissingField(&'static str),
    #[error("invalid type \"{given}\"; valid values: {valid:?}")]
    InvalidType { given: String, valid: &'static [&'static str] },
    #[error("field \"{field}\" is not valid for type \"{kind}\"")]
    InvalidField { field: &'static str, kind: CommandKind },
    #[error("\"{0}\" is not a valid procedure name")]
    InvalidSource(String),
    #[error("command \"{name}\" not found in command group \"{group}\"")]
    UnknownCommand { name: String, group: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    #[default]
    #[serde(alias = "procedure")]
    Action,
    #[serde(alias = "constraint")]
    Condition,
}

impl CommandKind {
    /// Parse a descriptor `type`, accepting the `procedure`/`constraint` aliases.
    pub fn parse(type_name: &str) -> Result<Self, RegistryError> {
        match type_name {
            "action" | "procedure" => Ok(CommandKind::Action),
            "condition" | "constraint" => Ok(CommandKind::Condition),
            other => Err(RegistryError::InvalidType {
                given: other.to_string(),
                valid: VALID_TYPES,
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Action => "action",
            CommandKind::Condition => "condition",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a command's function comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Implemented in this crate; resolved by `orig_name` at run time.
    #[default]
    Builtin,
    GimpPdb,
    Gegl,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Builtin => "builtin",
            Origin::GimpPdb => "gimp_pdb",
            Origin::Gegl => "gegl",
        }
    }

    pub fn is_procedure(self) -> bool {
        self != Origin::Builtin
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    /// Free-form type name such as `string`, `bool`, `int`, `enum:RunMode`.
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: Value,
    #[serde(default)]
    pub default_value: Value,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoreOptions {
    pub enabled_for_previews: bool,
    /// Conditions only: the item's parent folders must satisfy the
    /// condition too.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub also_apply_to_parent_folders: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: CommandKind,
    /// Procedure name for procedure origins; empty for built-ins.
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub arguments: Vec<Argument>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub menu_path: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub command_groups: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub display_options_on_create: bool,
    pub more_options: MoreOptions,
    #[serde(default)]
    pub more_options_expanded: bool,
    pub orig_name: String,
}

impl Command {
    pub fn argument(&self, name: &str) -> Option<&Argument> {
        self.arguments.iter().find(|a| a.name == name)
    }

    /// Set an argument's value. Returns false if there is no such argument.
    pub fn set_argument(&mut self, name: &str, value: impl Into<Value>) -> bool {
        match self.arguments.iter_mut().find(|a| a.name == name) {
            Some(arg) => {
                arg.value = value.into();
                true
            }
            None => false,
        }
    }

    /// Argument values keyed by argument name.
    pub fn kwargs(&self) -> Kwargs {
        self.arguments
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect()
    }

    pub fn enabled_for_previews(&self) -> bool {
        self.more_options.enabled_for_previews
    }

    pub fn also_apply_to_parent_folders(&self) -> bool {
        self.more_options.also_apply_to_parent_folders.unwrap_or(false)
    }

    /// Display name, or the name when there is none.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Descriptors
// ============================================================================

/// Describes one argument of a command to be created.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArgumentDict {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Starts as `default_value` when omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
}

impl ArgumentDict {
    pub fn new(name: &str, type_name: &str, default_value: impl Into<Value>) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            default_value: Some(default_value.into()),
            ..Default::default()
        }
    }

    fn into_argument(self) -> Argument {
        let default_value = self.default_value.unwrap_or(Value::Null);
        Argument {
            value: self.value.unwrap_or_else(|| default_value.clone()),
            name: self.name,
            type_name: if self.type_name.is_empty() {
                "string".to_string()
            } else {
                self.type_name
            },
            default_value,
            display_name: self.display_name,
            tags: self.tags,
            visible: self.visible.unwrap_or(true),
        }
    }
}

/// Describes a command to be created. Only `name` is required.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandDict {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `action` (default) or `condition`; `procedure` and `constraint` are
    /// accepted as aliases.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<ArgumentDict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub menu_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Defaults to `default_actions` or `default_conditions` by kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_groups: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_options_on_create: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub more_options_expanded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_for_previews: Option<bool>,
    /// Conditions only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub also_apply_to_parent_folders: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orig_name: Option<String>,
}

impl CommandDict {
    pub fn new(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn condition(name: &str) -> Self {
        Self {
            kind: Some("condition".to_string()),
            ..Self::new(name)
        }
    }
}

/// Create a command record from a descriptor without adding it anywhere.
pub fn create_command(dict: &CommandDict) -> Result<Command, RegistryError> {
    let name = dict.name.clone().ok_or(RegistryError::MissingField("name"))?;
    let kind = match dict.kind.as_deref() {
        Some(type_name) => CommandKind::parse(type_name)?,
        None => CommandKind::default(),
    };
    if kind == CommandKind::Action && dict.also_apply_to_parent_folders.is_some() {
        return Err(RegistryError::InvalidField {
            field: "also_apply_to_parent_folders",
            kind,
        });
    }

    let default_group = match kind {
        CommandKind::Action => DEFAULT_ACTIONS_GROUP,
        CommandKind::Condition => DEFAULT_CONDITIONS_GROUP,
    };
    let mut tags = vec!["command".to_string(), kind.as_str().to_string()];
    tags.extend(dict.additional_tags.iter().cloned());

    let mut command = Command {
        orig_name: dict.orig_name.clone().unwrap_or_else(|| name.clone()),
        name,
        kind,
        function: dict.function.clone().unwrap_or_default(),
        origin: dict.origin.unwrap_or_default(),
        arguments: dict.arguments.iter().cloned().map(ArgumentDict::into_argument).collect(),
        enabled: dict.enabled.unwrap_or(true),
        display_name: dict.display_name.clone(),
        menu_path: dict.menu_path.clone(),
        description: dict.description.clone(),
        command_groups: Some(
            dict.command_groups
                .clone()
                .unwrap_or_else(|| vec![default_group.to_string()]),
        ),
        tags,
        display_options_on_create: dict.display_options_on_create.unwrap_or(false),
        more_options: MoreOptions {
            enabled_for_previews: dict.enabled_for_previews.unwrap_or(true),
            also_apply_to_parent_folders: match kind {
                CommandKind::Condition => Some(dict.also_apply_to_parent_folders.unwrap_or(false)),
                CommandKind::Action => None,
            },
        },
        more_options_expanded: dict.more_options_expanded.unwrap_or(false),
    };
    set_up_post_creation(&mut command);
    Ok(command)
}

/// Hide the run-mode argument procedures take first; the batcher always
/// runs them non-interactively.
fn set_up_post_creation(command: &mut Command) {
    if command.origin != Origin::GimpPdb {
        return;
    }
    if let Some(first) = command.arguments.first_mut() {
        if first.type_name == RUN_MODE_TYPE {
            first.visible = false;
        }
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    BeforeAdd,
    AfterAdd,
    BeforeReorder,
    AfterReorder,
    BeforeRemove,
    AfterRemove,
    BeforeClear,
    AfterClear,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            EventKind::BeforeAdd => "before-add-command",
            EventKind::AfterAdd => "after-add-command",
            EventKind::BeforeReorder => "before-reorder-command",
            EventKind::AfterReorder => "after-reorder-command",
            EventKind::BeforeRemove => "before-remove-command",
            EventKind::AfterRemove => "after-remove-command",
            EventKind::BeforeClear => "before-clear-commands",
            EventKind::AfterClear => "after-clear-commands",
        }
    }
}

/// What is about to be added.
#[derive(Debug)]
pub enum AddSubject<'a> {
    Dict(&'a CommandDict),
    Command(&'a Command),
}

#[derive(Debug)]
pub enum CommandEvent<'a> {
    BeforeAdd(AddSubject<'a>),
    AfterAdd {
        command: &'a Command,
        orig: Option<&'a CommandDict>,
    },
    BeforeReorder {
        command: &'a Command,
        position: usize,
    },
    AfterReorder {
        command: &'a Command,
        old: usize,
        new: isize,
    },
    BeforeRemove {
        command: &'a Command,
    },
    AfterRemove {
        name: &'a str,
    },
    BeforeClear,
    AfterClear,
}

impl CommandEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            CommandEvent::BeforeAdd(_) => EventKind::BeforeAdd,
            CommandEvent::AfterAdd { .. } => EventKind::AfterAdd,
            CommandEvent::BeforeReorder { .. } => EventKind::BeforeReorder,
            CommandEvent::AfterReorder { .. } => EventKind::AfterReorder,
            CommandEvent::BeforeRemove { .. } => EventKind::BeforeRemove,
            CommandEvent::AfterRemove { .. } => EventKind::AfterRemove,
            CommandEvent::BeforeClear => EventKind::BeforeClear,
            CommandEvent::AfterClear => EventKind::AfterClear,
        }
    }
}

pub type EventHandler = Rc<dyn Fn(&CommandGroup, &CommandEvent<'_>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

// ============================================================================
// Registry
// ============================================================================

/// Input to [`CommandGroup::add`].
pub enum AddSource {
    Dict(CommandDict),
    /// A procedure name, looked up in the registry's procedure database.
    ProcedureName(String),
    Command(Command),
}

impl From<CommandDict> for AddSource {
    fn from(dict: CommandDict) -> Self {
        AddSource::Dict(dict)
    }
}

impl From<Command> for AddSource {
    fn from(command: Command) -> Self {
        AddSource::Command(command)
    }
}

impl From<&str> for AddSource {
    fn from(name: &str) -> Self {
        AddSource::ProcedureName(name.to_string())
    }
}

pub struct CommandGroup {
    name: String,
    commands: Vec<Command>,
    initial_commands: Vec<CommandDict>,
    handlers: Vec<(HandlerId, EventKind, EventHandler)>,
    next_handler_id: usize,
    procedures: Option<Rc<dyn ProcedureDatabase>>,
}

impl fmt::Debug for CommandGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandGroup")
            .field("name", &self.name)
            .field("commands", &self.commands)
            .finish()
    }
}

impl CommandGroup {
    /// Create a registry holding `initial_commands`. [`clear`](Self::clear)
    /// restores them.
    pub fn create(name: &str, initial_commands: Vec<CommandDict>) -> Result<Self, RegistryError> {
        let mut group = Self {
            name: name.to_string(),
            commands: Vec::new(),
            initial_commands,
            handlers: Vec::new(),
            next_handler_id: 0,
            procedures: None,
        };
        group.add_initial_commands()?;
        Ok(group)
    }

    /// Database used to resolve [`AddSource::ProcedureName`].
    pub fn set_procedure_database(&mut self, procedures: Rc<dyn ProcedureDatabase>) {
        self.procedures = Some(procedures);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn add_initial_commands(&mut self) -> Result<(), RegistryError> {
        for dict in self.initial_commands.clone() {
            self.add(AddSource::Dict(dict))?;
        }
        Ok(())
    }

    pub fn add(&mut self, source: impl Into<AddSource>) -> Result<&Command, RegistryError> {
        match source.into() {
            AddSource::Dict(dict) => self.add_dict(dict),
            AddSource::ProcedureName(name) => {
                let procedure = self
                    .procedures
                    .as_ref()
                    .and_then(|db| db.lookup(&name))
                    .ok_or(RegistryError::InvalidSource(name))?;
                self.add_dict(command_dict_from_procedure(&procedure))
            }
            AddSource::Command(command) => self.add_command(command),
        }
    }

    fn add_dict(&mut self, mut dict: CommandDict) -> Result<&Command, RegistryError> {
        let name = dict.name.clone().ok_or(RegistryError::MissingField("name"))?;
        if dict.orig_name.is_none() {
            dict.orig_name = Some(name.clone());
        }
        let orig = dict.clone();
        self.emit(&CommandEvent::BeforeAdd(AddSubject::Dict(&orig)));

        dict.name = Some(self.unique_name(&name));
        if let Some(display_name) = &dict.display_name {
            dict.display_name = Some(self.unique_display_name(display_name));
        }
        let command = create_command(&dict)?;
        debug!(target: "batcher::commands", group = %self.name, command = %command.name, "added command");
        self.commands.push(command);

        let this: &CommandGroup = self;
        let added = &this.commands[this.commands.len() - 1];
        this.emit(&CommandEvent::AfterAdd {
            command: added,
            orig: Some(&orig),
        });
        Ok(added)
    }

    fn add_command(&mut self, mut command: Command) -> Result<&Command, RegistryError> {
        self.emit(&CommandEvent::BeforeAdd(AddSubject::Command(&command)));

        command.name = self.unique_name(&command.name);
        if let Some(display_name) = &command.display_name {
            command.display_name = Some(self.unique_display_name(display_name));
        }
        debug!(target: "batcher::commands", group = %self.name, command = %command.name, "added command");
        self.commands.push(command);

        let this: &CommandGroup = self;
        let added = &this.commands[this.commands.len() - 1];
        this.emit(&CommandEvent::AfterAdd {
            command: added,
            orig: None,
        });
        Ok(added)
    }

    fn unique_name(&self, name: &str) -> String {
        uniquify_name(name, self.commands.iter().map(|c| c.name.as_str()))
    }

    fn unique_display_name(&self, display_name: &str) -> String {
        uniquify_display_name(
            display_name,
            self.commands.iter().filter_map(|c| c.display_name.as_deref()),
        )
    }

    /// Move a command to `position`. Negative positions count from the end:
    /// `-1` is last, `-2` second to last.
    pub fn reorder(&mut self, name: &str, position: isize) -> Result<(), RegistryError> {
        let old = self.index_or_err(name)?;
        self.emit(&CommandEvent::BeforeReorder {
            command: &self.commands[old],
            position: old,
        });

        let command = self.commands.remove(old);
        let new = reorder_index(self.commands.len(), position);
        self.commands.insert(new, command);
        debug!(target: "batcher::commands", group = %self.name, command = name, old, new, "reordered command");

        self.emit(&CommandEvent::AfterReorder {
            command: &self.commands[new],
            old,
            new: position,
        });
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Command, RegistryError> {
        let index = self.index_or_err(name)?;
        self.emit(&CommandEvent::BeforeRemove {
            command: &self.commands[index],
        });

        let removed = self.commands.remove(index);
        debug!(target: "batcher::commands", group = %self.name, command = name, "removed command");

        self.emit(&CommandEvent::AfterRemove { name: &removed.name });
        Ok(removed)
    }

    pub fn get_index(&self, name: &str) -> Option<usize> {
        self.commands.iter().position(|c| c.name == name)
    }

    fn index_or_err(&self, name: &str) -> Result<usize, RegistryError> {
        self.get_index(name).ok_or_else(|| RegistryError::UnknownCommand {
            name: name.to_string(),
            group: self.name.clone(),
        })
    }

    /// Remove every command, then re-add the initial ones if asked.
    pub fn clear(&mut self, add_initial_commands: bool) -> Result<(), RegistryError> {
        self.emit(&CommandEvent::BeforeClear);
        self.commands.clear();
        if add_initial_commands {
            self.add_initial_commands()?;
        }
        debug!(target: "batcher::commands", group = %self.name, "cleared commands");
        self.emit(&CommandEvent::AfterClear);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Command> {
        self.commands.iter_mut().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.commands.iter().map(|c| c.name.as_str()).collect()
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub fn connect_event<F>(&mut self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&CommandGroup, &CommandEvent<'_>) + 'static,
    {
        let id = HandlerId(self.next_handler_id);
        self.next_handler_id += 1;
        self.handlers.push((id, kind, Rc::new(handler)));
        id
    }

    /// Returns false if no handler had this ID.
    pub fn disconnect_event(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(handler_id, _, _)| *handler_id != id);
        self.handlers.len() != before
    }

    fn emit(&self, event: &CommandEvent<'_>) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .handlers
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| Rc::clone(h))
            .collect();
        for handler in handlers {
            handler(self, event);
        }
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    pub fn to_json(&self) -> Result<String, RegistryError> {
        Ok(serde_json::to_string_pretty(&self.commands)?)
    }

    /// Replace the contents with commands parsed from `json`. On a parse
    /// error the registry is left untouched.
    pub fn load_from_str(&mut self, json: &str) -> Result<(), RegistryError> {
        let commands: Vec<Command> = serde_json::from_str(json)?;
        self.load_commands(commands)
    }

    fn load_commands(&mut self, commands: Vec<Command>) -> Result<(), RegistryError> {
        self.clear(false)?;
        self.commands = commands;
        for command in &mut self.commands {
            set_up_post_creation(command);
        }
        for command in &self.commands {
            self.emit(&CommandEvent::AfterAdd { command, orig: None });
        }
        debug!(target: "batcher::commands", group = %self.name, count = self.commands.len(), "loaded commands");
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), RegistryError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(&mut self, path: &Path) -> Result<(), RegistryError> {
        let json = std::fs::read_to_string(path)?;
        self.load_from_str(&json)
    }
}

// ============================================================================
// Pipelines
// ============================================================================

/// An action registry and a condition registry saved together.
#[derive(Debug, Serialize, Deserialize)]
struct PipelineFile {
    #[serde(default)]
    actions: Vec<Command>,
    #[serde(default)]
    conditions: Vec<Command>,
}

pub fn pipeline_to_json(actions: &CommandGroup, conditions: &CommandGroup) -> Result<String, RegistryError> {
    let file = PipelineFile {
        actions: actions.commands.clone(),
        conditions: conditions.commands.clone(),
    };
    Ok(serde_json::to_string_pretty(&file)?)
}

pub fn save_pipeline(path: &Path, actions: &CommandGroup, conditions: &CommandGroup) -> Result<(), RegistryError> {
    std::fs::write(path, pipeline_to_json(actions, conditions)?)?;
    Ok(())
}

/// Load both registries from a pipeline file, replacing their contents.
pub fn load_pipeline(path: &Path, actions: &mut CommandGroup, conditions: &mut CommandGroup) -> Result<(), RegistryError> {
    let json = std::fs::read_to_string(path)?;
    let file: PipelineFile = serde_json::from_str(&json)?;
    actions.load_commands(file.actions)?;
    conditions.load_commands(file.conditions)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdb::{InMemoryProcedureDatabase, Procedure, ProcedureArgument, ProcedureKind};
    use serde_json::json;
    use std::cell::RefCell;
    use tempfile::TempDir;

    fn rename_dict() -> CommandDict {
        CommandDict {
            display_name: Some("Rename".into()),
            arguments: vec![ArgumentDict::new("pattern", "string", "[image name]")],
            ..CommandDict::new("rename")
        }
    }

    fn autocrop_dict() -> CommandDict {
        CommandDict {
            display_name: Some("Autocrop".into()),
            ..CommandDict::new("autocrop")
        }
    }

    fn record_events(group: &mut CommandGroup) -> Rc<RefCell<Vec<String>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        for kind in [
            EventKind::BeforeAdd,
            EventKind::AfterAdd,
            EventKind::BeforeReorder,
            EventKind::AfterReorder,
            EventKind::BeforeRemove,
            EventKind::AfterRemove,
            EventKind::BeforeClear,
            EventKind::AfterClear,
        ] {
            let log = Rc::clone(&log);
            group.connect_event(kind, move |_, event| log.borrow_mut().push(event.kind().name().to_string()));
        }
        log
    }

    // =========================================================================
    // create_command
    // =========================================================================

    #[test]
    fn action_defaults() {
        let command = create_command(&rename_dict()).unwrap();
        assert_eq!(command.kind, CommandKind::Action);
        assert_eq!(command.origin, Origin::Builtin);
        assert_eq!(command.orig_name, "rename");
        assert_eq!(command.command_groups, Some(vec![DEFAULT_ACTIONS_GROUP.to_string()]));
        assert_eq!(command.tags, vec!["command", "action"]);
        assert!(command.enabled);
        assert!(command.enabled_for_previews());
        assert_eq!(command.more_options.also_apply_to_parent_folders, None);
        assert_eq!(command.argument("pattern").unwrap().value, json!("[image name]"));
    }

    #[test]
    fn condition_defaults() {
        let command = create_command(&CommandDict {
            additional_tags: vec!["extra".into()],
            ..CommandDict::condition("top_level")
        })
        .unwrap();
        assert_eq!(command.kind, CommandKind::Condition);
        assert_eq!(command.command_groups, Some(vec![DEFAULT_CONDITIONS_GROUP.to_string()]));
        assert_eq!(command.tags, vec!["command", "condition", "extra"]);
        assert_eq!(command.more_options.also_apply_to_parent_folders, Some(false));
    }

    #[test]
    fn type_aliases() {
        let procedure = create_command(&CommandDict {
            kind: Some("procedure".into()),
            ..CommandDict::new("a")
        })
        .unwrap();
        let constraint = create_command(&CommandDict {
            kind: Some("constraint".into()),
            ..CommandDict::new("b")
        })
        .unwrap();
        assert_eq!(procedure.kind, CommandKind::Action);
        assert_eq!(constraint.kind, CommandKind::Condition);
    }

    #[test]
    fn invalid_type_lists_valid_ones() {
        let err = create_command(&CommandDict {
            kind: Some("filter".into()),
            ..CommandDict::new("a")
        })
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid type \"filter\"; valid values: [\"action\", \"condition\"]"
        );
    }

    #[test]
    fn parent_folders_flag_rejected_for_actions() {
        let result = create_command(&CommandDict {
            also_apply_to_parent_folders: Some(true),
            ..CommandDict::new("a")
        });
        assert!(matches!(result, Err(RegistryError::InvalidField { .. })));
    }

    #[test]
    fn explicit_value_wins_over_default() {
        let command = create_command(&CommandDict {
            arguments: vec![ArgumentDict {
                value: Some(json!("x")),
                ..ArgumentDict::new("pattern", "string", "[image name]")
            }],
            ..CommandDict::new("rename")
        })
        .unwrap();
        let arg = command.argument("pattern").unwrap();
        assert_eq!(arg.value, json!("x"));
        assert_eq!(arg.default_value, json!("[image name]"));
    }

    #[test]
    fn run_mode_argument_hidden_for_pdb_commands() {
        let command = create_command(&CommandDict {
            origin: Some(Origin::GimpPdb),
            arguments: vec![
                ArgumentDict::new("run-mode", RUN_MODE_TYPE, "NONINTERACTIVE"),
                ArgumentDict::new("radius", "double", 1.0),
            ],
            ..CommandDict::new("plug-in-blur")
        })
        .unwrap();
        assert!(!command.arguments[0].visible);
        assert!(command.arguments[1].visible);
    }

    // =========================================================================
    // add
    // =========================================================================

    #[test]
    fn names_and_display_names_are_uniquified() {
        let mut group = CommandGroup::create("actions", vec![]).unwrap();
        group.add(rename_dict()).unwrap();
        group.add(rename_dict()).unwrap();
        let third = group.add(rename_dict()).unwrap();
        assert_eq!(third.name, "rename_3");
        assert_eq!(third.display_name.as_deref(), Some("Rename (3)"));
        assert_eq!(third.orig_name, "rename");
        assert_eq!(group.names(), vec!["rename", "rename_2", "rename_3"]);
    }

    #[test]
    fn same_descriptor_added_three_times() {
        let mut group = CommandGroup::create("procedures", vec![]).unwrap();
        for _ in 0..3 {
            group.add(autocrop_dict()).unwrap();
        }

        assert_eq!(group.names(), vec!["autocrop", "autocrop_2", "autocrop_3"]);
        let display_names: Vec<Option<&str>> = group.iter().map(|c| c.display_name.as_deref()).collect();
        assert_eq!(
            display_names,
            vec![Some("Autocrop"), Some("Autocrop (2)"), Some("Autocrop (3)")]
        );
        assert!(group.iter().all(|c| c.orig_name == "autocrop"));
    }

    #[test]
    fn missing_display_name_stays_missing() {
        let mut group = CommandGroup::create("actions", vec![]).unwrap();
        group.add(CommandDict::new("a")).unwrap();
        let second = group.add(CommandDict::new("a")).unwrap();
        assert_eq!(second.display_name, None);
        assert_eq!(second.label(), "a_2");
    }

    #[test]
    fn missing_name_is_rejected() {
        let mut group = CommandGroup::create("actions", vec![]).unwrap();
        let result = group.add(CommandDict::default());
        assert!(matches!(result, Err(RegistryError::MissingField("name"))));
    }

    #[test]
    fn before_add_gets_descriptor_and_after_add_gets_original() {
        let mut group = CommandGroup::create("actions", vec![]).unwrap();
        group.add(rename_dict()).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_before = Rc::clone(&seen);
        group.connect_event(EventKind::BeforeAdd, move |_, event| {
            if let CommandEvent::BeforeAdd(AddSubject::Dict(dict)) = event {
                seen_before.borrow_mut().push(format!("before {}", dict.name.as_deref().unwrap_or("")));
            }
        });
        let seen_after = Rc::clone(&seen);
        group.connect_event(EventKind::AfterAdd, move |registry, event| {
            if let CommandEvent::AfterAdd { command, orig } = event {
                let orig = orig.and_then(|d| d.name.as_deref()).unwrap_or("-");
                seen_after
                    .borrow_mut()
                    .push(format!("after {} from {} ({})", command.name, orig, registry.len()));
            }
        });

        group.add(rename_dict()).unwrap();
        assert_eq!(*seen.borrow(), vec!["before rename", "after rename_2 from rename (2)"]);
    }

    #[test]
    fn add_existing_command_record() {
        let mut group = CommandGroup::create("actions", vec![rename_dict()]).unwrap();
        let orig_seen = Rc::new(RefCell::new(None));
        let orig_in = Rc::clone(&orig_seen);
        group.connect_event(EventKind::AfterAdd, move |_, event| {
            if let CommandEvent::AfterAdd { orig, .. } = event {
                *orig_in.borrow_mut() = Some(orig.is_some());
            }
        });

        let record = create_command(&rename_dict()).unwrap();
        let added = group.add(record).unwrap();
        assert_eq!(added.name, "rename_2");
        assert_eq!(added.display_name.as_deref(), Some("Rename (2)"));
        assert_eq!(*orig_seen.borrow(), Some(false));
    }

    #[test]
    fn add_by_procedure_name() {
        let mut db = InMemoryProcedureDatabase::new();
        db.register(Procedure {
            name: "plug-in-autocrop".into(),
            menu_label: Some("_Autocrop Image".into()),
            blurb: Some("Remove empty borders".into()),
            kind: ProcedureKind::Gimp,
            arguments: vec![ProcedureArgument {
                name: "run-mode".into(),
                blurb: None,
                type_name: RUN_MODE_TYPE.into(),
                default_value: None,
            }],
        });
        let mut group = CommandGroup::create("actions", vec![]).unwrap();
        group.set_procedure_database(Rc::new(db));

        let added = group.add("plug-in-autocrop").unwrap();
        assert_eq!(added.origin, Origin::GimpPdb);
        assert_eq!(added.function, "plug-in-autocrop");
        assert_eq!(added.display_name.as_deref(), Some("Autocrop Image"));
        assert!(!added.arguments[0].visible);

        let err = group.add("plug-in-missing").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSource(name) if name == "plug-in-missing"));
    }

    // =========================================================================
    // reorder / remove / clear
    // =========================================================================

    fn abc() -> CommandGroup {
        let mut group = CommandGroup::create("actions", vec![]).unwrap();
        for name in ["a", "b", "c"] {
            group.add(CommandDict::new(name)).unwrap();
        }
        group
    }

    #[test]
    fn reorder_positions() {
        let mut group = abc();
        group.reorder("c", 0).unwrap();
        assert_eq!(group.names(), vec!["c", "a", "b"]);
        group.reorder("c", -1).unwrap();
        assert_eq!(group.names(), vec!["a", "b", "c"]);
        group.reorder("a", -2).unwrap();
        assert_eq!(group.names(), vec!["b", "a", "c"]);
        group.reorder("b", 10).unwrap();
        assert_eq!(group.names(), vec!["a", "c", "b"]);
    }

    #[test]
    fn reorder_events_carry_positions() {
        let mut group = abc();
        let positions = Rc::new(RefCell::new(Vec::new()));
        let p = Rc::clone(&positions);
        group.connect_event(EventKind::AfterReorder, move |_, event| {
            if let CommandEvent::AfterReorder { command, old, new } = event {
                p.borrow_mut().push((command.name.clone(), *old, *new));
            }
        });
        group.reorder("a", -1).unwrap();
        assert_eq!(*positions.borrow(), vec![("a".to_string(), 0, -1)]);
    }

    #[test]
    fn unknown_command_errors() {
        let mut group = abc();
        assert!(matches!(group.reorder("zzz", 0), Err(RegistryError::UnknownCommand { .. })));
        assert!(matches!(group.remove("zzz"), Err(RegistryError::UnknownCommand { .. })));
        assert_eq!(group.get_index("zzz"), None);
    }

    #[test]
    fn remove_fires_events_in_order() {
        let mut group = abc();
        let log = record_events(&mut group);
        let removed = group.remove("b").unwrap();
        assert_eq!(removed.name, "b");
        assert_eq!(group.names(), vec!["a", "c"]);
        assert_eq!(*log.borrow(), vec!["before-remove-command", "after-remove-command"]);
    }

    #[test]
    fn clear_keeps_only_the_initial_autocrop() {
        let mut group = CommandGroup::create("procedures", vec![autocrop_dict()]).unwrap();
        group.add(autocrop_dict()).unwrap();
        group.add(rename_dict()).unwrap();
        assert_eq!(group.len(), 3);

        group.clear(true).unwrap();
        assert_eq!(group.names(), vec!["autocrop"]);
        assert_eq!(group.get("autocrop").and_then(|c| c.display_name.as_deref()), Some("Autocrop"));
    }

    #[test]
    fn clear_restores_initial_commands() {
        let mut group = CommandGroup::create("actions", vec![rename_dict()]).unwrap();
        group.add(CommandDict::new("extra")).unwrap();
        let log = record_events(&mut group);

        group.clear(true).unwrap();
        assert_eq!(group.names(), vec!["rename"]);
        assert_eq!(
            *log.borrow(),
            vec!["before-clear-commands", "before-add-command", "after-add-command", "after-clear-commands"]
        );

        group.clear(false).unwrap();
        assert!(group.is_empty());
    }

    #[test]
    fn disconnected_handler_stops_firing() {
        let mut group = abc();
        let count = Rc::new(RefCell::new(0));
        let c = Rc::clone(&count);
        let id = group.connect_event(EventKind::BeforeRemove, move |_, _| *c.borrow_mut() += 1);
        group.remove("a").unwrap();
        assert!(group.disconnect_event(id));
        group.remove("b").unwrap();
        assert_eq!(*count.borrow(), 1);
        assert!(!group.disconnect_event(id));
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    #[test]
    fn save_and_load_replace_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("actions.json");

        let mut source = CommandGroup::create("actions", vec![rename_dict()]).unwrap();
        source.get_mut("rename").unwrap().set_argument("pattern", "img_[001]");
        source.add(CommandDict::new("export")).unwrap();
        source.save(&path).unwrap();

        let mut target = CommandGroup::create("actions", vec![CommandDict::new("other")]).unwrap();
        let log = record_events(&mut target);
        target.load(&path).unwrap();

        assert_eq!(target.names(), vec!["rename", "export"]);
        assert_eq!(target.get("rename").unwrap().argument("pattern").unwrap().value, json!("img_[001]"));
        assert_eq!(
            *log.borrow(),
            vec!["before-clear-commands", "after-clear-commands", "after-add-command", "after-add-command"]
        );
    }

    #[test]
    fn invalid_json_leaves_registry_untouched() {
        let mut group = abc();
        assert!(group.load_from_str("{not json").is_err());
        assert_eq!(group.len(), 3);
    }

    #[test]
    fn pipeline_round_trips_both_registries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pipeline.json");
        let actions = abc();
        let conditions = CommandGroup::create("conditions", vec![CommandDict::condition("top_level")]).unwrap();
        save_pipeline(&path, &actions, &conditions).unwrap();

        let mut loaded_actions = CommandGroup::create("actions", vec![]).unwrap();
        let mut loaded_conditions = CommandGroup::create("conditions", vec![]).unwrap();
        load_pipeline(&path, &mut loaded_actions, &mut loaded_conditions).unwrap();

        assert_eq!(loaded_actions.names(), vec!["a", "b", "c"]);
        assert_eq!(loaded_conditions.get("top_level").unwrap().kind, CommandKind::Condition);
    }
}
