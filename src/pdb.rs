//! Procedure database: externally provided procedures that can be added to a
//! command registry by name and run by the batcher.
//!
//! A procedure describes itself (name, menu label, blurb, typed arguments);
//! [`command_dict_from_procedure`] turns that description into a command
//! descriptor the registry accepts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::commands::{ArgumentDict, CommandDict, MORE_OPTIONS_TAG, Origin};
use crate::invoker::{CommandError, Kwargs};
use crate::uniquify::uniquify_argument_name;

/// Type name of the run-mode argument most GIMP procedures take first.
pub const RUN_MODE_TYPE: &str = "enum:RunMode";

/// Run mode passed to procedures during batch processing.
pub const RUN_MODE_NONINTERACTIVE: &str = "NONINTERACTIVE";

/// GEGL arguments that are rarely changed and go under "more options".
const LESS_USED_GEGL_ARGUMENTS: &[&str] = &["visible-", "name-"];

/// Defaults that differ from what the procedures declare, chosen so the
/// procedure works on the current image instead of opening new ones.
const CUSTOM_DEFAULTS: &[(&str, &[(&str, bool)])] = &[
    (
        "file-pdf-export",
        &[("ignore-hidden", false), ("layers-as-pages", true), ("reverse-order", true)],
    ),
    ("plug-in-lighting", &[("new-image", false)]),
    ("plug-in-map-object", &[("new-image", false), ("new-layer", false)]),
    ("plug-in-smooth-palette", &[("show-image", false)]),
    ("script-fu-add-bevel", &[("toggle", false)]),
    ("script-fu-circuit", &[("toggle-3", false)]),
    ("script-fu-fuzzy-border", &[("toggle-3", false), ("toggle-4", false)]),
    ("script-fu-old-photo", &[("toggle-4", false)]),
    ("script-fu-round-corners", &[("toggle-3", false)]),
    ("script-fu-slide", &[("toggle", false)]),
    ("script-fu-spinning-globe", &[("toggle-3", false)]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    #[default]
    Gimp,
    Gegl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureArgument {
    pub name: String,
    #[serde(default)]
    pub blurb: Option<String>,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub name: String,
    #[serde(default)]
    pub menu_label: Option<String>,
    #[serde(default)]
    pub blurb: Option<String>,
    #[serde(default)]
    pub kind: ProcedureKind,
    #[serde(default)]
    pub arguments: Vec<ProcedureArgument>,
}

pub trait ProcedureDatabase {
    fn lookup(&self, name: &str) -> Option<Procedure>;

    fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Run a procedure with arguments passed by name.
    fn run(&self, name: &str, kwargs: &Kwargs) -> Result<Value, CommandError>;
}

type RunFn = Rc<dyn Fn(&Kwargs) -> Result<Value, CommandError>>;

/// A procedure database held in memory. Procedures registered without a run
/// function succeed with `null`.
#[derive(Default)]
pub struct InMemoryProcedureDatabase {
    procedures: BTreeMap<String, (Procedure, Option<RunFn>)>,
}

impl InMemoryProcedureDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load procedure descriptions from a JSON array.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let procedures: Vec<Procedure> = serde_json::from_str(json)?;
        let mut db = Self::new();
        for procedure in procedures {
            db.register(procedure);
        }
        Ok(db)
    }

    pub fn register(&mut self, procedure: Procedure) {
        self.procedures.insert(procedure.name.clone(), (procedure, None));
    }

    pub fn register_with<F>(&mut self, procedure: Procedure, run: F)
    where
        F: Fn(&Kwargs) -> Result<Value, CommandError> + 'static,
    {
        self.procedures
            .insert(procedure.name.clone(), (procedure, Some(Rc::new(run))));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }
}

impl ProcedureDatabase for InMemoryProcedureDatabase {
    fn lookup(&self, name: &str) -> Option<Procedure> {
        self.procedures.get(name).map(|(p, _)| p.clone())
    }

    fn run(&self, name: &str, kwargs: &Kwargs) -> Result<Value, CommandError> {
        match self.procedures.get(name) {
            Some((_, Some(run))) => run(kwargs),
            Some((_, None)) => Ok(Value::Null),
            None => Err(CommandError::new(format!("procedure \"{name}\" not found"))),
        }
    }
}

/// Build a command descriptor for `procedure`.
pub fn command_dict_from_procedure(procedure: &Procedure) -> CommandDict {
    let origin = match procedure.kind {
        ProcedureKind::Gimp => Origin::GimpPdb,
        ProcedureKind::Gegl => Origin::Gegl,
    };

    let mut taken: Vec<String> = Vec::new();
    let mut arguments = Vec::with_capacity(procedure.arguments.len());
    for arg in &procedure.arguments {
        let name = uniquify_argument_name(&arg.name, taken.iter().map(String::as_str));
        taken.push(name.clone());

        let default_value = if arg.type_name == RUN_MODE_TYPE {
            Some(Value::from(RUN_MODE_NONINTERACTIVE))
        } else {
            custom_default(&procedure.name, &arg.name).or_else(|| arg.default_value.clone())
        };

        let mut tags = Vec::new();
        if origin == Origin::Gegl && LESS_USED_GEGL_ARGUMENTS.contains(&name.as_str()) {
            tags.push(MORE_OPTIONS_TAG.to_string());
        }

        arguments.push(ArgumentDict {
            name,
            type_name: arg.type_name.clone(),
            value: None,
            default_value,
            display_name: arg.blurb.clone(),
            tags,
            visible: None,
        });
    }

    CommandDict {
        name: Some(sanitize_procedure_name(&procedure.name)),
        function: Some(procedure.name.clone()),
        orig_name: Some(procedure.name.clone()),
        origin: Some(origin),
        arguments,
        display_name: Some(procedure_display_name(procedure)),
        description: Some(procedure.blurb.clone().unwrap_or_default()),
        ..Default::default()
    }
}

fn custom_default(procedure: &str, argument: &str) -> Option<Value> {
    CUSTOM_DEFAULTS
        .iter()
        .find(|(name, _)| *name == procedure)
        .and_then(|(_, defaults)| defaults.iter().find(|(arg, _)| *arg == argument))
        .map(|(_, value)| Value::Bool(*value))
}

/// Command names cannot contain the path (`/`) or attribute (`.`) separators.
fn sanitize_procedure_name(name: &str) -> String {
    name.replace(['/', '.'], "_")
}

fn procedure_display_name(procedure: &Procedure) -> String {
    match procedure.menu_label.as_deref() {
        Some(label) if !label.is_empty() => {
            let label = label.replace('_', "");
            match label.strip_suffix("...") {
                Some(stripped) => stripped.to_string(),
                None => label,
            }
        }
        _ => procedure.name.clone(),
    }
}
