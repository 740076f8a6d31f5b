//! Name patterns for files and folders.
//!
//! An [`ItemRenamer`] wraps a [`StringPattern`] configured with the built-in
//! fields below. Each call to [`ItemRenamer::rename`] renders the pattern for
//! one item; number fields keep counting across calls on the same renamer.
//!
//! | Field | Arguments | Produces |
//! |-------|-----------|----------|
//! | `[001]` (any digits) | `%n`, `%d`, `%dN` | Sequential number, padded to the field width |
//! | `[image name]` | extension mode | Item name |
//! | `[image path]` | separator, wrapper, extension mode | Parent folder names plus item name |
//! | `[output folder]` | component mode, separator, wrapper | Components of the output directory |
//! | `[current date]` | strftime format | Today's date |
//! | `[replace]` | field, regex, replacement, count, flags | Regex replacement over another field |
//!
//! Extension modes: `%e` keeps the extension, `%i` keeps it only if it equals
//! the target extension, `%n` keeps it only if it differs. Without a mode the
//! extension is stripped.

use chrono::Local;
use chrono::format::{Item as FormatItem, StrftimeItems};
use regex::RegexBuilder;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Component, PathBuf};
use std::rc::Rc;

use crate::itemtree::{ItemId, ItemTree, SharedTree};
use crate::naming::{file_extension, filename_root};
use crate::pattern::{Field, FieldError, PatternError, Signature, StringPattern};

const NUMBER_KEY: &str = "^[0-9]+$";
const PATH_COMPONENT_TOKEN: &str = "%c";

/// Everything the built-in fields may look at while rendering one item.
#[derive(Debug, Clone)]
pub struct RenameContext {
    pub tree: SharedTree,
    /// The item being renamed.
    pub item: ItemId,
    /// Items that passed the run's conditions. `None` outside a run, in
    /// which case numbering counts the whole tree.
    pub matching_items: Option<Rc<[ItemId]>>,
    pub matching_items_and_parents: Option<Rc<[ItemId]>>,
    /// Extension files are exported with, without the dot.
    pub file_extension: String,
    pub output_dir: PathBuf,
}

impl RenameContext {
    pub fn new(tree: SharedTree, item: ItemId) -> Self {
        Self {
            tree,
            item,
            matching_items: None,
            matching_items_and_parents: None,
            file_extension: String::new(),
            output_dir: PathBuf::new(),
        }
    }

    /// The same context pointed at another item.
    pub fn for_item(&self, item: ItemId) -> Self {
        Self { item, ..self.clone() }
    }
}

/// Renders new names for items from a pattern.
pub struct ItemRenamer {
    pattern: StringPattern<RenameContext>,
    rename_files: bool,
    rename_folders: bool,
}

impl ItemRenamer {
    pub fn new(pattern: &str, rename_files: bool, rename_folders: bool) -> Result<Self, PatternError> {
        Ok(Self {
            pattern: StringPattern::new(pattern, builtin_fields(rename_files, rename_folders))?,
            rename_files,
            rename_folders,
        })
    }

    pub fn rename(&mut self, context: &RenameContext) -> String {
        self.pattern.substitute(context)
    }

    pub fn pattern(&self) -> &str {
        self.pattern.pattern()
    }

    pub fn rename_files(&self) -> bool {
        self.rename_files
    }

    pub fn rename_folders(&self) -> bool {
        self.rename_folders
    }
}

// ============================================================================
// Fields
// ============================================================================

type PlainFieldFn = fn(&RenameContext, &[String]) -> Result<String, FieldError>;

/// A stateless field, callable both from a pattern and from `[replace]`.
struct PlainField {
    key: &'static str,
    signature: Signature,
    func: PlainFieldFn,
}

fn plain_fields() -> Vec<PlainField> {
    vec![
        PlainField {
            key: "image name",
            signature: Signature::none().optional([""]),
            func: image_name,
        },
        PlainField {
            key: "image path",
            signature: Signature::none().optional(["-", "", ""]),
            func: image_path,
        },
        PlainField {
            key: "output folder",
            signature: Signature::none().optional(["%b", "-", ""]),
            func: output_folder,
        },
        PlainField {
            key: "current date",
            signature: Signature::none().optional(["%Y-%m-%d"]),
            func: current_date,
        },
        PlainField {
            key: "replace",
            signature: Signature::none().required(3).variadic(),
            func: replace,
        },
    ]
}

fn builtin_fields(rename_files: bool, rename_folders: bool) -> Vec<Field<RenameContext>> {
    let mut fields = vec![number_field(rename_files, rename_folders)];
    fields.extend(plain_fields().into_iter().map(|field| {
        let func = field.func;
        Field::new(field.key, field.signature, move |ctx, _name, args| func(ctx, args))
    }));
    fields
}

fn current_item_name(ctx: &RenameContext, tree: &ItemTree) -> Result<String, FieldError> {
    tree.get(ctx.item)
        .map(|item| item.name.clone())
        .ok_or_else(|| FieldError::new(format!("item {} is not in the tree", ctx.item)))
}

// ----------------------------------------------------------------------------
// Numbering
// ----------------------------------------------------------------------------

struct Counter {
    next: i64,
    step: i64,
    padding: usize,
}

impl Counter {
    fn advance(&mut self) -> String {
        let text = self.next.to_string();
        self.next += self.step;
        let width = text.chars().count();
        if width < self.padding {
            format!("{}{text}", "0".repeat(self.padding - width))
        } else {
            text
        }
    }
}

/// Counters are keyed by the field as written and the item's parent, so
/// `[001]` restarts in every folder unless `%n` is given.
fn number_field(rename_files: bool, rename_folders: bool) -> Field<RenameContext> {
    let mut counters: HashMap<(String, Option<ItemId>), Counter> = HashMap::new();

    let signature = Signature::none().variadic();
    Field::new(NUMBER_KEY, signature, move |ctx: &RenameContext, value: &str, args: &[String]| {
        let mut per_parent = true;
        let mut ascending = true;
        let mut padding = None;
        for arg in args {
            if arg == "%n" {
                per_parent = false;
            } else if let Some(width) = arg.strip_prefix("%d") {
                ascending = false;
                if let Ok(width) = width.parse::<usize>() {
                    padding = Some(width);
                }
            }
        }

        let tree = ctx.tree.borrow();
        let item = tree
            .get(ctx.item)
            .ok_or_else(|| FieldError::new(format!("item {} is not in the tree", ctx.item)))?;
        let parent = if per_parent { item.parent } else { None };
        let key = (value.to_string(), parent);

        if !counters.contains_key(&key) {
            let mut start: i64 = value
                .parse()
                .map_err(|_| FieldError::new(format!("number \"{value}\" is out of range")))?;
            if start == 0 && !ascending {
                let scope = number_scope(ctx, &tree, rename_files, rename_folders);
                let count = if !per_parent {
                    scope.len()
                } else {
                    match parent.and_then(|p| tree.get(p)) {
                        Some(p) => tree.count_siblings(&scope, p.depth + 1, Some(p.id)),
                        None => tree.count_siblings(&scope, 0, None),
                    }
                };
                start = count as i64;
            }
            counters.insert(
                key.clone(),
                Counter {
                    next: start,
                    step: if ascending { 1 } else { -1 },
                    padding: padding.unwrap_or(value.chars().count()),
                },
            );
        }

        counters
            .get_mut(&key)
            .map(Counter::advance)
            .ok_or_else(|| FieldError::new("counter missing"))
    })
}

/// Items a descending count starts from, depending on what gets renamed.
fn number_scope(ctx: &RenameContext, tree: &ItemTree, rename_files: bool, rename_folders: bool) -> Vec<ItemId> {
    let Some(matching) = ctx.matching_items.as_deref() else {
        return tree.iter().map(|i| i.id).collect();
    };
    let with_parents = ctx.matching_items_and_parents.as_deref().unwrap_or(matching);

    match (rename_files, rename_folders) {
        (true, true) => with_parents.to_vec(),
        (false, true) => with_parents
            .iter()
            .copied()
            .filter(|&id| tree.get(id).is_some_and(|i| i.is_folder()))
            .collect(),
        _ => matching.to_vec(),
    }
}

// ----------------------------------------------------------------------------
// Names and paths
// ----------------------------------------------------------------------------

fn apply_extension_mode(name: &str, mode: &str, target_extension: &str) -> String {
    let matches_target = || file_extension(name) == target_extension.to_lowercase();
    let keep = match mode {
        "%e" => true,
        "%i" => matches_target(),
        "%n" => !matches_target(),
        _ => false,
    };
    if keep { name.to_string() } else { filename_root(name) }
}

fn image_name(ctx: &RenameContext, args: &[String]) -> Result<String, FieldError> {
    let name = current_item_name(ctx, &ctx.tree.borrow())?;
    let mode = args.first().map(String::as_str).unwrap_or("");
    Ok(apply_extension_mode(&name, mode, &ctx.file_extension))
}

/// Join components with `separator`, substituting each into `wrapper` at
/// `%c`. A wrapper without `%c` is ignored.
fn wrap_components<I>(components: I, separator: &str, wrapper: &str) -> String
where
    I: IntoIterator<Item = String>,
{
    components
        .into_iter()
        .map(|c| {
            if wrapper.contains(PATH_COMPONENT_TOKEN) {
                wrapper.replace(PATH_COMPONENT_TOKEN, &c)
            } else {
                c
            }
        })
        .collect::<Vec<_>>()
        .join(separator)
}

fn image_path(ctx: &RenameContext, args: &[String]) -> Result<String, FieldError> {
    let separator = args.first().map(String::as_str).unwrap_or("-");
    let wrapper = args.get(1).map(String::as_str).unwrap_or("");

    let mut components: Vec<String> = {
        let tree = ctx.tree.borrow();
        tree.parents(ctx.item)
            .into_iter()
            .filter_map(|p| tree.get(p).map(|i| i.name.clone()))
            .collect()
    };
    components.push(image_name(ctx, &args[args.len().min(2)..])?);

    Ok(wrap_components(components, separator, wrapper))
}

fn output_folder(ctx: &RenameContext, args: &[String]) -> Result<String, FieldError> {
    let mode = args.first().map(String::as_str).unwrap_or("%b");
    let separator = args.get(1).map(String::as_str).unwrap_or("-");
    let wrapper = args.get(2).map(String::as_str).unwrap_or("");

    let components: Vec<String> = ctx
        .output_dir
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    let selected: Vec<String> = if let Some(count) = mode.strip_prefix("%b") {
        let count = count.parse::<usize>().unwrap_or(1);
        // zero keeps everything, like a negative slice start of -0
        let skip = if count == 0 { 0 } else { components.len().saturating_sub(count) };
        components.into_iter().skip(skip).collect()
    } else if let Some(count) = mode.strip_prefix("%f") {
        let count = count.parse::<usize>().unwrap_or(1);
        components.into_iter().take(count).collect()
    } else {
        components
    };

    Ok(wrap_components(selected, separator, wrapper))
}

fn current_date(_ctx: &RenameContext, args: &[String]) -> Result<String, FieldError> {
    let format = args.first().map(String::as_str).unwrap_or("%Y-%m-%d");
    let items: Vec<FormatItem<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|i| matches!(i, FormatItem::Error)) {
        return Err(FieldError::new(format!("invalid date format \"{format}\"")));
    }
    let mut date = String::new();
    write!(date, "{}", Local::now().format_with_items(items.into_iter()))
        .map_err(|_| FieldError::new(format!("invalid date format \"{format}\"")))?;
    Ok(date)
}

// ----------------------------------------------------------------------------
// Replace
// ----------------------------------------------------------------------------

/// `[replace, field, regex, replacement, count, flags...]`.
///
/// The field is written like a field reference without the outer brackets
/// (`[image name, %e]`) and must name one of the stateless built-ins
/// exactly; anything else renders as an empty string. A count of 0 replaces
/// every match.
fn replace(ctx: &RenameContext, args: &[String]) -> Result<String, FieldError> {
    let [field, regex, replacement, count_and_flags @ ..] = args else {
        return Err(FieldError::new("replace needs a field, a regex and a replacement"));
    };

    let (name, field_args) = StringPattern::<RenameContext>::parse_field(field);
    let Some(field) = plain_fields().into_iter().find(|f| f.key == name) else {
        return Ok(String::new());
    };
    let bound = field
        .signature
        .bind(&field_args)
        .ok_or_else(|| FieldError::new(format!("wrong number of arguments for \"{name}\"")))?;
    let text = (field.func)(ctx, &bound)?;

    let count = count_and_flags
        .first()
        .and_then(|c| c.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut builder = RegexBuilder::new(regex);
    for flag in count_and_flags.iter().skip(1) {
        match flag.to_uppercase().as_str() {
            "IGNORECASE" | "I" => builder.case_insensitive(true),
            "MULTILINE" | "M" => builder.multi_line(true),
            "DOTALL" | "S" => builder.dot_matches_new_line(true),
            "VERBOSE" | "X" => builder.ignore_whitespace(true),
            _ => &mut builder,
        };
    }
    let regex = builder
        .build()
        .map_err(|e| FieldError::new(format!("invalid regex: {e}")))?;

    Ok(regex
        .replacen(&text, count, expansion_template(replacement).as_str())
        .into_owned())
}

/// Convert a backslash-style replacement (`\1`, `\g<name>`) into the
/// `${1}`/`${name}` form understood by `regex`.
fn expansion_template(replacement: &str) -> String {
    let chars: Vec<char> = replacement.chars().collect();
    let mut template = String::with_capacity(replacement.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '$' => template.push_str("$$"),
            '\\' if i + 1 < chars.len() => {
                let next = chars[i + 1];
                if next.is_ascii_digit() {
                    let digits: String = chars[i + 1..].iter().take_while(|c| c.is_ascii_digit()).collect();
                    i += digits.len();
                    template.push_str(&format!("${{{digits}}}"));
                } else if next == 'g' && chars.get(i + 2) == Some(&'<') {
                    match chars[i + 3..].iter().position(|&c| c == '>') {
                        Some(len) => {
                            let name: String = chars[i + 3..i + 3 + len].iter().collect();
                            template.push_str(&format!("${{{name}}}"));
                            i += 3 + len;
                        }
                        None => template.push('\\'),
                    }
                } else {
                    match next {
                        'n' => template.push('\n'),
                        't' => template.push('\t'),
                        '\\' => template.push('\\'),
                        other => {
                            template.push('\\');
                            template.push(other);
                        }
                    }
                    i += 1;
                }
            }
            c => template.push(c),
        }
        i += 1;
    }
    template
}

// ============================================================================
// Catalog
// ============================================================================

/// One line of a field's documentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExampleLine {
    Note(&'static str),
    Example(&'static str, &'static str),
}

/// A built-in field as listed by the `fields` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub display_name: &'static str,
    /// What to type in a pattern to use the field.
    pub str_to_insert: &'static str,
    pub key: &'static str,
    pub examples: Vec<ExampleLine>,
}

pub fn field_catalog() -> Vec<FieldInfo> {
    use ExampleLine::{Example, Note};

    let output_folder_examples = if cfg!(windows) {
        vec![
            Note(r#"Suppose that the output folder is "C:\Users\username\Pictures"."#),
            Example("[output folder]", "Pictures"),
            Example("[output folder, %]", "Users-username-Pictures"),
            Example("[output folder, %b2]", "username-Pictures"),
            Example("[output folder, %b2, _]", "username_Pictures"),
            Example("[output folder, %b2, _, (%c)]", "(username)_(Pictures)"),
            Example("[output folder, %f2]", "Users-username"),
        ]
    } else {
        vec![
            Note(r#"Suppose that the output folder is "/home/username/Pictures"."#),
            Example("[output folder]", "Pictures"),
            Example("[output folder, %]", "home-username-Pictures"),
            Example("[output folder, %b2]", "username-Pictures"),
            Example("[output folder, %b2, _]", "username_Pictures"),
            Example("[output folder, %b2, _, (%c)]", "(username)_(Pictures)"),
            Example("[output folder, %f2]", "home-username"),
        ]
    };

    vec![
        FieldInfo {
            display_name: "image001",
            str_to_insert: "image[001]",
            key: NUMBER_KEY,
            examples: vec![
                Example("[001]", "001, 002, ..."),
                Example("[1]", "1, 2, ..."),
                Example("[005]", "005, 006, ..."),
                Note("To continue numbering across folders, use %n."),
                Example("[001, %n]", "001, 002, ..."),
                Note("To use descending numbers, use %d."),
                Note("Suppose that the number of images is 5:"),
                Example("[000, %d]", "005, 004, ..."),
                Example("[10, %d2]", "10, 09, ..."),
            ],
        },
        FieldInfo {
            display_name: "Image name",
            str_to_insert: "[image name]",
            key: "image name",
            examples: vec![
                Note(r#"Suppose that an image is named "Image.png" and the file extension is "png"."#),
                Example("[image name]", "Image"),
                Example("[image name, %e]", "Image.png"),
                Example("[image name, %i]", "Image.png"),
                Example("[image name, %n]", "Image"),
                Note(r#"Suppose that an image is named "Image.jpg" and the file extension is "png"."#),
                Example("[image name, %e]", "Image.jpg"),
                Example("[image name, %i]", "Image"),
                Example("[image name, %n]", "Image.jpg"),
            ],
        },
        FieldInfo {
            display_name: "Image path",
            str_to_insert: "[image path]",
            key: "image path",
            examples: vec![
                Note(r#"Suppose that an image named "Left" has parent folders named "Hands" and "Body"."#),
                Example("[image path]", "Body-Hands-Left"),
                Example("[image path, _]", "Body_Hands_Left"),
                Example("[image path, _, (%c)]", "(Body)_(Hands)_(Left)"),
                Note(r#"Suppose that an image is named "Left.jpg" and the file extension is "png"."#),
                Example("[image path, -, %c, %e]", "Body-Hands-Left.jpg"),
                Example("[image path, -, %c, %i]", "Body-Hands-Left"),
                Example("[image path, -, %c, %n]", "Body-Hands-Left.jpg"),
            ],
        },
        FieldInfo {
            display_name: "Output folder",
            str_to_insert: "[output folder]",
            key: "output folder",
            examples: output_folder_examples,
        },
        FieldInfo {
            display_name: "Current date",
            str_to_insert: "[current date]",
            key: "current date",
            examples: vec![
                Example("[current date]", "2019-01-28"),
                Note("Custom date format uses \"%\" to specify date components:"),
                Example("[current date, %m.%d.%Y_%H-%M]", "28.01.2019_19-04"),
                Example("[current date, %H_%M_%S]", "19_04_48"),
            ],
        },
        FieldInfo {
            display_name: "Replace",
            str_to_insert: "[replace]",
            key: "replace",
            examples: vec![
                Note(r#"Suppose that an image is named "Animal copy #1"."#),
                Example("[replace, [image name], [a], [b] ]", "Animbl copy #1"),
                Note("You can use regular expressions for the pattern and the replacement:"),
                Example("[replace, [image name], [ copy(?: #[[0-9]]+)*$], [] ]", "Animal"),
                Note("Optional arguments are the number of replacements and flags, e.g. ignorecase:"),
                Example("[replace, [image name], [a], [b], 1, ignorecase]", "bnimal copy #1"),
            ],
        },
    ]
}
