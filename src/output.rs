//! CLI output formatting.
//!
//! # Output Format
//!
//! ## Run / Preview
//!
//! Items are listed in tree order, indented by depth. A renamed item shows
//! its original name, then its new name. Exported files show where they went.
//!
//! ```text
//! Body
//!     Hands
//!         Left.png → Body_Hands_Left
//!             Output: output/Body/Hands/Body_Hands_Left.png
//!     Torso.png → Body_Torso
//!         Output: output/Body/Body_Torso.png (not written)
//!
//! Skipped
//!     plug-in-blur: "Left.png": nothing to blur
//!
//! Processed 2 files, exported 1
//! ```
//!
//! ## Commands
//!
//! ```text
//! Actions
//! 001 [x] Rename (rename, builtin)
//! 002 [ ] Export (export, builtin)
//!
//! Conditions
//! 001 [x] Matching File Extension (matching_file_extension, builtin)
//! ```
//!
//! # Architecture
//!
//! Each view has a `format_*` function (returns `Vec<String>`) for testability
//! and a `print_*` wrapper that writes to stdout. Format functions are pure:
//! no I/O, no side effects.

use std::collections::BTreeMap;

use crate::batcher::{BatchReport, CommandIssues, Issue};
use crate::commands::CommandGroup;
use crate::renamer::{ExampleLine, FieldInfo};

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("{count} {word}")
    } else {
        format!("{count} {word}s")
    }
}

// ============================================================================
// Run report
// ============================================================================

fn issue_line(command: &str, issue: &Issue) -> String {
    match &issue.item {
        Some(item) => format!("{}{}: \"{}\": {}", indent(1), command, item, issue.message),
        None => format!("{}{}: {}", indent(1), command, issue.message),
    }
}

fn issue_section(title: &str, issues: &CommandIssues) -> Vec<String> {
    if issues.is_empty() {
        return Vec::new();
    }
    let mut lines = vec![String::new(), title.to_string()];
    let all: [&BTreeMap<String, Vec<Issue>>; 2] = [&issues.conditions, &issues.actions];
    for map in all {
        for (command, list) in map {
            lines.extend(list.iter().map(|issue| issue_line(command, issue)));
        }
    }
    lines
}

pub fn format_report(report: &BatchReport) -> Vec<String> {
    let mut lines = Vec::new();

    for item in &report.items {
        let orig = item
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let header = if orig == item.name {
            format!("{}{}", indent(item.depth), orig)
        } else {
            format!("{}{} → {}", indent(item.depth), orig, item.name)
        };
        lines.push(header);

        if let Some(path) = &item.output_path {
            let status = if item.written { "" } else { " (not written)" };
            lines.push(format!("{}Output: {}{}", indent(item.depth + 1), path.display(), status));
        }
    }

    lines.extend(issue_section("Skipped", &report.skipped));
    lines.extend(issue_section("Failed", &report.failed));

    lines.push(String::new());
    lines.push(format!(
        "Processed {}, exported {}",
        plural(report.files().count(), "file"),
        report.written_count()
    ));
    lines
}

pub fn print_report(report: &BatchReport) {
    for line in format_report(report) {
        println!("{}", line);
    }
}

// ============================================================================
// Commands
// ============================================================================

fn command_lines(title: &str, group: &CommandGroup) -> Vec<String> {
    let mut lines = vec![title.to_string()];
    if group.is_empty() {
        lines.push(format!("{}(none)", indent(1)));
    }
    for (i, command) in group.iter().enumerate() {
        let marker = if command.enabled { "[x]" } else { "[ ]" };
        lines.push(format!(
            "{} {} {} ({}, {})",
            format_index(i + 1),
            marker,
            command.label(),
            command.name,
            command.origin.as_str()
        ));
    }
    lines
}

pub fn format_commands(actions: &CommandGroup, conditions: &CommandGroup) -> Vec<String> {
    let mut lines = command_lines("Actions", actions);
    lines.push(String::new());
    lines.extend(command_lines("Conditions", conditions));
    lines
}

pub fn print_commands(actions: &CommandGroup, conditions: &CommandGroup) {
    for line in format_commands(actions, conditions) {
        println!("{}", line);
    }
}

// ============================================================================
// Fields
// ============================================================================

pub fn format_fields(fields: &[FieldInfo]) -> Vec<String> {
    let mut lines = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            lines.push(String::new());
        }
        lines.push(format!("{} {}", field.display_name, field.str_to_insert));
        for example in &field.examples {
            match example {
                ExampleLine::Note(note) => lines.push(format!("{}{}", indent(1), note)),
                ExampleLine::Example(pattern, result) => {
                    lines.push(format!("{}{} → {}", indent(1), pattern, result))
                }
            }
        }
    }
    lines
}

pub fn print_fields(fields: &[FieldInfo]) {
    for line in format_fields(fields) {
        println!("{}", line);
    }
}
