//! Parameter-name alias resolution.
//!
//! User code frequently spells well-known tool parameters in camelCase or
//! with near-synonyms (`filePath`, `text`, …). A fixed alias table maps those
//! alternates onto their canonical names *before* required-field validation,
//! so a call with any recognized alias behaves identically to the canonical
//! call.
//!
//! The table is fixed at build time and travels inside the capability
//! manifest; it is never expanded at runtime. Resolution is case-sensitive
//! and non-recursive.

use serde_json::{Map, Value};

use crate::catalog::ParamSpec;
use crate::manifest::AliasEntry;

/// The fixed alias table: `(canonical, accepted alternates)`.
pub const ALIAS_TABLE: &[(&str, &[&str])] = &[
    ("file_path", &["filePath", "filename", "path", "file"]),
    ("content", &["text", "data", "body"]),
    ("old_string", &["oldString", "old_text", "old"]),
    ("new_string", &["newString", "new_text", "new"]),
    ("command", &["cmd", "command_line"]),
    ("url", &["uri", "link"]),
];

/// The alias table as manifest entries, in table order.
pub fn standard_aliases() -> Vec<AliasEntry> {
    ALIAS_TABLE
        .iter()
        .map(|(canonical, aliases)| AliasEntry {
            canonical: (*canonical).to_string(),
            aliases: aliases.iter().map(|a| (*a).to_string()).collect(),
        })
        .collect()
}

/// Rewrite aliased keys in `args` to their canonical names.
///
/// For each declared parameter whose canonical name is absent from `args`,
/// the first present alias (in table order) is renamed to the canonical key.
/// The canonical key always wins when present; an alias sitting next to it
/// is left untouched. Keys that are themselves declared parameters of the
/// tool are never treated as aliases, so a tool that genuinely declares a
/// `path` parameter keeps it.
pub fn canonicalize(args: &mut Map<String, Value>, declared: &[ParamSpec], table: &[AliasEntry]) {
    for param in declared {
        if args.contains_key(&param.name) {
            continue;
        }
        let Some(entry) = table.iter().find(|e| e.canonical == param.name) else {
            continue;
        };
        for alias in &entry.aliases {
            if declared.iter().any(|p| &p.name == alias) {
                continue;
            }
            if let Some(value) = args.remove(alias.as_str()) {
                args.insert(param.name.clone(), value);
                break;
            }
        }
    }
}

/// Return the first declared required parameter missing from `args`, if any.
///
/// Callers run this *after* [`canonicalize`].
pub fn missing_required<'a>(args: &Map<String, Value>, declared: &'a [ParamSpec]) -> Option<&'a str> {
    declared
        .iter()
        .find(|p| p.required && !args.contains_key(&p.name))
        .map(|p| p.name.as_str())
}
