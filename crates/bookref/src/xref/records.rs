//
// xref/records.rs
//
// Turns raw index entries into structured cross-reference records
//

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use super::types::{IndexEntry, XRef};

/// Matches text reference lines such as `(ref:fig-cap) A caption`.
/// Group 1 is the key including its parentheses, group 2 the value.
fn text_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\(.*\))\s+(.*)$").unwrap())
}

/// Split an id token on its first colon into `(type, id)`.
///
/// A token without a colon has an empty type.
pub fn split_entry_id(token: &str) -> (String, String) {
    match token.split_once(':') {
        Some((kind, id)) => (kind.to_string(), id.to_string()),
        None => (String::new(), token.to_string()),
    }
}

/// Convert raw index entries into cross-reference records.
///
/// Text reference entries (`(key) value`) are collected first and never
/// produce records themselves. Every other entry becomes one record, in input
/// order, with its title replaced by a text reference value when the title is
/// exactly that reference's key. Entries that are blank after trimming are
/// dropped.
///
/// # Examples
///
/// ```
/// use bookref::xref::{entries_to_xrefs, IndexEntry};
///
/// let entries = vec![
///     IndexEntry::new("ch1.Rmd", "(ref:cap) A long caption"),
///     IndexEntry::new("ch1.Rmd", "fig:plot (ref:cap)"),
/// ];
/// let xrefs = entries_to_xrefs(&entries);
/// assert_eq!(xrefs.len(), 1);
/// assert_eq!(xrefs[0].kind, "fig");
/// assert_eq!(xrefs[0].title, "A long caption");
/// ```
pub fn entries_to_xrefs(entries: &[IndexEntry]) -> Vec<XRef> {
    let pattern = text_ref_pattern();

    let mut text_refs: HashMap<&str, &str> = HashMap::new();
    let mut normal_entries: Vec<&IndexEntry> = Vec::with_capacity(entries.len());
    for index_entry in entries {
        match pattern.captures(&index_entry.entry) {
            Some(caps) => {
                let key = caps.get(1).map_or("", |m| m.as_str());
                let value = caps.get(2).map_or("", |m| m.as_str());
                text_refs.insert(key, value);
            }
            None => normal_entries.push(index_entry),
        }
    }

    log::trace!(
        "Converting {} index entries ({} text references)",
        normal_entries.len(),
        text_refs.len()
    );

    normal_entries
        .into_iter()
        .filter_map(|index_entry| entry_to_xref(index_entry, &text_refs))
        .collect()
}

fn entry_to_xref(index_entry: &IndexEntry, text_refs: &HashMap<&str, &str>) -> Option<XRef> {
    let entry = index_entry.entry.as_str();
    if entry.trim().is_empty() {
        return None;
    }

    let (token, title) = match entry.split_once(' ') {
        Some((token, title)) => {
            let title = match text_refs.get(title) {
                Some(resolved) if !resolved.is_empty() => *resolved,
                _ => title,
            };
            (token, title)
        }
        None => (entry, ""),
    };
    let (kind, id) = split_entry_id(token);

    Some(XRef {
        file: index_entry.file.clone(),
        kind,
        id,
        title: title.to_string(),
    })
}
