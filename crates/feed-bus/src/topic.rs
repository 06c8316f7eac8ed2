//! Canonical topic names.
//!
//! One topic per change-feed scope (table plus optional filter) and one per
//! presence room. Filter values are percent-escaped so user-supplied values
//! cannot collide with the `.` separators.

const CHANGES_PREFIX: &str = "changes";
const PRESENCE_PREFIX: &str = "presence";

/// Topic carrying row-level change events for a table, optionally narrowed
/// to rows where `column = value`.
pub fn changes(table: &str, filter: Option<(&str, &str)>) -> String {
    match filter {
        Some((column, value)) => format!(
            "{CHANGES_PREFIX}.{table}.{column}.{}",
            escape_segment(value)
        ),
        None => format!("{CHANGES_PREFIX}.{table}"),
    }
}

/// Topic carrying presence snapshots for a room.
pub fn presence(room: &str) -> String {
    format!("{PRESENCE_PREFIX}.{}", escape_segment(room))
}

fn escape_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '.' => out.push_str("%2e"),
            '%' => out.push_str("%25"),
            _ => out.push(ch),
        }
    }
    out
}
