//! Console commands and projection rendering.

use chrono::{DateTime, Local, Utc};
use client_core::Projection;
use shared::domain::Category;

pub const HELP: &str = "commands: next | prev | goto <n> | say <text> | resync | categories | use <id|name> | show | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Next,
    Previous,
    /// Zero-based index; typed one-based.
    GoTo(usize),
    Say(String),
    Resync,
    Categories,
    Use(String),
    Show,
    Help,
    Quit,
}

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "next" | "n" => ConsoleCommand::Next,
        "prev" | "previous" | "p" => ConsoleCommand::Previous,
        "goto" | "g" => {
            let position: usize = rest
                .parse()
                .map_err(|_| format!("goto expects a position, got {rest:?}"))?;
            if position == 0 {
                return Err("positions start at 1".to_string());
            }
            ConsoleCommand::GoTo(position - 1)
        }
        "say" | "s" if !rest.is_empty() => ConsoleCommand::Say(rest.to_string()),
        "say" | "s" => return Err("say expects some text".to_string()),
        "resync" => ConsoleCommand::Resync,
        "categories" | "ls" => ConsoleCommand::Categories,
        "use" if !rest.is_empty() => ConsoleCommand::Use(rest.to_string()),
        "use" => return Err("use expects a category id or name".to_string()),
        "show" => ConsoleCommand::Show,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command {other:?}; type help")),
    };
    Ok(Some(command))
}

/// Finds a category by numeric id or case-insensitive name.
pub fn find_category<'a>(categories: &'a [Category], wanted: &str) -> Option<&'a Category> {
    let wanted = wanted.trim();
    if let Ok(id) = wanted.parse::<i64>() {
        if let Some(category) = categories.iter().find(|category| category.id.0 == id) {
            return Some(category);
        }
    }
    categories
        .iter()
        .find(|category| category.name.eq_ignore_ascii_case(wanted))
}

pub fn render_projection(projection: &Projection) -> String {
    let Some(category) = &projection.category else {
        return "(no category selected)".to_string();
    };
    let mut status = Vec::new();
    if !projection.settled {
        status.push("syncing".to_string());
    }
    if !projection.live {
        status.push("offline".to_string());
    }
    status.push(format!("updated {}", clock_time(projection.last_updated)));
    let status = format!(" [{}]", status.join(", "));

    match projection.active_item() {
        Some(item) => format!(
            "{} {}/{}{}: {}",
            category.name,
            projection.active_index.map_or(0, |index| index + 1),
            projection.len(),
            status,
            item.text
        ),
        None if projection.is_empty() => format!("{} (empty){}", category.name, status),
        None => format!("{} -/{}{}", category.name, projection.len(), status),
    }
}

/// Local wall-clock time of a projection update.
fn clock_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M:%S").to_string()
}

pub fn render_categories(categories: &[Category]) -> String {
    if categories.is_empty() {
        return "(no categories)".to_string();
    }
    categories
        .iter()
        .map(|category| format!("{:>4}  {}", category.id.0, category.name))
        .collect::<Vec<_>>()
        .join("\n")
}
