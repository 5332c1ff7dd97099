//! Event and message dispatch over a registry snapshot
//!
//! Every routine walks the snapshot in `(priority, name)` order. A plugin
//! that fails or panics is logged and skipped for that call only.

use crate::manager::PluginManager;
use crate::plugin::{guarded, Capabilities, PluginInstance};
use serde_json::Value;
use std::sync::Arc;

/// Offer an event to every interested plugin, collecting non-`None` results
/// in registry order
pub async fn dispatch_event(
    snapshot: &[Arc<PluginInstance>],
    event: &str,
    payload: &Value,
    manager: &PluginManager,
) -> Vec<Value> {
    let mut results = Vec::new();

    for instance in snapshot {
        if !instance.accepts_event(event) {
            continue;
        }
        let call = instance.plugin().on_event(event, payload, manager);
        if let Some(Some(result)) = guarded(instance.name(), "on_event", call).await {
            results.push(result);
        }
    }

    tracing::debug!(event, results = results.len(), "Event dispatched");
    results
}

/// Run the filter chain: each filter sees the previous filter's output
pub async fn run_filters(
    snapshot: &[Arc<PluginInstance>],
    text: &str,
    manager: &PluginManager,
) -> String {
    let mut current = text.to_string();

    for instance in snapshot.iter().filter(|i| i.has(Capabilities::FILTER)) {
        let call = instance.plugin().filter_message(&current, manager);
        if let Some(Some(filtered)) = guarded(instance.name(), "filter_message", call).await {
            if filtered != current {
                tracing::trace!(plugin = %instance.name(), "Message rewritten by filter");
            }
            current = filtered;
        }
    }

    current
}

/// Split `text` into `(command, args)` when it starts with a prefix.
///
/// The prefix is stripped, the command keeps its case, and args are the
/// trimmed remainder. A bare prefix is not a command.
pub fn parse_command<'a>(text: &'a str, prefixes: &[char]) -> Option<(&'a str, &'a str)> {
    let first = text.chars().next()?;
    if !prefixes.contains(&first) {
        return None;
    }

    let body = &text[first.len_utf8()..];
    let (command, args) = match body.find(char::is_whitespace) {
        Some(split) => (&body[..split], body[split..].trim()),
        None => (body, ""),
    };

    if command.is_empty() {
        None
    } else {
        Some((command, args))
    }
}

/// Offer a parsed command to every command handler, collecting results in
/// registry order
pub async fn dispatch_command(
    snapshot: &[Arc<PluginInstance>],
    command: &str,
    args: &str,
    manager: &PluginManager,
) -> Vec<String> {
    let mut results = Vec::new();

    for instance in snapshot.iter().filter(|i| i.has(Capabilities::COMMANDS)) {
        let call = instance.plugin().handle_command(command, args, manager);
        if let Some(Some(result)) = guarded(instance.name(), "handle_command", call).await {
            results.push(result);
        }
    }

    results
}

/// Filter phase, then command phase. Text without a command prefix yields
/// no results, though the filters still ran.
pub async fn handle_message(
    snapshot: &[Arc<PluginInstance>],
    text: &str,
    prefixes: &[char],
    manager: &PluginManager,
) -> Vec<String> {
    let filtered = run_filters(snapshot, text, manager).await;

    match parse_command(&filtered, prefixes) {
        Some((command, args)) => {
            let results = dispatch_command(snapshot, command, args, manager).await;
            tracing::debug!(command, results = results.len(), "Command dispatched");
            results
        }
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("/hello good world", &['/']), Some(("hello", "good world")));
        assert_eq!(parse_command("/ping", &['/']), Some(("ping", "")));
        assert_eq!(parse_command("/Echo   spaced  out  ", &['/']), Some(("Echo", "spaced  out")));
        assert_eq!(parse_command("!upper x", &['/', '!']), Some(("upper", "x")));
    }

    #[test]
    fn test_parse_command_rejects_non_commands() {
        assert_eq!(parse_command("hello", &['/']), None);
        assert_eq!(parse_command("", &['/']), None);
        assert_eq!(parse_command("/", &['/']), None);
        assert_eq!(parse_command("/ spaced", &['/']), None);
        assert_eq!(parse_command("!upper", &['/']), None);
        assert_eq!(parse_command(" /late", &['/']), None);
    }

    #[test]
    fn test_parse_command_multibyte_prefix() {
        assert_eq!(parse_command("§run fast", &['§']), Some(("run", "fast")));
    }
}
