use std::collections::BTreeSet;

pub(crate) const PASS_STATS: &str = "JOBGRAPH_PASS_STATS";
pub(crate) const DISABLED_PASSES: &str = "JOBGRAPH_DISABLED_PASSES";
pub(crate) const VALIDATE_PASSES: &str = "JOBGRAPH_VALIDATE_PASSES";

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

/// Comma-separated names; blank entries are dropped.
pub(crate) fn name_list(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> BTreeSet<String> {
    lookup(key)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
