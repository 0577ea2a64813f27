//! Parsers for provisioning tool output.
//!
//! Text scraping here is best-effort enrichment. Callers must not rely on it
//! for control flow: a missing summary is `None`, a missing resource list is
//! empty.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::debug;

use crate::core::models::RestoredResource;

/// Resource counts from a plan or apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub added: u32,
    pub changed: u32,
    pub destroyed: u32,
}

static PLAN_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Plan: (\d+) to add, (\d+) to change, (\d+) to destroy").unwrap()
});

static APPLY_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Apply complete! Resources: (\d+) added, (\d+) changed, (\d+) destroyed").unwrap()
});

// "aws_backup_vault.main: Creation complete after 2s [id=acme-vault]"
static CREATION_COMPLETE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(\S+): )?Creation complete after \S+ \[id=([^\]]+)\]").unwrap()
});

/// Extract `Plan: N to add, M to change, K to destroy`.
///
/// Falls back to the `Apply complete!` line, which is all an apply of a saved
/// plan prints.
pub fn parse_change_summary(output: &str) -> Option<ChangeSummary> {
    let caps = PLAN_SUMMARY
        .captures(output)
        .or_else(|| APPLY_SUMMARY.captures(output))?;

    let count = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok());

    Some(ChangeSummary {
        added: count(1)?,
        changed: count(2)?,
        destroyed: count(3)?,
    })
}

/// Build the list of resources an apply created.
///
/// Structured output (a JSON object with a `resources` array) takes precedence
/// over scanning the text for creation markers.
pub fn parse_restored_resources(output: &str) -> Vec<RestoredResource> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(output.trim()) {
        if let Some(resources) = map.get("resources") {
            match serde_json::from_value::<Vec<RestoredResource>>(resources.clone()) {
                Ok(resources) => return resources,
                Err(e) => debug!(error = %e, "Structured resource list did not parse"),
            }
        }
    }

    output
        .lines()
        .filter_map(|line| CREATION_COMPLETE.captures(line))
        .filter_map(|caps| {
            let id = caps.get(2)?.as_str().to_string();
            let resource_type = match caps.get(1) {
                // module.backup.aws_backup_vault.main -> aws_backup_vault
                Some(address) => address.as_str().rsplit('.').nth(1).unwrap_or_default(),
                None => id.split('.').next().unwrap_or_default(),
            }
            .to_string();

            Some(RestoredResource {
                id,
                resource_type,
                provider: None,
                status: "created".to_string(),
            })
        })
        .collect()
}

/// Parse `output -json`. Returns an empty map when the text is not a JSON object.
pub fn parse_output_values(output: &str) -> HashMap<String, Value> {
    match serde_json::from_str::<HashMap<String, Value>>(output.trim()) {
        Ok(values) => values,
        Err(e) => {
            debug!(error = %e, "Provisioning outputs are not valid JSON");
            HashMap::new()
        }
    }
}
