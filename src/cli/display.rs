//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use serde_json::Value;

use super::commands::ValidationResult;
use crate::compute::ComputeHost;
use crate::topology::Node;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    let header_row: Vec<String> = headers.iter().map(|h| h.to_uppercase()).collect();
    for row in std::iter::once(header_row).chain(rows) {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                Some(width) => format!("{:width$}", cell, width = *width),
                None => cell.clone(),
            })
            .collect();
        output.push_str(cells.join("   ").trim_end());
        output.push('\n');
    }

    output
}

// ============================================================================
// Computes & nodes
// ============================================================================

/// Format compute list for display
pub fn format_compute_list(computes: &[ComputeHost]) -> String {
    let headers = &["ID", "ADDRESS", "STATUS", "VERSION", "LAST ERROR"];
    let rows: Vec<Vec<String>> = computes
        .iter()
        .map(|c| {
            vec![
                c.compute_id.clone(),
                c.base_url(),
                if c.is_connected() { "connected" } else { "disconnected" }.to_string(),
                c.version.clone().unwrap_or_else(|| "-".to_string()),
                c.last_error.clone().unwrap_or_default(),
            ]
        })
        .collect();

    format_table(headers, rows)
}

/// One-line summary of a compute after add/probe
pub fn format_compute(compute: &ComputeHost) -> String {
    format!(
        "Compute '{}' at {} is {}\n",
        compute.compute_id,
        compute.base_url(),
        if compute.is_connected() { "connected" } else { "disconnected" }
    )
}

/// Format node list for display
pub fn format_node_list(nodes: &[Node]) -> String {
    let headers = &["NAME", "TYPE", "COMPUTE", "STATUS", "LINKED PORTS"];
    let rows: Vec<Vec<String>> = nodes
        .iter()
        .map(|n| {
            let linked = n.ports.iter().filter(|p| p.is_bound()).count();
            vec![
                n.name.clone(),
                n.node_type.api_segment().to_string(),
                n.compute_id.clone(),
                n.status.to_string(),
                format!("{}/{}", linked, n.ports.len()),
            ]
        })
        .collect();

    format_table(headers, rows)
}

// ============================================================================
// Notifications
// ============================================================================

/// Format one item of a notification stream
pub fn format_stream_item(item: &Value) -> String {
    let kind = item["kind"].as_str().unwrap_or("?");
    match kind {
        "project.snapshot" => {
            let snapshot = &item["snapshot"];
            format!(
                "snapshot @{}: {} node(s), {} link(s)",
                snapshot["sequence"],
                snapshot["nodes"].as_array().map_or(0, Vec::len),
                snapshot["links"].as_array().map_or(0, Vec::len),
            )
        }
        "events.missed" => format!("missed events {}..={}", item["from"], item["to"]),
        _ => {
            let payload = &item["payload"];
            let subject = payload["name"]
                .as_str()
                .map(str::to_string)
                .or_else(|| payload["linkId"].as_str().map(str::to_string))
                .or_else(|| payload["nodeId"].as_str().map(str::to_string))
                .unwrap_or_default();
            format!("#{} {} {}", item["sequence"], kind, subject)
                .trim_end()
                .to_string()
        }
    }
}

// ============================================================================
// Validation display
// ============================================================================

/// Format a settings validation result
pub fn format_validation_result(result: &ValidationResult) -> String {
    if result.valid {
        format!(
            "Settings are valid\n  Listen:   {}\n  Computes: {}\n",
            result.listen, result.computes
        )
    } else {
        format!(
            "Settings are invalid: {}\n",
            result.error.as_deref().unwrap_or("unknown error")
        )
    }
}
