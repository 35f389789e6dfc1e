//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::{RoomStatusView, StepView};
use crate::manifest::WorkloadSet;
use crate::server::{StartResponse, StopResponse};

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
    let mut push_row = |cells: Vec<String>| {
        let line: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                Some(width) => format!("{:width$}", cell, width = width),
                None => cell.clone(),
            })
            .collect();
        output.push_str(line.join("   ").trim_end());
        output.push('\n');
    };

    push_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        push_row(row);
    }

    output
}

// ============================================================================
// Room display
// ============================================================================

pub fn format_room_status(status: &RoomStatusView) -> String {
    let mut output = String::new();
    output.push_str(&format!("Room:             {}\n", status.room_id));
    output.push_str(&format!("Stream uuid:      {}\n", status.ws_uuid));
    output.push_str(&format!("State:            {}\n", status.state));
    output.push_str(&format!("Active:           {}\n", status.active));
    output.push_str(&format!(
        "Unsaved changes:  {}\n",
        if status.unsaved_changes { "yes" } else { "no" }
    ));
    output
}

pub fn format_start(room_id: i64, response: &StartResponse) -> String {
    format!(
        "Room {} started (operation {})\nStream: /ws/medical-device/{}\n",
        room_id, response.operation_id, response.ws_uuid
    )
}

pub fn format_stop(room_id: i64, response: &StopResponse) -> String {
    format!("Room {}: {}\n", room_id, response.message)
}

pub fn format_commit(room_id: i64) -> String {
    format!("Room {} committed\n", room_id)
}

/// Per-step detail of a failed start or stop
pub fn format_steps(steps: &[StepView]) -> String {
    let headers = &["WORKLOAD", "REPLICAS", "STATUS", "ERROR"];
    let rows = steps
        .iter()
        .map(|s| {
            vec![
                s.workload.clone(),
                s.replicas.to_string(),
                s.status.clone(),
                s.error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    format_table(headers, rows)
}

// ============================================================================
// Render display
// ============================================================================

/// Summary table followed by every rendered document
pub fn format_render(set: &WorkloadSet) -> String {
    let headers = &["NAME", "KIND"];
    let rows = set
        .descriptors()
        .map(|d| {
            let kind = if d.is_scalable() {
                "Deployment"
            } else {
                "Service"
            };
            vec![d.name.clone(), kind.to_string()]
        })
        .collect();

    let mut output = format!("# room {} on port {}\n", set.room_uuid, set.port);
    for line in format_table(headers, rows).lines() {
        output.push_str("# ");
        output.push_str(line);
        output.push('\n');
    }
    output.push_str(&set.to_multi_document());
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ManifestGenerator, ProviderRef};
    use uuid::Uuid;

    #[test]
    fn test_format_table() {
        let headers = &["name", "value"];
        let rows = vec![
            vec!["a".to_string(), "1".to_string()],
            vec!["longer".to_string(), "2".to_string()],
        ];
        let output = format_table(headers, rows);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "NAME     VALUE");
        assert_eq!(lines[1], "a        1");
        assert_eq!(lines[2], "longer   2");
    }

    #[test]
    fn test_format_table_empty() {
        let output = format_table(&["name"], vec![]);
        assert_eq!(output, "No resources found.\n");
    }

    #[test]
    fn test_format_steps() {
        let steps = vec![StepView {
            workload: "abc-consumer".into(),
            replicas: 1,
            status: "compensated".into(),
            error: None,
        }];
        let output = format_steps(&steps);
        assert!(output.contains("abc-consumer"));
        assert!(output.contains("compensated"));
    }

    #[test]
    fn test_format_render() {
        let generator = ManifestGenerator::builtin().unwrap();
        let set = generator
            .render_workload_set(
                &Uuid::nil(),
                8001,
                &[],
                &[ProviderRef::new("spo2", Uuid::nil())],
            )
            .unwrap();

        let output = format_render(&set);
        assert!(output.starts_with("# room 00000000-0000-0000-0000-000000000000 on port 8001"));
        assert!(output.contains("Service"));
        assert!(output.contains("kind: Deployment"));
    }
}
