use std::collections::BTreeSet;
use std::path::Path;

use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::cli::OutputFormat;
use crate::incremental::UpdateReport;
use crate::store::StoreCounts;

/// Render query rows in the requested format.
///
/// Columns are the union of row keys in first-seen order (later rows may add
/// keys); missing cells render empty.
pub fn print_rows(rows: &[JsonMap<String, JsonValue>], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            match serde_json::to_string_pretty(rows) {
                Ok(s) => println!("{}", s),
                Err(e) => eprintln!("error serialising rows: {}", e),
            }
        }
        OutputFormat::Table => print_table(rows),
        OutputFormat::Csv => print_csv(rows),
    }
}

fn columns(rows: &[JsonMap<String, JsonValue>]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.clone()) {
                out.push(key.clone());
            }
        }
    }
    out
}

fn cell(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn print_table(rows: &[JsonMap<String, JsonValue>]) {
    if rows.is_empty() {
        println!("(no rows)");
        return;
    }
    let columns = columns(rows);
    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    let rendered: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(i, col)| {
                    let text = cell(row.get(col));
                    widths[i] = widths[i].max(text.len());
                    text
                })
                .collect()
        })
        .collect();

    let header: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{:<width$}", c, width = widths[i]))
        .collect();
    println!("{}", header.join("  "));
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    println!("{}", rule.join("  "));
    for row in rendered {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, text)| format!("{:<width$}", text, width = widths[i]))
            .collect();
        println!("{}", line.join("  ").trim_end());
    }
}

fn csv_escape(text: &str) -> String {
    if text.contains([',', '"', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_owned()
    }
}

fn print_csv(rows: &[JsonMap<String, JsonValue>]) {
    let columns = columns(rows);
    println!(
        "{}",
        columns
            .iter()
            .map(|c| csv_escape(c))
            .collect::<Vec<_>>()
            .join(",")
    );
    for row in rows {
        let line: Vec<String> = columns
            .iter()
            .map(|col| csv_escape(&cell(row.get(col))))
            .collect();
        println!("{}", line.join(","));
    }
}

/// Print the `update` summary.
///
/// Per-file parse diagnostics go to stderr so stdout stays clean for
/// downstream consumers.
pub fn print_update_summary(report: &UpdateReport, elapsed_secs: f64) {
    let mode = if report.full { " (full)" } else { "" };
    println!(
        "Updated{} in {:.2}s: {} added, {} modified, {} deleted, {} unchanged",
        mode, elapsed_secs, report.added, report.modified, report.deleted, report.unchanged
    );
    println!(
        "  {} files parsed, {} skipped, {} entities, {} relationships",
        report.extract.files_parsed,
        report.extract.files_skipped,
        report.entities_written,
        report.relationships_written
    );
    println!(
        "  Resolution: {} resolved, {} external, {} dropped",
        report.extract.resolution.resolved,
        report.extract.resolution.external,
        report.extract.resolution.dropped
    );
    if report.rounds > 1 {
        println!("  {} reconciliation rounds", report.rounds);
    }
    if report.orphan_externals_removed > 0 {
        println!("  {} orphan externals removed", report.orphan_externals_removed);
    }
    if report.canceled {
        eprintln!("  update canceled before completion");
    }
    if report.extract.parse_errors > 0 {
        eprintln!("  {} files had parse errors:", report.extract.parse_errors);
        for diagnostic in &report.extract.diagnostics {
            eprintln!(
                "    {}:{}:{}: {}",
                diagnostic.path.display(),
                diagnostic.line,
                diagnostic.column,
                diagnostic.message
            );
        }
    }
    if report.row_failures > 0 {
        eprintln!("  {} rows failed to write", report.row_failures);
    }
    for kind in &report.unknown_kinds {
        eprintln!("  entity kind '{}' is not declared in the store schema", kind);
    }
}

/// Print `status` output: per-kind counts plus store health.
pub fn print_status(
    counts: &StoreCounts,
    store_dir: &Path,
    schema_version: u32,
    tracked_files: usize,
    json: bool,
) {
    if json {
        let payload = serde_json::json!({
            "store": store_dir.display().to_string(),
            "schema_version": schema_version,
            "tracked_files": tracked_files,
            "entities": counts.entities,
            "relationships": counts.relationships,
            "total_entities": counts.total_entities(),
            "total_relationships": counts.total_relationships(),
        });
        match serde_json::to_string_pretty(&payload) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("error serialising status: {}", e),
        }
        return;
    }

    println!("Store: {}", store_dir.display());
    println!("Schema version: {}", schema_version);
    println!("Tracked files: {}", tracked_files);
    println!(
        "Entities: {} total",
        counts.total_entities()
    );
    for (kind, count) in &counts.entities {
        println!("  {:<20} {}", kind, count);
    }
    println!("Relationships: {} total", counts.total_relationships());
    for (kind, count) in &counts.relationships {
        println!("  {:<28} {}", kind, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_escaping() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_columns_union_preserves_order() {
        let mut a = JsonMap::new();
        a.insert("name".into(), JsonValue::String("f".into()));
        let mut b = JsonMap::new();
        b.insert("name".into(), JsonValue::String("g".into()));
        b.insert("kind".into(), JsonValue::String("Function".into()));
        assert_eq!(columns(&[a, b]), vec!["name".to_owned(), "kind".to_owned()]);
    }
}
