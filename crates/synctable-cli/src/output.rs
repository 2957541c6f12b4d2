//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde_json::{json, Value};
use synctable_core::{ChangeOrigin, Record, RowKey, Rows};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print every row of a table
    pub fn print_rows(&self, rows: &Rows) {
        match self.format {
            OutputFormat::Human => {
                if rows.is_empty() {
                    println!("No rows.");
                    return;
                }
                for (key, row) in rows {
                    println!("{} | {}", truncate(key.as_str(), 20), compact(row));
                }
                println!("\n{} row(s)", rows.len());
            }
            OutputFormat::Json => {
                let rows: Vec<&Record> = rows.values().collect();
                println!("{}", json!({ "rows": rows }));
            }
            OutputFormat::Quiet => {
                for key in rows.keys() {
                    println!("{}", key);
                }
            }
        }
    }

    /// Print one changed row; `None` means it is gone
    pub fn print_change(&self, key: &RowKey, row: Option<&Record>, origin: ChangeOrigin) {
        let origin = origin_str(origin);
        match self.format {
            OutputFormat::Human => match row {
                Some(row) => println!("[{}] {} = {}", origin, key, compact(row)),
                None => println!("[{}] {} deleted", origin, key),
            },
            OutputFormat::Json => {
                println!(
                    "{}",
                    json!({"key": key.as_str(), "origin": origin, "row": row})
                );
            }
            OutputFormat::Quiet => println!("{}", key),
        }
    }

    /// Print a single record
    pub fn print_record(&self, key: &RowKey, row: Option<&Record>) {
        match self.format {
            OutputFormat::Human => match row {
                Some(row) => println!("{} = {}", key, compact(row)),
                None => println!("{} (no row)", key),
            },
            OutputFormat::Json => {
                println!("{}", json!({"key": key.as_str(), "row": row}));
            }
            OutputFormat::Quiet => println!("{}", key),
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!("{}", json!({"status": "success", "message": message}));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning that should not abort the command
    pub fn warning(&self, message: &str) {
        match self.format {
            OutputFormat::Human => eprintln!("! {}", message),
            OutputFormat::Json => {
                println!("{}", json!({"status": "warning", "message": message}));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn origin_str(origin: ChangeOrigin) -> &'static str {
    match origin {
        ChangeOrigin::Local => "local",
        ChangeOrigin::Remote => "remote",
        ChangeOrigin::Rollback => "rollback",
    }
}

/// One-line JSON rendering of a record
fn compact(row: &Record) -> String {
    Value::Object(row.clone()).to_string()
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééé", 5), "éé...");
    }

    #[test]
    fn test_compact() {
        let row = json!({"id": "t1", "done": true});
        assert_eq!(
            compact(row.as_object().unwrap()),
            r#"{"done":true,"id":"t1"}"#
        );
    }

    #[test]
    fn test_origin_str() {
        assert_eq!(origin_str(ChangeOrigin::Rollback), "rollback");
    }
}
