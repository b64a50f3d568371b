//! Table Metadata Format
//!
//! The serialized table structure stored under `<root>/metadata` when the
//! table is created. Every replica compares this node byte-for-byte with
//! its own configuration's serialized form before participating.

use crate::config::TableSchema;
use crate::error::{Error, Result};

/// Serialize a schema to the version-1 metadata text.
pub fn metadata_text(schema: &TableSchema) -> String {
    let mut out = String::new();
    out.push_str("metadata format version: 1\n");
    out.push_str(&format!("date column: {}\n", schema.date_column));
    out.push_str(&format!(
        "sampling expression: {}\n",
        schema.sampling_expression
    ));
    out.push_str(&format!("index granularity: {}\n", schema.index_granularity));
    out.push_str(&format!("mode: {}\n", schema.mode));
    out.push_str(&format!("sign column: {}\n", schema.sign_column));
    out.push_str(&format!("primary key: {}\n", schema.primary_key));
    out.push_str("columns:\n");
    for column in &schema.columns {
        out.push_str(&format!("`{}` {}\n", column.name, column.type_name));
    }
    out
}

/// Assert that `found` (the coordinator's metadata) matches the local
/// schema character for character. Column-name divergence is reported
/// separately since it usually means the table was created with a
/// different column set.
pub fn check_metadata(schema: &TableSchema, found: &str) -> Result<()> {
    let expected = metadata_text(schema);
    if expected == found {
        return Ok(());
    }

    for (expected_line, found_line) in expected.lines().zip(found.lines()) {
        if expected_line == found_line {
            continue;
        }
        if let (Some(expected_name), Some(found_name)) =
            (column_name(expected_line), column_name(found_line))
        {
            if expected_name != found_name {
                return Err(Error::UnknownColumn {
                    expected: expected_name.to_string(),
                    found: found_name.to_string(),
                });
            }
        }
        return Err(Error::MetadataMismatch {
            found: format!("expected line {expected_line:?}, found {found_line:?}"),
        });
    }

    Err(Error::MetadataMismatch {
        found: "metadata lengths differ".to_string(),
    })
}

fn column_name(line: &str) -> Option<&str> {
    line.strip_prefix('`')?.split('`').next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnDef;

    fn schema() -> TableSchema {
        TableSchema {
            name: "hits".into(),
            coordinator_path: "/wolftable/hits".into(),
            date_column: "event_date".into(),
            sampling_expression: "".into(),
            index_granularity: 8192,
            mode: 0,
            sign_column: "".into(),
            primary_key: "(counter_id, event_date)".into(),
            columns: vec![
                ColumnDef {
                    name: "event_date".into(),
                    type_name: "Date".into(),
                },
                ColumnDef {
                    name: "counter_id".into(),
                    type_name: "UInt32".into(),
                },
            ],
        }
    }

    #[test]
    fn test_format() {
        assert_eq!(
            metadata_text(&schema()),
            "metadata format version: 1\n\
             date column: event_date\n\
             sampling expression: \n\
             index granularity: 8192\n\
             mode: 0\n\
             sign column: \n\
             primary key: (counter_id, event_date)\n\
             columns:\n\
             `event_date` Date\n\
             `counter_id` UInt32\n"
        );
    }

    #[test]
    fn test_check_accepts_own_serialization() {
        let schema = schema();
        check_metadata(&schema, &metadata_text(&schema)).unwrap();
    }

    #[test]
    fn test_check_rejects_divergence() {
        let mut other = schema();
        other.index_granularity = 1024;
        let result = check_metadata(&schema(), &metadata_text(&other));
        assert!(matches!(result, Err(Error::MetadataMismatch { .. })));
    }

    #[test]
    fn test_check_reports_column_name_divergence() {
        let mut other = schema();
        other.columns[1].name = "visitor_id".into();
        let result = check_metadata(&schema(), &metadata_text(&other));
        match result {
            Err(Error::UnknownColumn { expected, found }) => {
                assert_eq!(expected, "counter_id");
                assert_eq!(found, "visitor_id");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
