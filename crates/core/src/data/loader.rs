//! Loading tuning tables from spreadsheets and JSON files

use crate::data::table::TuningTable;
use crate::error::{Error, Result};
use calamine::{open_workbook_auto, Data, Reader};
use serde_json::Value;
use std::path::Path;
use sumtune_utils::get_extension;

/// Supported on-disk formats for tuning data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableFormat {
    /// Excel / OpenDocument workbook, first sheet, header row
    Spreadsheet,
    /// JSON array of records or a column-oriented object
    Json,
    /// One JSON record per line
    JsonLines,
}

impl TableFormat {
    /// Infer the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match get_extension(path)?.as_str() {
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Some(Self::Spreadsheet),
            "json" => Some(Self::Json),
            "jsonl" | "ndjson" => Some(Self::JsonLines),
            _ => None,
        }
    }
}

/// Load a tuning table, choosing the reader from the file extension
pub fn load_table(path: impl AsRef<Path>) -> Result<TuningTable> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::data_loading(path, "file does not exist"));
    }

    let format = TableFormat::from_path(path)
        .ok_or_else(|| Error::data_loading(path, "unsupported file extension"))?;

    let table = match format {
        TableFormat::Spreadsheet => load_spreadsheet(path)?,
        TableFormat::Json => load_json(path)?,
        TableFormat::JsonLines => load_json_lines(path)?,
    };

    tracing::info!(
        "Loaded {} rows with columns {:?} from {}",
        table.len(),
        table.columns(),
        path.display()
    );
    Ok(table)
}

/// Read the first worksheet of a workbook; the first row holds the column names
pub fn load_spreadsheet(path: impl AsRef<Path>) -> Result<TuningTable> {
    let path = path.as_ref();
    let mut workbook =
        open_workbook_auto(path).map_err(|e| Error::data_loading(path, e.to_string()))?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| Error::data_loading(path, "workbook has no worksheets"))?
        .map_err(|e| Error::data_loading(path, e.to_string()))?;

    let mut rows = range.rows();
    let header = rows
        .next()
        .ok_or_else(|| Error::data_loading(path, "worksheet is empty"))?;

    let columns = header
        .iter()
        .enumerate()
        .map(|(i, cell)| cell_value(cell).unwrap_or_else(|| format!("Unnamed: {}", i)))
        .collect();

    let mut table = TuningTable::new(columns);
    for row in rows {
        table.push_row(row.iter().map(cell_value).collect())?;
    }
    Ok(table)
}

fn cell_value(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Read a JSON file holding either an array of records or a column-oriented object
/// (`{"column": {"0": value, ...}}` or `{"column": [value, ...]}`)
pub fn load_json(path: impl AsRef<Path>) -> Result<TuningTable> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let value: Value =
        serde_json::from_str(&text).map_err(|e| Error::data_loading(path, e.to_string()))?;

    match value {
        Value::Array(records) => table_from_records(path, &records),
        Value::Object(columns) => table_from_columns(path, &columns),
        _ => Err(Error::data_loading(path, "expected a JSON array or object")),
    }
}

/// Read newline-delimited JSON records
pub fn load_json_lines(path: impl AsRef<Path>) -> Result<TuningTable> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;

    let records = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str::<Value>(line)
                .map_err(|e| Error::data_loading(path, format!("line {}: {}", i + 1, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    table_from_records(path, &records)
}

fn table_from_records(path: &Path, records: &[Value]) -> Result<TuningTable> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        let object = record
            .as_object()
            .ok_or_else(|| Error::data_loading(path, "every record must be a JSON object"))?;
        for key in object.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }

    let mut table = TuningTable::new(columns.clone());
    for record in records {
        let row = columns
            .iter()
            .map(|c| record.get(c).and_then(json_value))
            .collect();
        table.push_row(row)?;
    }
    Ok(table)
}

fn table_from_columns(path: &Path, columns: &serde_json::Map<String, Value>) -> Result<TuningTable> {
    let mut names = Vec::with_capacity(columns.len());
    let mut values: Vec<Vec<Option<String>>> = Vec::with_capacity(columns.len());

    for (name, column) in columns {
        let cells = match column {
            Value::Array(items) => items.iter().map(json_value).collect(),
            Value::Object(indexed) => {
                let mut entries: Vec<(&String, &Value)> = indexed.iter().collect();
                entries.sort_by_key(|(k, _)| k.parse::<u64>().unwrap_or(u64::MAX));
                entries.into_iter().map(|(_, v)| json_value(v)).collect()
            }
            _ => {
                return Err(Error::data_loading(
                    path,
                    format!("column '{}' must be an array or an object", name),
                ))
            }
        };
        names.push(name.clone());
        values.push(cells);
    }

    let num_rows = values.first().map(Vec::len).unwrap_or(0);
    if values.iter().any(|c| c.len() != num_rows) {
        return Err(Error::data_loading(path, "columns have different lengths"));
    }

    let mut table = TuningTable::new(names);
    for i in 0..num_rows {
        table.push_row(values.iter().map(|c| c[i].clone()).collect())?;
    }
    Ok(table)
}

fn json_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::table::{CONTENT, REFERENCE_SUMMARY};

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(TableFormat::from_path(Path::new("a.xlsx")), Some(TableFormat::Spreadsheet));
        assert_eq!(TableFormat::from_path(Path::new("a.JSON")), Some(TableFormat::Json));
        assert_eq!(TableFormat::from_path(Path::new("a.jsonl")), Some(TableFormat::JsonLines));
        assert_eq!(TableFormat::from_path(Path::new("a.csv")), None);
    }

    #[test]
    fn test_missing_file() {
        let err = load_table("/definitely/not/here.xlsx").unwrap_err();
        assert!(matches!(err, Error::DataLoading { .. }));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "data.csv", "content,reference_summary\n");
        assert!(load_table(&path).is_err());
    }

    #[test]
    fn test_invalid_spreadsheet() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "data.xlsx", "this is not a zip archive");
        assert!(load_table(&path).is_err());
    }

    #[test]
    fn test_spreadsheet_header_and_cells() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/articles.xlsx");
        let table = load_table(&path).unwrap();

        assert_eq!(table.columns(), &["id", CONTENT, REFERENCE_SUMMARY, "Unnamed: 3"]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.cell(0, "id"), Some("1"));
        assert_eq!(table.cell(0, CONTENT), Some("wind power grew in norway"));
        assert_eq!(table.cell(0, "Unnamed: 3"), Some("note"));
        assert_eq!(table.cell(1, REFERENCE_SUMMARY), None);
        assert_eq!(table.cell(1, "Unnamed: 3"), None);

        let complete = table.drop_missing();
        assert_eq!(complete.len(), 2);
        assert_eq!(complete.cell(1, REFERENCE_SUMMARY), Some("hydro rose"));

        let examples = table.select(&[CONTENT, REFERENCE_SUMMARY]).unwrap().drop_missing();
        assert_eq!(examples.examples().unwrap().len(), 2);
    }

    #[test]
    fn test_json_records_with_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "summary.json",
            r#"[
                {"content": "A", "reference_summary": "a", "url": "x"},
                {"content": null, "reference_summary": "b"}
            ]"#,
        );

        let table = load_table(&path).unwrap();
        assert_eq!(table.columns(), &[CONTENT, REFERENCE_SUMMARY, "url"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.cell(1, CONTENT), None);
        assert_eq!(table.cell(1, "url"), None);
        assert_eq!(table.drop_missing().len(), 1);
    }

    #[test]
    fn test_json_columns_orient() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "summary.json",
            r#"{"content": {"1": "B", "0": "A", "10": "K"}, "reference_summary": {"0": "a", "1": "b", "10": "k"}}"#,
        );

        let table = load_table(&path).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.cell(0, CONTENT), Some("A"));
        assert_eq!(table.cell(2, REFERENCE_SUMMARY), Some("k"));
    }

    #[test]
    fn test_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "summary.jsonl",
            "{\"content\": \"A\", \"reference_summary\": \"a\"}\n\n{\"content\": \"B\", \"reference_summary\": \"b\"}\n",
        );

        let table = load_table(&path).unwrap();
        assert_eq!(table.examples().unwrap().len(), 2);
    }

    #[test]
    fn test_json_lines_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "summary.jsonl", "{\"content\": \"A\"}\nnot json\n");
        let err = load_table(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
