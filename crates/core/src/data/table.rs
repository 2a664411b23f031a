//! Column-oriented table of optional string cells

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Article column
pub const CONTENT: &str = "content";
/// Target summary column
pub const REFERENCE_SUMMARY: &str = "reference_summary";
/// Derived prompt column
pub const PROMPT: &str = "prompt";

/// One article/summary pair
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    /// Article text
    pub content: String,

    /// Target summary
    pub reference_summary: String,
}

impl Example {
    /// Create a new example
    pub fn new(content: impl Into<String>, reference_summary: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reference_summary: reference_summary.into(),
        }
    }
}

/// Tabular tuning data.
///
/// Cells are `None` where the source had no value (an empty spreadsheet cell or a
/// JSON `null`), so rows can be dropped the way a dataframe `dropna` would.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TuningTable {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl TuningTable {
    /// Create an empty table with the given columns
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a `content`/`reference_summary` table from examples
    pub fn from_examples(examples: &[Example]) -> Self {
        let mut table = Self::new(vec![CONTENT.to_string(), REFERENCE_SUMMARY.to_string()]);
        for example in examples {
            table.rows.push(vec![
                Some(example.content.clone()),
                Some(example.reference_summary.clone()),
            ]);
        }
        table
    }

    /// Append a row; its width must match the number of columns
    pub fn push_row(&mut self, row: Vec<Option<String>>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::Validation(format!(
                "Row has {} cells but the table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Column names, in order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the table has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name).ok_or_else(|| {
            Error::Validation(format!(
                "Missing column '{}' (available: {:?})",
                name, self.columns
            ))
        })
    }

    /// Cell value at `row` in column `name`
    pub fn cell(&self, row: usize, name: &str) -> Option<&str> {
        let idx = self.column_index(name)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    /// All values of one column
    pub fn column(&self, name: &str) -> Result<Vec<Option<&str>>> {
        let idx = self.require_column(name)?;
        Ok(self.rows.iter().map(|r| r[idx].as_deref()).collect())
    }

    /// Replace a column's values, appending the column if it does not exist yet
    pub fn set_column(&mut self, name: &str, values: Vec<Option<String>>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(Error::Validation(format!(
                "Column '{}' has {} values but the table has {} rows",
                name,
                values.len(),
                self.rows.len()
            )));
        }

        match self.column_index(name) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                self.columns.push(name.to_string());
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
        Ok(())
    }

    /// Project onto the named columns, in the given order
    pub fn select(&self, names: &[&str]) -> Result<TuningTable> {
        let indices = names
            .iter()
            .map(|n| self.require_column(n))
            .collect::<Result<Vec<_>>>()?;

        Ok(TuningTable {
            columns: names.iter().map(|n| n.to_string()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| indices.iter().map(|&i| r[i].clone()).collect())
                .collect(),
        })
    }

    /// The last `n` rows (all rows if `n` exceeds the length)
    pub fn tail(&self, n: usize) -> TuningTable {
        let start = self.rows.len().saturating_sub(n);
        TuningTable {
            columns: self.columns.clone(),
            rows: self.rows[start..].to_vec(),
        }
    }

    /// Rows that have a value in every column
    pub fn drop_missing(&self) -> TuningTable {
        TuningTable {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|r| r.iter().all(Option::is_some))
                .cloned()
                .collect(),
        }
    }

    /// Typed view over the `content`/`reference_summary` columns
    pub fn examples(&self) -> Result<Vec<Example>> {
        let content = self.require_column(CONTENT)?;
        let summary = self.require_column(REFERENCE_SUMMARY)?;

        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| match (&row[content], &row[summary]) {
                (Some(c), Some(s)) => Ok(Example::new(c.clone(), s.clone())),
                _ => Err(Error::Validation(format!(
                    "Row {} is missing '{}' or '{}'",
                    i, CONTENT, REFERENCE_SUMMARY
                ))),
            })
            .collect()
    }
}
