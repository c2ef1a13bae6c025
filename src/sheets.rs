//! Worksheet abstraction and A1 cell addressing

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::RunConfiguration;

/// Value written into a single cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Text(s) => f.write_str(s),
        }
    }
}

/// An opened worksheet. Rows and columns are 1-based.
pub trait Worksheet {
    /// Values of a column down to its last non-empty cell
    fn col_values(&self, col: u32) -> Result<Vec<String>>;

    fn update_cell(&mut self, row: u32, col: u32, value: CellValue) -> Result<()>;
}

/// Opens the worksheet named by a run configuration
pub trait SheetConnector {
    fn connect(&self, config: &RunConfiguration) -> Result<Box<dyn Worksheet>>;
}

/// Convert column letters (`A`, `z`, `AB`) to a 1-based column index
pub fn column_index(letters: &str) -> Result<u32> {
    let letters = letters.trim();
    if letters.is_empty() {
        anyhow::bail!("Column is empty");
    }

    let mut index: u32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            anyhow::bail!("Invalid column '{}'", letters);
        }
        let digit = (c.to_ascii_uppercase() as u32) - ('A' as u32) + 1;
        index = index
            .checked_mul(26)
            .and_then(|i| i.checked_add(digit))
            .ok_or_else(|| anyhow::anyhow!("Column '{}' is out of range", letters))?;
    }

    Ok(index)
}

/// Convert a 1-based column index back to letters
pub fn column_letters(mut index: u32) -> String {
    let mut letters = Vec::new();
    while index > 0 {
        let rem = (index - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        index = (index - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// A1 notation for a single cell, e.g. `(3, 2)` -> `B3`
pub fn a1_cell(row: u32, col: u32) -> String {
    format!("{}{}", column_letters(col), row)
}
