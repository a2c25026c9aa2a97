use crate::error::Result;
use csv::ReaderBuilder;
use log::debug;
use std::io::Read;
use std::path::Path;

/// Cell values read as missing: the default missing-value markers of common
/// dataframe CSV readers.
const NA_TOKENS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// A transaction export as read from disk: a header and string cells, with
/// missing cells already resolved to `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl RawTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self { columns, rows }
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);

        let columns: Vec<String> = rdr
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let mut row: Vec<Option<String>> = record.iter().map(clean_cell).collect();
            row.resize(columns.len(), None);
            rows.push(row);
        }

        debug!("Read {} rows across {} columns", rows.len(), columns.len());

        Ok(Self { columns, rows })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_csv_str(text: &str) -> Result<Self> {
        Self::from_reader(text.as_bytes())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn clean_cell(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if NA_TOKENS.contains(&trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}
