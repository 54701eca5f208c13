//! Marshaled query results: copied column names, binary-safe copied cells.

use crate::error::{MysqlError, MysqlResult};

/// One fetched row. NULL cells are absent values.
#[derive(Debug, Clone, Default)]
pub struct Row {
    values: Vec<Option<Vec<u8>>>,
}

impl Row {
    pub(crate) fn new(values: Vec<Option<Vec<u8>>>) -> Self {
        Row { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw cell bytes; `None` for NULL.
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    pub fn get_str(&self, index: usize) -> MysqlResult<Option<&str>> {
        match self.values.get(index) {
            None => Err(MysqlError::TypeConversion(format!(
                "column index {index} out of range"
            ))),
            Some(None) => Ok(None),
            Some(Some(bytes)) => std::str::from_utf8(bytes)
                .map(Some)
                .map_err(|_| MysqlError::TypeConversion("invalid UTF-8".into())),
        }
    }

    pub fn get_i64(&self, index: usize) -> MysqlResult<Option<i64>> {
        match self.get_str(index)? {
            None => Ok(None),
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|_| MysqlError::TypeConversion(format!("not an integer: {text}"))),
        }
    }
}

/// Full result of one query. For statements without a result set only
/// `affected_rows` is populated.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub column_names: Vec<String>,
    pub rows: Vec<Row>,
    pub affected_rows: u64,
}

impl QueryResult {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c == name)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&[u8]> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }
}
