use anyhow::{anyhow, bail, Context, Result};
use calamine::{Data, Range, Reader, Xlsx};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::Path;

/// In-memory tabular data: an ordered list of unique column names and rows
/// of scalar cells. Every row has exactly one cell per column, in column
/// order. Cells are JSON scalars (null, bool, number, string); non-finite
/// floats are represented as null so serialization never emits `NaN` or
/// `Infinity` tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Dataset {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for col in &columns {
            if !seen.insert(col.as_str()) {
                bail!("duplicate column name: {col}");
            }
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                bail!(
                    "row {} has {} cells, expected {}",
                    i,
                    row.len(),
                    columns.len()
                );
            }
        }
        Ok(Self { columns, rows })
    }

    /// Build a one-column table from a list of values, preserving the
    /// column name of whatever the values were taken from.
    pub fn single_column(name: &str, values: Vec<Value>) -> Self {
        Self {
            columns: vec![name.to_string()],
            rows: values.into_iter().map(|v| vec![v]).collect(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First `n` rows as a new dataset.
    pub fn head(&self, n: usize) -> Dataset {
        Dataset {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Parse CSV bytes. The first record is the header row; cells are
    /// inferred as integer, float, or string, with empty cells as null.
    pub fn from_csv_bytes(bytes: &[u8]) -> Result<Dataset> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(bytes);
        let columns: Vec<String> = rdr
            .headers()
            .context("failed to read CSV header")?
            .iter()
            .map(|h| h.to_string())
            .collect();
        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record.context("failed to read CSV record")?;
            rows.push(record.iter().map(parse_cell).collect());
        }
        Dataset::new(columns, rows)
    }

    /// Parse the first worksheet of an XLSX workbook.
    pub fn from_xlsx_bytes(bytes: &[u8]) -> Result<Dataset> {
        let mut workbook =
            Xlsx::new(Cursor::new(bytes)).context("failed to open workbook")?;
        let sheet = workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("workbook has no sheets"))?;
        let range = workbook
            .worksheet_range(&sheet)
            .with_context(|| format!("failed to read sheet {sheet}"))?;
        Dataset::from_sheet_range(&range)
    }

    /// Load from a file path, dispatching on extension. CSV and XLSX are
    /// supported everywhere; legacy XLS works here because the format can
    /// be sniffed from the file.
    pub fn from_path(path: &Path) -> Result<Dataset> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "csv" => {
                let bytes = fs_err::read(path)?;
                Dataset::from_csv_bytes(&bytes)
            }
            "xlsx" | "xls" => {
                let mut workbook = calamine::open_workbook_auto(path)
                    .context("failed to open workbook")?;
                let sheet = workbook
                    .sheet_names()
                    .first()
                    .cloned()
                    .ok_or_else(|| anyhow!("workbook has no sheets"))?;
                let range = workbook
                    .worksheet_range(&sheet)
                    .with_context(|| format!("failed to read sheet {sheet}"))?;
                Dataset::from_sheet_range(&range)
            }
            other => bail!("unsupported file extension: {other:?}"),
        }
    }

    fn from_sheet_range(range: &Range<Data>) -> Result<Dataset> {
        let mut iter = range.rows();
        let header = match iter.next() {
            Some(h) => h,
            None => return Dataset::new(vec![], vec![]),
        };
        let columns: Vec<String> = header.iter().map(cell_header).collect();
        let mut rows = Vec::new();
        for row in iter {
            let mut cells: Vec<Value> = row.iter().map(sheet_cell).collect();
            // Trailing blank cells are common in spreadsheets; pad or trim
            // to the header width.
            cells.resize(columns.len(), Value::Null);
            rows.push(cells);
        }
        Dataset::new(columns, rows)
    }

    /// Serialize as CSV text with a header row. Null cells become empty
    /// fields.
    pub fn to_csv_string(&self) -> Result<String> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record(&self.columns)?;
        for row in &self.rows {
            wtr.write_record(row.iter().map(cell_to_string))?;
        }
        let bytes = wtr
            .into_inner()
            .map_err(|e| anyhow!("failed to flush CSV writer: {e}"))?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_json_rows(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let mut obj = serde_json::Map::new();
                for (col, cell) in self.columns.iter().zip(row) {
                    obj.insert(col.clone(), cell.clone());
                }
                Value::Object(obj)
            })
            .collect()
    }

    /// Occurrence counts for one column, most frequent first. The result
    /// has the original column plus a `Count` column.
    pub fn value_counts(&self, column: &str) -> Result<Dataset> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| anyhow!("unknown column: {column}"))?;
        let mut order: Vec<Value> = Vec::new();
        let mut counts: HashMap<String, i64> = HashMap::new();
        for row in &self.rows {
            let key = row[idx].to_string();
            if !counts.contains_key(&key) {
                order.push(row[idx].clone());
            }
            *counts.entry(key).or_insert(0) += 1;
        }
        let mut pairs: Vec<(Value, i64)> = order
            .into_iter()
            .map(|v| {
                let n = counts[&v.to_string()];
                (v, n)
            })
            .collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1));
        Dataset::new(
            vec![column.to_string(), "Count".to_string()],
            pairs
                .into_iter()
                .map(|(v, n)| vec![v, Value::from(n)])
                .collect(),
        )
    }

    /// Whether any value in the column occurs more than once.
    pub fn column_has_duplicates(&self, column: &str) -> Result<bool> {
        let counts = self.value_counts(column)?;
        Ok(counts
            .rows
            .iter()
            .any(|row| row[1].as_i64().unwrap_or(0) > 1))
    }
}

/// Lift an f64 into a JSON scalar, mapping NaN and infinities to null.
pub(crate) fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn parse_cell(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return float_value(f);
    }
    Value::String(raw.to_string())
}

fn cell_header(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

fn sheet_cell(cell: &Data) -> Value {
    match cell {
        Data::String(s) => Value::String(s.clone()),
        Data::Float(f) => float_value(*f),
        Data::Int(i) => Value::from(*i),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(d) => Value::String(d.to_string()),
        Data::DateTimeIso(d) => Value::String(d.clone()),
        Data::DurationIso(d) => Value::String(d.clone()),
        Data::Error(_) | Data::Empty => Value::Null,
    }
}

fn cell_to_string(cell: &Value) -> String {
    match cell {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Dataset {
        Dataset::new(
            vec!["id".into(), "name".into()],
            vec![
                vec![json!(1), json!("a")],
                vec![json!(1), json!("b")],
                vec![json!(2), json!("c")],
            ],
        )
        .unwrap()
    }

    #[test]
    fn csv_round_trip() {
        let csv = "id,name\n1,a\n1,b\n2,c\n";
        let ds = Dataset::from_csv_bytes(csv.as_bytes()).unwrap();
        assert_eq!(ds, sample());
        assert_eq!(ds.to_csv_string().unwrap(), csv);
    }

    #[test]
    fn rejects_duplicate_columns() {
        assert!(Dataset::new(vec!["a".into(), "a".into()], vec![]).is_err());
    }

    #[test]
    fn rejects_ragged_rows() {
        assert!(Dataset::new(vec!["a".into()], vec![vec![json!(1), json!(2)]]).is_err());
    }

    #[test]
    fn empty_cells_are_null() {
        let ds = Dataset::from_csv_bytes("a,b\n1,\n".as_bytes()).unwrap();
        assert_eq!(ds.rows()[0][1], Value::Null);
    }

    #[test]
    fn non_finite_floats_become_null() {
        let ds = Dataset::from_csv_bytes("a,b\ninf,NaN\n".as_bytes()).unwrap();
        assert_eq!(ds.rows()[0][0], Value::Null);
        assert_eq!(ds.rows()[0][1], Value::Null);
        // And they serialize as empty fields, never as literal tokens.
        assert_eq!(ds.to_csv_string().unwrap(), "a,b\n,\n");
        assert_eq!(float_value(f64::NEG_INFINITY), Value::Null);
    }

    #[test]
    fn value_counts_orders_by_frequency() {
        let counts = sample().value_counts("id").unwrap();
        assert_eq!(counts.columns(), &["id".to_string(), "Count".to_string()]);
        assert_eq!(counts.rows()[0], vec![json!(1), json!(2)]);
        assert_eq!(counts.rows()[1], vec![json!(2), json!(1)]);
    }

    #[test]
    fn duplicate_detection() {
        let ds = sample();
        assert!(ds.column_has_duplicates("id").unwrap());
        assert!(!ds.column_has_duplicates("name").unwrap());
    }

    #[test]
    fn head_truncates() {
        assert_eq!(sample().head(2).row_count(), 2);
        assert_eq!(sample().head(10).row_count(), 3);
    }

    #[test]
    fn json_rows_carry_column_names() {
        let rows = sample().to_json_rows();
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["name"], json!("a"));
    }
}
