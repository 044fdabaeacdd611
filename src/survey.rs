use crate::atomic::write_atomically;
use crate::error::{Result, TrackerError};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl Cell {
    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Cell::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Parse a raw text cell: blanks and `NaN` are missing, numbers are numbers.
    pub fn parse(raw: &str) -> Cell {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
            return Cell::Empty;
        }
        match trimmed.parse::<f64>() {
            Ok(n) if !n.is_nan() => Cell::Number(n),
            _ => Cell::Text(raw.to_string()),
        }
    }

    fn from_data(data: &Data) -> Cell {
        match data {
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Float(f) if f.is_nan() => Cell::Empty,
            Data::Float(f) => Cell::Number(*f),
            Data::String(s) if s.trim().is_empty() => Cell::Empty,
            Data::String(s) => Cell::Text(s.clone()),
            Data::Bool(b) => Cell::Text(b.to_string()),
            Data::DateTime(dt) => dt.as_datetime().map(Cell::Timestamp).unwrap_or(Cell::Empty),
            Data::DateTimeIso(s) => parse_timestamp(s)
                .map(Cell::Timestamp)
                .unwrap_or_else(|| Cell::Text(s.clone())),
            Data::DurationIso(s) => Cell::Text(s.clone()),
            Data::Error(_) | Data::Empty => Cell::Empty,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Empty => Ok(()),
            Cell::Number(n) => write!(f, "{}", n),
            Cell::Text(s) => f.write_str(s),
            Cell::Timestamp(ts) => write!(f, "{}", ts.format(TIMESTAMP_FORMAT)),
        }
    }
}

/// Submission timestamps as exported by survey tools, with or without an offset.
/// Offsets are dropped and the wall-clock time is kept, so a submission is
/// counted on the day the enumerator saw.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// Survey responses, one row per submission, read-only once loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurveyTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl SurveyTable {
    pub fn new(headers: Vec<String>, mut rows: Vec<Vec<Cell>>) -> Self {
        for row in &mut rows {
            row.resize(headers.len(), Cell::Empty);
        }
        Self { headers, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| TrackerError::MissingColumn(name.to_string()))
    }

    pub fn column(&self, index: usize) -> impl Iterator<Item = &Cell> {
        self.rows.iter().map(move |row| &row[index])
    }

    /// Set or add a column; `values` must hold one cell per row.
    pub fn set_column(&mut self, name: &str, values: Vec<Cell>) {
        let index = match self.column_index(name) {
            Some(index) => index,
            None => {
                self.headers.push(name.to_string());
                for row in &mut self.rows {
                    row.push(Cell::Empty);
                }
                self.headers.len() - 1
            }
        };
        for (row, value) in self.rows.iter_mut().zip(values) {
            row[index] = value;
        }
    }

    /// Rows whose `column` holds exactly `value`.
    pub fn filter_equals(&self, column: usize, value: &str) -> SurveyTable {
        let rows = self
            .rows
            .iter()
            .filter(|row| row[column].to_string() == value)
            .cloned()
            .collect();
        SurveyTable {
            headers: self.headers.clone(),
            rows,
        }
    }

    pub fn without_rows(&self, drop: &BTreeSet<usize>) -> SurveyTable {
        let rows = self
            .rows
            .iter()
            .enumerate()
            .filter(|(i, _)| !drop.contains(i))
            .map(|(_, row)| row.clone())
            .collect();
        SurveyTable {
            headers: self.headers.clone(),
            rows,
        }
    }

    /// Turn parseable text in `column` into timestamps.
    fn coerce_timestamps(&mut self, column: usize) {
        for row in &mut self.rows {
            if let Cell::Text(raw) = &row[column] {
                if let Some(ts) = parse_timestamp(raw) {
                    row[column] = Cell::Timestamp(ts);
                }
            }
        }
    }
}

/// Load the survey from a spreadsheet sheet, or from a CSV export.
pub fn load_survey(path: &Path, sheet_name: &str, time_column: &str) -> Result<SurveyTable> {
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    let mut table = if is_csv {
        read_csv_survey(File::open(path)?)?
    } else {
        read_workbook(path, sheet_name)?
    };

    if let Some(index) = table.column_index(time_column) {
        table.coerce_timestamps(index);
    }
    info!(
        path = %path.display(),
        rows = table.len(),
        columns = table.headers.len(),
        "loaded survey responses"
    );
    Ok(table)
}

pub fn read_csv_survey<R: Read>(reader: R) -> Result<SurveyTable> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();

    let mut rows: Vec<Vec<Cell>> = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(Cell::parse).collect());
    }
    Ok(SurveyTable::new(headers, rows))
}

fn read_workbook(path: &Path, sheet_name: &str) -> Result<SurveyTable> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| TrackerError::Spreadsheet(e.to_string()))?;
    if !workbook.sheet_names().iter().any(|name| name == sheet_name) {
        return Err(TrackerError::MissingSheet(sheet_name.to_string()));
    }

    let range = workbook
        .worksheet_range(sheet_name)
        .map_err(|e| TrackerError::Spreadsheet(e.to_string()))?;
    let mut rows_iter = range.rows();

    let headers: Vec<String> = match rows_iter.next() {
        Some(row) => row.iter().map(|cell| cell.to_string()).collect(),
        None => return Ok(SurveyTable::default()),
    };
    let rows: Vec<Vec<Cell>> = rows_iter
        .map(|row| row.iter().map(Cell::from_data).collect::<Vec<_>>())
        .collect();

    debug!(sheet = sheet_name, "read survey worksheet");
    Ok(SurveyTable::new(headers, rows))
}

/// Write `table` as CSV to `destination`, refusing to touch the survey source.
pub fn export_table(table: &SurveyTable, destination: &Path, source: &Path) -> Result<PathBuf> {
    if same_file(destination, source) {
        return Err(TrackerError::SourceOverwrite(source.to_path_buf()));
    }

    write_atomically(destination, |w| {
        let mut writer = csv::Writer::from_writer(w);
        writer.write_record(&table.headers)?;
        for row in &table.rows {
            writer.write_record(row.iter().map(|cell| cell.to_string()))?;
        }
        writer.flush()?;
        Ok(())
    })?;
    info!(path = %destination.display(), rows = table.len(), "exported survey table");
    Ok(destination.to_path_buf())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SAMPLE: &str = "_submission_time,2B. Name of Enumerator ,4A. Acres,Comment\n\
                          2025-01-16T09:12:33,Amina,2,ok\n\
                          2025-01-16 10:00:00,Brian,,NaN\n\
                          not a time,Amina,3.5,No maize\n";

    #[test]
    fn csv_cells_are_typed() {
        let table = read_csv_survey(SAMPLE.as_bytes()).unwrap();

        assert_eq!(table.headers[1], "2B. Name of Enumerator ");
        assert_eq!(table.rows[0][2], Cell::Number(2.0));
        assert_eq!(table.rows[1][2], Cell::Empty);
        assert_eq!(table.rows[1][3], Cell::Empty);
        assert_eq!(table.rows[2][3], Cell::Text("No maize".to_string()));
    }

    #[test]
    fn submission_column_is_coerced_to_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("survey.csv");
        fs::write(&path, SAMPLE).unwrap();

        let table = load_survey(&path, "ignored", "_submission_time").unwrap();

        let expected = NaiveDate::from_ymd_opt(2025, 1, 16)
            .unwrap()
            .and_hms_opt(9, 12, 33)
            .unwrap();
        assert_eq!(table.rows[0][0], Cell::Timestamp(expected));
        assert!(matches!(table.rows[1][0], Cell::Timestamp(_)));
        assert_eq!(table.rows[2][0], Cell::Text("not a time".to_string()));
    }

    #[test]
    fn short_rows_are_padded() {
        let table = read_csv_survey("a,b,c\n1\n".as_bytes()).unwrap();
        assert_eq!(table.rows[0], vec![Cell::Number(1.0), Cell::Empty, Cell::Empty]);
    }

    #[test]
    fn timestamps_accept_offsets_and_dates() {
        assert!(parse_timestamp("2025-01-16T09:12:33.120+03:00").is_some());
        assert!(parse_timestamp("2025-01-16").is_some());
        assert!(parse_timestamp("16/01/2025 09:12").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn offset_timestamps_keep_their_wall_clock_day() {
        let parsed = parse_timestamp("2025-01-16T01:30:00+03:00").unwrap();
        let expected = NaiveDate::from_ymd_opt(2025, 1, 16)
            .unwrap()
            .and_hms_opt(1, 30, 0)
            .unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2025, 1, 16).unwrap());
    }

    #[test]
    fn export_refuses_to_overwrite_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("survey.csv");
        fs::write(&source, SAMPLE).unwrap();
        let table = read_csv_survey(SAMPLE.as_bytes()).unwrap();

        let err = export_table(&table, &source, &source).unwrap_err();

        assert!(matches!(err, TrackerError::SourceOverwrite(_)));
        assert_eq!(fs::read_to_string(&source).unwrap(), SAMPLE);
    }

    #[test]
    fn export_writes_cells_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("survey.csv");
        let target = dir.path().join("cleaned.csv");
        let table = SurveyTable::new(
            vec!["when".to_string(), "n".to_string(), "note".to_string()],
            vec![vec![
                Cell::Timestamp(
                    NaiveDate::from_ymd_opt(2025, 1, 2).unwrap().and_hms_opt(3, 4, 5).unwrap(),
                ),
                Cell::Number(3.0),
                Cell::Empty,
            ]],
        );

        export_table(&table, &target, &source).unwrap();

        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            "when,n,note\n2025-01-02 03:04:05,3,\n"
        );
    }

    #[test]
    fn unreadable_workbook_is_a_spreadsheet_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("survey.xlsx");
        fs::write(&path, b"not a zip").unwrap();

        assert!(matches!(
            load_survey(&path, "Maize P&L Survey", "_submission_time"),
            Err(TrackerError::Spreadsheet(_))
        ));
    }
}
