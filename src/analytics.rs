use crate::error::{Result, TrackerError};
use crate::models::SurveyConfig;
use crate::survey::{self, Cell, SurveyTable};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct EnumeratorActivity {
    pub enumerator: String,
    pub submissions: usize,
    pub first_submission: Option<NaiveDateTime>,
    pub last_submission: Option<NaiveDateTime>,
}

impl EnumeratorActivity {
    pub fn duration(&self) -> Option<Duration> {
        Some(self.last_submission? - self.first_submission?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMissing {
    pub column: String,
    pub missing: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateRow {
    pub row: usize,
    pub submitted_at: String,
    pub enumerator: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingValues,
    InfiniteValues,
    TooFewValues,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::MissingValues => "contains missing values",
            SkipReason::InfiniteValues => "contains infinite values",
            SkipReason::TooFewValues => "fewer than 2 values",
        })
    }
}

/// A numeric column left out of outlier analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedColumn {
    pub column: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutlierHit {
    pub row: usize,
    pub value: f64,
    pub z_score: f64,
    pub enumerator: Option<String>,
    pub submitted_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnOutliers {
    pub column: String,
    pub mean: f64,
    pub std_dev: f64,
    pub hits: Vec<OutlierHit>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutlierReport {
    pub columns: Vec<ColumnOutliers>,
    pub skipped: Vec<SkippedColumn>,
}

impl OutlierReport {
    pub fn total_hits(&self) -> usize {
        self.columns.iter().map(|c| c.hits.len()).sum()
    }

    /// Row indices flagged in any analysed column.
    pub fn flagged_rows(&self) -> BTreeSet<usize> {
        self.columns
            .iter()
            .flat_map(|c| c.hits.iter().map(|hit| hit.row))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumeratorProfile {
    pub activity: EnumeratorActivity,
    pub no_answers: usize,
    pub missing_cells: usize,
    pub outliers: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedTotals {
    /// Added column name and the source columns summed into it.
    pub added: Vec<(String, Vec<String>)>,
    /// Totals whose pattern matched no column.
    pub unmatched: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueRange {
    pub name: String,
    pub columns: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Where the two cleaned survey files went.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedExport {
    pub full: PathBuf,
    pub without_outliers: PathBuf,
    pub dropped_rows: usize,
}

pub const CLEANED_FILE: &str = "cleaned_survey_data.csv";
pub const OUTLIERS_REMOVED_FILE: &str = "cleaned_survey_data_outliers_removed.csv";

pub struct SurveyAnalyzer<'a> {
    config: &'a SurveyConfig,
}

impl<'a> SurveyAnalyzer<'a> {
    pub fn new(config: &'a SurveyConfig) -> Self {
        Self { config }
    }

    /// The whole table, or only the rows of one enumerator.
    pub fn scoped(&self, table: &SurveyTable, enumerator: Option<&str>) -> Result<SurveyTable> {
        match enumerator {
            None => Ok(table.clone()),
            Some(name) => {
                let column = table.require_column(&self.config.enumerator_column)?;
                Ok(table.filter_equals(column, name))
            }
        }
    }

    /// Submission count and first/last submission per enumerator, busiest first.
    pub fn enumerator_activity(&self, table: &SurveyTable) -> Result<Vec<EnumeratorActivity>> {
        let enumerator_col = table.require_column(&self.config.enumerator_column)?;
        let time_col = table.require_column(&self.config.submission_time_column)?;

        let mut by_enumerator: HashMap<String, EnumeratorActivity> = HashMap::new();
        for row in &table.rows {
            if row[enumerator_col].is_missing() {
                continue;
            }
            let name = row[enumerator_col].to_string();
            let submitted = row[time_col].as_timestamp();
            let entry = by_enumerator
                .entry(name.clone())
                .or_insert_with(|| EnumeratorActivity {
                    enumerator: name,
                    submissions: 0,
                    first_submission: None,
                    last_submission: None,
                });
            entry.submissions += 1;
            if let Some(ts) = submitted {
                entry.first_submission = Some(entry.first_submission.map_or(ts, |t| t.min(ts)));
                entry.last_submission = Some(entry.last_submission.map_or(ts, |t| t.max(ts)));
            }
        }

        let mut activity: Vec<EnumeratorActivity> = by_enumerator.into_values().collect();
        activity.sort_by(|a, b| {
            b.submissions
                .cmp(&a.submissions)
                .then_with(|| a.enumerator.cmp(&b.enumerator))
        });
        Ok(activity)
    }

    pub fn low_submission_enumerators<'b>(
        &self,
        activity: &'b [EnumeratorActivity],
    ) -> Vec<&'b EnumeratorActivity> {
        activity
            .iter()
            .filter(|a| a.submissions < self.config.low_submission_threshold)
            .collect()
    }

    /// Submissions per calendar day, including days with none in between.
    pub fn daily_submissions(&self, table: &SurveyTable) -> Result<Vec<(NaiveDate, usize)>> {
        let time_col = table.require_column(&self.config.submission_time_column)?;
        let mut counts: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        for ts in table.column(time_col).filter_map(Cell::as_timestamp) {
            *counts.entry(ts.date()).or_default() += 1;
        }

        let (first, last) = match (counts.keys().next(), counts.keys().next_back()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Ok(Vec::new()),
        };
        Ok(first
            .iter_days()
            .take_while(|day| *day <= last)
            .map(|day| (day, counts.get(&day).copied().unwrap_or(0)))
            .collect())
    }

    pub fn daily_submissions_by_enumerator(
        &self,
        table: &SurveyTable,
    ) -> Result<BTreeMap<NaiveDate, BTreeMap<String, usize>>> {
        let enumerator_col = table.require_column(&self.config.enumerator_column)?;
        let time_col = table.require_column(&self.config.submission_time_column)?;

        let mut counts: BTreeMap<NaiveDate, BTreeMap<String, usize>> = BTreeMap::new();
        for row in &table.rows {
            if let (Some(ts), false) = (row[time_col].as_timestamp(), row[enumerator_col].is_missing()) {
                *counts
                    .entry(ts.date())
                    .or_default()
                    .entry(row[enumerator_col].to_string())
                    .or_default() += 1;
            }
        }
        Ok(counts)
    }

    pub fn missing_data(&self, table: &SurveyTable) -> Vec<ColumnMissing> {
        let rows = table.len();
        table
            .headers
            .iter()
            .enumerate()
            .map(|(index, column)| {
                let missing = table.column(index).filter(|cell| cell.is_missing()).count();
                let percent = if rows == 0 {
                    0.0
                } else {
                    missing as f64 / rows as f64 * 100.0
                };
                ColumnMissing {
                    column: column.clone(),
                    missing,
                    percent,
                }
            })
            .collect()
    }

    /// Columns missing in more than the configured share of rows.
    pub fn critical_missing(&self, missing: &[ColumnMissing]) -> Vec<ColumnMissing> {
        missing
            .iter()
            .filter(|m| m.percent > self.config.critical_missing_percent)
            .cloned()
            .collect()
    }

    /// Missing cells per enumerator, most first.
    pub fn missing_by_enumerator(&self, table: &SurveyTable) -> Result<Vec<(String, usize)>> {
        let enumerator_col = table.require_column(&self.config.enumerator_column)?;
        let mut totals: HashMap<String, usize> = HashMap::new();
        for row in &table.rows {
            if row[enumerator_col].is_missing() {
                continue;
            }
            let missing = row.iter().filter(|cell| cell.is_missing()).count();
            *totals.entry(row[enumerator_col].to_string()).or_default() += missing;
        }

        let mut totals: Vec<(String, usize)> = totals.into_iter().collect();
        totals.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(totals)
    }

    /// Every row whose (submission time, enumerator) pair occurs more than once.
    pub fn duplicates(&self, table: &SurveyTable) -> Result<Vec<DuplicateRow>> {
        let enumerator_col = table.require_column(&self.config.enumerator_column)?;
        let time_col = table.require_column(&self.config.submission_time_column)?;

        let key = |row: &Vec<Cell>| (row[time_col].to_string(), row[enumerator_col].to_string());
        let mut occurrences: HashMap<(String, String), usize> = HashMap::new();
        for row in &table.rows {
            *occurrences.entry(key(row)).or_default() += 1;
        }

        Ok(table
            .rows
            .iter()
            .enumerate()
            .filter(|&(_, row)| occurrences[&key(row)] > 1)
            .map(|(index, row)| {
                let (submitted_at, enumerator) = key(row);
                DuplicateRow {
                    row: index,
                    submitted_at,
                    enumerator,
                }
            })
            .collect())
    }

    /// Columns where every present value is a number. The submission and
    /// enumerator columns are identifiers and never analysed.
    pub fn numeric_columns(&self, table: &SurveyTable) -> Vec<usize> {
        (0..table.headers.len())
            .filter(|index| {
                let name = &table.headers[*index];
                name != &self.config.submission_time_column && name != &self.config.enumerator_column
            })
            .filter(|index| {
                table
                    .column(*index)
                    .all(|cell| matches!(cell, Cell::Number(_) | Cell::Empty))
            })
            .collect()
    }

    /// Per-column z-score outliers using the sample standard deviation.
    pub fn outliers(&self, table: &SurveyTable) -> OutlierReport {
        let enumerator_col = table.column_index(&self.config.enumerator_column);
        let time_col = table.column_index(&self.config.submission_time_column);
        let threshold = self.config.outlier_z_threshold;

        let mut report = OutlierReport::default();
        for index in self.numeric_columns(table) {
            let column = table.headers[index].clone();
            let values: Vec<Option<f64>> = table.column(index).map(Cell::as_number).collect();

            let skip = if values.iter().any(Option::is_none) {
                Some(SkipReason::MissingValues)
            } else if values.iter().flatten().any(|v| v.is_infinite()) {
                Some(SkipReason::InfiniteValues)
            } else if values.len() < 2 {
                Some(SkipReason::TooFewValues)
            } else {
                None
            };
            if let Some(reason) = skip {
                debug!(column = %column, %reason, "skipping column for outlier detection");
                report.skipped.push(SkippedColumn { column, reason });
                continue;
            }

            let values: Vec<f64> = values.into_iter().flatten().collect();
            let (mean, std_dev) = mean_and_sample_std(&values);
            let hits = if std_dev > 0.0 && std_dev.is_finite() {
                values
                    .iter()
                    .enumerate()
                    .filter_map(|(row, value)| {
                        let z_score = (value - mean) / std_dev;
                        (z_score.abs() > threshold).then(|| OutlierHit {
                            row,
                            value: *value,
                            z_score,
                            enumerator: enumerator_col
                                .map(|c| &table.rows[row][c])
                                .filter(|cell| !cell.is_missing())
                                .map(|cell| cell.to_string()),
                            submitted_at: time_col.and_then(|c| table.rows[row][c].as_timestamp()),
                        })
                    })
                    .collect()
            } else {
                Vec::new()
            };

            report.columns.push(ColumnOutliers {
                column,
                mean,
                std_dev,
                hits,
            });
        }

        if !report.skipped.is_empty() {
            warn!(count = report.skipped.len(), "numeric columns skipped for outlier detection");
        }
        report
    }

    /// Timing, "No" answers, missing cells and outliers for one enumerator.
    pub fn enumerator_profile(&self, table: &SurveyTable, enumerator: &str) -> Result<EnumeratorProfile> {
        let scoped = self.scoped(table, Some(enumerator))?;
        let activity = self
            .enumerator_activity(&scoped)?
            .into_iter()
            .next()
            .ok_or_else(|| TrackerError::NotFound(enumerator.to_string()))?;

        let no_answers = scoped
            .rows
            .iter()
            .flatten()
            .filter(|cell| cell.to_string().contains("No"))
            .count();
        let missing_cells = scoped.rows.iter().flatten().filter(|c| c.is_missing()).count();

        Ok(EnumeratorProfile {
            activity,
            no_answers,
            missing_cells,
            outliers: self.present_value_outliers(&scoped),
        })
    }

    /// Outlier count where each column is scored over its present values
    /// only, so a sparse column still contributes.
    fn present_value_outliers(&self, table: &SurveyTable) -> usize {
        self.numeric_columns(table)
            .into_iter()
            .map(|index| {
                let values: Vec<f64> = table
                    .column(index)
                    .filter_map(Cell::as_number)
                    .filter(|v| v.is_finite())
                    .collect();
                count_beyond(&values, self.config.outlier_z_threshold)
            })
            .sum()
    }

    /// Write the full table and the table minus every outlier row into
    /// `output_dir`. A row flagged in several columns is dropped once.
    pub fn export_cleaned(
        &self,
        table: &SurveyTable,
        output_dir: &Path,
        source: &Path,
    ) -> Result<CleanedExport> {
        let report = self.outliers(table);
        let full = survey::export_table(table, &output_dir.join(CLEANED_FILE), source)?;

        let cleaned = table.without_rows(&report.flagged_rows());
        let without_outliers =
            survey::export_table(&cleaned, &output_dir.join(OUTLIERS_REMOVED_FILE), source)?;

        Ok(CleanedExport {
            full,
            without_outliers,
            dropped_rows: table.len() - cleaned.len(),
        })
    }

    /// Append the configured row-wise totals; missing parts count as zero.
    pub fn add_derived_totals(&self, table: &mut SurveyTable) -> Result<DerivedTotals> {
        let mut totals = DerivedTotals::default();
        for total in &self.config.derived_totals {
            let pattern = compile(&total.pattern)?;
            let sources: Vec<usize> = (0..table.headers.len())
                .filter(|i| table.headers[*i] != total.name && pattern.is_match(&table.headers[*i]))
                .collect();
            if sources.is_empty() {
                warn!(total = %total.name, "no survey columns match derived total pattern");
                totals.unmatched.push(total.name.clone());
                continue;
            }

            let values: Vec<Cell> = table
                .rows
                .iter()
                .map(|row| {
                    let sum: f64 = sources.iter().filter_map(|i| row[*i].as_number()).sum();
                    Cell::Number(sum)
                })
                .collect();
            let source_names: Vec<String> = sources.iter().map(|i| table.headers[*i].clone()).collect();
            table.set_column(&total.name, values);
            totals.added.push((total.name.clone(), source_names));
        }
        Ok(totals)
    }

    /// Min and max over every number in the columns matching each range pattern.
    pub fn value_ranges(&self, table: &SurveyTable) -> Result<Vec<ValueRange>> {
        let mut ranges = Vec::new();
        for range in &self.config.value_ranges {
            let pattern = compile(&range.pattern)?;
            let columns: Vec<usize> = (0..table.headers.len())
                .filter(|i| pattern.is_match(&table.headers[*i]))
                .collect();
            let numbers: Vec<f64> = columns
                .iter()
                .flat_map(|i| table.column(*i).filter_map(Cell::as_number))
                .collect();

            ranges.push(ValueRange {
                name: range.name.clone(),
                columns: columns.len(),
                min: numbers.iter().copied().reduce(f64::min),
                max: numbers.iter().copied().reduce(f64::max),
            });
        }
        Ok(ranges)
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| TrackerError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Values with |z| above `threshold`; zero when the spread is degenerate.
fn count_beyond(values: &[f64], threshold: f64) -> usize {
    if values.len() < 2 {
        return 0;
    }
    let (mean, std_dev) = mean_and_sample_std(values);
    if !(std_dev > 0.0 && std_dev.is_finite()) {
        return 0;
    }
    values
        .iter()
        .filter(|&&v| ((v - mean) / std_dev).abs() > threshold)
        .count()
}

fn mean_and_sample_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}
