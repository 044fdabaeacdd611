use crate::error::TrackerError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tracker_file: String,
    pub output_directory: Option<String>,
    #[serde(default)]
    pub survey: SurveyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyConfig {
    pub source_file: String,
    pub sheet_name: String,
    pub enumerator_column: String,
    pub submission_time_column: String,
    pub low_submission_threshold: usize,
    pub outlier_z_threshold: f64,
    pub critical_missing_percent: f64,
    pub derived_totals: Vec<ColumnPattern>,
    pub value_ranges: Vec<ColumnPattern>,
}

/// A named group of survey columns selected by a header regex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnPattern {
    pub name: String,
    pub pattern: String,
}

impl ColumnPattern {
    fn new(name: &str, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracker_file: "business_pipeline_tracker.csv".to_string(),
            output_directory: Some("output".to_string()),
            survey: SurveyConfig::default(),
        }
    }
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            source_file: "Maize_PL_Survey.xlsx".to_string(),
            sheet_name: "Maize P&L Survey".to_string(),
            // The survey form exports this header with a trailing space
            enumerator_column: "2B. Name of Enumerator ".to_string(),
            submission_time_column: "_submission_time".to_string(),
            low_submission_threshold: 5,
            outlier_z_threshold: 3.0,
            critical_missing_percent: 50.0,
            derived_totals: vec![
                ColumnPattern::new("Total Maize Harvested (90 kgs bag)", r"^4[GH]\. What quantity"),
                ColumnPattern::new("Total Maize Lost (90 kgs bag)", r"What quantity of maize was lost due to"),
                ColumnPattern::new("Total Production Cost (KES)", r"How much did you spend on"),
                ColumnPattern::new("Total Acreage", r"^4[ABC]\. What\s+is the total size of land"),
            ],
            value_ranges: vec![
                ColumnPattern::new(
                    "Farm gate price (KES/kg)",
                    r"How much \(KES\) did you sell your maize at the farm gate per kg in",
                ),
                ColumnPattern::new("Total Acreage", r"^Total Acreage$"),
            ],
        }
    }
}

impl Config {
    pub fn load_from_file(file_path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(file_path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, file_path: &str) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(file_path, content)?;
        Ok(())
    }
}

/// Header of the persisted tracker file, in column order.
pub const PROSPECT_COLUMNS: [&str; 11] = [
    "Prospect Name",
    "Contact Person",
    "Email",
    "Phone",
    "Opportunity Size (KES)",
    "Status",
    "Stage",
    "Industry",
    "Follow-up Date",
    "Notes",
    "Priority",
];

/// Column that older tracker files may lack; it loads as `No`.
pub const OPTIONAL_COLUMN: &str = "Priority";

pub const DATE_FORMAT: &str = "%d/%m/%Y";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prospect {
    #[serde(rename = "Prospect Name")]
    pub name: String,
    #[serde(rename = "Contact Person")]
    pub contact_person: String,
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "Phone")]
    pub phone: String,
    #[serde(rename = "Opportunity Size (KES)")]
    pub opportunity_size: f64,
    #[serde(rename = "Status")]
    pub status: Status,
    #[serde(rename = "Stage")]
    pub stage: Stage,
    #[serde(rename = "Industry")]
    pub industry: Industry,
    #[serde(rename = "Follow-up Date")]
    pub follow_up_date: String,
    #[serde(rename = "Notes", default)]
    pub notes: String,
    #[serde(rename = "Priority", default)]
    pub priority: Priority,
}

impl Prospect {
    /// Identity used for de-duplication.
    pub fn dedup_key(&self) -> (&str, &str, &str) {
        (&self.name, &self.email, &self.phone)
    }
}

/// Input of the add form, before normalization.
#[derive(Debug, Clone)]
pub struct NewProspect {
    pub name: String,
    pub contact_person: String,
    pub email: String,
    pub phone: String,
    pub opportunity_size: f64,
    pub status: Status,
    pub stage: Stage,
    pub industry: Industry,
    pub priority: Priority,
    pub follow_up_date: Option<String>,
    pub notes: String,
}

/// Fields of the modify form. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct ProspectChanges {
    pub contact_person: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub opportunity_size: Option<f64>,
    pub status: Option<Status>,
    pub stage: Option<Stage>,
    pub industry: Option<Industry>,
    pub priority: Option<Priority>,
    pub follow_up_date: Option<String>,
    pub notes: Option<String>,
}

impl ProspectChanges {
    pub fn is_empty(&self) -> bool {
        self.contact_person.is_none()
            && self.email.is_none()
            && self.phone.is_none()
            && self.opportunity_size.is_none()
            && self.status.is_none()
            && self.stage.is_none()
            && self.industry.is_none()
            && self.priority.is_none()
            && self.follow_up_date.is_none()
            && self.notes.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "Lead Identified")]
    LeadIdentified,
    Contacted,
    #[serde(rename = "Proposal Sent")]
    ProposalSent,
    Negotiation,
    Won,
    Lost,
    Tender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Industry {
    Technology,
    Finance,
    Healthcare,
    Education,
    Retail,
    Manufacturing,
    Agriculture,
    #[serde(rename = "Real Estate")]
    RealEstate,
    Government,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Yes,
    #[default]
    No,
}

impl Status {
    pub const ALL: [Status; 2] = [Status::Open, Status::Closed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Open => "Open",
            Status::Closed => "Closed",
        }
    }
}

impl Stage {
    /// Pipeline order, with Tender last.
    pub const ALL: [Stage; 7] = [
        Stage::LeadIdentified,
        Stage::Contacted,
        Stage::ProposalSent,
        Stage::Negotiation,
        Stage::Won,
        Stage::Lost,
        Stage::Tender,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::LeadIdentified => "Lead Identified",
            Stage::Contacted => "Contacted",
            Stage::ProposalSent => "Proposal Sent",
            Stage::Negotiation => "Negotiation",
            Stage::Won => "Won",
            Stage::Lost => "Lost",
            Stage::Tender => "Tender",
        }
    }

    /// Stage a prospect is counted under in pipeline reports.
    pub fn reporting_stage(&self) -> Stage {
        match self {
            Stage::Tender => Stage::LeadIdentified,
            other => *other,
        }
    }
}

impl Industry {
    pub const ALL: [Industry; 10] = [
        Industry::Technology,
        Industry::Finance,
        Industry::Healthcare,
        Industry::Education,
        Industry::Retail,
        Industry::Manufacturing,
        Industry::Agriculture,
        Industry::RealEstate,
        Industry::Government,
        Industry::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Industry::Technology => "Technology",
            Industry::Finance => "Finance",
            Industry::Healthcare => "Healthcare",
            Industry::Education => "Education",
            Industry::Retail => "Retail",
            Industry::Manufacturing => "Manufacturing",
            Industry::Agriculture => "Agriculture",
            Industry::RealEstate => "Real Estate",
            Industry::Government => "Government",
            Industry::Other => "Other",
        }
    }
}

impl Priority {
    pub const ALL: [Priority; 2] = [Priority::Yes, Priority::No];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Yes => "Yes",
            Priority::No => "No",
        }
    }
}

fn parse_choice<T: Copy>(
    field: &'static str,
    value: &str,
    all: &[T],
    name: fn(&T) -> &'static str,
) -> Result<T, TrackerError> {
    let wanted = value.trim();
    all.iter()
        .find(|choice| name(*choice).eq_ignore_ascii_case(wanted))
        .copied()
        .ok_or_else(|| TrackerError::InvalidValue {
            field,
            value: value.to_string(),
        })
}

impl FromStr for Status {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_choice("status", s, &Status::ALL, Status::as_str)
    }
}

impl FromStr for Stage {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_choice("stage", s, &Stage::ALL, Stage::as_str)
    }
}

impl FromStr for Industry {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_choice("industry", s, &Industry::ALL, Industry::as_str)
    }
}

impl FromStr for Priority {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_choice("priority", s, &Priority::ALL, Priority::as_str)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Industry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rewrite a phone ending in a 9-digit national number to local `0XXXXXXXXX` form.
///
/// Only all-digit inputs of at least 9 characters are touched; the last nine
/// digits lose their leading zeros and gain a single `0` prefix.
pub fn normalize_phone(phone: &str) -> String {
    let is_digits = !phone.is_empty() && phone.chars().all(|c| c.is_ascii_digit());
    if !is_digits || phone.len() < 9 {
        return phone.to_string();
    }

    let national = phone[phone.len() - 9..].trim_start_matches('0');
    let national = if national.is_empty() { "0" } else { national };
    format!("0{}", national)
}

/// Round a currency amount to cents.
pub fn round_currency(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Format a follow-up date as `DD/MM/YYYY`, falling back to `today`.
pub fn format_follow_up_date(raw: Option<&str>, today: NaiveDate) -> String {
    raw.and_then(parse_follow_up_date)
        .unwrap_or(today)
        .format(DATE_FORMAT)
        .to_string()
}

pub fn parse_follow_up_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    [DATE_FORMAT, "%Y-%m-%d", "%d-%m-%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_digit_phone_becomes_local_form() {
        assert_eq!(normalize_phone("254712345678"), "0712345678");
        assert_eq!(normalize_phone("712345678"), "0712345678");
    }

    #[test]
    fn leading_zeros_in_national_part_collapse_to_one() {
        assert_eq!(normalize_phone("0712345678"), "0712345678");
        assert_eq!(normalize_phone("254012345678"), "012345678");
    }

    #[test]
    fn short_or_non_numeric_phone_passes_through() {
        assert_eq!(normalize_phone("12345678"), "12345678");
        assert_eq!(normalize_phone("+254712345678"), "+254712345678");
        assert_eq!(normalize_phone("0712 345 678"), "0712 345 678");
        assert_eq!(normalize_phone(""), "");
    }

    #[test]
    fn currency_rounds_to_two_decimals() {
        assert_eq!(round_currency(1234.5678), 1234.57);
        assert_eq!(round_currency(10.0), 10.0);
    }

    #[test]
    fn follow_up_date_accepts_common_formats() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        assert_eq!(format_follow_up_date(Some("2025-04-15"), today), "15/04/2025");
        assert_eq!(format_follow_up_date(Some("15/04/2025"), today), "15/04/2025");
        assert_eq!(format_follow_up_date(Some("15-04-2025"), today), "15/04/2025");
    }

    #[test]
    fn missing_or_garbage_date_defaults_to_today() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        assert_eq!(format_follow_up_date(None, today), "01/03/2025");
        assert_eq!(format_follow_up_date(Some("N/A"), today), "01/03/2025");
    }

    #[test]
    fn enums_parse_case_insensitively() {
        assert_eq!("proposal sent".parse::<Stage>().unwrap(), Stage::ProposalSent);
        assert_eq!("Real Estate".parse::<Industry>().unwrap(), Industry::RealEstate);
        assert_eq!("YES".parse::<Priority>().unwrap(), Priority::Yes);
        assert!("Pending".parse::<Status>().is_err());
    }

    #[test]
    fn tender_reports_as_lead_identified() {
        assert_eq!(Stage::Tender.reporting_stage(), Stage::LeadIdentified);
        assert_eq!(Stage::Won.reporting_stage(), Stage::Won);
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.tracker_file, config.tracker_file);
        assert_eq!(parsed.survey.enumerator_column, "2B. Name of Enumerator ");
        assert_eq!(parsed.survey.derived_totals.len(), 4);
    }
}
