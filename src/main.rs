mod analytics;
mod atomic;
mod error;
mod models;
mod report;
mod store;
mod survey;
mod view;

use analytics::{OutlierReport, SurveyAnalyzer};
use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use error::TrackerError;
use models::{Config, Industry, NewProspect, Priority, ProspectChanges, Stage, Status};
use std::fs::{self, File};
use std::path::Path;
use std::str::FromStr;
use store::{ProspectStore, ProspectTable};
use survey::{load_survey, SurveyTable};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use view::{filtered_view, ViewFilter};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipeline_tracker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Parse command line arguments
    let matches = cli().get_matches();
    let config_file = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.toml");

    // Load or create configuration
    let config = if Path::new(config_file).exists() {
        tracing::debug!(path = config_file, "loading configuration");
        Config::load_from_file(config_file)
            .with_context(|| format!("Failed to read configuration: {}", config_file))?
    } else {
        println!("📝 Creating default configuration file: {}", config_file);
        let default_config = Config::default();
        default_config.save_to_file(config_file)?;
        default_config
    };

    // Dispatch to the selected command
    match matches.subcommand() {
        Some(("add", args)) => run_add(&config, args),
        Some(("update", args)) => run_update(&config, args),
        Some(("list", args)) => run_list(&config, args),
        Some(("summary", _)) => run_summary(&config),
        Some(("import", args)) => run_import(&config, args),
        Some(("export", args)) => run_export(&config, args),
        Some(("survey", args)) => run_survey(&config, args),
        Some(("survey-export", args)) => run_survey_export(&config, args),
        _ => unreachable!("subcommand is required"),
    }
}

fn cli() -> Command {
    let stage = || {
        Arg::new("stage")
            .long("stage")
            .value_name("STAGE")
            .value_parser(Stage::from_str)
            .help("Pipeline stage (Lead Identified, Contacted, Proposal Sent, Negotiation, Won, Lost, Tender)")
    };
    let status = || {
        Arg::new("status")
            .long("status")
            .value_name("STATUS")
            .value_parser(Status::from_str)
            .help("Open or Closed")
    };
    let industry = || {
        Arg::new("industry")
            .long("industry")
            .value_name("INDUSTRY")
            .value_parser(Industry::from_str)
            .help("Industry category")
    };
    let priority = || {
        Arg::new("priority")
            .long("priority")
            .value_name("YES|NO")
            .value_parser(Priority::from_str)
    };
    let text = |id: &'static str, long: &'static str, help: &'static str| {
        Arg::new(id).long(long).value_name("TEXT").help(help)
    };
    let size = || {
        Arg::new("size")
            .long("size")
            .value_name("KES")
            .value_parser(clap::value_parser!(f64))
            .help("Opportunity size (KES)")
    };
    let survey_file = || {
        Arg::new("file")
            .long("file")
            .value_name("FILE")
            .help("Survey spreadsheet or CSV (overrides the configuration)")
    };

    Command::new("pipeline-tracker")
        .version("0.1")
        .about("Tracks business prospects and monitors field-survey submissions")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml")
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("add")
                .about("Add a new business prospect")
                .arg(text("name", "name", "Prospect name").required(true))
                .arg(text("contact", "contact", "Contact person").required(true))
                .arg(text("email", "email", "Email").required(true))
                .arg(text("phone", "phone", "Phone number").default_value(""))
                .arg(size().default_value("0"))
                .arg(status().default_value("Open"))
                .arg(stage().default_value("Lead Identified"))
                .arg(industry().default_value("Other"))
                .arg(priority().default_value("No"))
                .arg(text("follow-up", "follow-up", "Follow-up date (DD/MM/YYYY or YYYY-MM-DD)"))
                .arg(text("notes", "notes", "Additional notes").default_value("")),
        )
        .subcommand(
            Command::new("update")
                .about("Modify an existing prospect")
                .arg(Arg::new("name").required(true).value_name("NAME"))
                .arg(text("contact", "contact", "Contact person"))
                .arg(text("email", "email", "Email"))
                .arg(text("phone", "phone", "Phone number"))
                .arg(size())
                .arg(status())
                .arg(stage())
                .arg(industry())
                .arg(priority())
                .arg(text("follow-up", "follow-up", "Follow-up date"))
                .arg(text("notes", "notes", "Additional notes")),
        )
        .subcommand(
            Command::new("list")
                .about("Show filtered prospects, priority first")
                .arg(stage())
                .arg(status())
                .arg(industry())
                .arg(
                    Arg::new("min-size")
                        .long("min-size")
                        .value_name("KES")
                        .value_parser(clap::value_parser!(f64))
                        .default_value("0"),
                ),
        )
        .subcommand(Command::new("summary").about("Pipeline KPIs, funnel and industry totals"))
        .subcommand(
            Command::new("import")
                .about("Replace the tracker with an uploaded CSV")
                .arg(Arg::new("file").required(true).value_name("FILE")),
        )
        .subcommand(
            Command::new("export")
                .about("Download the full tracker as CSV")
                .arg(Arg::new("file").required(true).value_name("FILE")),
        )
        .subcommand(
            Command::new("survey")
                .about("Survey monitoring report")
                .arg(survey_file())
                .arg(
                    Arg::new("enumerator")
                        .long("enumerator")
                        .value_name("NAME")
                        .help("Limit the report to one enumerator"),
                ),
        )
        .subcommand(
            Command::new("survey-export")
                .about("Export the cleaned survey, with and without outliers")
                .arg(survey_file()),
        )
}

/// Print recoverable store errors; only the terminal ones propagate.
fn settle(result: std::result::Result<ProspectTable, TrackerError>) -> Result<Option<ProspectTable>> {
    match result {
        Ok(table) => Ok(Some(table)),
        Err(
            e @ (TrackerError::Validation(_)
            | TrackerError::SchemaMismatch { .. }
            | TrackerError::NotFound(_)
            | TrackerError::InvalidValue { .. }),
        ) => {
            println!("❌ {}", e);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Open the tracker file named in the configuration and load its rows
fn open_store(config: &Config) -> Result<(ProspectStore, ProspectTable)> {
    let store = ProspectStore::new(&config.tracker_file);
    let table = store.load()?;
    Ok((store, table))
}

/// Add one prospect from the command line flags
fn run_add(config: &Config, args: &ArgMatches) -> Result<()> {
    let (store, table) = open_store(config)?;
    let string = |id: &str| args.get_one::<String>(id).cloned().unwrap_or_default();

    // Unset flags fall back to the form defaults
    let new = NewProspect {
        name: string("name"),
        contact_person: string("contact"),
        email: string("email"),
        phone: string("phone"),
        opportunity_size: args.get_one::<f64>("size").copied().unwrap_or(0.0),
        status: args.get_one::<Status>("status").copied().unwrap_or(Status::Open),
        stage: args.get_one::<Stage>("stage").copied().unwrap_or(Stage::LeadIdentified),
        industry: args.get_one::<Industry>("industry").copied().unwrap_or(Industry::Other),
        priority: args.get_one::<Priority>("priority").copied().unwrap_or_default(),
        follow_up_date: args.get_one::<String>("follow-up").cloned(),
        notes: string("notes"),
    };

    // An unchanged row count means the new row was a duplicate
    let before = table.len();
    if let Some(table) = settle(store.add(&table, new))? {
        if table.len() == before {
            println!("⚠️  A prospect with the same name, email and phone already exists; nothing added.");
        } else {
            println!(
                "✅ Prospect added successfully! ({} total, saved to {})",
                table.len(),
                store.path().display()
            );
        }
    }
    Ok(())
}

/// Update the given fields of an existing prospect
fn run_update(config: &Config, args: &ArgMatches) -> Result<()> {
    let (store, table) = open_store(config)?;
    let name = args
        .get_one::<String>("name")
        .context("prospect name is required")?;

    // Only flags that were passed become changes
    let changes = ProspectChanges {
        contact_person: args.get_one::<String>("contact").cloned(),
        email: args.get_one::<String>("email").cloned(),
        phone: args.get_one::<String>("phone").cloned(),
        opportunity_size: args.get_one::<f64>("size").copied(),
        status: args.get_one::<Status>("status").copied(),
        stage: args.get_one::<Stage>("stage").copied(),
        industry: args.get_one::<Industry>("industry").copied(),
        priority: args.get_one::<Priority>("priority").copied(),
        follow_up_date: args.get_one::<String>("follow-up").cloned(),
        notes: args.get_one::<String>("notes").cloned(),
    };
    if changes.is_empty() {
        println!("⚠️  Nothing to update for {}", name);
        return Ok(());
    }

    if settle(store.update(&table, name, changes))?.is_some() {
        println!("✅ Prospect updated successfully!");
    }
    Ok(())
}

/// Print the filtered, priority-first prospect list
fn run_list(config: &Config, args: &ArgMatches) -> Result<()> {
    let (_, table) = open_store(config)?;
    let filter = ViewFilter {
        stage: args.get_one::<Stage>("stage").copied(),
        status: args.get_one::<Status>("status").copied(),
        industry: args.get_one::<Industry>("industry").copied(),
        min_opportunity: args.get_one::<f64>("min-size").copied().unwrap_or(0.0),
    };

    // Phones come back masked from the view
    let rows = filtered_view(&table, &filter);
    println!("📋 Filtered Business Prospects ({} of {})", rows.len(), table.len());
    println!("==========================================");
    for row in &rows {
        let marker = if row.priority == Priority::Yes { "⭐" } else { "  " };
        println!(
            "{} {} | {} | {} | {} | KES {:.2} | {} | {} | {} | follow-up {}",
            marker,
            row.name,
            row.contact_person,
            row.email,
            row.phone,
            row.opportunity_size,
            row.status,
            row.stage,
            row.industry,
            row.follow_up_date
        );
        if !row.notes.is_empty() {
            println!("     📝 {}", row.notes);
        }
    }
    Ok(())
}

/// Print KPIs, the conversion funnel and opportunity totals by industry
fn run_summary(config: &Config) -> Result<()> {
    let (_, table) = open_store(config)?;
    let summary = report::summarize(&table);

    println!("📊 Business Prospects Pipeline");
    println!("==============================\n");
    println!("Total Prospects:    {}", summary.total_prospects);
    println!("Open Deals:         {}", summary.open_deals);
    println!("Closed Deals:       {}", summary.closed_deals);
    println!("Priority Prospects: {}", summary.priority_prospects);

    // Charts only make sense with data
    if table.is_empty() {
        return Ok(());
    }
    println!("\n🔄 Conversion Funnel");
    for (stage, count) in &summary.funnel {
        println!("   {:<16} {}", stage.as_str(), count);
    }
    println!("\n📈 Opportunity Size by Industry");
    for (industry, total) in &summary.industry_totals {
        println!("   {:<14} KES {:.2}", industry.as_str(), total);
    }
    Ok(())
}

/// Replace the tracker with an uploaded CSV
fn run_import(config: &Config, args: &ArgMatches) -> Result<()> {
    let store = ProspectStore::new(&config.tracker_file);
    // Loading first surfaces a locked tracker before anything is replaced.
    store.load()?;

    let file = args.get_one::<String>("file").context("upload file is required")?;
    let upload = File::open(file).with_context(|| format!("Failed to open upload: {}", file))?;
    if let Some(table) = settle(store.replace_all(upload))? {
        println!("✅ File uploaded successfully! ({} prospects)", table.len());
    }
    Ok(())
}

/// Download a copy of the tracker
fn run_export(config: &Config, args: &ArgMatches) -> Result<()> {
    let (store, table) = open_store(config)?;
    let file = args.get_one::<String>("file").context("export file is required")?;
    store.export(&table, Path::new(file))?;
    println!("📥 Exported {} prospects to {}", table.len(), file);
    Ok(())
}

/// Load the survey named on the command line or in the configuration,
/// with the configured totals appended
fn load_survey_table(config: &Config, args: &ArgMatches) -> Result<(String, SurveyTable)> {
    let source = args
        .get_one::<String>("file")
        .cloned()
        .unwrap_or_else(|| config.survey.source_file.clone());
    let mut table = load_survey(
        Path::new(&source),
        &config.survey.sheet_name,
        &config.survey.submission_time_column,
    )
    .with_context(|| format!("Error loading survey file: {}", source))?;

    // Derived totals join the numeric columns before any analysis
    let totals = SurveyAnalyzer::new(&config.survey).add_derived_totals(&mut table)?;
    for (name, sources) in &totals.added {
        tracing::debug!(total = %name, columns = sources.len(), "added derived total");
    }
    for name in &totals.unmatched {
        println!("⚠️  Columns for {} not found; total cannot be calculated.", name);
    }
    Ok((source, table))
}

/// Print the survey monitoring report, optionally for one enumerator
fn run_survey(config: &Config, args: &ArgMatches) -> Result<()> {
    let (source, full) = load_survey_table(config, args)?;
    let analyzer = SurveyAnalyzer::new(&config.survey);
    let enumerator = args.get_one::<String>("enumerator").map(String::as_str);
    let table = analyzer.scoped(&full, enumerator)?;

    if full.is_empty() {
        println!("⚠️  {} contains no submissions.", source);
        return Ok(());
    }
    println!("✅ Loaded {} submissions from {}", full.len(), source);

    // Profile is computed against the full table so it can report NotFound
    if let Some(name) = enumerator {
        let profile = analyzer.enumerator_profile(&full, name)?;
        println!("\n👤 Enumerator: {}", name);
        println!("   ⏰ Start Time:      {}", format_time(profile.activity.first_submission));
        println!("   ⏰ Stop Time:       {}", format_time(profile.activity.last_submission));
        println!("   ⏳ Survey Duration: {}", format_duration(profile.activity.duration()));
        println!("   🚫 'No' answers:    {}", profile.no_answers);
        println!("   ❓ Missing cells:   {}", profile.missing_cells);
        println!("   📉 Outliers:        {}", profile.outliers);
    }

    // Enumerator performance
    let activity = analyzer.enumerator_activity(&table)?;
    println!("\n👤 Enumerator Performance");
    for entry in &activity {
        println!(
            "   {:<24} {:>4} submissions  {} → {}  ({})",
            entry.enumerator,
            entry.submissions,
            format_time(entry.first_submission),
            format_time(entry.last_submission),
            format_duration(entry.duration())
        );
    }

    let low = analyzer.low_submission_enumerators(&activity);
    println!("\n⚠️  Enumerators with Low Submissions");
    if low.is_empty() {
        println!("   ✅ No enumerators with low submissions detected.");
    } else {
        println!(
            "   These enumerators have fewer than {} submissions and may need follow-up:",
            config.survey.low_submission_threshold
        );
        for entry in low {
            println!("   - {} ({})", entry.enumerator, entry.submissions);
        }
    }

    // Submission trends
    println!("\n📅 Daily Submissions Trend");
    for (day, count) in analyzer.daily_submissions(&table)? {
        println!("   {}  {}", day, count);
    }

    println!("\n📆 Daily Submissions Per Enumerator");
    for (day, counts) in analyzer.daily_submissions_by_enumerator(&table)? {
        let line: Vec<String> = counts.iter().map(|(name, n)| format!("{}: {}", name, n)).collect();
        println!("   {}  {}", day, line.join(", "));
    }

    print_missing_data(&analyzer, &table)?;

    // Same submission time and enumerator twice
    let duplicates = analyzer.duplicates(&table)?;
    println!("\n🔁 Duplicate Responses");
    if duplicates.is_empty() {
        println!("   ✅ No duplicate responses found.");
    } else {
        println!("   ⚠️  {} duplicate responses detected!", duplicates.len());
        for duplicate in &duplicates {
            // +2 matches the spreadsheet row number below the header
            println!("   row {}: {} | {}", duplicate.row + 2, duplicate.submitted_at, duplicate.enumerator);
        }
    }

    print_outliers(&analyzer.outliers(&table));

    // Price and acreage ranges
    let ranges = analyzer.value_ranges(&table)?;
    if !ranges.is_empty() {
        println!("\n💰 Value Ranges");
        for range in ranges {
            match (range.min, range.max) {
                (Some(min), Some(max)) => println!(
                    "   {} ({} columns): min {} / max {}",
                    range.name, range.columns, min, max
                ),
                _ => println!("   ⚠️  {}: no matching values found", range.name),
            }
        }
    }
    Ok(())
}

/// Print critical missing columns and missing cells per enumerator
fn print_missing_data(analyzer: &SurveyAnalyzer, table: &SurveyTable) -> Result<()> {
    println!("\n⚠️  Missing Data Overview");
    let critical = analyzer.critical_missing(&analyzer.missing_data(table));
    if critical.is_empty() {
        println!("   ✅ No critical missing data detected.");
    } else {
        println!("   🚨 Critical fields with too much missing data:");
        for column in &critical {
            println!("   - {} ({} missing, {:.1}%)", column.column, column.missing, column.percent);
        }
    }

    println!("\n🔍 Missing Data Per Enumerator");
    for (enumerator, missing) in analyzer.missing_by_enumerator(table)? {
        println!("   {:<24} {}", enumerator, missing);
    }
    Ok(())
}

/// Print flagged values per column and the columns that were skipped
fn print_outliers(report: &OutlierReport) {
    println!("\n📉 Outlier Detection");
    if report.columns.is_empty() && report.skipped.is_empty() {
        println!("   ⚠️  No numeric columns found for outlier detection.");
        return;
    }

    for column in &report.columns {
        if column.hits.is_empty() {
            continue;
        }
        println!(
            "   🚨 Outliers detected in {} (mean {:.2}, std {:.2}):",
            column.column, column.mean, column.std_dev
        );
        for hit in &column.hits {
            println!(
                "      row {}: {} (z = {:.2}) {} {}",
                hit.row + 2,
                hit.value,
                hit.z_score,
                hit.enumerator.as_deref().unwrap_or("-"),
                format_time(hit.submitted_at)
            );
        }
    }
    if report.total_hits() == 0 {
        println!("   ✅ No outliers detected.");
    }

    if !report.skipped.is_empty() {
        println!("   ⚠️  The following columns were skipped:");
        for skipped in &report.skipped {
            println!("      - {} ({})", skipped.column, skipped.reason);
        }
    }
}

/// Write the cleaned survey and the outlier-free copy to the output directory.
fn run_survey_export(config: &Config, args: &ArgMatches) -> Result<()> {
    let (source, table) = load_survey_table(config, args)?;
    let analyzer = SurveyAnalyzer::new(&config.survey);

    // Exports land next to the other reports, never over the source
    let output_dir = config.output_directory.as_deref().unwrap_or("output");
    fs::create_dir_all(output_dir)?;

    let export = analyzer.export_cleaned(&table, Path::new(output_dir), Path::new(&source))?;
    println!("✅ Data exported successfully! {}", export.full.display());
    println!(
        "✅ Cleaned data (outliers removed) exported successfully! {} ({} rows dropped)",
        export.without_outliers.display(),
        export.dropped_rows
    );
    Ok(())
}

fn format_time(time: Option<chrono::NaiveDateTime>) -> String {
    time.map(|t| t.format(survey::TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_duration(duration: Option<chrono::Duration>) -> String {
    match duration {
        Some(d) => {
            let minutes = d.num_minutes();
            format!("{}d {:02}h {:02}m", minutes / 1440, (minutes % 1440) / 60, minutes % 60)
        }
        None => "-".to_string(),
    }
}
