use crate::atomic::write_atomically;
use crate::error::{Result, TrackerError};
use crate::models::{
    format_follow_up_date, normalize_phone, parse_follow_up_date, round_currency, DATE_FORMAT, NewProspect, Prospect,
    ProspectChanges, OPTIONAL_COLUMN, PROSPECT_COLUMNS,
};
use chrono::{Local, NaiveDate};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// In-memory copy of the tracker file, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProspectTable {
    pub rows: Vec<Prospect>,
}

impl ProspectTable {
    pub fn new(rows: Vec<Prospect>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Prospect> {
        self.rows.iter()
    }

    /// Keep the first row for every (name, email, phone) triple.
    fn dedup(&mut self) -> usize {
        let before = self.rows.len();
        let mut seen = HashSet::new();
        self.rows.retain(|row| {
            let (name, email, phone) = row.dedup_key();
            seen.insert((name.to_string(), email.to_string(), phone.to_string()))
        });
        before - self.rows.len()
    }
}

/// CSV-backed prospect table. Every mutation persists atomically and then
/// re-reads the file, so callers always get back what is on disk.
pub struct ProspectStore {
    path: PathBuf,
}

impl ProspectStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the tracker file. A missing file is an empty table; any other
    /// open failure is terminal for the run.
    pub fn load(&self) -> Result<ProspectTable> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "tracker file not found, starting empty");
                return Ok(ProspectTable::default());
            }
            Err(source) => {
                return Err(TrackerError::LockedResource {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let table = read_table(file, true)?;
        debug!(path = %self.path.display(), rows = table.len(), "loaded tracker file");
        Ok(table)
    }

    /// Validate, normalize and append a prospect, then persist and reload.
    pub fn add(&self, table: &ProspectTable, new: NewProspect) -> Result<ProspectTable> {
        self.add_on(table, new, Local::now().date_naive())
    }

    /// Add with an explicit "today" used when the follow-up date is missing.
    pub fn add_on(
        &self,
        table: &ProspectTable,
        new: NewProspect,
        today: NaiveDate,
    ) -> Result<ProspectTable> {
        let required = [
            ("Prospect Name", &new.name),
            ("Contact Person", &new.contact_person),
            ("Email", &new.email),
        ];
        let blank: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(column, _)| *column)
            .collect();
        if !blank.is_empty() {
            return Err(TrackerError::Validation(format!(
                "required fields are blank: {}",
                blank.join(", ")
            )));
        }
        validate_size(new.opportunity_size)?;

        let prospect = Prospect {
            name: new.name,
            contact_person: new.contact_person,
            email: new.email,
            phone: normalize_phone(&new.phone),
            opportunity_size: round_currency(new.opportunity_size),
            status: new.status,
            stage: new.stage,
            industry: new.industry,
            follow_up_date: format_follow_up_date(new.follow_up_date.as_deref(), today),
            notes: new.notes,
            priority: new.priority,
        };

        // Same name, email and phone as an existing row is a duplicate
        let mut updated = table.clone();
        updated.rows.push(prospect);
        if updated.dedup() > 0 {
            warn!("duplicate prospect (name, email, phone) dropped, first entry kept");
        }

        self.persist(&updated)?;
        self.load()
    }

    /// Overwrite the given fields of the prospect called `name`.
    ///
    /// When several rows share the name, the last one is updated.
    pub fn update(
        &self,
        table: &ProspectTable,
        name: &str,
        changes: ProspectChanges,
    ) -> Result<ProspectTable> {
        let index = table
            .rows
            .iter()
            .rposition(|row| row.name == name)
            .ok_or_else(|| TrackerError::NotFound(name.to_string()))?;

        for (column, value) in [
            ("Contact Person", &changes.contact_person),
            ("Email", &changes.email),
        ] {
            if matches!(value, Some(v) if v.trim().is_empty()) {
                return Err(TrackerError::Validation(format!("{} cannot be blank", column)));
            }
        }
        if let Some(size) = changes.opportunity_size {
            validate_size(size)?;
        }

        let mut updated = table.clone();
        let row = &mut updated.rows[index];
        if let Some(contact_person) = changes.contact_person {
            row.contact_person = contact_person;
        }
        if let Some(email) = changes.email {
            row.email = email;
        }
        if let Some(phone) = changes.phone {
            row.phone = normalize_phone(&phone);
        }
        if let Some(size) = changes.opportunity_size {
            row.opportunity_size = round_currency(size);
        }
        if let Some(status) = changes.status {
            row.status = status;
        }
        if let Some(stage) = changes.stage {
            row.stage = stage;
        }
        if let Some(industry) = changes.industry {
            row.industry = industry;
        }
        if let Some(priority) = changes.priority {
            row.priority = priority;
        }
        // Dates always leave an update in tracker format; unparseable stored
        // text is left for the user to correct
        match changes.follow_up_date {
            Some(date) => {
                row.follow_up_date = format_follow_up_date(Some(&date), Local::now().date_naive());
            }
            None => {
                if let Some(date) = parse_follow_up_date(&row.follow_up_date) {
                    row.follow_up_date = date.format(DATE_FORMAT).to_string();
                }
            }
        }
        if let Some(notes) = changes.notes {
            row.notes = notes;
        }

        self.persist(&updated)?;
        self.load()
    }

    /// Replace the whole table with an uploaded CSV.
    ///
    /// The upload must carry every tracker column; extra columns are dropped.
    /// On a schema mismatch nothing is written and the caller keeps its table.
    pub fn replace_all<R: Read>(&self, incoming: R) -> Result<ProspectTable> {
        let replacement = read_table(incoming, false)?;
        info!(rows = replacement.len(), "replacing tracker table from upload");
        self.persist(&replacement)?;
        self.load()
    }

    /// Atomically replace the tracker file with `table`.
    pub fn persist(&self, table: &ProspectTable) -> Result<()> {
        write_atomically(&self.path, |w| write_table(w, table))?;
        debug!(path = %self.path.display(), rows = table.len(), "persisted tracker file");
        Ok(())
    }

    /// Write a copy of the table elsewhere ("download").
    pub fn export(&self, table: &ProspectTable, destination: &Path) -> Result<()> {
        write_atomically(destination, |w| write_table(w, table))
    }
}

fn validate_size(size: f64) -> Result<()> {
    if !size.is_finite() || size < 0.0 {
        return Err(TrackerError::Validation(format!(
            "opportunity size must be a non-negative amount, got {}",
            size
        )));
    }
    Ok(())
}

/// Parse a tracker CSV. `allow_optional` lets the Priority column be absent.
fn read_table<R: Read>(reader: R, allow_optional: bool) -> Result<ProspectTable> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader.headers()?.clone();
    // A zero-byte file is an empty tracker
    if headers.is_empty() {
        return Ok(ProspectTable::default());
    }

    let missing: Vec<String> = PROSPECT_COLUMNS
        .iter()
        .filter(|column| !headers.iter().any(|h| h == **column))
        .filter(|column| !(allow_optional && **column == OPTIONAL_COLUMN))
        .map(|column| column.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(TrackerError::SchemaMismatch { missing });
    }

    // Columns are matched by name, so extra or reordered columns are fine
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let prospect: Prospect = record?;
        rows.push(prospect);
    }
    Ok(ProspectTable::new(rows))
}

/// Serialize the table with the tracker header, in tracker column order.
pub fn write_table<W: Write>(writer: W, table: &ProspectTable) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    // Header is written explicitly so an empty table still carries the schema
    writer.write_record(PROSPECT_COLUMNS)?;
    for row in table.iter() {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Industry, Priority, Stage, Status};
    use std::fs;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 2, 10).unwrap()
    }

    fn new_prospect(name: &str, email: &str, phone: &str) -> NewProspect {
        NewProspect {
            name: name.to_string(),
            contact_person: "Jane Wanjiru".to_string(),
            email: email.to_string(),
            phone: phone.to_string(),
            opportunity_size: 150_000.456,
            status: Status::Open,
            stage: Stage::Contacted,
            industry: Industry::Agriculture,
            priority: Priority::No,
            follow_up_date: Some("2025-03-01".to_string()),
            notes: "Met at the expo".to_string(),
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> ProspectStore {
        ProspectStore::new(dir.path().join("tracker.csv"))
    }

    #[test]
    fn missing_file_loads_as_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = store_in(&dir).load().unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn unopenable_file_is_a_locked_resource() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();
        let store = ProspectStore::new(blocker.join("tracker.csv"));

        assert!(matches!(store.load(), Err(TrackerError::LockedResource { .. })));
    }

    #[test]
    fn add_normalizes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let table = store
            .add_on(&ProspectTable::default(), new_prospect("Acme", "a@acme.co.ke", "254712345678"), today())
            .unwrap();

        assert_eq!(table.len(), 1);
        let row = &table.rows[0];
        assert_eq!(row.phone, "0712345678");
        assert_eq!(row.opportunity_size, 150_000.46);
        assert_eq!(row.follow_up_date, "01/03/2025");

        let on_disk = fs::read_to_string(store.path()).unwrap();
        assert!(on_disk.starts_with("Prospect Name,Contact Person,Email,Phone,"));
        assert!(on_disk.contains(",0712345678,"));
    }

    #[test]
    fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut table = ProspectTable::default();
        table = store.add_on(&table, new_prospect("Acme", "a@acme.co.ke", "0700000001"), today()).unwrap();
        let mut second = new_prospect("Baraka Foods", "b@baraka.co.ke", "0012");
        second.notes = "Wants a quote, \"urgent\"\nCall after 2pm".to_string();
        second.priority = Priority::Yes;
        table = store.add_on(&table, second, today()).unwrap();

        store.persist(&table).unwrap();
        let reloaded = store.load().unwrap();

        assert_eq!(reloaded, table);
        assert_eq!(reloaded.rows[1].phone, "0012");
    }

    #[test]
    fn duplicate_add_keeps_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let table = store
            .add_on(&ProspectTable::default(), new_prospect("Acme", "a@acme.co.ke", "0712345678"), today())
            .unwrap();

        let mut again = new_prospect("Acme", "a@acme.co.ke", "254712345678");
        again.notes = "second attempt".to_string();
        again.opportunity_size = 1.0;
        let table = store.add_on(&table, again, today()).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.rows[0].notes, "Met at the expo");
        assert_eq!(table.rows[0].opportunity_size, 150_000.46);
    }

    #[test]
    fn blank_identity_fields_are_rejected_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut blank = new_prospect("Acme", "a@acme.co.ke", "0712345678");
        blank.contact_person = "   ".to_string();

        let err = store.add_on(&ProspectTable::default(), blank, today()).unwrap_err();

        assert!(matches!(err, TrackerError::Validation(msg) if msg.contains("Contact Person")));
        assert!(!store.path().exists());
    }

    #[test]
    fn negative_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut negative = new_prospect("Acme", "a@acme.co.ke", "0712345678");
        negative.opportunity_size = -5.0;

        assert!(matches!(
            store.add_on(&ProspectTable::default(), negative, today()),
            Err(TrackerError::Validation(_))
        ));
    }

    #[test]
    fn update_changes_only_given_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let before = store
            .add_on(&ProspectTable::default(), new_prospect("Acme", "a@acme.co.ke", "0712345678"), today())
            .unwrap();

        let changes = ProspectChanges {
            stage: Some(Stage::Negotiation),
            notes: Some("Sent revised pricing".to_string()),
            ..Default::default()
        };
        let after = store.update(&before, "Acme", changes).unwrap();

        let mut expected = before.rows[0].clone();
        expected.stage = Stage::Negotiation;
        expected.notes = "Sent revised pricing".to_string();
        assert_eq!(after.rows, vec![expected]);
    }

    #[test]
    fn update_rewrites_uploaded_dates_in_tracker_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let upload = format!(
            "{}\nAcme,Jane,a@acme.co.ke,0712345678,100.0,Open,Contacted,Retail,2025-03-01,,No\n\
             Beta,Joe,b@beta.co.ke,0722222222,50.0,Open,Contacted,Retail,next week,,No\n",
            PROSPECT_COLUMNS.join(",")
        );
        let table = store.replace_all(upload.as_bytes()).unwrap();
        assert_eq!(table.rows[0].follow_up_date, "2025-03-01");

        let notes = |text: &str| ProspectChanges {
            notes: Some(text.to_string()),
            ..Default::default()
        };
        let table = store.update(&table, "Acme", notes("called")).unwrap();
        let table = store.update(&table, "Beta", notes("emailed")).unwrap();

        assert_eq!(table.rows[0].follow_up_date, "01/03/2025");
        assert_eq!(table.rows[1].follow_up_date, "next week");
    }

    #[test]
    fn update_targets_last_row_with_the_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut table = ProspectTable::default();
        table = store.add_on(&table, new_prospect("Acme", "one@acme.co.ke", "0711111111"), today()).unwrap();
        table = store.add_on(&table, new_prospect("Acme", "two@acme.co.ke", "0722222222"), today()).unwrap();

        let changes = ProspectChanges {
            status: Some(Status::Closed),
            ..Default::default()
        };
        let table = store.update(&table, "Acme", changes).unwrap();

        assert_eq!(table.rows[0].status, Status::Open);
        assert_eq!(table.rows[1].status, Status::Closed);
    }

    #[test]
    fn update_of_unknown_name_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let err = store
            .update(&ProspectTable::default(), "Nobody", ProspectChanges::default())
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(name) if name == "Nobody"));
    }

    #[test]
    fn upload_missing_a_column_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let table = store
            .add_on(&ProspectTable::default(), new_prospect("Acme", "a@acme.co.ke", "0712345678"), today())
            .unwrap();
        let on_disk = fs::read_to_string(store.path()).unwrap();

        let upload = "Prospect Name,Contact Person,Email,Phone,Opportunity Size (KES),Status,Stage,Industry,Follow-up Date,Notes\n\
                      Zeta,Z,z@z.com,0700,10,Open,Won,Retail,01/01/2025,\n";
        let err = store.replace_all(upload.as_bytes()).unwrap_err();

        assert!(matches!(err, TrackerError::SchemaMismatch { ref missing } if missing == &vec!["Priority".to_string()]));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), on_disk);
        assert_eq!(store.load().unwrap(), table);
    }

    #[test]
    fn upload_with_extra_columns_replaces_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let table = store
            .add_on(&ProspectTable::default(), new_prospect("Acme", "a@acme.co.ke", "0712345678"), today())
            .unwrap();

        let upload = "Region,Prospect Name,Contact Person,Email,Phone,Opportunity Size (KES),Status,Stage,Industry,Follow-up Date,Notes,Priority\n\
                      Coast,Zeta,Z,z@z.com,0700123456,2500.5,Closed,Won,Real Estate,01/01/2025,signed,Yes\n";
        let table = store.replace_all(upload.as_bytes()).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.rows[0].name, "Zeta");
        assert_eq!(table.rows[0].industry, Industry::RealEstate);
        assert_eq!(table.rows[0].phone, "0700123456");
        assert!(!fs::read_to_string(store.path()).unwrap().contains("Region"));
    }

    #[test]
    fn older_files_without_priority_default_to_no() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(
            store.path(),
            "Prospect Name,Contact Person,Email,Phone,Opportunity Size (KES),Status,Stage,Industry,Follow-up Date,Notes\n\
             Acme,Jane,a@acme.co.ke,0712345678,100.0,Open,Tender,Finance,05/05/2025,\n",
        )
        .unwrap();

        let table = store.load().unwrap();
        assert_eq!(table.rows[0].priority, Priority::No);
        assert_eq!(table.rows[0].stage, Stage::Tender);
    }

    #[test]
    fn export_writes_a_full_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let table = store
            .add_on(&ProspectTable::default(), new_prospect("Acme", "a@acme.co.ke", "0712345678"), today())
            .unwrap();
        let copy = dir.path().join("download.csv");

        store.export(&table, &copy).unwrap();

        assert_eq!(
            fs::read_to_string(&copy).unwrap(),
            fs::read_to_string(store.path()).unwrap()
        );
    }
}
