use crate::models::{Industry, Priority, Prospect, Stage, Status};
use crate::store::ProspectTable;

pub const PHONE_MASK: &str = "****";

#[derive(Debug, Clone, Default)]
pub struct ViewFilter {
    pub stage: Option<Stage>,
    pub status: Option<Status>,
    pub industry: Option<Industry>,
    pub min_opportunity: f64,
}

impl ViewFilter {
    fn matches(&self, prospect: &Prospect) -> bool {
        self.stage.map_or(true, |stage| prospect.stage == stage)
            && self.status.map_or(true, |status| prospect.status == status)
            && self.industry.map_or(true, |industry| prospect.industry == industry)
            && prospect.opportunity_size >= self.min_opportunity
    }
}

/// Filtered, priority-first copy of the table with phones masked for display.
pub fn filtered_view(table: &ProspectTable, filter: &ViewFilter) -> Vec<Prospect> {
    let mut rows: Vec<Prospect> = table
        .iter()
        .filter(|prospect| filter.matches(prospect))
        .cloned()
        .collect();

    rows.sort_by_key(|prospect| prospect.priority != Priority::Yes);

    for row in &mut rows {
        row.phone = mask_phone(&row.phone);
    }
    rows
}

/// Keep the first four and last two characters of a phone number.
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= 6 {
        return PHONE_MASK.to_string();
    }

    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}{}", head, PHONE_MASK, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prospect(name: &str, size: f64, priority: Priority, stage: Stage) -> Prospect {
        Prospect {
            name: name.to_string(),
            contact_person: "Contact".to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            phone: "0712345678".to_string(),
            opportunity_size: size,
            status: Status::Open,
            stage,
            industry: Industry::Retail,
            follow_up_date: "01/01/2025".to_string(),
            notes: String::new(),
            priority,
        }
    }

    fn sample() -> ProspectTable {
        ProspectTable::new(vec![
            prospect("A", 500.0, Priority::No, Stage::Contacted),
            prospect("B", 50.0, Priority::Yes, Stage::Contacted),
            prospect("C", 1500.0, Priority::Yes, Stage::Won),
            prospect("D", 2500.0, Priority::No, Stage::Contacted),
            prospect("E", 100.0, Priority::Yes, Stage::Contacted),
        ])
    }

    #[test]
    fn priority_rows_come_first_and_keep_their_order() {
        let view = filtered_view(&sample(), &ViewFilter::default());
        let names: Vec<&str> = view.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["B", "C", "E", "A", "D"]);
    }

    #[test]
    fn minimum_size_is_inclusive() {
        let filter = ViewFilter {
            min_opportunity: 100.0,
            ..Default::default()
        };
        let view = filtered_view(&sample(), &filter);

        assert!(view.iter().all(|p| p.opportunity_size >= 100.0));
        let names: Vec<&str> = view.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["C", "E", "A", "D"]);
    }

    #[test]
    fn equality_filters_combine() {
        let filter = ViewFilter {
            stage: Some(Stage::Contacted),
            status: Some(Status::Open),
            industry: Some(Industry::Retail),
            min_opportunity: 0.0,
        };
        let view = filtered_view(&sample(), &filter);
        assert_eq!(view.len(), 4);

        let none = ViewFilter {
            industry: Some(Industry::Finance),
            ..Default::default()
        };
        assert!(filtered_view(&sample(), &none).is_empty());
    }

    #[test]
    fn view_masks_phones_but_leaves_table_alone() {
        let table = sample();
        let view = filtered_view(&table, &ViewFilter::default());

        assert!(view.iter().all(|p| p.phone == "0712****78"));
        assert!(table.iter().all(|p| p.phone == "0712345678"));
    }

    #[test]
    fn short_phones_are_fully_masked() {
        assert_eq!(mask_phone("123456"), PHONE_MASK);
        assert_eq!(mask_phone(""), "");
        assert_eq!(mask_phone("1234567"), "1234****67");
    }
}
