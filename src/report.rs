use crate::models::{Industry, Priority, Prospect, Stage, Status};
use crate::store::ProspectTable;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub total_prospects: usize,
    pub open_deals: usize,
    pub closed_deals: usize,
    pub priority_prospects: usize,
    /// Stage counts in pipeline order, Tender counted as Lead Identified.
    pub funnel: Vec<(Stage, usize)>,
    /// Opportunity size per industry present in the table, never negative.
    pub industry_totals: Vec<(Industry, f64)>,
}

fn count(table: &ProspectTable, wanted: impl Fn(&Prospect) -> bool) -> usize {
    table.iter().filter(|p| wanted(p)).count()
}

pub fn summarize(table: &ProspectTable) -> PipelineSummary {
    let funnel = Stage::ALL
        .iter()
        .filter(|stage| **stage != Stage::Tender)
        .map(|stage| {
            let n = table
                .iter()
                .filter(|p| p.stage.reporting_stage() == *stage)
                .count();
            (*stage, n)
        })
        .filter(|(_, n)| *n > 0)
        .collect();

    let industry_totals = Industry::ALL
        .iter()
        .filter(|industry| table.iter().any(|p| p.industry == **industry))
        .map(|industry| {
            let total: f64 = table
                .iter()
                .filter(|p| p.industry == *industry)
                .map(|p| p.opportunity_size)
                .sum();
            (*industry, total.max(0.0))
        })
        .collect();

    PipelineSummary {
        total_prospects: table.len(),
        open_deals: count(table, |p| p.status == Status::Open),
        closed_deals: count(table, |p| p.status == Status::Closed),
        priority_prospects: count(table, |p| p.priority == Priority::Yes),
        funnel,
        industry_totals,
    }
}
