//! Table and JSON rendering of booking reports.

use tabled::{Table, Tabled};

use seatbook_core::result::AppResult;
use seatbook_engine::{Outcome, Report};

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Seat grid and outcome table
    #[default]
    Table,
    /// The whole report as JSON
    Json,
}

/// One line of the outcome table.
#[derive(Debug, Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Passenger")]
    passenger: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Seat")]
    seat: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Detail")]
    detail: String,
}

impl From<&Outcome> for OutcomeRow {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Assigned {
                passenger,
                seat,
                attempts,
            } => Self {
                passenger: passenger.to_string(),
                status: "assigned".to_string(),
                seat: seat.label.clone(),
                attempts: *attempts,
                detail: String::new(),
            },
            Outcome::Failed {
                passenger,
                reason,
                kind,
                message,
                attempts,
            } => Self {
                passenger: passenger.to_string(),
                status: format!("failed ({reason})"),
                seat: "-".to_string(),
                attempts: *attempts,
                detail: format!("{kind}: {message}"),
            },
        }
    }
}

/// Print a report in the selected format
pub fn print_report(report: &Report, format: OutputFormat) -> AppResult<()> {
    match format {
        OutputFormat::Table => {
            print_kv("Run", &report.run_id().to_string());
            let trip = report.trip();
            print_kv("Trip", &format!("{} ({})", trip.code, trip.id));
            print_kv("Lock strategy", report.lock_strategy().as_str());
            print_kv("Isolation level", report.isolation_level().as_str());
            print_kv(
                "Pool",
                &format!(
                    "{} connection(s), {} used at peak",
                    report.pool_capacity(),
                    report.pool_high_water()
                ),
            );
            println!();
            print!("{}", render_grid(report));
            println!();

            if report.outcomes().is_empty() {
                println!("No passengers.");
            } else {
                let rows: Vec<OutcomeRow> =
                    report.outcomes().iter().map(OutcomeRow::from).collect();
                println!("{}", Table::new(rows));
            }
            println!();
            print_kv(
                "Result",
                &format!(
                    "{} assigned, {} failed, {} failed attempt(s)",
                    report.assigned_count(),
                    report.failed_count(),
                    report.attempt_log().len()
                ),
            );
            print_kv("Elapsed", &format!("{:?}", report.elapsed()));
        }
        OutputFormat::Json => println!("{}", render_json(report)?),
    }
    Ok(())
}

/// The whole report as pretty-printed JSON.
pub fn render_json(report: &Report) -> AppResult<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

/// Seat grid, one line per row: `x` occupied, `.` free, a gap at the aisle.
pub fn render_grid(report: &Report) -> String {
    let aisle_after = report.layout().aisle_after as usize;
    let mut out = String::new();

    for (index, row) in report.rows().enumerate() {
        out.push_str(&format!("{:>3} ", index + 1));
        for (column, slot) in row.iter().enumerate() {
            if aisle_after > 0 && column == aisle_after {
                out.push_str("  ");
            }
            out.push(if slot.is_some() { 'x' } else { '.' });
        }
        out.push('\n');
    }
    out
}

/// Print a success message
pub fn print_success(msg: &str) {
    println!("✓ {}", msg);
}

/// Print an error message
pub fn print_error(msg: &str) {
    eprintln!("✗ {}", msg);
}

/// Print a key-value pair
pub fn print_kv(key: &str, value: &str) {
    println!("  {:<24} {}", format!("{}:", key), value);
}
