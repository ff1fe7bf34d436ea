use colored::*;
use prettytable::{color, Attr, Cell, Row, Table};
use serde::Serialize;

use crate::engine::{HandlerSource, Resolution};
use crate::scenario::ScenarioReport;
use crate::slot::{EntryPointSlot, FailureMode, Operation};
use crate::table::ReleaseForm;

/// Output format for the `run` and `resolve` commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    #[default]
    Table,
    Json,
    JsonPretty,
}

impl Format {
    pub fn reporter(self) -> Box<dyn Reporter> {
        match self {
            Format::Table => Box::new(TableReporter),
            Format::Json => Box::new(JsonReporter),
            Format::JsonPretty => Box::new(JsonPrettyReporter),
        }
    }
}

/// Trait for implementing custom scenario report output.
///
/// # Examples
///
/// ```rust
/// use allocslot::{Reporter, ScenarioReport};
/// use std::error::Error;
///
/// struct Summary;
///
/// impl Reporter for Summary {
///     fn report(&self, reports: &[ScenarioReport]) -> Result<(), Box<dyn Error>> {
///         let failed = reports.iter().filter(|r| !r.passed()).count();
///         println!("{failed} of {} scenarios failed", reports.len());
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter {
    fn report(&self, reports: &[ScenarioReport]) -> Result<(), Box<dyn std::error::Error>>;
}

fn use_colors() -> bool {
    std::env::var("NO_COLOR").is_err()
}

fn header_row(headers: &[&str]) -> Row {
    let colors = use_colors();
    Row::new(
        headers
            .iter()
            .map(|header| {
                if colors {
                    Cell::new(header)
                        .with_style(Attr::Bold)
                        .with_style(Attr::ForegroundColor(color::CYAN))
                } else {
                    Cell::new(header).with_style(Attr::Bold)
                }
            })
            .collect(),
    )
}

fn source_label(source: HandlerSource) -> &'static str {
    match source {
        HandlerSource::User => "user",
        HandlerSource::Default => "default",
    }
}

fn form_label(form: Option<ReleaseForm>) -> String {
    match form {
        None => "-".to_string(),
        Some(ReleaseForm::Unsized) => "unsized".to_string(),
        Some(ReleaseForm::Sized(size)) => format!("sized({size})"),
    }
}

/// How a slot is reached from ordinary code.
pub fn reached_by(slot: EntryPointSlot) -> &'static str {
    match (slot.operation(), slot.failure_mode()) {
        (Operation::Allocate, FailureMode::Throwing) => "allocation, failure is an error",
        (Operation::Allocate, FailureMode::Reporting) => "allocation, failure is a null result",
        (Operation::Release, FailureMode::Throwing) => "release",
        (Operation::Release, FailureMode::Reporting) => "unwind of a reporting allocation",
    }
}

/// Table of every slot and the request shape that selects it.
pub fn slots_table() -> Table {
    let mut table = Table::new();
    table.add_row(header_row(&[
        "#",
        "slot",
        "operation",
        "kind",
        "alignment",
        "failure mode",
        "reached by",
    ]));
    for slot in EntryPointSlot::ALL {
        table.add_row(Row::new(vec![
            Cell::new(&slot.index().to_string()),
            Cell::new(slot.name()),
            Cell::new(&slot.operation().to_string()),
            Cell::new(&slot.kind().to_string()),
            Cell::new(&slot.alignment().to_string()),
            Cell::new(&slot.failure_mode().to_string()),
            Cell::new(reached_by(slot)),
        ]));
    }
    table
}

/// Single-row table for one resolution.
pub fn resolution_table(resolution: &Resolution) -> Table {
    let mut table = Table::new();
    table.add_row(header_row(&["slot", "source", "form"]));
    table.add_row(Row::new(vec![
        Cell::new(resolution.slot.name()),
        Cell::new(source_label(resolution.source)),
        Cell::new(&form_label(resolution.form)),
    ]));
    table
}

/// Steps of one scenario with the slot and handler each resolved to.
pub fn steps_table(report: &ScenarioReport) -> Table {
    let mut table = Table::new();
    table.add_row(header_row(&["step", "op", "handle", "slot", "source", "form"]));
    for step in &report.steps {
        table.add_row(Row::new(vec![
            Cell::new(&step.index.to_string()),
            Cell::new(&step.op),
            Cell::new(&step.handle),
            Cell::new(step.resolution.slot.name()),
            Cell::new(source_label(step.resolution.source)),
            Cell::new(&form_label(step.resolution.form)),
        ]));
    }
    table
}

/// Nonzero counters plus every slot an expectation disagreed on.
pub fn counters_table(report: &ScenarioReport) -> Table {
    let mut table = Table::new();
    table.add_row(header_row(&["slot", "count", "expected"]));
    for slot in EntryPointSlot::ALL {
        let count = report.counters.get(slot);
        let mismatch = report
            .mismatches
            .iter()
            .rev()
            .find(|m| m.slot == slot && m.step.is_none());
        if count == 0 && mismatch.is_none() {
            continue;
        }
        let expected = mismatch.map_or_else(String::new, |m| m.expected.to_string());
        table.add_row(Row::new(vec![
            Cell::new(slot.name()),
            Cell::new(&count.to_string()),
            Cell::new(&expected),
        ]));
    }
    table
}

fn display_report(report: &ScenarioReport) {
    let status = if report.passed() {
        "PASS".green().bold()
    } else {
        "FAIL".red().bold()
    };
    println!(
        "{} scenario {} - {} [{}]",
        "[allocslot]".blue().bold(),
        report.name.yellow().bold(),
        report.description,
        status
    );
    if !report.overrides.is_empty() {
        let names: Vec<&str> = report.overrides.iter().map(|s| s.name()).collect();
        println!("overrides: {}", names.join(", "));
    }

    steps_table(report).printstd();
    counters_table(report).printstd();

    for mismatch in &report.mismatches {
        let at = match mismatch.step {
            Some(step) => format!("after step {step}"),
            None => "at end".to_string(),
        };
        println!(
            "  {} {}: expected {}, got {}",
            at.dimmed(),
            mismatch.slot.name().red(),
            mismatch.expected,
            mismatch.actual
        );
    }
    if !report.outstanding.is_empty() {
        println!(
            "  {} {}",
            "released after the run:".dimmed(),
            report.outstanding.join(", ")
        );
    }
    println!();
}

pub struct TableReporter;

impl Reporter for TableReporter {
    fn report(&self, reports: &[ScenarioReport]) -> Result<(), Box<dyn std::error::Error>> {
        if reports.is_empty() {
            println!("{} no scenarios ran", "[allocslot]".blue().bold());
            return Ok(());
        }

        for report in reports {
            display_report(report);
        }
        let failed = reports.iter().filter(|r| !r.passed()).count();
        println!(
            "{} passed, {} failed",
            (reports.len() - failed).to_string().green(),
            failed.to_string().red()
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct ReportsJson<'a> {
    passed: bool,
    scenarios: &'a [ScenarioReport],
}

impl<'a> From<&'a [ScenarioReport]> for ReportsJson<'a> {
    fn from(reports: &'a [ScenarioReport]) -> Self {
        Self {
            passed: reports.iter().all(ScenarioReport::passed),
            scenarios: reports,
        }
    }
}

pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn report(&self, reports: &[ScenarioReport]) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", serde_json::to_string(&ReportsJson::from(reports))?);
        Ok(())
    }
}

pub struct JsonPrettyReporter;

impl Reporter for JsonPrettyReporter {
    fn report(&self, reports: &[ScenarioReport]) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", serde_json::to_string_pretty(&ReportsJson::from(reports))?);
        Ok(())
    }
}
