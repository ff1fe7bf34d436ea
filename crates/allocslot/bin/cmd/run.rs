use allocslot::scenario::builtin;
use allocslot::{Format, Scenario, ScenarioDriver, SystemProvider};
use clap::Parser;
use eyre::{bail, eyre, Result};
use std::path::PathBuf;

#[derive(Debug, Parser)]
pub struct RunArgs {
    #[arg(
        long = "scenario",
        value_name = "NAME",
        value_parser = builtin::NAMES,
        help = "Built-in scenario to run (a, b or c). Repeatable"
    )]
    scenarios: Vec<String>,

    #[arg(long = "file", value_name = "PATH", help = "JSON scenario file to run. Repeatable")]
    files: Vec<PathBuf>,

    #[arg(long, value_enum, default_value_t = Format::Table, help = "Output format")]
    format: Format,
}

impl RunArgs {
    fn scenarios(&self) -> Result<Vec<Scenario>> {
        if self.scenarios.is_empty() && self.files.is_empty() {
            return Ok(builtin::all());
        }

        let mut scenarios = Vec::new();
        for name in &self.scenarios {
            match builtin::by_name(name) {
                Some(scenario) => scenarios.push(scenario),
                None => bail!("unknown built-in scenario {name:?}"),
            }
        }
        for path in &self.files {
            scenarios.push(Scenario::from_path(path)?);
        }
        Ok(scenarios)
    }

    pub fn run(&self) -> Result<()> {
        let driver = ScenarioDriver::new(SystemProvider);
        let reports = self
            .scenarios()?
            .iter()
            .map(|scenario| driver.run(scenario))
            .collect::<Result<Vec<_>, _>>()?;

        self.format
            .reporter()
            .report(&reports)
            .map_err(|e| eyre!("failed to write report: {e}"))?;

        let failed: Vec<&str> = reports
            .iter()
            .filter(|r| !r.passed())
            .map(|r| r.name.as_str())
            .collect();
        if !failed.is_empty() {
            bail!("{} scenario(s) failed: {}", failed.len(), failed.join(", "));
        }
        Ok(())
    }
}
