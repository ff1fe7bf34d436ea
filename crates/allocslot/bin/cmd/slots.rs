use allocslot::output::slots_table;
use allocslot::{DEFAULT_ALIGNMENT, SIZED_DEALLOCATION};
use clap::Parser;
use eyre::Result;

#[derive(Debug, Parser)]
pub struct SlotsArgs {}

impl SlotsArgs {
    pub fn run(&self) -> Result<()> {
        slots_table().printstd();
        println!("default alignment: {DEFAULT_ALIGNMENT} bytes");
        println!(
            "sized deallocation: {}",
            if SIZED_DEALLOCATION { "enabled" } else { "disabled" }
        );
        Ok(())
    }
}
