// CLI subcommands

pub mod cpu;
pub mod run;
