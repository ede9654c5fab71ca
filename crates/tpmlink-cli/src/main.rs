//! `tpm-send`: transmit one raw TPM command and print the response.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{render, tss2_rc, Cli};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let plan = cli.plan()?;
    let response = plan.run().inspect_err(|e| {
        if let Some(rc) = tss2_rc(e) {
            eprintln!("TSS2 rc: 0x{:08X}", rc);
        }
    })?;
    println!("{}", render(&response));
    Ok(())
}
