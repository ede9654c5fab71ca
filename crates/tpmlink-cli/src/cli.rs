use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tpmlink_tcti::{exchange, Response, TctiError, TctiFile, TctiSpec, Timeout};

#[derive(Parser, Debug)]
#[command(name = "tpm-send")]
#[command(about = "Send one raw TPM command through a TCTI", long_about = None)]
pub struct Cli {
    /// Transport as `name[:conf]`, e.g. `mssim:host=localhost,port=2321`
    #[arg(short, long)]
    pub tcti: Option<String>,

    /// Transport config file (.toml or .json)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Receive timeout in milliseconds; blocks when absent
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Locality to send the command at
    #[arg(short, long)]
    pub locality: Option<u8>,

    /// Command bytes in hex, header included
    pub command: String,
}

/// Everything needed to run one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub spec: TctiSpec,
    pub timeout: Timeout,
    pub locality: Option<u8>,
    pub command: Vec<u8>,
}

impl Cli {
    /// Resolve the transport: `--tcti`, then `--config`, then the
    /// environment, then the default simulator.
    pub fn plan(&self) -> Result<Plan> {
        let file = match &self.config {
            Some(path) => Some(
                TctiFile::from_file(path)
                    .with_context(|| format!("loading {}", path.display()))?,
            ),
            None => None,
        };

        let spec = if let Some(tcti) = &self.tcti {
            tcti.parse()
                .with_context(|| format!("invalid --tcti '{}'", tcti))?
        } else if let Some(file) = &file {
            file.tcti.clone()
        } else if let Some(spec) = TctiSpec::from_env()? {
            spec
        } else {
            TctiSpec::default()
        };

        let timeout_ms = self
            .timeout_ms
            .or_else(|| file.as_ref().and_then(|f| f.timeout_ms));
        let timeout = match timeout_ms {
            Some(ms) => Timeout::After(Duration::from_millis(ms)),
            None => Timeout::Block,
        };
        let locality = self
            .locality
            .or_else(|| file.as_ref().and_then(|f| f.locality));

        Ok(Plan {
            spec,
            timeout,
            locality,
            command: parse_hex(&self.command)?,
        })
    }
}

impl Plan {
    /// Open the transport, run the exchange and close it again.
    pub fn run(&self) -> Result<Response> {
        tracing::info!(tcti = %self.spec, "opening transport");
        let mut ctx = self.spec.open().context("opening transport")?;
        if let Some(locality) = self.locality {
            ctx.set_locality(locality).context("setting locality")?;
        }
        let response = exchange(&mut ctx, &self.command, self.timeout)?;
        ctx.finalize()?;
        Ok(response)
    }
}

/// Decode hex, ignoring whitespace and an optional `0x` prefix.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input.split_whitespace().collect();
    let digits = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
        .unwrap_or(&cleaned);
    hex::decode(digits).context("command is not valid hex")
}

/// TSS2 response code of the first transport error in the chain.
pub fn tss2_rc(err: &anyhow::Error) -> Option<u32> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<TctiError>())
        .map(TctiError::rc)
}

pub fn render(response: &Response) -> String {
    format!(
        "tag:  0x{:04X}\nsize: {}\ncode: {}\n{}",
        response.header.tag,
        response.header.size,
        response.code(),
        hex::encode(&response.bytes)
    )
}
