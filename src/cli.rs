use crate::core::supervisor::run_sandboxed;
use crate::exec::codec::{self, PathEncoding};
use crate::observability::events::{EventSink, LogEventSink};
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

const INFO_FLAG: &str = "sandboxedProcessInfo";
const RESULT_FLAG: &str = "sandboxedProcessResult";

#[derive(Parser, Debug)]
#[command(
    name = "pipbox-exec",
    author,
    version,
    about = "Runs one sandboxed process from a request blob and writes its response blob",
    long_about = None
)]
struct Cli {
    /// `/sandboxedProcessInfo:<path>` and `/sandboxedProcessResult:<path>`
    #[arg(value_name = "FLAG", required = true)]
    flags: Vec<String>,
}

/// Blob locations handed to the helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperArguments {
    pub info_path: PathBuf,
    pub result_path: PathBuf,
}

/// Parse `/name:value` flags; names are case-insensitive and each must appear once.
pub fn parse_helper_arguments<S: AsRef<str>>(raw: &[S]) -> Result<HelperArguments> {
    let mut info_path = None;
    let mut result_path = None;

    for arg in raw {
        let arg = arg.as_ref();
        let (name, value) = arg
            .strip_prefix('/')
            .and_then(|rest| rest.split_once(':'))
            .ok_or_else(|| anyhow!("malformed argument '{}', expected /name:value", arg))?;
        if value.is_empty() {
            bail!("argument /{} has an empty value", name);
        }

        let slot = if name.eq_ignore_ascii_case(INFO_FLAG) {
            &mut info_path
        } else if name.eq_ignore_ascii_case(RESULT_FLAG) {
            &mut result_path
        } else {
            bail!("unknown argument /{}", name);
        };
        if slot.replace(PathBuf::from(value)).is_some() {
            bail!("argument /{} given more than once", name);
        }
    }

    Ok(HelperArguments {
        info_path: info_path.ok_or_else(|| anyhow!("missing /{}:<path>", INFO_FLAG))?,
        result_path: result_path.ok_or_else(|| anyhow!("missing /{}:<path>", RESULT_FLAG))?,
    })
}

/// Load the request, run it under a local supervisor and write the response.
pub fn execute(args: &HelperArguments) -> Result<()> {
    let info = codec::load_request(&args.info_path)
        .with_context(|| format!("cannot read request {}", args.info_path.display()))?;
    let pip = info.pip.clone();
    log::info!("[{}] running {}", pip, info.command_line());

    let events: Arc<dyn EventSink> = Arc::new(LogEventSink);
    let result =
        run_sandboxed(info, events).with_context(|| format!("[{}] sandboxed run failed", pip))?;

    codec::save_result(&args.result_path, &result, PathEncoding::PathTableId)
        .with_context(|| format!("cannot write response {}", args.result_path.display()))?;
    log::info!(
        "[{}] finished with exit code {} (killed: {}, timed out: {})",
        pip,
        result.exit_code,
        result.killed,
        result.timed_out
    );
    Ok(())
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let args = parse_helper_arguments(&cli.flags)?;
    execute(&args)
}
