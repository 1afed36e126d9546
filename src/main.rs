use anyhow::{bail, Result};
use mailconv::{ConvertOptions, MailConverter, PipelineError, StopReason};
use std::path::PathBuf;
use std::process::ExitCode;

const DEFAULT_STORE_DIR: &str = "mailstore";

fn main() -> ExitCode {
    match run() {
        Ok(StopReason::Completed) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(2),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<StopReason> {
    mailconv::init_tracing_once();

    let mut args = std::env::args_os().skip(1);
    let Some(mbox) = args.next().map(PathBuf::from) else {
        bail!("usage: mailconv <mbox-file> [target-dir]");
    };
    if !mbox.is_file() {
        bail!("{} is not a file", mbox.display());
    }
    // Output lands beside the archive unless told otherwise.
    let target = match args.next() {
        Some(t) => PathBuf::from(t),
        None => mbox.parent().map(|p| p.join(DEFAULT_STORE_DIR)).unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR)),
    };

    let opts = ConvertOptions::default().overlay_env();
    let label = mbox.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let converter = MailConverter::with_options(opts).progress_label(label);

    let shutdown = converter.shutdown_coordinator();
    if let Err(e) = shutdown.spawn_signal_listener() {
        tracing::warn!("signal handling unavailable: {}", e);
    }

    let report = match converter.convert_mbox(&mbox, &target, &shutdown) {
        Ok(r) => r,
        Err(e) => {
            if let Some(PipelineError::SourceRead { position, .. }) = e.downcast_ref::<PipelineError>() {
                eprintln!("stopped reading {} at record {}; rerun to resume", mbox.display(), position);
            }
            return Err(e);
        }
    };

    println!("{}", report);
    println!("Mail store: {}", target.display());
    Ok(report.stop_reason)
}
