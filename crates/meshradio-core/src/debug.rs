use std::fs::OpenOptions;
use std::sync::Once;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt as tracingfmt, EnvFilter};

static INIT_LOG: Once = Once::new();

/// Sets up logging with maximum verbosity (trace level).
/// Mainly for unit tests.
pub fn setup_logging_verbose() {
    setup_logging(EnvFilter::new("trace"), None);
}

/// Sets up default logging to stdout and optionally, a verbose log file.
/// Returns a guard that needs to be kept alive for logging to file to work.
pub fn setup_logging_default(verbose_logfile: Option<String>) -> Option<WorkerGuard> {
    let stdout_filter = get_default_stdout_filter();
    let logfile_and_filter = verbose_logfile.map(|file| (file, get_default_logfile_filter()));

    setup_logging(stdout_filter, logfile_and_filter)
}

pub fn get_default_stdout_filter() -> EnvFilter {
    EnvFilter::new("info")
        // Hide continuous logs from the sample-rate paths
        .add_directive("meshradio_phy::dsp=warn".parse().unwrap())
        .add_directive("meshradio_phy::channelizer=warn".parse().unwrap())
        .add_directive("meshradio_phy::demodulator=info".parse().unwrap())
        .add_directive("meshradio_phy::synthesizer=info".parse().unwrap())
        // MAC slot machinery
        .add_directive("meshradio_mac=info".parse().unwrap())
        // Network-side elements
        .add_directive("meshradio_net=debug".parse().unwrap())
}

fn get_default_logfile_filter() -> EnvFilter {
    EnvFilter::new("debug")
}

/// Sets up logging to stdout and optionally, a verbose log file.
/// If an output file is requested, returns Some(WorkerGuard). Keep this value
/// alive or logging to file may cease working.
fn setup_logging(stdout_filter: EnvFilter, outfile: Option<(String, EnvFilter)>) -> Option<WorkerGuard> {
    if let Some((outfile, outfile_filter)) = outfile {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(outfile)
            .expect("Failed to open log file");
        let (file_writer, guard) = tracing_appender::non_blocking(file);

        INIT_LOG.call_once(|| {
            let file_layer = tracingfmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false)
                .with_file(true)
                .with_line_number(true);

            let stdout_layer = tracingfmt::layer()
                .with_target(false)
                .with_file(true)
                .with_line_number(true);

            tracing_subscriber::registry()
                .with(file_layer.with_filter(outfile_filter))
                .with(stdout_layer.with_filter(stdout_filter))
                .init();
        });

        Some(guard)
    } else {
        INIT_LOG.call_once(|| {
            let stdout_layer = tracingfmt::layer()
                .with_target(false)
                .with_file(true)
                .with_line_number(true);

            tracing_subscriber::registry()
                .with(stdout_layer.with_filter(stdout_filter))
                .init();
        });

        None
    }
}
