use std::path::Path;

use log::{info, LevelFilter};
use pgexec::{config::SETTINGS_FILE, Client, ConnectionConfig, Settings, DEFAULT_PROGRAM};
use simplelog::{ColorChoice, TerminalMode};
use sql_bench::{BenchOptions, Harness};

fn main() {
    let Err(e) = run() else {
        return;
    };
    let err = e.downcast_ref::<pgexec::Error>();
    if let Some(pgexec::Error::CommandFailed { stderr, .. }) = err {
        // Forward the client's own diagnostics untouched
        eprint!("{stderr}");
    }
    let code = err.map_or(1, pgexec::Error::exit_code);
    eprintln!("Error: {e:#}");
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    simplelog::TermLogger::init(
        LevelFilter::Info,
        simplelog::ConfigBuilder::new()
            .add_filter_allow_str("pgexec")
            .add_filter_allow_str("sql_bench")
            .build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;

    let settings = Settings::load(Path::new(SETTINGS_FILE))?;
    let config = ConnectionConfig::from_settings(&settings)?;
    let options = BenchOptions::from_settings(&settings)?;
    let client = Client::with_program(settings.get("PSQL").unwrap_or(DEFAULT_PROGRAM), &config);

    info!(
        "{} runs per file against {}:{}/{} (sslmode={})",
        options.runs, config.host, config.port, config.database, config.ssl_mode
    );
    let harness = Harness::new(client, config.database, options)?;
    let (results, path) = sql_bench::run(&harness)?;
    results.stdout()?;
    println!("Wrote results to {}", path.display());

    Ok(())
}
