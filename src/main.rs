use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;

mod cli;

use cli::Cli;
use cli::commands::Commands;
use streamscope::config::JobConfig;
use streamscope::report::JobReport;

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("streamscope")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("streamscope.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Narrow the log level to the one the job asks for
fn apply_log_level(config: &JobConfig) -> Result<()> {
    if let Some(level) = &config.log_level {
        let level: log::LevelFilter = level
            .parse()
            .map_err(|_| eyre::eyre!("Invalid log_level '{}'", level))?;
        log::set_max_level(level);
    }
    Ok(())
}

async fn run_application(cli: &Cli, config: JobConfig) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        None => handle_run_command(config, false, cli.is_verbose()).await,
        Some(Commands::Run { json, .. }) => handle_run_command(config, *json, cli.is_verbose()).await,
        Some(Commands::Check { .. }) => handle_check_command(&config),
        Some(Commands::ShowConfig { .. }) => handle_show_config_command(&config),
    }
}

async fn handle_run_command(config: JobConfig, json: bool, verbose: bool) -> Result<()> {
    let scheduler = config.build_scheduler().context("Failed to build scheduler")?;
    info!(
        "Running {} modules on {} streams",
        config.modules.len(),
        config.streams
    );
    if !json {
        println!(
            "{} {} modules on {} streams",
            "Running:".cyan(),
            config.modules.len(),
            config.streams
        );
    }

    let report = scheduler.run(&config.input).await.context("Job failed")?;

    if json {
        let out = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        println!("{}", out);
    } else {
        print_report(&report, verbose);
    }
    Ok(())
}

fn print_report(report: &JobReport, verbose: bool) {
    println!("{} {}", "Done:".green(), report.summary_line());
    for module in &report.modules {
        let limit = module
            .concurrency_limit
            .map(|n| format!(" (limit {}, peak {})", n, module.peak_concurrency))
            .unwrap_or_default();
        println!(
            "  {:<28} passed {:>6}  rejected {:>6}{}",
            module.label, module.passed, module.rejected, limit
        );
    }
    if verbose {
        for stream in &report.per_stream {
            println!(
                "  {} {}: {} events, {} accepted",
                "stream".dimmed(),
                stream.stream,
                stream.events,
                stream.accepted
            );
        }
    }
}

fn handle_check_command(config: &JobConfig) -> Result<()> {
    config.check().context("Job check failed")?;
    let totals = config.input.totals();
    println!(
        "{} {} modules, {} runs, {} lumis, {} events",
        "OK:".green(),
        config.modules.len(),
        totals.runs,
        totals.lumis,
        totals.events
    );
    Ok(())
}

fn handle_show_config_command(config: &JobConfig) -> Result<()> {
    let yaml = config.to_yaml().context("Failed to serialize configuration")?;
    print!("{}", yaml);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let job_path = cli.job_path().cloned();
    let config = JobConfig::load(job_path.as_ref()).context("Failed to load configuration")?;
    apply_log_level(&config)?;

    info!("Starting with config from: {:?}", job_path);

    // Run the main application logic
    run_application(&cli, config).await.context("Application failed")?;

    Ok(())
}
