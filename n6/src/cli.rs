use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::ArgMatches;
use clap_complete::Shell;
use n6_aggregator::{Aggregator, AggregatorDataManager, RunOutcome, StdioTransport};
use n6_config::{Config, OverridableConfig};

use crate::cliapp::make_app;
use crate::setup;

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();

    match matches.subcommand() {
        Some(("run", matches)) => run(load_config(matches)?),
        Some(("inspect", matches)) => inspect(load_config(matches)?),
        Some(("generate-completions", matches)) => generate_completions(matches),
        _ => unreachable!(),
    }
}

/// Loads the config folder and applies overrides from the environment.
fn load_config(matches: &ArgMatches) -> Result<Config> {
    let Some(path) = crate::cliapp::config_path(matches) else {
        anyhow::bail!("missing config folder");
    };

    let mut config = Config::from_path(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    config.apply_override(OverridableConfig::from_env())?;

    Ok(config)
}

pub fn run(config: Config) -> Result<()> {
    setup::init_logging(&config);
    setup::dump_spawn_infos(&config);
    setup::init_metrics(&config)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;

    // The state is restored and compacted before the signal handlers are installed.
    let outcome = runtime.block_on(async {
        let manager = AggregatorDataManager::start(config.aggregator().clone())?;
        Aggregator::new(manager, StdioTransport::stdio())
            .run(setup::shutdown_signal())
            .await
    })?;

    match outcome {
        RunOutcome::Stopped => n6_log::info!("aggregator stopped"),
        RunOutcome::RestartRequested => n6_log::info!("aggregator stopped, restart requested"),
    }

    Ok(())
}

pub fn inspect(config: Config) -> Result<()> {
    setup::init_logging(&config);

    let summary = n6_aggregator::inspect_state(config.aggregator())
        .context("failed to inspect the aggregator state")?;

    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &summary)?;
    writeln!(stdout)?;

    Ok(())
}

pub fn generate_completions(matches: &ArgMatches) -> Result<()> {
    let shell = match matches.get_one::<Shell>("format") {
        Some(shell) => *shell,
        None => Shell::from_env().unwrap_or(Shell::Bash),
    };

    let mut app = make_app();
    let name = app.get_name().to_owned();
    clap_complete::generate(shell, &mut app, name, &mut io::stdout());

    Ok(())
}
