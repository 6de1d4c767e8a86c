//! Command-line entry point: parses CLI flags, loads the TOML
//! configuration, wires up the compiled-in plugins, and drives the agent
//! until a termination signal arrives (or, on Unix, reloads it on SIGHUP).

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use env_logger::Env;
use tokio_util::sync::CancellationToken;

use straw_agent::agent::config::{Loader, Registry};
use straw_agent::inputs::mem::MemInput;
use straw_agent::outputs::file::{FileOutput, FileOutputConfig};

#[derive(Parser)]
#[command(name = "straw-agent", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "STRAW_AGENT_CONFIG", default_value = "straw-agent.toml")]
    config: PathBuf,

    /// Config overrides, as `key=value` TOML fragments merged over the
    /// file (e.g. `--config-override agent.interval='"5s"'`).
    #[arg(long)]
    config_override: Vec<String>,
}

fn build_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_input("mem", Box::new(|_table| Ok(Box::new(MemInput::new()) as Box<dyn straw_agent::input::Input>)));
    registry.register_output(
        "file",
        Box::new(|table| {
            let text = toml::to_string(table).unwrap_or_default();
            let config: FileOutputConfig = toml::from_str(&text).unwrap_or_default();
            Ok(Box::new(FileOutput::new(config)) as Box<dyn straw_agent::output::Output>)
        }),
    );
    registry
}

fn cli_overrides(cli: &Cli) -> anyhow::Result<Option<toml::Table>> {
    if cli.config_override.is_empty() {
        return Ok(None);
    }
    let mut merged = toml::Table::new();
    for fragment in &cli.config_override {
        let parsed = toml::Table::from_str(fragment)
            .map_err(|e| anyhow::anyhow!("invalid --config-override '{fragment}': {e}"))?;
        straw_agent::agent::config::merge_override(&mut merged, parsed);
    }
    Ok(Some(merged))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let _ = straw_agent::version::set(env!("CARGO_PKG_VERSION"));
    log::info!("starting straw-agent v{}", straw_agent::version::get());

    let cli = Cli::parse();

    loop {
        let mut loader = Loader::parse_file(cli.config.clone());
        if let Some(overrides) = cli_overrides(&cli)? {
            loader = loader.with_override(overrides);
        }
        let raw = loader.load()?;
        if raw.agent.quiet {
            log::set_max_level(log::LevelFilter::Warn);
        }

        let registry = build_registry();
        let agent = straw_agent::agent::config::build(raw, &registry)?;

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let mut handle = tokio::spawn(agent.run(run_cancel));

        let reload = wait_for_shutdown_or_reload(&cancel, &mut handle).await?;
        if !reload {
            break;
        }
        log::info!("SIGHUP received, reloading configuration");
    }

    Ok(())
}

/// Waits for the agent task to finish on its own, for Ctrl+C / SIGTERM (in
/// which case the agent is cancelled and awaited), or, on Unix, for SIGHUP
/// (in which case the agent is cancelled, awaited, and the caller is told
/// to reload). Returns `true` only for the SIGHUP/reload case.
async fn wait_for_shutdown_or_reload(
    cancel: &CancellationToken,
    handle: &mut tokio::task::JoinHandle<anyhow::Result<()>>,
) -> anyhow::Result<bool> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        tokio::select! {
            res = &mut *handle => return res?.map(|()| false),
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = sighup.recv() => {
                cancel.cancel();
                handle.await??;
                return Ok(true);
            }
        }
        cancel.cancel();
        handle.await??;
        Ok(false)
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            res = &mut *handle => return res?.map(|()| false),
            _ = tokio::signal::ctrl_c() => {}
        }
        cancel.cancel();
        handle.await??;
        Ok(false)
    }
}
