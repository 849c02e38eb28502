//! Command-line host for isoload plugin modules.

mod layout;
mod service;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use isoload_core::config::{HostConfig, env_vars};
use isoload_core::{PluginHost, ServiceCollaborator, UnloadOutcome};

use crate::service::HttpService;

/// isoload - Load, serve and unload plugin modules in isolation.
#[derive(Parser, Debug)]
#[command(name = "isoload")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Config file (TOML).
    #[arg(short, long, global = true, env = env_vars::CONFIG)]
    config: Option<PathBuf>,

    /// Plugin deployment directory.
    #[arg(short, long, global = true)]
    plugin_dir: Option<PathBuf>,

    /// Directory searched for shared dependencies (repeatable).
    #[arg(long = "shared-path", global = true)]
    shared_paths: Vec<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Load the plugin, wait for a key, unload it and report the outcome.
    Run {
        /// Serve the plugin's routes over HTTP while it is loaded.
        #[arg(long)]
        serve: bool,
        /// Address the HTTP service binds to.
        #[arg(long, default_value = "127.0.0.1:9380")]
        bind: SocketAddr,
        /// Do not wait for a key before unloading and before exiting.
        #[arg(long)]
        no_prompt: bool,
        /// Keep the HTTP service running across unload (the unload then reports stuck).
        #[arg(long, requires = "serve")]
        detach: bool,
    },
    /// Load the plugin, print how its dependencies were bound, and unload it.
    Inspect,
    /// Validate a deployment directory without loading anything.
    CheckLayout {
        /// Directory to check (defaults to the configured plugin directory).
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    let config = load_config(&args)?;

    match args.command {
        Command::Run {
            serve,
            bind,
            no_prompt,
            detach,
        } => run_plugin(config, serve.then_some(bind), no_prompt, detach).await,
        Command::Inspect => inspect_plugin(config).await,
        Command::CheckLayout { dir } => {
            let mut config = config;
            if let Some(dir) = dir {
                config.plugin_dir = dir;
            }
            check_layout(&config)
        }
    }
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "isoload=debug" } else { "isoload=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(default_directive)
            .add_directive(tracing::Level::WARN.into())
    });

    if env_vars::log_json() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

/// Defaults, then the config file, then the environment, then flags.
fn load_config(args: &Args) -> Result<HostConfig> {
    let file = args.config.clone().or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("isoload").join("config.toml"))
            .filter(|path| path.is_file())
    });

    let config = match file {
        Some(path) => {
            tracing::debug!("Reading config from {}", path.display());
            HostConfig::from_file(&path)?
        }
        None => HostConfig::default(),
    };

    let mut config = config.with_env_overrides();
    if let Some(dir) = &args.plugin_dir {
        config.plugin_dir = dir.clone();
    }
    if !args.shared_paths.is_empty() {
        config.shared_search_paths = args.shared_paths.clone();
    }
    Ok(config)
}

async fn run_plugin(
    config: HostConfig,
    serve: Option<SocketAddr>,
    no_prompt: bool,
    detach: bool,
) -> Result<()> {
    let mut host = PluginHost::new(config);
    host.load_plugin().context("Failed to load plugin")?;
    if let Some(plugin) = host.plugin() {
        println!("Loaded {}", plugin);
    }

    if let Some(bind) = serve {
        host.attach(Box::new(HttpService::new(bind)))
            .await
            .context("Failed to attach plugin to the HTTP service")?;
        println!("Serving plugin routes under http://{}/plugin/", bind);
    }
    let leaked = if detach { host.detach_collaborator() } else { None };

    wait_for_key("Press Enter to unload the plugin...", no_prompt).await?;

    let outcome = host.unload_plugin().await?;
    report_outcome(outcome);

    wait_for_key("Press Enter to exit...", no_prompt).await?;

    if let Some(mut service) = leaked {
        if let Err(e) = service.stop().await {
            tracing::warn!("Detached service did not stop cleanly: {}", e);
        }
        service.dispose().await;
    }
    Ok(())
}

async fn inspect_plugin(config: HostConfig) -> Result<()> {
    let mut host = PluginHost::new(config);
    host.load_plugin().context("Failed to load plugin")?;

    if let (Some(context), Some(plugin)) = (host.context(), host.plugin()) {
        println!("Plugin:    {}", plugin);
        println!("Context:   {} ({:?})", context.name(), context.state());
        println!("Directory: {}", context.directory().display());
        if let Some(symbols) = context.debug_symbols() {
            println!("Symbols:   {}", symbols.display());
        }
        println!("Loaded at: {}", context.loaded_at().to_rfc3339());

        let resolutions = context.resolutions();
        if resolutions.is_empty() {
            println!("No dependencies resolved.");
        }
        for (id, resolution) in resolutions {
            println!("  {:<20} {:?}", id, resolution);
        }
        for name in context.native_bindings() {
            println!("  {:<20} native", name);
        }
    }

    let outcome = host.unload_plugin().await?;
    report_outcome(outcome);
    Ok(())
}

fn check_layout(config: &HostConfig) -> Result<()> {
    let report = layout::check_layout(config)
        .with_context(|| format!("Failed to read layout of {}", config.plugin_dir.display()))?;
    print!("{}", report);

    if !report.is_ok() {
        anyhow::bail!("{} problem(s) found in {}", report.problems(), config.plugin_dir.display());
    }
    println!("Layout OK");
    Ok(())
}

fn report_outcome(outcome: UnloadOutcome) {
    match outcome {
        UnloadOutcome::Unloaded { attempts } => {
            println!("Plugin unloaded after {} attempts.", attempts);
        }
        UnloadOutcome::Stuck { outstanding } => {
            println!(
                "Plugin could not be unloaded: {} handle(s) still reference it.",
                outstanding
            );
        }
    }
}

/// Block until a line is read from stdin; end of input counts as a key.
async fn wait_for_key(prompt: &str, skip: bool) -> Result<()> {
    if skip {
        return Ok(());
    }
    println!("{}", prompt);
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| ())
    })
    .await
    .context("Console reader task failed")?
    .context("Failed to read from stdin")
}
