//! wasm-posix Command-Line Interface
//!
//! This CLI provides tools for:
//! - Calling exports of a POSIX-style WebAssembly module
//! - Running a library in the module as a process (`exec`)
//! - Dumping the module's POSIX constants table
//! - Starting the module's interactive terminal on a worker thread

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use wasm_posix::{RuntimeConfig, WasiCapabilities, WasmRuntime, WorkerChannel, WorkerOptions};

#[derive(Parser)]
#[command(name = "wasm-posix")]
#[command(author, version, about = "Run WebAssembly modules as POSIX processes", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    runtime: RuntimeArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RuntimeArgs {
    /// Maximum linear memory in MB
    #[arg(long, global = true)]
    max_memory: Option<usize>,

    /// Fuel limit (instructions, roughly)
    #[arg(long, global = true)]
    fuel: Option<u64>,

    /// Directory to pre-open read-write (repeatable)
    #[arg(long = "dir", global = true)]
    dirs: Vec<PathBuf>,

    /// Environment variable KEY=VALUE (repeatable)
    #[arg(long = "env", global = true)]
    envs: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Call an exported function
    Call {
        /// Module (.wasm or .wat)
        module: PathBuf,

        /// Function name
        function: String,

        /// Pass this string as the first argument
        #[arg(short, long)]
        string: Option<String>,

        /// Numeric arguments
        #[arg(allow_hyphen_values = true)]
        args: Vec<i64>,
    },

    /// Load argv[0] as a library inside the module and run its main
    Exec {
        /// Module (.wasm or .wat)
        module: PathBuf,

        /// Library and its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },

    /// Print the module's POSIX constants as JSON
    Constants {
        /// Module (.wasm or .wat)
        module: PathBuf,
    },

    /// Start the module's terminal with stdin served from this process
    Terminal {
        /// Module (.wasm or .wat)
        module: PathBuf,

        /// Arguments for the terminal
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
}

fn parse_env(pair: &str) -> Result<(String, String)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => anyhow::bail!("Invalid environment variable: {}. Use KEY=VALUE", pair),
    }
}

fn build_config(base: RuntimeConfig, args: &RuntimeArgs) -> Result<RuntimeConfig> {
    let mut config = base;
    if let Some(mb) = args.max_memory {
        let bytes = mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| anyhow::anyhow!("--max-memory {} MB is too large", mb))?;
        config = config.max_memory(bytes);
    }
    if let Some(fuel) = args.fuel {
        config = config.fuel_limit(fuel);
    }

    let mut caps: WasiCapabilities = config.capabilities.clone();
    for dir in &args.dirs {
        caps = caps.preopened_dir_rw(dir);
    }
    for pair in &args.envs {
        let (key, value) = parse_env(pair)?;
        caps = caps.env(key, value);
    }
    Ok(config.capabilities(caps))
}

fn instantiate(config: RuntimeConfig, module: &Path) -> Result<wasm_posix::ModuleInstance> {
    let runtime = WasmRuntime::new(config).context("Failed to create runtime")?;
    let module = runtime
        .load_module(module)
        .with_context(|| format!("Failed to load {}", module.display()))?;
    debug!("exports: {:?}", module.exports().collect::<Vec<_>>());
    Ok(runtime.instantiate(&module)?)
}

fn cmd_call(
    config: RuntimeConfig,
    module: PathBuf,
    function: String,
    string: Option<String>,
    args: Vec<i64>,
) -> Result<()> {
    let mut instance = instantiate(config, &module)?;
    let output = match string {
        Some(text) => instance.call_with_string(&function, &text, &args)?,
        None => instance.call(&function, &args)?,
    };
    println!("{}", output);
    Ok(())
}

fn cmd_exec(config: RuntimeConfig, module: PathBuf, argv: Vec<String>) -> Result<i32> {
    let mut instance = instantiate(config, &module)?;
    let code = instance
        .run(&argv)
        .with_context(|| format!("Failed to run {}", argv[0]))?;
    info!("{} exited with {}", argv[0], code);
    Ok(code)
}

fn cmd_constants(config: RuntimeConfig, module: PathBuf) -> Result<()> {
    let instance = instantiate(config, &module)?;
    let constants = instance
        .constants()
        .ok_or_else(|| anyhow::anyhow!("{} provides no constants", module.display()))?;

    let sorted: BTreeMap<&str, i32> = constants.iter().collect();
    println!("{}", serde_json::to_string_pretty(&sorted)?);
    Ok(())
}

fn cmd_terminal(config: RuntimeConfig, module: PathBuf, argv: Vec<String>) -> Result<i32> {
    let mut worker = WorkerChannel::spawn(std::io::stdin()).context("Failed to start worker")?;
    worker.init(&module.to_string_lossy(), WorkerOptions::new(config))?;

    let output = worker.call_with_string("terminal", argv.as_slice(), &[])?;
    let code = output
        .as_i64()
        .ok_or_else(|| anyhow::anyhow!("terminal returned {}", output))?;
    Ok(code as i32)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Call {
            module,
            function,
            string,
            args,
        } => {
            let config = build_config(RuntimeConfig::default(), &cli.runtime)?;
            cmd_call(config, module, function, string, args)
        }

        Commands::Exec { module, argv } => {
            let config = build_config(RuntimeConfig::default(), &cli.runtime)?;
            let code = cmd_exec(config, module, argv)?;
            std::process::exit(code);
        }

        Commands::Constants { module } => {
            let config = build_config(RuntimeConfig::minimal(), &cli.runtime)?;
            cmd_constants(config, module)
        }

        Commands::Terminal { module, argv } => {
            let config = build_config(RuntimeConfig::terminal(), &cli.runtime)?;
            let code = cmd_terminal(config, module, argv)?;
            std::process::exit(code);
        }
    }
}
