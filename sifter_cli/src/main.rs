use sifter_core::artifacts::logs_dir;
use sifter_core::config::{ConfigError, SifterConfig, load_env_overrides};
use sifter_core::{
    CommandProcess, CommandProcessConfig, LocalServerFactory, ReductionOracle, SanitizerReporter,
    ServerFactory, Signature, TargetController, Testcase,
};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./sifter.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// KEY=VALUE environment overrides for the target
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate a testcase once; exits 0 when it is interesting
    Check {
        testcase: PathBuf,
        /// Artifact prefix for this evaluation
        #[arg(long, default_value = "sifter_check")]
        prefix: PathBuf,
        /// File being reduced, if not the landing page
        #[arg(long)]
        reduce_file: Option<PathBuf>,
    },
    /// Answer `evaluate <prefix>` requests from a reducer on stdin
    Driver {
        testcase: PathBuf,
        #[arg(long)]
        reduce_file: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<SifterConfig> {
    let path = match path {
        Some(path) => path,
        None => {
            let default_path = PathBuf::from("sifter.toml");
            if !default_path.exists() {
                bail!("No config file specified and default 'sifter.toml' not found");
            }
            default_path
        }
    };
    log::info!("Loading configuration from {:?}", path);
    Ok(SifterConfig::load_from_file(&path)?)
}

fn build_oracle(
    config: &SifterConfig,
    env_file: Option<&Path>,
) -> anyhow::Result<ReductionOracle<CommandProcess>> {
    let run = config.run_config()?;
    let servers = LocalServerFactory;
    if !run.no_harness && !servers.supports_redirects() {
        return Err(ConfigError::Invalid(
            "the harness needs a redirecting server; set no-harness = true in [reduce]".to_string(),
        )
        .into());
    }
    let process = CommandProcess::new(CommandProcessConfig::from(&config.target));
    let target = TargetController::new(process, config.target.relaunch);
    let mut oracle = ReductionOracle::new(
        run,
        target,
        Box::new(servers),
        Box::new(SanitizerReporter::new()),
    )
    .on_alt_crash(Box::new(|prefix: &Path| {
        log::info!("Alternate crash logs kept in {:?}", logs_dir(prefix));
    }));

    if let Some(path) = env_file.or(config.target.env_file.as_deref()) {
        oracle = oracle.with_env(load_env_overrides(path)?);
    }
    if let Some(path) = &config.reduce.harness {
        let page = std::fs::read(path).with_context(|| format!("Failed to read harness {path:?}"))?;
        oracle = oracle.with_harness(page);
    }
    if let Some(path) = &config.reduce.signature {
        oracle = oracle.with_signature(Signature::load(path)?);
    }
    Ok(oracle)
}

fn resolve_testcase(testcase: &Path, reduce_file: Option<&Path>) -> anyhow::Result<Testcase> {
    let resolved = Testcase::resolve(testcase)?;
    Ok(match reduce_file {
        Some(file) => resolved.with_reduce_file(file)?,
        None => resolved,
    })
}

fn serve_driver(oracle: &mut ReductionOracle<CommandProcess>) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read driver request")?;
        let request = line.trim();
        if request.is_empty() {
            continue;
        }
        if request == "quit" {
            break;
        }
        match request.split_once(' ') {
            Some(("evaluate", prefix)) => {
                let verdict = oracle.evaluate(Path::new(prefix.trim()))?;
                writeln!(stdout, "{}", u8::from(verdict))?;
            }
            _ => {
                log::warn!("Unknown driver request: {:?}", request);
                writeln!(stdout, "error unknown request")?;
            }
        }
        stdout.flush()?;
    }
    Ok(())
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = load_config(cli.config)?;
    log::debug!("Effective configuration: {config:#?}");
    let mut oracle = build_oracle(&config, cli.env_file.as_deref())?;

    match cli.command {
        Commands::Check {
            testcase,
            prefix,
            reduce_file,
        } => {
            let result = resolve_testcase(&testcase, reduce_file.as_deref()).and_then(|tc| {
                oracle.init(tc);
                Ok(oracle.evaluate(&prefix)?)
            });
            oracle.cleanup();
            if result? {
                println!("Interesting: logs in {:?}", logs_dir(&prefix));
                Ok(ExitCode::SUCCESS)
            } else {
                println!("Not interesting");
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Driver {
            testcase,
            reduce_file,
        } => {
            let result = resolve_testcase(&testcase, reduce_file.as_deref()).and_then(|tc| {
                oracle.init(tc);
                serve_driver(&mut oracle)
            });
            oracle.cleanup();
            result?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
