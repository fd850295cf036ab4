//! RCE command line driver

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use rce::error::report_error;
use rce::interp::{Executor, Outcome};
use rce::ir::Bindings;
use rce::opt::CheckOutcome;
use rce::{Method, RceConfig, RceError};

#[derive(Parser)]
#[command(name = "rce", version, about = "Range-check elimination for counted loops")]
struct Cli {
    /// Optimizer configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the verdict for every bounds check and range test
    Analyze {
        /// Method description file
        file: PathBuf,
    },
    /// Print the rewrite plan
    Compile {
        /// Method description file
        file: PathBuf,
        /// Emit the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run interpreted and compiled forms and compare them
    Run {
        /// Method description file
        file: PathBuf,
        /// Argument binding, e.g. `--arg n=5`
        #[arg(long = "arg", value_parser = parse_binding)]
        args: Vec<(String, i64)>,
        /// Method to run when the file holds several
        #[arg(long)]
        method: Option<String>,
    },
    /// Tokenize and dump tokens (debug)
    Tokens {
        /// Method description file
        file: PathBuf,
    },
}

fn parse_binding(s: &str) -> Result<(String, i64), String> {
    let (name, value) = s.split_once('=').ok_or_else(|| format!("expected NAME=VALUE, got `{s}`"))?;
    let value = value
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("bad value for `{name}`: {e}"))?;
    Ok((name.trim().to_string(), value))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Command::Analyze { file } => analyze_file(&file, &config),
        Command::Compile { file, json } => compile_file(&file, &config, json),
        Command::Run { file, args, method } => run_file(&file, &config, &args, method.as_deref()),
        Command::Tokens { file } => tokenize_file(&file),
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<RceConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(RceConfig::from_file(path)?),
        None => Ok(RceConfig::default()),
    }
}

/// Parse a file, rendering syntax errors against the source
fn load_methods(path: &Path) -> Result<Vec<Method>, Box<dyn std::error::Error>> {
    let source = std::fs::read_to_string(path)?;
    let filename = path.display().to_string();
    rce::parser::parse(&source).map_err(|e| {
        let _ = report_error(&filename, &source, &e);
        e.into()
    })
}

fn analyze_file(path: &Path, config: &RceConfig) -> Result<(), Box<dyn std::error::Error>> {
    for method in load_methods(path)? {
        let compilation = rce::Pipeline::for_config(config).run(&method, config, None)?;
        println!("method {}", method.name);
        for report in &compilation.checks {
            let outcome = match &report.outcome {
                CheckOutcome::Opaque(reason) => format!("opaque ({reason:?})"),
                CheckOutcome::Verdict(verdict) => verdict.to_string(),
            };
            println!("  {:<8} {outcome}", report.name);
        }
        for report in &compilation.branches {
            println!("  {:<8} {}", report.branch.to_string(), report.outcome.name());
        }
    }
    Ok(())
}

fn compile_file(path: &Path, config: &RceConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut plans = Vec::new();
    for method in load_methods(path)? {
        let (compilation, _) = rce::compile(&method, config, None)?;
        plans.push(compilation);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }
    for plan in &plans {
        println!("method {} ({} optimizations)", plan.method, plan.stats.total());
        for line in plan.render().lines() {
            println!("  {line}");
        }
    }
    Ok(())
}

fn run_file(
    path: &Path,
    config: &RceConfig,
    args: &[(String, i64)],
    name: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let methods = load_methods(path)?;
    let method = match name {
        Some(name) => methods.iter().find(|m| m.name == name),
        None => methods.first(),
    }
    .ok_or_else(|| RceError::malformed("no matching method in file"))?;

    let mut bindings = Bindings::new();
    for (param, value) in args {
        bindings = bindings.with_param(param, *value);
    }

    let (_, code) = rce::compile(method, config, None)?;
    let interpreted = Executor::interpreted(method).run(&bindings)?;
    let compiled = Executor::compiled(&code).run(&bindings)?;

    let describe = |outcome: Outcome| match outcome {
        Outcome::Returned => "returned".to_string(),
        Outcome::Threw(kind) => format!("threw {kind}"),
    };
    println!("interpreted: {} after {} stores", describe(interpreted.outcome), interpreted.writes.len());
    println!(
        "compiled:    {} after {} stores, {} deopt(s)",
        describe(compiled.outcome),
        compiled.writes.len(),
        compiled.deopts.len()
    );
    if !interpreted.same_behavior(&compiled) {
        return Err("compiled code diverged from the interpreter".into());
    }
    Ok(())
}

fn tokenize_file(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let source = std::fs::read_to_string(path)?;

    let tokens = rce::lexer::tokenize(&source)?;
    for (tok, span) in &tokens {
        println!("{tok:?} @ {span}");
    }

    Ok(())
}
