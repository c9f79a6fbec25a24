use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt};

use stackvm::config::{CONFIG_FILE_NAME, MachineConfig};
use stackvm::demo::{self, DemoReport};

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum StatsFormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "stackvm")]
#[command(about = "A minimal stack-based bytecode virtual machine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in demonstration program
    Demo {
        /// Machine config file (defaults to ./stackvm.toml if present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Operand stack size in cells
        #[arg(long)]
        stack_capacity: Option<usize>,

        /// Heap size in cells
        #[arg(long)]
        heap_capacity: Option<usize>,

        /// Instruction budget (0 = unlimited)
        #[arg(long)]
        fuel: Option<u64>,

        /// Trace every executed instruction
        #[arg(long)]
        trace: bool,

        /// Output format for the report
        #[arg(long, value_enum, default_value = "human")]
        stats: StatsFormatArg,
    },
    /// Write the default machine config
    Config {
        /// Destination file (prints to stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Initialize logging to stderr.
///
/// `RUST_LOG` overrides the default filter.
fn init_logging(trace: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if trace {
            EnvFilter::new("stackvm=trace")
        } else {
            EnvFilter::new("stackvm=warn")
        }
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<MachineConfig, String> {
    match path {
        Some(path) => MachineConfig::load(path)
            .map_err(|e| format!("failed to load {}: {}", path.display(), e)),
        None => {
            let default_path = Path::new(CONFIG_FILE_NAME);
            if default_path.exists() {
                MachineConfig::load(default_path)
                    .map_err(|e| format!("failed to load {}: {}", CONFIG_FILE_NAME, e))
            } else {
                Ok(MachineConfig::default())
            }
        }
    }
}

fn print_report(report: &DemoReport, format: StatsFormatArg) -> Result<(), String> {
    match format {
        StatsFormatArg::Human => {
            for value in &report.printed {
                println!("print: {}", value);
            }
            println!("heap[{}] = {}", demo::SUM_ADDR, report.sum);
            println!("heap[{}] = {}", demo::DOUBLED_ADDR, report.doubled);
            println!(
                "instructions: {}, calls: {} ({} native), max stack depth: {}",
                report.stats.instructions,
                report.stats.calls,
                report.stats.native_calls,
                report.stats.max_stack_depth
            );
        }
        StatsFormatArg::Json => {
            let json = serde_json::to_string_pretty(report)
                .map_err(|e| format!("failed to serialize report: {}", e))?;
            println!("{}", json);
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Commands::Demo {
            config,
            stack_capacity,
            heap_capacity,
            fuel,
            trace,
            stats,
        } => {
            let mut machine_config = load_config(config.as_deref())?;
            if let Some(n) = stack_capacity {
                machine_config.stack_capacity = n;
            }
            if let Some(n) = heap_capacity {
                machine_config.heap_capacity = n;
            }
            if let Some(n) = fuel {
                machine_config.fuel = if n == 0 { None } else { Some(n) };
            }
            machine_config.trace |= trace;
            machine_config.validate().map_err(|e| e.to_string())?;

            init_logging(machine_config.trace);
            let report = demo::run(&machine_config).map_err(|e| format!("runtime error: {}", e))?;
            print_report(&report, stats)
        }
        Commands::Config { output } => {
            let config = MachineConfig::default();
            match output {
                Some(path) => {
                    if path.exists() {
                        return Err(format!("{} already exists", path.display()));
                    }
                    config
                        .save(&path)
                        .map_err(|e| format!("failed to write {}: {}", path.display(), e))?;
                    println!("Wrote default config to {}", path.display());
                }
                None => {
                    let toml = config.to_toml().map_err(|e| e.to_string())?;
                    print!("{}", toml);
                }
            }
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
