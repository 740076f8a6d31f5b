use batcher::batcher::{BatchOptions, Batcher};
use batcher::commands::{CommandGroup, pipeline_to_json};
use batcher::config::{self, BatchConfig, ConfigOverrides};
use batcher::itemtree::ItemTree;
use batcher::pdb::{InMemoryProcedureDatabase, ProcedureDatabase};
use batcher::{builtins, output, renamer};
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Flags shared by `run` and `preview`.
#[derive(clap::Args, Clone, Default)]
struct RunArgs {
    /// Output directory (overrides `output_dir`)
    #[arg(long)]
    output: Option<String>,

    /// Rename pattern (overrides `rename.pattern`)
    #[arg(long)]
    pattern: Option<String>,

    /// Export file extension (overrides `export.file_extension`)
    #[arg(long)]
    extension: Option<String>,
}

impl RunArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            output_dir: self.output.clone(),
            pattern: self.pattern.clone(),
            file_extension: self.extension.clone(),
        }
    }
}

#[derive(Parser)]
#[command(name = "batcher")]
#[command(about = "Batch rename and export files with a configurable pipeline")]
#[command(long_about = "\
Batch rename and export files with a configurable pipeline

Every file under the source directory that passes the configured conditions
is renamed with a filename pattern and exported to the output directory,
keeping its folder structure.

  photos/
  ├── batcher.toml                 # Config (optional)
  ├── Body/
  │   ├── Hands/
  │   │   └── Left.png             # → output/Body/Hands/image001.png
  │   └── Torso.png                # → output/Body/image001.png
  └── cover.png                    # → output/image001.png

Patterns mix text with fields in brackets:
  image[001]           numbered per folder: image001, image002, ...
  [image path, _]      Body_Hands_Left
  [current date]-[image name]

Run 'batcher fields' for all fields and 'batcher gen-config' to generate a
documented batcher.toml.")]
#[command(version)]
struct Cli {
    /// Source directory
    #[arg(long, default_value = ".", global = true)]
    source: PathBuf,

    /// Config file (default: batcher.toml in the source directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Procedure descriptions (JSON) for pipelines with procedure commands
    #[arg(long, global = true)]
    procedures: Option<PathBuf>,

    /// More log output (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rename and export every matching file
    Run(RunArgs),
    /// Show what `run` would do without writing anything
    Preview(RunArgs),
    /// List the actions and conditions of the active pipeline
    Commands {
        /// List every built-in command instead
        #[arg(long)]
        builtins: bool,
    },
    /// Print the pipeline built from the config as JSON
    GenPipeline,
    /// List the fields available in rename patterns
    Fields,
    /// Print a stock batcher.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Command::Run(args) => run(&cli, args, false)?,
        Command::Preview(args) => run(&cli, args, true)?,
        Command::Commands { builtins: true } => {
            let actions = CommandGroup::create("actions", builtins::builtin_actions())?;
            let conditions = CommandGroup::create("conditions", builtins::builtin_conditions())?;
            output::print_commands(&actions, &conditions);
        }
        Command::Commands { builtins: false } => {
            let config = load_config(&cli, &ConfigOverrides::default())?;
            let (actions, conditions) = config::build_pipeline(&config, &cli.source)?;
            output::print_commands(&actions, &conditions);
        }
        Command::GenPipeline => {
            let config = load_config(&cli, &ConfigOverrides::default())?;
            let (actions, conditions) = config::build_pipeline(&config, &cli.source)?;
            println!("{}", pipeline_to_json(&actions, &conditions)?);
        }
        Command::Fields => {
            output::print_fields(&renamer::field_catalog());
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// Log to stderr so stdout carries only command output.
fn init_tracing(verbose: u8) {
    let fallback_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(cli: &Cli, overrides: &ConfigOverrides) -> Result<BatchConfig, config::ConfigError> {
    config::load_config(&cli.source, cli.config.as_deref(), overrides)
}

fn load_procedures(path: &Path) -> Result<Rc<dyn ProcedureDatabase>, Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)?;
    Ok(Rc::new(InMemoryProcedureDatabase::from_json(&json)?))
}

fn run(cli: &Cli, args: &RunArgs, is_preview: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli, &args.overrides())?;
    let procedures = cli.procedures.as_deref().map(load_procedures).transpose()?;

    let (mut actions, mut conditions) = config::build_pipeline(&config, &cli.source)?;
    if let Some(db) = &procedures {
        actions.set_procedure_database(db.clone());
        conditions.set_procedure_database(db.clone());
    }

    let output_dir = PathBuf::from(&config.output_dir);
    let mut excluded = vec![output_dir.clone(), cli.source.join(config::CONFIG_FILE_NAME)];
    excluded.extend(config.pipeline_path(&cli.source));
    let tree = read_source(&cli.source, &excluded)?;

    let batcher = Batcher::new(
        tree,
        BatchOptions {
            output_dir,
            file_extension: config.export.extension().to_string(),
            overwrite: config.export.overwrite,
            is_preview,
            procedures,
        },
    );
    let report = batcher.run(&actions, &conditions)?;
    output::print_report(&report);
    Ok(())
}

/// Build the item tree, leaving out the output directory and the batcher's
/// own files when they lie inside the source directory.
fn read_source(source: &Path, excluded: &[PathBuf]) -> Result<ItemTree, Box<dyn std::error::Error>> {
    let source = source.canonicalize()?;
    let excluded: Vec<PathBuf> = excluded.iter().filter_map(|p| p.canonicalize().ok()).collect();
    Ok(ItemTree::from_dir_excluding(&source, &excluded)?)
}
