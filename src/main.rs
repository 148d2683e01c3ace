// ==============================================================================
// main.rs - Variant Pipeline CLI
// ==============================================================================
// Description: Command line entry point for project, import, export and
//              association commands
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use variant_pipeline::exporter::MAX_SAMPLES_PER_QUERY;
use variant_pipeline::format::FormatSpec;
use variant_pipeline::{
    associate, export, import, load_phenotypes, logging, AssociationOptions, ExportOptions, ImportOptions,
    PhenotypeOptions, Project,
};

#[derive(Parser, Debug)]
#[command(name = "vpipe", author, version, about = "Concurrent variant import and association testing")]
struct Cli {
    /// Project directory
    #[arg(short, long, env = "VPIPE_PROJECT", default_value = ".", global = true)]
    project: PathBuf,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new project
    Init {
        /// Project name
        name: String,
    },
    /// Import variants and genotypes from delimited files
    Import(ImportArgs),
    /// Export variants with per-sample genotypes
    Export(ExportArgs),
    /// Load phenotypes of samples
    Phenotype(PhenotypeArgs),
    /// Test groups of variants for association with a phenotype
    Associate(AssociateArgs),
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// Input files, plain or gzip-compressed
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Built-in format name or path to a JSON format descriptor
    #[arg(long, default_value = "vcf")]
    format: String,

    /// Sample names overriding those in the header
    #[arg(long, num_args = 1..)]
    sample_name: Vec<String>,

    /// Re-import files that are already in the project
    #[arg(long)]
    force: bool,

    /// Reader threads per file
    #[arg(short, long, env = "VPIPE_JOBS", default_value_t = 4)]
    jobs: usize,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Output file, gzip-compressed when it ends in .gz
    output: PathBuf,

    /// Samples to export, all when omitted
    #[arg(long, num_args = 1..)]
    samples: Vec<String>,

    /// Omit the header line
    #[arg(long)]
    no_header: bool,

    /// Samples joined per query
    #[arg(long, default_value_t = MAX_SAMPLES_PER_QUERY)]
    block_size: usize,
}

#[derive(Args, Debug)]
struct PhenotypeArgs {
    /// Tab-delimited file with a sample name column
    path: PathBuf,

    /// Columns to load, all when omitted
    #[arg(long, num_args = 1..)]
    fields: Vec<String>,
}

#[derive(Args, Debug)]
struct AssociateArgs {
    /// Phenotype field of the sample table
    phenotype: String,

    /// Method specs, e.g. "BurdenPermute --permutations 500 --name perm"
    #[arg(short, long = "method", required = true, num_args = 1..)]
    methods: Vec<String>,

    /// Variant fields that define a group
    #[arg(short, long, required = true, num_args = 1..)]
    group_by: Vec<String>,

    /// Group worker threads
    #[arg(short, long, env = "VPIPE_JOBS", default_value_t = 4)]
    jobs: usize,

    /// Drop samples whose missing rate is at least this
    #[arg(long)]
    discard_samples: Option<f64>,

    /// Drop variants whose missing rate is at least this
    #[arg(long)]
    discard_variants: Option<f64>,

    /// SQL conditions on genotype fields
    #[arg(long = "genotype", num_args = 1..)]
    genotype_conditions: Vec<String>,

    /// Report file, - for stdout
    #[arg(short, long, default_value = "-")]
    output: PathBuf,

    /// Database that keeps results across runs
    #[arg(long)]
    to_db: Option<PathBuf>,

    /// Recompute groups already in the result database
    #[arg(long)]
    force: bool,
}

fn print_summary<T: Serialize>(summary: &T) -> Result<()> {
    eprintln!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    if let Command::Init { name } = &cli.command {
        let project = Project::init(&cli.project, name)
            .with_context(|| format!("Failed to create project in {}", cli.project.display()))?;
        info!("Created project {} in {}", project.name(), project.dir.display());
        return print_summary(&project.info);
    }

    let project = Project::open(&cli.project)
        .with_context(|| format!("No project found in {}", cli.project.display()))?;

    match cli.command {
        Command::Init { .. } => Ok(()),
        Command::Import(args) => {
            let format = FormatSpec::load(&args.format).context("Failed to load format descriptor")?;
            let summary = import(
                &project,
                ImportOptions {
                    files: args.files,
                    format,
                    sample_names: args.sample_name,
                    force: args.force,
                    jobs: args.jobs,
                },
            )?;
            print_summary(&summary)
        }
        Command::Export(args) => {
            if args.block_size == 0 {
                bail!("--block-size must be positive");
            }
            let summary = export(
                &project,
                &ExportOptions {
                    output: args.output,
                    samples: args.samples,
                    header: !args.no_header,
                    block_size: args.block_size,
                    ..Default::default()
                },
            )?;
            print_summary(&summary)
        }
        Command::Phenotype(args) => {
            let summary = load_phenotypes(
                &project,
                &PhenotypeOptions {
                    path: args.path,
                    fields: args.fields,
                    delimiter: b'\t',
                },
            )?;
            print_summary(&summary)
        }
        Command::Associate(args) => {
            let summary = associate(
                &project,
                &AssociationOptions {
                    phenotype: args.phenotype,
                    methods: args.methods,
                    group_by: args.group_by,
                    jobs: args.jobs,
                    discard_samples: args.discard_samples,
                    discard_variants: args.discard_variants,
                    genotype_conditions: args.genotype_conditions,
                    output: Some(args.output),
                    result_db: args.to_db,
                    force: args.force,
                },
            )?;
            print_summary(&summary)
        }
    }
}
