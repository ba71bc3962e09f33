use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use sitepatch_batch::{
    render_summary, report_recent_markdown, run_features, BatchConfig, Classifier,
    FeatureRegistry,
};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "sitepatch")]
#[command(about = "Idempotent batch patcher for site page sources")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply one feature, or every enabled feature, to the target pages.
    Run(RunArgs),
    /// List configured features.
    Features {
        #[arg(long)]
        workspace_root: Option<PathBuf>,
    },
    /// Print the content category of each slug.
    Classify {
        #[arg(required = true)]
        slugs: Vec<String>,
        #[arg(long)]
        workspace_root: Option<PathBuf>,
    },
    /// Summarize the most recent persisted runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        reports_dir: Option<PathBuf>,
        #[arg(long)]
        workspace_root: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Feature name from features.yaml; all enabled features when omitted.
    #[arg(long)]
    feature: Option<String>,
    /// Directory scanned for pages (default: <workspace-root>/app).
    #[arg(long)]
    target_dir: Option<PathBuf>,
    /// Report what would change without writing any page.
    #[arg(long)]
    dry_run: bool,
    /// Directory holding features.yaml, rules/ and content/.
    #[arg(long)]
    workspace_root: Option<PathBuf>,
    /// Persist summary.md and report.json for each run under this directory.
    #[arg(long)]
    reports_dir: Option<PathBuf>,
}

fn batch_config(workspace_root: Option<PathBuf>) -> BatchConfig {
    let mut config = BatchConfig::from_env();
    if let Some(root) = workspace_root {
        if std::env::var_os("SITEPATCH_TARGET_DIR").is_none() {
            config.target_dir = root.join("app");
        }
        config.workspace_root = root;
    }
    config
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let mut config = batch_config(args.workspace_root);
    if let Some(target_dir) = args.target_dir {
        config.target_dir = target_dir;
    }
    if args.reports_dir.is_some() {
        config.reports_dir = args.reports_dir;
    }
    config.dry_run |= args.dry_run;
    debug!(?config, "resolved configuration");

    let runs = run_features(&config, args.feature.as_deref())?;
    let mut failed = false;
    for run in &runs {
        println!("{}", render_summary(&run.report));
        if let Some(dir) = &run.reports_dir {
            println!("  report: {}", dir.display());
        }
        if let Some(err) = &run.report_error {
            println!("  report not written: {err}");
        }
        failed |= run.has_failures();
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => run(cli.run),
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Features { workspace_root }) => {
            let config = batch_config(workspace_root);
            let registry = FeatureRegistry::from_workspace_root(&config.workspace_root)?;
            for feature in &registry.features {
                println!(
                    "{}{}\tmarker={}\tcontent={}\trules={}",
                    feature.name,
                    if feature.enabled { "" } else { " (disabled)" },
                    feature.marker.as_str(),
                    feature.content.display(),
                    feature.rules.len()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Classify {
            slugs,
            workspace_root,
        }) => {
            let config = batch_config(workspace_root);
            let classifier = Classifier::from_workspace_root(&config.workspace_root)?;
            for slug in &slugs {
                println!("{slug}\t{}", classifier.classify(slug));
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Report {
            runs,
            reports_dir,
            workspace_root,
        }) => {
            let config = batch_config(workspace_root);
            let reports_dir = reports_dir
                .or(config.reports_dir)
                .unwrap_or_else(|| config.workspace_root.join("reports"));
            println!("{}", report_recent_markdown(runs, &reports_dir)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
