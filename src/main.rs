use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use modpatch::module::{FactoryCompiler, FactoryError, ModuleFactory, ModuleId, ScriptCompiler};
use modpatch::plugin::manifest::{load_from_path, PluginManifest};
use modpatch::plugin::ManifestPlugin;
use modpatch::runtime::{BootReport, Runtime, RuntimeConfig};
use modpatch::settings::SettingsStore;
use modpatch::snapshot::{write_patched_sources, SnapshotResult};
use serde::Deserialize;
use similar::{ChangeTag, TextDiff};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "modpatch")]
#[command(about = "Apply plugin patches to a bundle of module factories", long_about = None)]
#[command(version)]
struct Cli {
    /// Log patch diagnostics at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct BootArgs {
    /// JSON bundle: an array of { "id", "source" } module factories
    #[arg(short, long)]
    bundle: PathBuf,

    /// Plugin manifest, or a directory searched for *.toml manifests
    #[arg(short, long, default_value = "plugins")]
    plugins: PathBuf,

    /// TOML settings file, one table per plugin
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Host version checked against plugins' host_version requirements
    #[arg(long)]
    host_version: Option<String>,

    /// Start no plugins; every module loads unpatched
    #[arg(long)]
    safe_mode: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot plugins, patch the bundle and write patched sources
    Apply {
        #[command(flatten)]
        boot: BootArgs,

        /// Directory receiving one snapshot per patched module
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Show unified diff of every patched module
        #[arg(short, long)]
        diff: bool,
    },

    /// Boot plugins and report which patches would apply
    Check {
        #[command(flatten)]
        boot: BootArgs,

        /// Print the boot report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List plugin manifests with their dependencies and patch counts
    List {
        #[arg(short, long, default_value = "plugins")]
        plugins: PathBuf,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BundleId {
    Text(String),
    Number(u64),
}

#[derive(Deserialize)]
struct BundleModule {
    id: BundleId,
    source: String,
}

impl From<BundleId> for ModuleId {
    fn from(id: BundleId) -> Self {
        match id {
            BundleId::Text(text) => ModuleId::from(text),
            BundleId::Number(n) => ModuleId::from(n),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Apply { boot, out, diff } => cmd_apply(boot, out, diff).await,
        Commands::Check { boot, json } => cmd_check(boot, json).await,
        Commands::List { plugins } => cmd_list(&plugins),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "modpatch=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

/// Collect manifest files: `path` itself, or every *.toml below it.
fn discover_manifests(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        anyhow::bail!("plugin path does not exist: {}", path.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|s| s.to_str()) == Some("toml")
        {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

fn load_manifests(path: &Path) -> Result<Vec<(PathBuf, PluginManifest)>> {
    discover_manifests(path)?
        .into_iter()
        .map(|file| {
            let manifest = load_from_path(&file)?;
            Ok((file, manifest))
        })
        .collect()
}

fn load_bundle(path: &Path) -> Result<Vec<BundleModule>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read bundle {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid bundle {}", path.display()))
}

/// Host-side factory for a bundle entry. Sources that do not parse still get
/// a factory so the module is registered; it fails when executed.
fn host_factory(id: &ModuleId, source: String) -> ModuleFactory {
    match ScriptCompiler.compile(id, &source) {
        Ok(factory) => factory,
        Err(err) => {
            tracing::warn!(module = %id, error = %err, "bundle module does not parse");
            let message = err.to_string();
            ModuleFactory::new(source, move || Err(FactoryError::Message(message.clone())))
        }
    }
}

/// Boot plugins, define and execute every bundle module.
async fn boot(args: &BootArgs) -> Result<Runtime> {
    let settings = match &args.settings {
        Some(path) => SettingsStore::load_from_path(path)?,
        None => SettingsStore::new(),
    };
    let config = RuntimeConfig {
        safe_mode: args.safe_mode,
        host_version: args.host_version.clone(),
        ..RuntimeConfig::default()
    };
    let mut runtime = Runtime::new(config).with_settings(settings);

    for (file, manifest) in load_manifests(&args.plugins)? {
        let name = manifest.plugin.name.clone();
        runtime
            .add_plugin(Arc::new(ManifestPlugin::new(manifest)))
            .with_context(|| format!("cannot add plugin {name} from {}", file.display()))?;
    }

    let summary = runtime.start_plugins().await;
    for (name, err) in &summary.failed {
        eprintln!("{} {}: {}", "✗".red(), name, err);
    }

    for module in load_bundle(&args.bundle)? {
        let id = ModuleId::from(module.id);
        let factory = host_factory(&id, module.source);
        runtime.define_module(id.clone(), factory);
        if let Err(err) = runtime.require(id) {
            eprintln!("{} {}", "!".yellow(), err);
        }
    }

    Ok(runtime)
}

fn display_diff(id: &ModuleId, original: &str, modified: &str) {
    println!("\n{}", format!("--- module {id} (original)").dimmed());
    println!("{}", format!("+++ module {id} (patched)").dimmed());

    let diff = TextDiff::from_lines(original, modified);
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => format!("-{}", change).red(),
            ChangeTag::Insert => format!("+{}", change).green(),
            ChangeTag::Equal => format!(" {}", change).normal(),
        };
        print!("{}", sign);
    }
    if !modified.ends_with('\n') {
        println!();
    }
}

fn print_report(runtime: &Runtime, report: &BootReport) {
    if report.safe_mode {
        println!("{}", "Safe mode: no plugins started".yellow());
    }
    for name in &report.started {
        println!("{} {}: started", "✓".green(), name);
    }
    for name in &report.disabled {
        println!("{} {}: disabled", "⊘".cyan(), name);
    }

    for record in runtime.interceptor().records() {
        if record.patched.is_some() {
            println!(
                "{} module {}: patched by {}",
                "✓".green(),
                record.id,
                record.event.plugins.join(", ")
            );
        }
        for diagnostic in &record.diagnostics {
            eprintln!("{} module {}: {}", "⚠".yellow(), record.id, diagnostic);
        }
    }
    for patch in &report.unmatched_patches {
        eprintln!(
            "{} {} patch {}: never matched (find {})",
            "⊙".yellow(),
            patch.plugin,
            patch.id,
            patch.find
        );
    }

    println!();
    println!("{}", "Summary:".bold());
    println!("  {} modules", report.modules);
    println!("  {} patched", format!("{}", report.patched_modules.len()).green());
    println!(
        "  {} unmatched patches",
        format!("{}", report.unmatched_patches.len()).yellow()
    );
    println!("  {} failed plugins", format!("{}", report.failed.len()).red());
}

/// Print fatals and exit non-zero when the boot cannot be trusted.
fn exit_on_fatal(runtime: &Runtime) {
    if let Err(err) = runtime.finish_boot() {
        eprintln!("\n{}", "Startup failed:".red().bold());
        let modpatch::runtime::BootError::Fatal { fatals } = err;
        for fatal in &fatals {
            eprintln!("  {} {}", "✗".red(), fatal);
        }
        eprintln!(
            "{}",
            "Re-run with --safe-mode to load the bundle without plugins.".dimmed()
        );
        std::process::exit(1);
    }
}

async fn cmd_apply(args: BootArgs, out: Option<PathBuf>, show_diff: bool) -> Result<()> {
    let runtime = boot(&args).await?;
    let report = runtime.report();
    print_report(&runtime, &report);

    if show_diff {
        for record in runtime.interceptor().records() {
            if let Some(patched) = &record.patched_source {
                display_diff(&record.id, record.original.source(), patched);
            }
        }
    }

    if let Some(dir) = out {
        let results = write_patched_sources(runtime.interceptor(), &dir)?;
        let written = results
            .iter()
            .filter(|r| matches!(r, SnapshotResult::Written { .. }))
            .count();
        println!(
            "\nWrote {} snapshot(s) to {} ({} unchanged)",
            written,
            dir.display(),
            results.len() - written
        );
    }

    exit_on_fatal(&runtime);
    Ok(())
}

async fn cmd_check(args: BootArgs, json: bool) -> Result<()> {
    let runtime = boot(&args).await?;
    let report = runtime.report();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&runtime, &report);
    }

    exit_on_fatal(&runtime);
    Ok(())
}

fn cmd_list(plugins: &Path) -> Result<()> {
    let manifests = load_manifests(plugins)?;
    if manifests.is_empty() {
        println!("{}", "No plugin manifests found".yellow());
        return Ok(());
    }

    for (file, manifest) in manifests {
        let meta = &manifest.plugin;
        let mut flags = Vec::new();
        if meta.required {
            flags.push("required".red().to_string());
        }
        if meta.enabled_by_default {
            flags.push("default-on".green().to_string());
        }
        println!(
            "{} {}",
            meta.name.bold(),
            if flags.is_empty() {
                String::new()
            } else {
                format!("[{}]", flags.join(", "))
            }
        );
        if !meta.description.is_empty() {
            println!("  {}", meta.description);
        }
        println!("  {}", file.display().to_string().dimmed());
        if !meta.dependencies.is_empty() {
            println!("  depends on: {}", meta.dependencies.join(", "));
        }
        if let Some(req) = &meta.host_version {
            println!("  host: {}", req);
        }
        println!(
            "  {} patch(es), {} setting(s)",
            manifest.patches.len(),
            manifest.settings.len()
        );
    }
    Ok(())
}
