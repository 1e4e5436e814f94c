use std::io::{stdin, stdout};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use harmoniq_plugin_db::{
    apply_blacklistings_from_dead_mans_pedal, FormatRegistry, KnownPluginList,
    PluginDirectoryScanner, PluginFormat, PluginStore, ScanConfig, ShutdownSignal,
};
use harmoniq_plugin_scanner::{
    run_worker, ProcessLauncher, ScanCoordinator, ScanPolicy, SettingsStore, SCAN_MODE_KEY,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "harmoniq-plugin-scanner", version, about = "Scan for plug-ins, optionally in a sandboxed worker process")]
struct Args {
    /// Restrict scanning to the given plugin formats
    #[arg(
        long,
        value_name = "FORMAT",
        value_parser = parse_format,
        default_values_t = PluginFormat::ALL.to_vec(),
    )]
    formats: Vec<PluginFormat>,

    /// Additional paths to scan for plugins
    #[arg(long = "path", value_name = "PATH")]
    extra_paths: Vec<PathBuf>,

    /// Change the stored scan mode before scanning
    #[arg(long, value_enum)]
    mode: Option<ScanMode>,

    /// Settings file holding the scan mode
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Plugin database file
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Probe files again even if they are already in the database
    #[arg(long)]
    rescan: bool,

    /// Forget previously failed plugins before scanning
    #[arg(long)]
    clear_blacklist: bool,

    /// Run as a scan worker for the host that launched this process
    #[arg(long = "scan-worker", value_name = "TOKEN", hide = true)]
    scan_worker: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScanMode {
    InProcess,
    OutOfProcess,
}

impl From<ScanMode> for ScanPolicy {
    fn from(mode: ScanMode) -> Self {
        match mode {
            ScanMode::InProcess => ScanPolicy::InProcess,
            ScanMode::OutOfProcess => ScanPolicy::OutOfProcess,
        }
    }
}

fn parse_format(value: &str) -> Result<PluginFormat, String> {
    match value.to_ascii_lowercase().as_str() {
        "clap" => Ok(PluginFormat::Clap),
        "vst3" => Ok(PluginFormat::Vst3),
        "ovst3" | "openvst3" => Ok(PluginFormat::Ovst3),
        "harmoniq" | "hq" | "hqplug" => Ok(PluginFormat::Harmoniq),
        other => Err(format!("unsupported format: {other}")),
    }
}

fn main() -> anyhow::Result<()> {
    // stdout carries the worker protocol, so logs always go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let args = Args::parse();
    let registry = FormatRegistry::with_manifest_backends();

    if let Some(token) = args.scan_worker.as_deref() {
        return run_worker(stdin().lock(), stdout().lock(), token, &registry)
            .context("scan worker failed");
    }

    run_host(args, registry)
}

fn run_host(args: Args, registry: FormatRegistry) -> anyhow::Result<()> {
    let settings_path = match args.settings {
        Some(path) => path,
        None => SettingsStore::default_path().context("failed to locate settings file")?,
    };
    let settings = SettingsStore::open(&settings_path)
        .with_context(|| format!("failed to open settings at {}", settings_path.display()))?;
    if let Some(mode) = args.mode {
        settings
            .set_value(SCAN_MODE_KEY, ScanPolicy::from(mode).as_setting())
            .context("failed to store scan mode")?;
    }

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.request())
            .context("failed to install Ctrl-C handler")?;
    }

    let launcher = ProcessLauncher::current_exe().context("failed to locate scanner executable")?;
    let coordinator = ScanCoordinator::new(&settings, Box::new(launcher), shutdown.clone());
    info!(policy = %coordinator.policy(), "starting plugin scan");

    let database_path = match args.database {
        Some(path) => path,
        None => PluginStore::default_path().context("failed to locate plugin database")?,
    };
    let store = PluginStore::open(&database_path)
        .with_context(|| format!("failed to open plugin database {}", database_path.display()))?;

    let mut list = KnownPluginList::new();
    store.load_into(&mut list);
    if args.clear_blacklist {
        list.clear_blacklist();
    }
    let pedal = store.dead_mans_pedal_path();
    for crashed in apply_blacklistings_from_dead_mans_pedal(&mut list, &pedal) {
        warn!(plugin = %crashed, "previous scan crashed on this plugin");
    }
    list.set_custom_scanner(Box::new(coordinator));

    let mut config = ScanConfig::default();
    for extra in &args.extra_paths {
        config.add_path(extra);
    }

    let mut failed = Vec::new();
    for format in &args.formats {
        let Some(backend) = registry.find(format.name()) else {
            continue;
        };
        let mut scanner =
            PluginDirectoryScanner::new(backend, &config, Some(pedal.clone()), shutdown.clone());
        let report = scanner.run(&mut list, !args.rescan);
        failed.extend(report.failed);
        if report.cancelled {
            warn!("scan cancelled");
            break;
        }
    }
    list.scan_finished();
    list.sort_by_name();
    store.save(&list).context("failed to save plugin database")?;

    for plugin in list.types() {
        println!("{} ({})", plugin.name, plugin.format);
    }
    for locator in failed {
        println!("failed: {locator}");
    }
    Ok(())
}
