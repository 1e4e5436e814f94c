use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::{FormatBackend, KnownPluginList, PluginDescription, PluginFormat, ShutdownSignal};

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub system_roots: Vec<PathBuf>,
    pub user_roots: Vec<PathBuf>,
    pub max_depth: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        let system_roots = vec![
            PathBuf::from("/usr/share/harmoniq-studio/plugins/clap"),
            PathBuf::from("/usr/share/harmoniq-studio/plugins/vst3"),
            PathBuf::from("/usr/share/harmoniq-studio/plugins/ovst3"),
            PathBuf::from("/usr/share/harmoniq-studio/plugins/harmoniq"),
        ];
        let mut user_roots = Vec::new();
        if let Some(home) = dirs::home_dir() {
            user_roots.push(home.join(".clap"));
            user_roots.push(home.join(".vst3"));
            user_roots.push(home.join(".harmoniq/plugins"));
        }
        Self {
            system_roots,
            user_roots,
            max_depth: 4,
        }
    }
}

impl ScanConfig {
    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        Self {
            system_roots: Vec::new(),
            user_roots: roots,
            max_depth: 4,
        }
    }

    /// Adds an extra search root; a file adds its parent directory.
    pub fn add_path(&mut self, path: &Path) {
        let root = if path.is_dir() {
            path.to_path_buf()
        } else if let Some(parent) = path.parent() {
            parent.to_path_buf()
        } else {
            return;
        };
        if !self.user_roots.contains(&root) && !self.system_roots.contains(&root) {
            self.user_roots.push(root);
        }
    }

    fn roots(&self) -> impl Iterator<Item = &PathBuf> {
        self.system_roots.iter().chain(self.user_roots.iter())
    }
}

/// Outcome of scanning every candidate below the search roots.
#[derive(Debug, Default)]
pub struct DirectoryScanReport {
    pub found: Vec<PluginDescription>,
    pub failed: Vec<String>,
    pub cancelled: bool,
}

/// Walks the search roots for one format and feeds each candidate to a
/// [`KnownPluginList`].
///
/// While a file is being scanned its locator is written to the dead man's
/// pedal file. If the process dies mid-scan the entry survives, and
/// [`apply_blacklistings_from_dead_mans_pedal`] blacklists it on the next run.
pub struct PluginDirectoryScanner {
    backend: Arc<dyn FormatBackend>,
    candidates: Vec<String>,
    next_index: usize,
    dead_mans_pedal: Option<PathBuf>,
    shutdown: ShutdownSignal,
    failed: Vec<String>,
    cancelled: bool,
}

impl PluginDirectoryScanner {
    pub fn new(
        backend: Arc<dyn FormatBackend>,
        config: &ScanConfig,
        dead_mans_pedal: Option<PathBuf>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let candidates = find_candidates(backend.as_ref(), config);
        log::debug!(
            "found {} {} candidates",
            candidates.len(),
            backend.name()
        );
        Self {
            backend,
            candidates,
            next_index: 0,
            dead_mans_pedal,
            shutdown,
            failed: Vec::new(),
            cancelled: false,
        }
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn next_plugin_to_scan(&self) -> Option<&str> {
        self.candidates.get(self.next_index).map(String::as_str)
    }

    pub fn progress(&self) -> f32 {
        if self.candidates.is_empty() {
            return 1.0;
        }
        self.next_index as f32 / self.candidates.len() as f32
    }

    pub fn failed_files(&self) -> &[String] {
        &self.failed
    }

    /// Whether shutdown cut the scan short, including while the last
    /// candidate was being probed.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Scans the next candidate. Returns `None` once every candidate has been
    /// visited or shutdown was requested.
    pub fn scan_next_file(
        &mut self,
        list: &mut KnownPluginList,
        dont_rescan_if_already_in_list: bool,
    ) -> Option<Vec<PluginDescription>> {
        let locator = self.candidates.get(self.next_index)?.clone();
        if self.shutdown.is_requested() {
            self.cancelled = true;
            return None;
        }
        self.next_index += 1;

        self.set_dead_mans_pedal(Some(&locator));
        let result =
            list.scan_and_add_file(self.backend.as_ref(), &locator, dont_rescan_if_already_in_list);
        self.set_dead_mans_pedal(None);
        if self.shutdown.is_requested() {
            self.cancelled = true;
        }

        match result {
            Ok(found) => Some(found),
            Err(_) => {
                self.failed.push(locator);
                Some(Vec::new())
            }
        }
    }

    pub fn run(
        &mut self,
        list: &mut KnownPluginList,
        dont_rescan_if_already_in_list: bool,
    ) -> DirectoryScanReport {
        let mut report = DirectoryScanReport::default();
        while let Some(found) = self.scan_next_file(list, dont_rescan_if_already_in_list) {
            report.found.extend(found);
        }
        report.cancelled = self.cancelled;
        report.failed = self.failed.clone();
        report
    }

    fn set_dead_mans_pedal(&self, scanning: Option<&str>) {
        let Some(path) = self.dead_mans_pedal.as_ref() else {
            return;
        };
        let result = match scanning {
            Some(locator) => fs::write(path, format!("{locator}\n")),
            None if path.exists() => fs::remove_file(path),
            None => Ok(()),
        };
        if let Err(err) = result {
            log::warn!("failed to update dead man's pedal {}: {}", path.display(), err);
        }
    }
}

/// Blacklists whatever was being scanned when a previous run died, then
/// clears the pedal file.
pub fn apply_blacklistings_from_dead_mans_pedal(
    list: &mut KnownPluginList,
    pedal: &Path,
) -> Vec<String> {
    let Ok(raw) = fs::read_to_string(pedal) else {
        return Vec::new();
    };
    let crashed: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect();
    for locator in &crashed {
        log::warn!("blacklisting {locator}: a previous scan crashed while probing it");
        list.add_to_blacklist(locator.clone());
    }
    if let Err(err) = fs::remove_file(pedal) {
        log::debug!("could not remove dead man's pedal {}: {}", pedal.display(), err);
    }
    crashed
}

fn find_candidates(backend: &dyn FormatBackend, config: &ScanConfig) -> Vec<String> {
    let mut candidates = BTreeSet::new();
    for root in config.roots() {
        if !root.exists() {
            continue;
        }
        let walker = WalkDir::new(root).max_depth(config.max_depth).into_iter();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if let Some(io) = err.io_error() {
                        log::debug!("skipping entry while scanning {}: {}", root.display(), io);
                    }
                    continue;
                }
            };
            if let Some(locator) = backend.candidate_locator(entry.path()) {
                candidates.insert(locator);
            }
        }
    }
    candidates.into_iter().collect()
}

pub fn classify_candidate(path: &Path) -> Option<(PluginFormat, PathBuf)> {
    if path.is_file() {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("clap") => {
                if path.file_name()?.eq("plugin.clap") {
                    let bundle = path.parent()?.parent()?;
                    if bundle
                        .extension()
                        .map(|ext| ext.eq_ignore_ascii_case("clap"))
                        .unwrap_or(false)
                    {
                        return Some((PluginFormat::Clap, bundle.to_path_buf()));
                    }
                }
                return Some((PluginFormat::Clap, path.to_path_buf()));
            }
            Some("hqplug") => return Some((PluginFormat::Harmoniq, path.to_path_buf())),
            _ => {}
        }
    } else if path.is_dir() {
        // Dot directories such as `~/.vst3` have no extension and are roots.
        let format = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(PluginFormat::from_extension)?;
        if matches!(format, PluginFormat::Clap | PluginFormat::Vst3 | PluginFormat::Ovst3) {
            return Some((format, path.to_path_buf()));
        }
    }
    None
}
