use std::collections::BTreeSet;

use thiserror::Error;

use crate::{FormatBackend, PluginDescription, ProbeError};

/// Reasons a single file failed to scan. None of them are fatal: the file is
/// blacklisted and the surrounding scan carries on.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan request for {0:?} is missing a format or locator")]
    InvalidRequest(String),
    #[error("scan worker was unreachable when sending the request")]
    SendFailed,
    #[error("connection to the scan worker was lost")]
    ConnectionLost,
    #[error("failed to launch scan worker: {0}")]
    Launch(#[source] std::io::Error),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// Replaces the direct backend call when the known list scans a file, e.g.
/// to move probing into a separate process.
pub trait CustomScanner: Send {
    fn find_types_for(
        &mut self,
        format: &dyn FormatBackend,
        locator: &str,
    ) -> Result<Vec<PluginDescription>, ScanError>;

    /// Called once a batch of scans is complete.
    fn scan_finished(&mut self);
}

#[derive(Default)]
pub struct KnownPluginList {
    types: Vec<PluginDescription>,
    blacklist: BTreeSet<String>,
    scanner: Option<Box<dyn CustomScanner>>,
    revision: u64,
}

impl KnownPluginList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_custom_scanner(&mut self, scanner: Box<dyn CustomScanner>) {
        self.scanner = Some(scanner);
    }

    pub fn clear_custom_scanner(&mut self) -> Option<Box<dyn CustomScanner>> {
        self.scanner.take()
    }

    pub fn types(&self) -> &[PluginDescription] {
        &self.types
    }

    pub fn blacklist(&self) -> impl Iterator<Item = &str> {
        self.blacklist.iter().map(String::as_str)
    }

    /// Increases every time the types or blacklist change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Adds or replaces a description; returns `false` if an identical entry
    /// was already present.
    pub fn add_type(&mut self, description: PluginDescription) -> bool {
        if let Some(existing) = self
            .types
            .iter_mut()
            .find(|existing| existing.is_duplicate_of(&description))
        {
            if *existing == description {
                return false;
            }
            *existing = description;
        } else {
            self.types.push(description);
        }
        self.revision += 1;
        true
    }

    pub fn remove_type(&mut self, description: &PluginDescription) -> bool {
        let before = self.types.len();
        self.types
            .retain(|existing| !existing.is_duplicate_of(description));
        let removed = self.types.len() != before;
        if removed {
            self.revision += 1;
        }
        removed
    }

    pub fn types_for_file(&self, locator: &str) -> Vec<PluginDescription> {
        self.types
            .iter()
            .filter(|description| description.file_or_identifier == locator)
            .cloned()
            .collect()
    }

    pub fn is_file_known(&self, locator: &str) -> bool {
        self.types
            .iter()
            .any(|description| description.file_or_identifier == locator)
    }

    pub fn is_blacklisted(&self, locator: &str) -> bool {
        self.blacklist.contains(locator)
    }

    pub fn add_to_blacklist(&mut self, locator: impl Into<String>) {
        if self.blacklist.insert(locator.into()) {
            self.revision += 1;
        }
    }

    pub fn remove_from_blacklist(&mut self, locator: &str) -> bool {
        let removed = self.blacklist.remove(locator);
        if removed {
            self.revision += 1;
        }
        removed
    }

    pub fn clear_blacklist(&mut self) {
        if !self.blacklist.is_empty() {
            self.blacklist.clear();
            self.revision += 1;
        }
    }

    pub fn sort_by_name(&mut self) {
        self.types.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.format.cmp(&b.format))
        });
    }

    /// Scans one file and records what it contains.
    ///
    /// Blacklisted files are skipped. With `dont_rescan_if_already_in_list`
    /// the descriptions already known for the file are returned unchanged. A
    /// failed scan blacklists the file and reports the error; a request that
    /// names no file is rejected without touching the blacklist.
    pub fn scan_and_add_file(
        &mut self,
        format: &dyn FormatBackend,
        locator: &str,
        dont_rescan_if_already_in_list: bool,
    ) -> Result<Vec<PluginDescription>, ScanError> {
        if locator.is_empty() || format.name().is_empty() {
            return Err(ScanError::InvalidRequest(locator.to_string()));
        }
        if self.is_blacklisted(locator) {
            log::debug!("not scanning blacklisted plugin {locator}");
            return Ok(Vec::new());
        }
        if dont_rescan_if_already_in_list && self.is_file_known(locator) {
            return Ok(self.types_for_file(locator));
        }

        let found = match self.scanner.as_mut() {
            Some(scanner) => scanner.find_types_for(format, locator),
            None => format.enumerate_descriptors(locator).map_err(ScanError::from),
        };

        match found {
            Ok(descriptions) => {
                for description in &descriptions {
                    self.add_type(description.clone());
                }
                Ok(descriptions)
            }
            Err(err @ ScanError::InvalidRequest(_)) => Err(err),
            Err(err) => {
                log::warn!("failed to scan {locator}: {err}");
                self.add_to_blacklist(locator);
                Err(err)
            }
        }
    }

    pub fn scan_finished(&mut self) {
        if let Some(scanner) = self.scanner.as_mut() {
            scanner.scan_finished();
        }
    }
}

impl std::fmt::Debug for KnownPluginList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnownPluginList")
            .field("types", &self.types)
            .field("blacklist", &self.blacklist)
            .field("custom_scanner", &self.scanner.is_some())
            .field("revision", &self.revision)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;

    struct FixedBackend {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FixedBackend {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl FormatBackend for FixedBackend {
        fn name(&self) -> &str {
            "VST"
        }

        fn enumerate_descriptors(
            &self,
            locator: &str,
        ) -> Result<Vec<PluginDescription>, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProbeError::Unsupported);
            }
            Ok(vec![PluginDescription::new("Fixed", "VST", locator).with_unique_id("1")])
        }
    }

    struct RecordingScanner {
        calls: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
        lose_connection: bool,
    }

    impl CustomScanner for RecordingScanner {
        fn find_types_for(
            &mut self,
            _format: &dyn FormatBackend,
            locator: &str,
        ) -> Result<Vec<PluginDescription>, ScanError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.lose_connection {
                return Err(ScanError::ConnectionLost);
            }
            Ok(vec![PluginDescription::new("Remote", "VST", locator)])
        }

        fn scan_finished(&mut self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn direct_scan_adds_types() {
        let backend = FixedBackend::new(false);
        let mut list = KnownPluginList::new();
        let found = list.scan_and_add_file(&backend, "/a.vst", true).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(list.types().len(), 1);

        let again = list.scan_and_add_file(&backend, "/a.vst", true).unwrap();
        assert_eq!(again, found);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        list.scan_and_add_file(&backend, "/a.vst", false).unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(list.types().len(), 1);
    }

    #[test]
    fn failed_scan_blacklists_file() {
        let backend = FixedBackend::new(true);
        let mut list = KnownPluginList::new();
        assert!(list.scan_and_add_file(&backend, "/bad.vst", true).is_err());
        assert!(list.is_blacklisted("/bad.vst"));

        assert!(list
            .scan_and_add_file(&backend, "/bad.vst", false)
            .unwrap()
            .is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        assert!(list.remove_from_blacklist("/bad.vst"));
        assert_eq!(list.blacklist().count(), 0);
    }

    #[test]
    fn custom_scanner_replaces_backend() {
        let backend = FixedBackend::new(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let mut list = KnownPluginList::new();
        list.set_custom_scanner(Box::new(RecordingScanner {
            calls: Arc::clone(&calls),
            finished: Arc::clone(&finished),
            lose_connection: false,
        }));

        let found = list.scan_and_add_file(&backend, "/b.vst", false).unwrap();
        assert_eq!(found[0].name, "Remote");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        list.scan_finished();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lost_connection_blacklists_only_that_file() {
        let backend = FixedBackend::new(false);
        let mut list = KnownPluginList::new();
        list.set_custom_scanner(Box::new(RecordingScanner {
            calls: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
            lose_connection: true,
        }));
        let err = list.scan_and_add_file(&backend, "/crash.vst", false);
        assert!(matches!(err, Err(ScanError::ConnectionLost)));
        assert_eq!(list.blacklist().collect::<Vec<_>>(), vec!["/crash.vst"]);
        assert!(list.types().is_empty());
    }

    #[test]
    fn empty_locator_is_rejected_without_blacklisting() {
        let backend = FixedBackend::new(false);
        let mut list = KnownPluginList::new();
        let result = list.scan_and_add_file(&backend, "", false);
        assert!(matches!(result, Err(ScanError::InvalidRequest(_))));
        assert_eq!(list.blacklist().count(), 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn revision_tracks_changes() {
        let mut list = KnownPluginList::new();
        let description = PluginDescription::new("A", "VST", "/a.vst");
        assert!(list.add_type(description.clone()));
        assert!(!list.add_type(description.clone()));
        let revision = list.revision();
        assert!(list.remove_type(&description));
        assert!(list.revision() > revision);
    }
}
