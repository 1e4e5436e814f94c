use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::scan::classify_candidate;
use crate::{PluginDescription, PluginFormat};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("plugin not found at {0}")]
    Missing(PathBuf),
    #[error("unsupported plugin format")]
    Unsupported,
}

/// A plugin format that knows how to list the plugins inside a file or
/// identifier.
pub trait FormatBackend: Send + Sync {
    /// Format name, also used to select this backend in worker requests.
    fn name(&self) -> &str;

    fn enumerate_descriptors(&self, locator: &str)
        -> Result<Vec<PluginDescription>, ProbeError>;

    /// Maps a path found while walking search roots to a locator this backend
    /// can probe.
    fn candidate_locator(&self, path: &Path) -> Option<String> {
        let (format, candidate) = classify_candidate(path)?;
        format
            .name()
            .eq_ignore_ascii_case(self.name())
            .then(|| candidate.display().to_string())
    }
}

/// Backends available to this process, looked up by format name.
#[derive(Clone, Default)]
pub struct FormatRegistry {
    backends: Vec<Arc<dyn FormatBackend>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a manifest backend for every known format.
    pub fn with_manifest_backends() -> Self {
        let mut registry = Self::new();
        for format in PluginFormat::ALL {
            registry.register(Arc::new(ManifestBackend::new(format)));
        }
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn FormatBackend>) {
        self.backends
            .retain(|existing| !existing.name().eq_ignore_ascii_case(backend.name()));
        self.backends.push(backend);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn FormatBackend>> {
        self.backends
            .iter()
            .find(|backend| backend.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|backend| backend.name().to_string())
            .collect()
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

/// Describes plugins from the `manifest.json` shipped inside their bundle,
/// falling back to a name derived from the path.
#[derive(Debug, Clone, Copy)]
pub struct ManifestBackend {
    format: PluginFormat,
}

impl ManifestBackend {
    pub fn new(format: PluginFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> PluginFormat {
        self.format
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Bundle { plugins: Vec<ManifestEntry> },
    Single(ManifestEntry),
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    pub id: Option<String>,
    pub name: Option<String>,
    pub vendor: Option<String>,
    pub category: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub is_instrument: Option<bool>,
    pub has_editor: Option<bool>,
    pub num_inputs: Option<u32>,
    pub num_outputs: Option<u32>,
}

impl ManifestEntry {
    fn into_description(self, format: PluginFormat, path: &Path) -> PluginDescription {
        let name = self.name.unwrap_or_else(|| file_stem(path));
        let unique_id = self
            .id
            .or_else(|| default_id(path))
            .unwrap_or_else(|| path.display().to_string());
        PluginDescription {
            descriptive_name: self.description.unwrap_or_else(|| name.clone()),
            name,
            format: format.name().to_string(),
            category: self.category.unwrap_or_default(),
            manufacturer: self.vendor.unwrap_or_default(),
            version: self.version.unwrap_or_default(),
            file_or_identifier: path.display().to_string(),
            unique_id,
            is_instrument: self.is_instrument.unwrap_or(false),
            has_editor: self.has_editor.unwrap_or(false),
            num_inputs: self.num_inputs.unwrap_or(0),
            num_outputs: self.num_outputs.unwrap_or(2),
        }
    }
}

impl FormatBackend for ManifestBackend {
    fn name(&self) -> &str {
        self.format.name()
    }

    fn enumerate_descriptors(
        &self,
        locator: &str,
    ) -> Result<Vec<PluginDescription>, ProbeError> {
        let path = Path::new(locator);
        if !path.exists() {
            return Err(ProbeError::Missing(path.to_path_buf()));
        }
        let descriptions = match find_manifest(self.format, path)? {
            Some(ManifestFile::Bundle { plugins }) => plugins
                .into_iter()
                .map(|entry| entry.into_description(self.format, path))
                .collect(),
            Some(ManifestFile::Single(entry)) => vec![entry.into_description(self.format, path)],
            None => vec![stub_description(self.format, path)],
        };
        Ok(descriptions)
    }
}

fn find_manifest(
    format: PluginFormat,
    path: &Path,
) -> Result<Option<ManifestFile>, ProbeError> {
    let mut candidates = Vec::new();
    match format {
        PluginFormat::Clap => {
            if path.is_dir() {
                candidates.push(path.join("manifest.json"));
                candidates.push(path.join("Contents/manifest.json"));
            } else if let Some(parent) = path.parent() {
                candidates.push(parent.join("manifest.json"));
            }
        }
        PluginFormat::Vst3 | PluginFormat::Ovst3 => {
            candidates.push(path.join("Contents/manifest.json"));
            candidates.push(path.join("manifest.json"));
        }
        PluginFormat::Harmoniq => {
            if path.is_file() {
                if let Some(parent) = path.parent() {
                    candidates.push(parent.join("manifest.json"));
                }
            }
            candidates.push(path.join("manifest.json"));
        }
    }
    for candidate in candidates {
        if candidate.is_file() {
            let raw = fs::read_to_string(candidate)?;
            let manifest: ManifestFile = serde_json::from_str(&raw)?;
            return Ok(Some(manifest));
        }
    }
    Ok(None)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn default_id(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

fn stub_description(format: PluginFormat, path: &Path) -> PluginDescription {
    let name = file_stem(path);
    let mut unique_id = name.clone();
    unique_id.push('#');
    unique_id.push_str(&format.name().to_ascii_lowercase());
    let mut description =
        PluginDescription::new(name, format.name(), path.display().to_string())
            .with_unique_id(unique_id);
    description.is_instrument = matches!(format, PluginFormat::Harmoniq);
    description.num_outputs = 2;
    description
}

#[cfg(test)]
mod tests {
    use std::fs::{create_dir_all, File};

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn manifest_bundle_lists_every_plugin() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("Suite.vst3");
        create_dir_all(bundle.join("Contents")).unwrap();
        fs::write(
            bundle.join("Contents/manifest.json"),
            serde_json::json!({
                "plugins": [
                    { "id": "suite.synth", "name": "Suite Synth", "is_instrument": true },
                    { "id": "suite.fx", "name": "Suite FX", "vendor": "Acme", "num_inputs": 2 }
                ]
            })
            .to_string(),
        )
        .unwrap();

        let backend = ManifestBackend::new(PluginFormat::Vst3);
        let found = backend
            .enumerate_descriptors(&bundle.display().to_string())
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].unique_id, "suite.synth");
        assert!(found[0].is_instrument);
        assert_eq!(found[1].manufacturer, "Acme");
        assert_eq!(found[1].format, "VST3");
    }

    #[test]
    fn plugin_without_manifest_gets_stub() {
        let dir = tempdir().unwrap();
        let plugin = dir.path().join("synth.clap");
        File::create(&plugin).unwrap();
        let backend = ManifestBackend::new(PluginFormat::Clap);
        let found = backend
            .enumerate_descriptors(&plugin.display().to_string())
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "synth");
        assert_eq!(found[0].unique_id, "synth#clap");
    }

    #[test]
    fn missing_plugin_is_an_error() {
        let backend = ManifestBackend::new(PluginFormat::Clap);
        assert!(matches!(
            backend.enumerate_descriptors("/definitely/not/here.clap"),
            Err(ProbeError::Missing(_))
        ));
    }

    #[test]
    fn registry_finds_backends_by_name() {
        let registry = FormatRegistry::with_manifest_backends();
        assert_eq!(registry.find("clap").unwrap().name(), "CLAP");
        assert!(registry.find("AU").is_none());
        assert_eq!(registry.names().len(), PluginFormat::ALL.len());
    }
}
