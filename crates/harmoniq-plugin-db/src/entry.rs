use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum PluginFormat {
    Clap,
    Vst3,
    Ovst3,
    Harmoniq,
}

impl PluginFormat {
    pub const ALL: [PluginFormat; 4] = [
        PluginFormat::Clap,
        PluginFormat::Vst3,
        PluginFormat::Ovst3,
        PluginFormat::Harmoniq,
    ];

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "clap" => Some(Self::Clap),
            "vst3" => Some(Self::Vst3),
            "ovst3" => Some(Self::Ovst3),
            "hqplug" => Some(Self::Harmoniq),
            _ => None,
        }
    }

    /// Name used on the wire and in descriptors to select a format backend.
    pub fn name(self) -> &'static str {
        match self {
            Self::Clap => "CLAP",
            Self::Vst3 => "VST3",
            Self::Ovst3 => "OVST3",
            Self::Harmoniq => "Harmoniq",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for PluginFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata identifying one loadable plugin variant inside a file or bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginDescription {
    pub name: String,
    pub descriptive_name: String,
    /// Name of the format backend that produced this description.
    pub format: String,
    pub category: String,
    pub manufacturer: String,
    pub version: String,
    pub file_or_identifier: String,
    pub unique_id: String,
    pub is_instrument: bool,
    pub has_editor: bool,
    pub num_inputs: u32,
    pub num_outputs: u32,
}

impl PluginDescription {
    pub fn new(
        name: impl Into<String>,
        format: impl Into<String>,
        file_or_identifier: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            descriptive_name: name.clone(),
            name,
            format: format.into(),
            file_or_identifier: file_or_identifier.into(),
            ..Self::default()
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = unique_id.into();
        self
    }

    /// Stable key used to deduplicate descriptions in the known plugin list.
    pub fn identifier(&self) -> String {
        format!(
            "{}-{}-{}",
            self.format, self.file_or_identifier, self.unique_id
        )
    }

    pub fn is_duplicate_of(&self, other: &PluginDescription) -> bool {
        self.format == other.format
            && self.file_or_identifier == other.file_or_identifier
            && self.unique_id == other.unique_id
    }
}
