//! Process-wide settings, loaded once at startup.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_phase::HistoMethod;
use crate::sspfm_read::{load_record, TableLayout};

/// Names of the output sub-folders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Folders {
    pub nanoloops: String,
    pub properties: String,
    pub best_nanoloops: String,
    pub figures: String,
}

impl Default for Folders {
    fn default() -> Self {
        Folders {
            nanoloops: "nanoloops".to_string(),
            properties: "properties".to_string(),
            best_nanoloops: "best_nanoloops".to_string(),
            figures: "figures".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Figure size in pixels.
    pub figsize: [u32; 2],
    pub folders: Folders,
    pub delimiter: String,
    pub header_lines: usize,
    /// Column titles by file kind (extension), then by channel.
    pub channels: BTreeMap<String, BTreeMap<String, String>>,
    pub histo_method: HistoMethod,
    /// Subtract the off-field y-shift before the differential analysis.
    pub electrostatic_offset: bool,
    pub radians_input_phase: bool,
    pub multi_processing: bool,
    /// Worker threads, 0 for one per core.
    pub workers: usize,
    pub detect_bug_segments: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            figsize: [1200, 900],
            folders: Folders::default(),
            delimiter: "\t".to_string(),
            header_lines: 0,
            channels: BTreeMap::new(),
            histo_method: HistoMethod::Fit,
            electrostatic_offset: true,
            radians_input_phase: false,
            multi_processing: false,
            workers: 0,
            detect_bug_segments: false,
        }
    }
}

impl Settings {
    /// Built-in defaults, overridden by `filepath` when given.
    pub fn load(filepath: Option<&Path>) -> SspfmResult<Self> {
        match filepath {
            Some(path) => load_record(path),
            None => Ok(Settings::default()),
        }
    }

    pub fn delimiter_byte(&self) -> SspfmResult<u8> {
        let text = self.delimiter.replace("\\t", "\t");
        match text.as_bytes() {
            [byte] => Ok(*byte),
            _ => Err(SspfmError::config("delimiter", &self.delimiter, &["single character, e.g. \\t , ;"])),
        }
    }

    /// Table layout for raw files of kind `extension`.
    pub fn layout_for(&self, extension: &str) -> SspfmResult<TableLayout> {
        let channels: HashMap<String, String> = self
            .channels
            .get(&extension.to_ascii_lowercase())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(TableLayout {
            delimiter: self.delimiter_byte()?,
            header_lines: self.header_lines,
            channels,
        })
    }
}
