//! `layers.csv` registry.
//!
//! The registry lists the layers the visualization tool loads, grouped under
//! `Group` rows. Each exported layer is added once, with the RGB colour picked
//! in the export settings. The file keeps the encoding it was read with.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::encoding::{self, TextEncoding};
use crate::error::{ExportError, Result};

pub const REGISTRY_FILE_NAME: &str = "layers.csv";

/// Result of registering a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    AlreadyListed { colour_differs: bool },
}

/// Colour index `0..=9` mapped to a fully saturated hue.
pub fn colour_rgb(index: u8) -> [u8; 3] {
    let h = f64::from(index) / 10.0;
    let sector = (h * 6.0).floor();
    let f = h * 6.0 - sector;
    let (r, g, b) = match (sector as i64).rem_euclid(6) {
        0 => (1.0, f, 0.0),
        1 => (1.0 - f, 1.0, 0.0),
        2 => (0.0, 1.0, f),
        3 => (0.0, 1.0 - f, 1.0),
        4 => (f, 0.0, 1.0),
        _ => (1.0, 0.0, 1.0 - f),
    };
    [r, g, b].map(|channel: f64| (channel * 255.0) as u8)
}

fn read_rows(text: &str) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

fn write_rows(rows: &[Vec<String>], crlf: bool) -> Result<String> {
    let terminator = if crlf {
        csv::Terminator::CRLF
    } else {
        csv::Terminator::Any(b'\n')
    };
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .terminator(terminator)
        .from_writer(Vec::new());
    for row in rows {
        writer.write_record(row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| ExportError::Format(format!("failed to write {}: {}", REGISTRY_FILE_NAME, e)))?;
    String::from_utf8(bytes).map_err(|e| ExportError::Format(format!("{} is not valid text: {}", REGISTRY_FILE_NAME, e)))
}

pub struct LayerRegistry {
    path: PathBuf,
}

impl LayerRegistry {
    /// `<output_root>/layers.csv` if it exists.
    pub fn find(output_root: &Path) -> Option<Self> {
        let path = output_root.join(REGISTRY_FILE_NAME);
        if path.is_file() {
            Some(Self { path })
        } else {
            info!(
                "{} not found in {}, add the layer to ur-scape manually",
                REGISTRY_FILE_NAME,
                output_root.display()
            );
            None
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn register(&self, name: &str, group: &str, colour: u8) -> Result<Registration> {
        let (text, encoding) = encoding::read_text(&self.path)?;
        let crlf = text.contains("\r\n");
        let mut rows = read_rows(&text)?;
        let rgb = colour_rgb(colour).map(|c| c.to_string());

        if let Some(existing) = rows.iter().find(|row| row.iter().any(|cell| cell == name)) {
            let colour_differs = existing.len() >= 5
                && existing[2].chars().all(|c| c.is_ascii_digit())
                && !existing[2].is_empty()
                && existing[2..5] != rgb[..];
            warn!("Layer {} is already listed in {}", name, REGISTRY_FILE_NAME);
            if colour_differs {
                warn!("Layer {} is listed with a different colour, the new colour is ignored", name);
            }
            return Ok(Registration::AlreadyListed { colour_differs });
        }

        let layer_row = vec!["Layer".to_string(), name.to_string(), rgb[0].clone(), rgb[1].clone(), rgb[2].clone()];
        let group_row = rows.iter().rposition(|row| {
            row.first().map_or(false, |c| c == "Group") && row.iter().skip(1).any(|c| c.eq_ignore_ascii_case(group))
        });
        match group_row {
            Some(start) => {
                // グループの最後のLayer行の後ろ
                let end = rows[start + 1..]
                    .iter()
                    .position(|row| row.first().map_or(true, |c| c != "Layer"))
                    .map_or(rows.len(), |offset| start + 1 + offset);
                rows.insert(end, layer_row);
            }
            None => {
                rows.push(vec![String::new(); 5]);
                rows.push(vec!["Group".to_string(), group.to_string(), String::new(), String::new(), String::new()]);
                rows.push(layer_row);
            }
        }

        let out = write_rows(&rows, crlf)?;
        fs::write(&self.path, encoding::encode(&out, encoding))?;
        info!("Added layer {} to {} ({:?})", name, REGISTRY_FILE_NAME, encoding);
        Ok(Registration::Added)
    }
}
