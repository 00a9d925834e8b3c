//! Patch grid files.
//!
//! A grid file is a comma separated header followed by one row per cell,
//! top row first:
//!
//! ```text
//! METADATA,TRUE
//! Layer Name,Population
//! Colouring,Multi
//! CATEGORIES,FALSE
//! Units,population/SqKm2
//! West,104.5
//! North,-2.8
//! East,105
//! South,-3.1
//! Count X,60
//! Count Y,36
//! VALUE,MASK
//! 123.4,1
//! 0,0
//! ...
//! ```
//!
//! Municipal budget files drop the descriptive metadata and the mask column.
//! Files are written as UTF-16 with a byte order mark.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::debug;

use super::encoding::{self, TextEncoding};
use crate::category::CategoryTable;
use crate::config::{ExportConfig, OutputMode};
use crate::error::{ExportError, Result};
use crate::model::{Extent, Raster};

const PLACEHOLDERS: &[&str] = &["Insert Source", "Insert Citation", "Insert Link"];

fn non_placeholder(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && !PLACEHOLDERS.contains(v))
        .map(str::to_string)
}

/// Header contents shared by every patch of one export.
#[derive(Debug, Clone, PartialEq)]
pub struct GridMetadata {
    pub layer_name: String,
    pub source: Option<String>,
    pub citation: Option<String>,
    pub mandatory_citation: bool,
    pub link: Option<String>,
    pub units: Option<String>,
    /// Written as the CATEGORIES section when present.
    pub categories: Option<CategoryTable>,
    pub municipal: bool,
    /// Decimal digits of the bounds.
    pub precision: usize,
}

impl GridMetadata {
    pub fn from_config(config: &ExportConfig, categories: Option<&CategoryTable>, is_point: bool) -> Self {
        let units = (categories.is_none() && config.units.is_set()).then(|| config.units.label.trim().to_string());
        Self {
            layer_name: config.name.clone(),
            source: non_placeholder(&config.source),
            citation: non_placeholder(&config.citation),
            mandatory_citation: config.mandatory_citation,
            link: non_placeholder(&config.link),
            units,
            categories: categories.filter(|_| !is_point).cloned(),
            municipal: config.mode == OutputMode::MunicipalBudget,
            precision: config.resolution.coordinate_precision(),
        }
    }
}

fn round_to(value: f64, digits: usize) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

pub struct GridFileWriter {
    encoding: TextEncoding,
}

impl Default for GridFileWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn push_line(out: &mut String, line: String) {
    out.push_str(&line);
    out.push('\n');
}

impl GridFileWriter {
    pub fn new() -> Self {
        Self {
            encoding: TextEncoding::Utf16Le { bom: true },
        }
    }

    pub fn with_encoding(encoding: TextEncoding) -> Self {
        Self { encoding }
    }

    fn render_header(&self, out: &mut String, extent: &Extent, cols: usize, rows: usize, meta: &GridMetadata, columns: &str) {
        if meta.municipal {
            out.push_str("METADATA,FALSE\n");
        } else {
            out.push_str("METADATA,TRUE\n");
            push_line(out, format!("Layer Name,{}", meta.layer_name));
            if let Some(source) = &meta.source {
                push_line(out, format!("Source,{}", source));
            }
            if let Some(citation) = &meta.citation {
                let key = if meta.mandatory_citation { "MandatoryCitation" } else { "Citation" };
                push_line(out, format!("{},\"{}\"", key, citation));
            }
            if let Some(link) = &meta.link {
                push_line(out, format!("Link,{}", link));
            }
            out.push_str("Colouring,Multi\n");
        }

        match &meta.categories {
            Some(table) => {
                out.push_str("CATEGORIES,TRUE\n");
                for (name, id) in table.entries() {
                    push_line(out, format!("{},{}", name, id));
                }
            }
            None => out.push_str("CATEGORIES,FALSE\n"),
        }
        if let Some(units) = &meta.units {
            push_line(out, format!("Units,{}", units));
        }

        let p = meta.precision;
        push_line(out, format!("West,{}", round_to(extent.west, p)));
        push_line(out, format!("North,{}", round_to(extent.north, p)));
        push_line(out, format!("East,{}", round_to(extent.east, p)));
        push_line(out, format!("South,{}", round_to(extent.south, p)));
        push_line(out, format!("Count X,{}", cols));
        push_line(out, format!("Count Y,{}", rows));
        out.push_str(columns);
        out.push('\n');
    }

    /// Renders one patch. `extent` is the patch extent, the counts come from the raster.
    pub fn render(&self, raster: &Raster, extent: &Extent, meta: &GridMetadata) -> String {
        let mut out = String::with_capacity(256 + raster.values.len() * 8);
        self.render_header(&mut out, extent, raster.cols, raster.rows, meta, "VALUE,MASK");

        for &value in &raster.values {
            if meta.municipal {
                // 無効セルと0は-1
                let id = if value.is_nan() { 0 } else { value as i64 };
                push_line(&mut out, format!("{}", if id == 0 { -1 } else { id }));
            } else if value.is_nan() {
                out.push_str("0,0\n");
            } else {
                push_line(&mut out, format!("{},1", value));
            }
        }
        out
    }

    /// Renders per-category layers of equal shape, one VALUE column each and no mask.
    pub fn render_multi(&self, layers: &[Raster], extent: &Extent, meta: &GridMetadata) -> Result<String> {
        let first = layers
            .first()
            .ok_or_else(|| ExportError::Format("multi grid needs at least one layer".to_string()))?;
        if layers.iter().any(|layer| layer.shape() != first.shape()) {
            return Err(ExportError::Format("multi grid layers differ in shape".to_string()));
        }

        let columns = vec!["VALUE"; layers.len()].join(",");
        let mut out = String::with_capacity(256 + first.values.len() * 4 * layers.len());
        self.render_header(&mut out, extent, first.cols, first.rows, meta, &columns);

        for i in 0..first.values.len() {
            let row = layers
                .iter()
                .map(|layer| {
                    let value = layer.values[i];
                    if value.is_nan() { "0".to_string() } else { format!("{}", value) }
                })
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&row);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn write(&self, path: &Path, raster: &Raster, extent: &Extent, meta: &GridMetadata) -> Result<()> {
        self.save(path, &self.render(raster, extent, meta))
    }

    pub fn write_multi(&self, path: &Path, layers: &[Raster], extent: &Extent, meta: &GridMetadata) -> Result<()> {
        let text = self.render_multi(layers, extent, meta)?;
        self.save(path, &text)
    }

    fn save(&self, path: &Path, text: &str) -> Result<()> {
        fs::write(path, encoding::encode(text, self.encoding)).map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => {
                ExportError::Resource(format!("output file is locked: {}", path.display()))
            }
            _ => ExportError::Io(e),
        })?;
        debug!("Wrote {}", path.display());
        Ok(())
    }
}

/// Header of a grid file read back from disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridHeader {
    pub metadata: bool,
    pub layer_name: Option<String>,
    pub source: Option<String>,
    pub citation: Option<String>,
    pub units: Option<String>,
    pub categories: Vec<(String, u32)>,
    pub west: f64,
    pub north: f64,
    pub east: f64,
    pub south: f64,
    pub count_x: usize,
    pub count_y: usize,
    pub columns: Vec<String>,
    /// Line index of the first body row.
    pub body_start: usize,
}

const HEADER_KEYS: &[&str] = &[
    "METADATA",
    "Layer Name",
    "Source",
    "Citation",
    "MandatoryCitation",
    "Link",
    "Colouring",
    "CATEGORIES",
    "Units",
    "West",
    "North",
    "East",
    "South",
    "Count X",
    "Count Y",
    "VALUE",
];

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ExportError::Format(format!("invalid {} value: {:?}", key, value)))
}

impl GridHeader {
    pub fn parse(text: &str) -> Result<Self> {
        let mut header = GridHeader::default();
        let mut seen = [false; 6];
        let mut in_categories = false;

        for (i, line) in text.lines().enumerate() {
            let (key, value) = line.split_once(',').unwrap_or((line, ""));
            let key = key.trim();
            let known = HEADER_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key));

            if in_categories && !known {
                let (name, id) = line
                    .rsplit_once(',')
                    .ok_or_else(|| ExportError::Format(format!("invalid category line: {:?}", line)))?;
                header.categories.push((name.to_string(), parse_number("category id", id)?));
                continue;
            }
            in_categories = false;

            match key.to_ascii_lowercase().as_str() {
                "metadata" => header.metadata = value.trim().eq_ignore_ascii_case("TRUE"),
                "layer name" => header.layer_name = Some(value.to_string()),
                "source" => header.source = Some(value.to_string()),
                "citation" | "mandatorycitation" => header.citation = Some(value.trim_matches('"').to_string()),
                "categories" => in_categories = value.trim().eq_ignore_ascii_case("TRUE"),
                "units" => header.units = Some(value.to_string()),
                "west" => (header.west, seen[0]) = (parse_number(key, value)?, true),
                "north" => (header.north, seen[1]) = (parse_number(key, value)?, true),
                "east" => (header.east, seen[2]) = (parse_number(key, value)?, true),
                "south" => (header.south, seen[3]) = (parse_number(key, value)?, true),
                "count x" => (header.count_x, seen[4]) = (parse_number(key, value)?, true),
                "count y" => (header.count_y, seen[5]) = (parse_number(key, value)?, true),
                "value" => {
                    if seen.iter().any(|s| !s) {
                        return Err(ExportError::Format("grid header is missing bounds or counts".to_string()));
                    }
                    header.columns = line.split(',').map(|c| c.trim().to_string()).collect();
                    header.body_start = i + 1;
                    return Ok(header);
                }
                _ => {}
            }
        }
        Err(ExportError::Format("grid header has no VALUE line".to_string()))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let (text, _) = encoding::read_text(path)?;
        Self::parse(&text)
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.west, self.south, self.east, self.north)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionProfile;
    use crate::model::GeoTransform;
    use crate::units::Units;
    use tempfile::TempDir;

    fn metadata() -> GridMetadata {
        GridMetadata {
            layer_name: "Elevation".to_string(),
            source: Some("SRTM".to_string()),
            citation: Some("NASA, 2000".to_string()),
            mandatory_citation: true,
            link: None,
            units: Some("AMSL".to_string()),
            categories: None,
            municipal: false,
            precision: 3,
        }
    }

    #[test]
    fn test_render_uniform_raster() {
        let raster = Raster::filled(4, 4, GeoTransform::north_up(100.0, 4.0, 1.0), 10.0);
        let text = GridFileWriter::new().render(&raster, &raster.extent(), &metadata());
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            &lines[..13],
            &[
                "METADATA,TRUE",
                "Layer Name,Elevation",
                "Source,SRTM",
                "MandatoryCitation,\"NASA, 2000\"",
                "Colouring,Multi",
                "CATEGORIES,FALSE",
                "Units,AMSL",
                "West,100",
                "North,4",
                "East,104",
                "South,0",
                "Count X,4",
                "Count Y,4",
            ]
        );
        assert_eq!(lines[13], "VALUE,MASK");
        assert_eq!(lines.len(), 14 + 16);
        assert!(lines[14..].iter().all(|l| *l == "10,1"));
    }

    #[test]
    fn test_invalid_cells_are_zero_with_mask() {
        let raster = Raster::new(2, 1, GeoTransform::north_up(0.0, 1.0, 1.0), vec![f64::NAN, 2.5]).unwrap();
        let text = GridFileWriter::new().render(&raster, &raster.extent(), &metadata());
        let body: Vec<_> = text.lines().skip_while(|l| *l != "VALUE,MASK").skip(1).collect();
        assert_eq!(body, vec!["0,0", "2.5,1"]);
    }

    #[test]
    fn test_municipal_budget_body() {
        let mut meta = metadata();
        meta.municipal = true;
        let raster = Raster::new(3, 1, GeoTransform::north_up(0.0, 1.0, 1.0), vec![f64::NAN, 0.0, 7.0]).unwrap();
        let text = GridFileWriter::new().render(&raster, &raster.extent(), &meta);
        assert!(text.starts_with("METADATA,FALSE\nCATEGORIES,FALSE\n"));
        assert!(!text.contains("Layer Name"));
        let body: Vec<_> = text.lines().skip_while(|l| *l != "VALUE,MASK").skip(1).collect();
        assert_eq!(body, vec!["-1", "-1", "7"]);
    }

    #[test]
    fn test_categories_section() {
        let mut meta = metadata();
        meta.units = None;
        meta.categories = Some(CategoryTable::from_values(["water", "forest"]));
        let raster = Raster::filled(1, 1, GeoTransform::north_up(0.0, 1.0, 1.0), 1.0);
        let text = GridFileWriter::new().render(&raster, &raster.extent(), &meta);
        assert!(text.contains("CATEGORIES,TRUE\nforest,1\nwater,2\nWest,"));

        let header = GridHeader::parse(&text).unwrap();
        assert_eq!(header.categories, vec![("forest".to_string(), 1), ("water".to_string(), 2)]);
    }

    #[test]
    fn test_header_round_trip_within_precision() {
        let transform = GeoTransform::north_up(104.123456, -2.654321, 0.5 / 60.0);
        let raster = Raster::filled(7, 5, transform, 1.0);
        let extent = raster.extent();
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("patch_grid.csv");

        GridFileWriter::new().write(&path, &raster, &extent, &metadata()).unwrap();
        let header = GridHeader::read(&path).unwrap();

        assert!(header.metadata);
        assert_eq!(header.count_x, 7);
        assert_eq!(header.count_y, 5);
        assert_eq!(header.citation.as_deref(), Some("NASA, 2000"));
        let tolerance = 0.5e-3 + 1e-12;
        assert!((header.west - extent.west).abs() <= tolerance);
        assert!((header.north - extent.north).abs() <= tolerance);
        assert!((header.east - extent.east).abs() <= tolerance);
        assert!((header.south - extent.south).abs() <= tolerance);
        assert_eq!(header.columns, vec!["VALUE", "MASK"]);

        let (text, encoding) = encoding::read_text(&path).unwrap();
        assert_eq!(encoding, TextEncoding::Utf16Le { bom: true });
        assert_eq!(text.lines().count(), header.body_start + 35);
    }

    #[test]
    fn test_multi_grid() {
        let transform = GeoTransform::north_up(0.0, 1.0, 1.0);
        let a = Raster::new(2, 1, transform, vec![1.0, 0.0]).unwrap();
        let b = Raster::new(2, 1, transform, vec![3.0, f64::NAN]).unwrap();
        let mut meta = metadata();
        meta.units = None;
        meta.categories = Some(CategoryTable::from_values(["bus", "train"]));

        let text = GridFileWriter::new().render_multi(&[a, b], &Extent::new(0.0, 0.0, 2.0, 1.0), &meta).unwrap();
        let body: Vec<_> = text.lines().skip_while(|l| *l != "VALUE,VALUE").skip(1).collect();
        assert_eq!(body, vec!["1,3", "0,0"]);
    }

    #[test]
    fn test_metadata_from_config_skips_placeholders() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = ExportConfig::new(temp_dir.path(), "Density", "Palembang", ResolutionProfile::tier(1).unwrap());
        config.source = Some("Insert Source".to_string());
        config.link = Some("https://example.org".to_string());
        config.units = Units::predefined(4);

        let meta = GridMetadata::from_config(&config, None, false);
        assert_eq!(meta.source, None);
        assert_eq!(meta.link.as_deref(), Some("https://example.org"));
        assert_eq!(meta.units.as_deref(), Some("population/SqKm2"));
        assert_eq!(meta.precision, 3);

        let categories = CategoryTable::from_values(["a"]);
        let meta = GridMetadata::from_config(&config, Some(&categories), true);
        assert!(meta.categories.is_none());
        assert!(meta.units.is_none());
    }

    #[test]
    fn test_missing_bounds_is_format_error() {
        let result = GridHeader::parse("METADATA,TRUE\nCount X,1\nVALUE,MASK\n");
        assert!(matches!(result, Err(ExportError::Format(_))));
    }
}
