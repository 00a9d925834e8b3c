use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::path::Path;
use urscape_export::geo;
use urscape_export::reader::describe_layer;
use urscape_export::{
    aggregate, compute_patches, AggregationOptions, ExportConfig, ExportError, Exporter, Extent, GdalGeoprocessor,
    GeoTransform, GridHeader, Layer, LayerKind, NoDataPolicy, Raster, ResolutionProfile,
};

#[pymodule]
#[pyo3(name = "urscape_export")]
fn urscape_export_py(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyPatch>()?;
    m.add_class::<PyGrid>()?;
    m.add_class::<PyGridHeader>()?;
    m.add_function(wrap_pyfunction!(latitude_to_mercator_y, m)?)?;
    m.add_function(wrap_pyfunction!(area_in_sq_km, m)?)?;
    m.add_function(wrap_pyfunction!(patches, m)?)?;
    m.add_function(wrap_pyfunction!(aggregate_grid, m)?)?;
    m.add_function(wrap_pyfunction!(read_grid_header, m)?)?;
    m.add_function(wrap_pyfunction!(export_raster, m)?)?;
    Ok(())
}

fn to_py_err(error: ExportError) -> PyErr {
    match error {
        ExportError::Config(message) => PyErr::new::<PyValueError, _>(message),
        ExportError::Io(e) => PyErr::new::<PyIOError, _>(e.to_string()),
        other => PyErr::new::<PyRuntimeError, _>(other.to_string()),
    }
}

#[pyclass(name = "Patch")]
#[derive(Clone)]
pub struct PyPatch {
    #[pyo3(get)]
    pub index: usize,
    #[pyo3(get)]
    pub west: f64,
    #[pyo3(get)]
    pub south: f64,
    #[pyo3(get)]
    pub east: f64,
    #[pyo3(get)]
    pub north: f64,
}

#[pymethods]
impl PyPatch {
    fn __repr__(&self) -> String {
        format!(
            "Patch(index={}, west={}, south={}, east={}, north={})",
            self.index, self.west, self.south, self.east, self.north
        )
    }
}

/// 北が上のグリッド（行優先、NaNはno-data）
#[pyclass(name = "Grid")]
#[derive(Clone)]
pub struct PyGrid {
    #[pyo3(get)]
    pub cols: usize,
    #[pyo3(get)]
    pub rows: usize,
    #[pyo3(get)]
    pub west: f64,
    #[pyo3(get)]
    pub north: f64,
    #[pyo3(get)]
    pub cell_size: f64,
    #[pyo3(get)]
    pub values: Vec<f64>,
}

impl From<Raster> for PyGrid {
    fn from(raster: Raster) -> Self {
        PyGrid {
            cols: raster.cols,
            rows: raster.rows,
            west: raster.transform.origin_x,
            north: raster.transform.origin_y,
            cell_size: raster.transform.cell_width,
            values: raster.values,
        }
    }
}

#[pymethods]
impl PyGrid {
    #[new]
    fn new(cols: usize, rows: usize, west: f64, north: f64, cell_size: f64, values: Vec<f64>) -> PyResult<Self> {
        let raster = Raster::new(cols, rows, GeoTransform::north_up(west, north, cell_size), values).map_err(to_py_err)?;
        Ok(PyGrid::from(raster))
    }

    #[getter]
    fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn __repr__(&self) -> String {
        format!(
            "Grid(rows={}, cols={}, origin=({}, {}), cell_size={})",
            self.rows, self.cols, self.west, self.north, self.cell_size
        )
    }
}

#[pyclass(name = "GridHeader")]
#[derive(Clone)]
pub struct PyGridHeader {
    #[pyo3(get)]
    pub layer_name: Option<String>,
    #[pyo3(get)]
    pub units: Option<String>,
    #[pyo3(get)]
    pub categories: Vec<(String, u32)>,
    #[pyo3(get)]
    pub bounds: (f64, f64, f64, f64),
    #[pyo3(get)]
    pub count: (usize, usize),
}

impl From<GridHeader> for PyGridHeader {
    fn from(header: GridHeader) -> Self {
        PyGridHeader {
            layer_name: header.layer_name,
            units: header.units,
            categories: header.categories,
            bounds: (header.west, header.south, header.east, header.north),
            count: (header.count_x, header.count_y),
        }
    }
}

#[pymethods]
impl PyGridHeader {
    fn __repr__(&self) -> String {
        format!(
            "GridHeader(layer_name={:?}, bounds={:?}, count={:?})",
            self.layer_name, self.bounds, self.count
        )
    }
}

#[pyfunction]
pub fn latitude_to_mercator_y(lat: f64) -> f64 {
    geo::latitude_to_mercator_y(lat)
}

#[pyfunction]
pub fn area_in_sq_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    geo::area_in_sq_km(lat1, lon1, lat2, lon2)
}

/// 範囲をパッチに分割する
#[pyfunction]
#[pyo3(signature = (west, south, east, north, max_patch_size, cell_size, is_world_tier=false))]
pub fn patches(
    west: f64,
    south: f64,
    east: f64,
    north: f64,
    max_patch_size: f64,
    cell_size: f64,
    is_world_tier: bool,
) -> Vec<PyPatch> {
    compute_patches(&Extent::new(west, south, east, north), max_patch_size, cell_size, is_world_tier)
        .into_iter()
        .map(|patch| PyPatch {
            index: patch.index,
            west: patch.extent.west,
            south: patch.extent.south,
            east: patch.extent.east,
            north: patch.extent.north,
        })
        .collect()
}

/// 面積で重み付けして粗いセルに集約する
#[pyfunction]
#[pyo3(signature = (grid, target_cell_size, relative=false, summary=false, multiplier=1.0, ignore_no_data=false))]
pub fn aggregate_grid(
    grid: &PyGrid,
    target_cell_size: f64,
    relative: bool,
    summary: bool,
    multiplier: f64,
    ignore_no_data: bool,
) -> PyResult<PyGrid> {
    let raster = Raster::new(
        grid.cols,
        grid.rows,
        GeoTransform::north_up(grid.west, grid.north, grid.cell_size),
        grid.values.clone(),
    )
    .map_err(to_py_err)?;
    let options = AggregationOptions {
        relative,
        summary,
        multiplier,
        policy: if ignore_no_data {
            NoDataPolicy::Ignore
        } else {
            NoDataPolicy::Propagate
        },
    };
    let result = aggregate(&raster, target_cell_size, &options).map_err(to_py_err)?;
    Ok(PyGrid::from(result))
}

#[pyfunction]
pub fn read_grid_header(path: &str) -> PyResult<PyGridHeader> {
    let header = GridHeader::read(Path::new(path)).map_err(to_py_err)?;
    Ok(PyGridHeader::from(header))
}

/// ラスターをパッチグリッドとして出力し、書き出したファイルを返す
#[pyfunction]
#[pyo3(signature = (input, output_root, name, location, resolution=3, date=String::new()))]
pub fn export_raster(
    input: &str,
    output_root: &str,
    name: &str,
    location: &str,
    resolution: usize,
    date: String,
) -> PyResult<Vec<String>> {
    let profile = ResolutionProfile::tier(resolution).map_err(to_py_err)?;
    let mut config = ExportConfig::new(output_root, name, location, profile);
    config.date = date;

    let (extent, crs) = describe_layer(Path::new(input), LayerKind::Raster)
        .map_err(|e| PyErr::new::<PyIOError, _>(format!("Failed to open raster: {:#}", e)))?;
    let mut layer = Layer::new(name, LayerKind::Raster, input, extent);
    if let Some(crs) = crs {
        layer = layer.with_crs(crs);
    }

    let engine = GdalGeoprocessor::new().map_err(to_py_err)?;
    let summary = Exporter::new(&config, &engine).export(&layer).map_err(to_py_err)?;
    Ok(summary
        .files
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect())
}
