//! Bounding-box resolution for pasted GeoJSON and uploaded files.
//!
//! Pasted text goes through a strict JSON parser and has to look like a
//! feature collection. Uploads dispatch on extension: `.geojson` files are
//! read as GeoJSON, `.parquet` files as GeoParquet with WKB geometries.

use std::fmt;
use std::path::Path;

use bytes::Bytes;
use geo::{BoundingRect, Geometry, Rect};
use geozero::wkb::Wkb;
use geozero::ToGeo;
use parquet::file::metadata::KeyValue;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

/// Column name GeoParquet writers use when the file carries no `geo` metadata.
pub const DEFAULT_GEOMETRY_COLUMN: &str = "geometry";

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected an object with a \"features\" array")]
    MissingFeatures,
    #[error("feature {index} is not valid GeoJSON: {source}")]
    Feature {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid GeoJSON: {0}")]
    GeoJson(#[from] geojson::Error),
    #[error("invalid parquet file: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("parquet file has no \"{0}\" column")]
    MissingColumn(String),
    #[error("column \"{0}\" does not hold WKB geometries")]
    NotWkb(String),
    #[error("invalid WKB geometry: {0}")]
    Wkb(#[from] geozero::error::GeozeroError),
    #[error("Invalid file format \"{0}\". Please upload a GeoJSON or GeoParquet file.")]
    UnsupportedFormat(String),
    #[error("input contains no geometries")]
    Empty,
}

/// Axis-aligned extent in geographic coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// The `--bbox` argument: `minx,miny,maxx,maxy`.
    pub fn to_arg(&self) -> String {
        format!("{},{},{},{}", self.min_x, self.min_y, self.max_x, self.max_y)
    }

    fn union(self, rect: Rect<f64>) -> Self {
        Self {
            min_x: self.min_x.min(rect.min().x),
            min_y: self.min_y.min(rect.min().y),
            max_x: self.max_x.max(rect.max().x),
            max_y: self.max_y.max(rect.max().y),
        }
    }
}

impl From<Rect<f64>> for BoundingBox {
    fn from(rect: Rect<f64>) -> Self {
        Self {
            min_x: rect.min().x,
            min_y: rect.min().y,
            max_x: rect.max().x,
            max_y: rect.max().y,
        }
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {} {} {}]", self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

/// Total bounds of a set of geometries. Empty geometries are skipped.
pub fn total_bounds<'a>(geometries: impl IntoIterator<Item = &'a Geometry<f64>>) -> Result<BoundingBox, ResolveError> {
    geometries
        .into_iter()
        .filter_map(|g| g.bounding_rect())
        .fold(None, |acc: Option<BoundingBox>, rect| match acc {
            Some(bbox) => Some(bbox.union(rect)),
            None => Some(rect.into()),
        })
        .ok_or(ResolveError::Empty)
}

/// Resolve pasted text. The text must be a JSON object holding a `features` array.
#[instrument(skip_all, fields(len = text.len()))]
pub fn from_pasted(text: &str) -> Result<BoundingBox, ResolveError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut object) = value else {
        return Err(ResolveError::MissingFeatures);
    };
    let Some(Value::Array(features)) = object.remove("features") else {
        return Err(ResolveError::MissingFeatures);
    };

    let mut geometries = Vec::with_capacity(features.len());
    for (index, feature) in features.into_iter().enumerate() {
        let feature: geojson::Feature =
            serde_json::from_value(feature).map_err(|source| ResolveError::Feature { index, source })?;
        if let Some(geometry) = feature.geometry {
            geometries.push(Geometry::<f64>::try_from(geometry)?);
        }
    }

    debug!(geometries = geometries.len(), "parsed pasted features");
    total_bounds(&geometries)
}

/// Upload types the resolver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    GeoJson,
    GeoParquet,
}

impl UploadKind {
    pub fn from_file_name(name: &str) -> Result<Self, ResolveError> {
        let ext = Path::new(name).extension().and_then(|e| e.to_str()).unwrap_or_default();
        if ext.eq_ignore_ascii_case("geojson") {
            Ok(Self::GeoJson)
        } else if ext.eq_ignore_ascii_case("parquet") {
            Ok(Self::GeoParquet)
        } else {
            Err(ResolveError::UnsupportedFormat(name.to_string()))
        }
    }
}

/// Resolve an uploaded file by its name and raw contents.
#[instrument(skip(data), fields(size = data.len()))]
pub fn from_upload(file_name: &str, data: Bytes) -> Result<BoundingBox, ResolveError> {
    let geometries = match UploadKind::from_file_name(file_name)? {
        UploadKind::GeoJson => read_geojson(&data)?,
        UploadKind::GeoParquet => read_geoparquet(data)?,
    };
    debug!(geometries = geometries.len(), "parsed uploaded file");
    total_bounds(&geometries)
}

fn read_geojson(data: &[u8]) -> Result<Vec<Geometry<f64>>, ResolveError> {
    let geojson = geojson::GeoJson::from_reader(data)?;
    let geometries: Vec<Geometry<f64>> = match geojson {
        geojson::GeoJson::FeatureCollection(collection) => collection
            .features
            .into_iter()
            .filter_map(|f| f.geometry)
            .map(Geometry::<f64>::try_from)
            .collect::<Result<Vec<_>, _>>()?,
        geojson::GeoJson::Feature(feature) => feature
            .geometry
            .map(Geometry::<f64>::try_from)
            .transpose()?
            .into_iter()
            .collect(),
        geojson::GeoJson::Geometry(geometry) => vec![Geometry::<f64>::try_from(geometry)?],
    };
    Ok(geometries)
}

#[derive(Deserialize)]
struct GeoMetadata {
    primary_column: Option<String>,
}

/// Name of the geometry column, read from the GeoParquet `geo` key when present.
fn geometry_column(metadata: Option<&Vec<KeyValue>>) -> String {
    metadata
        .into_iter()
        .flatten()
        .find(|kv| kv.key == "geo")
        .and_then(|kv| kv.value.as_deref())
        .and_then(|json| serde_json::from_str::<GeoMetadata>(json).ok())
        .and_then(|meta| meta.primary_column)
        .unwrap_or_else(|| DEFAULT_GEOMETRY_COLUMN.to_string())
}

fn read_geoparquet(data: Bytes) -> Result<Vec<Geometry<f64>>, ResolveError> {
    let reader = SerializedFileReader::new(data)?;
    let file_metadata = reader.metadata().file_metadata();
    let column = geometry_column(file_metadata.key_value_metadata());

    if !file_metadata.schema_descr().columns().iter().any(|c| c.name() == column) {
        return Err(ResolveError::MissingColumn(column));
    }

    let mut geometries = Vec::new();
    for row in reader.get_row_iter(None)? {
        let row = row?;
        let field = row.get_column_iter().find(|(name, _)| **name == column).map(|(_, field)| field);
        match field {
            Some(Field::Bytes(wkb)) => geometries.push(Wkb(wkb.data().to_vec()).to_geo()?),
            Some(Field::Null) | None => {}
            Some(_) => return Err(ResolveError::NotWkb(column)),
        }
    }
    Ok(geometries)
}
