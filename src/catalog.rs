//! Fixed tables describing what the Overture release exposes.
//!
//! Every category maps onto exactly one theme. The tables are static and
//! ordered; the first entry of each list is the form default.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Release tag the form is pre-filled with.
pub const DEFAULT_RELEASE: &str = "2024-05-16-beta.0";

/// Bucket path the downloader reads from, shown to the user as provenance.
pub const SOURCE_BUCKET: &str = "overturemaps-us-west-2";

/// Feature type inside an Overture release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Locality,
    LocalityArea,
    AdministrativeBoundary,
    Building,
    BuildingPart,
    Division,
    DivisionArea,
    Place,
    Segment,
    Connector,
    Infrastructure,
    Land,
    LandUse,
    Water,
}

impl Category {
    pub const ALL: [Category; 14] = [
        Category::Locality,
        Category::LocalityArea,
        Category::AdministrativeBoundary,
        Category::Building,
        Category::BuildingPart,
        Category::Division,
        Category::DivisionArea,
        Category::Place,
        Category::Segment,
        Category::Connector,
        Category::Infrastructure,
        Category::Land,
        Category::LandUse,
        Category::Water,
    ];

    /// Identifier as the downloader and the release layout spell it.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Locality => "locality",
            Self::LocalityArea => "locality_area",
            Self::AdministrativeBoundary => "administrative_boundary",
            Self::Building => "building",
            Self::BuildingPart => "building_part",
            Self::Division => "division",
            Self::DivisionArea => "division_area",
            Self::Place => "place",
            Self::Segment => "segment",
            Self::Connector => "connector",
            Self::Infrastructure => "infrastructure",
            Self::Land => "land",
            Self::LandUse => "land_use",
            Self::Water => "water",
        }
    }

    /// Theme the category is published under.
    pub const fn theme(&self) -> &'static str {
        match self {
            Self::Locality | Self::LocalityArea | Self::AdministrativeBoundary => "admins",
            Self::Building | Self::BuildingPart => "buildings",
            Self::Division | Self::DivisionArea => "divisions",
            Self::Place => "places",
            Self::Segment | Self::Connector => "transportation",
            Self::Infrastructure | Self::Land | Self::LandUse | Self::Water => "base",
        }
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::ALL[0]
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for Category {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "category",
                value: s.to_string(),
            })
    }
}

/// Output format offered by the downloader.
///
/// `geoparquet` is the canonical spelling; `parquet` is accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Geojson,
    Geojsonseq,
    #[serde(alias = "parquet")]
    Geoparquet,
}

impl FileFormat {
    pub const ALL: [FileFormat; 3] = [FileFormat::Geojson, FileFormat::Geojsonseq, FileFormat::Geoparquet];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Geojson => "geojson",
            Self::Geojsonseq => "geojsonseq",
            Self::Geoparquet => "geoparquet",
        }
    }

    /// Content type the finished artifact is served with.
    pub fn mime(&self) -> String {
        format!("application/{}", self.as_str())
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileFormat {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "geojson" => Ok(Self::Geojson),
            "geojsonseq" => Ok(Self::Geojsonseq),
            "geoparquet" | "parquet" => Ok(Self::Geoparquet),
            _ => Err(UnknownVariant {
                kind: "file format",
                value: s.to_string(),
            }),
        }
    }
}

/// Release path the downloader pulls from, e.g.
/// `overturemaps-us-west-2/release/2024-05-16-beta.0/theme=buildings/type=building/`.
pub fn source_url(version: &str, theme: &str, kind: &str) -> String {
    format!("{SOURCE_BUCKET}/release/{version}/theme={theme}/type={kind}/")
}

/// Serializable view of the tables, handed to the form on load.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogView {
    pub categories: Vec<CategoryEntry>,
    pub file_formats: Vec<&'static str>,
    pub default_release: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryEntry {
    pub id: &'static str,
    pub theme: &'static str,
}

impl CatalogView {
    pub fn new(default_release: impl Into<String>) -> Self {
        Self {
            categories: Category::ALL
                .iter()
                .map(|c| CategoryEntry {
                    id: c.as_str(),
                    theme: c.theme(),
                })
                .collect(),
            file_formats: FileFormat::ALL.iter().map(FileFormat::as_str).collect(),
            default_release: default_release.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_theme_table() {
        let expected = [
            ("locality", "admins"),
            ("locality_area", "admins"),
            ("administrative_boundary", "admins"),
            ("building", "buildings"),
            ("building_part", "buildings"),
            ("division", "divisions"),
            ("division_area", "divisions"),
            ("place", "places"),
            ("segment", "transportation"),
            ("connector", "transportation"),
            ("infrastructure", "base"),
            ("land", "base"),
            ("land_use", "base"),
            ("water", "base"),
        ];
        assert_eq!(Category::ALL.len(), expected.len());
        for (category, (id, theme)) in Category::ALL.iter().zip(expected) {
            assert_eq!(category.as_str(), id);
            assert_eq!(category.theme(), theme);
        }
    }

    #[test]
    fn test_category_round_trips_through_str() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>(), Ok(category));
        }
        assert!("buildings".parse::<Category>().is_err());
    }

    #[test]
    fn test_category_serde_matches_identifier() {
        let json = serde_json::to_string(&Category::AdministrativeBoundary).unwrap();
        assert_eq!(json, "\"administrative_boundary\"");
    }

    #[test]
    fn test_defaults_are_first_entries() {
        assert_eq!(Category::default(), Category::Locality);
        assert_eq!(FileFormat::default(), FileFormat::Geojson);
    }

    #[test]
    fn test_parquet_alias() {
        assert_eq!("parquet".parse::<FileFormat>(), Ok(FileFormat::Geoparquet));
        let parsed: FileFormat = serde_json::from_str("\"parquet\"").unwrap();
        assert_eq!(parsed, FileFormat::Geoparquet);
        assert_eq!(parsed.as_str(), "geoparquet");
    }

    #[test]
    fn test_mime() {
        assert_eq!(FileFormat::Geojsonseq.mime(), "application/geojsonseq");
    }

    #[test]
    fn test_source_url() {
        assert_eq!(
            source_url("2024-05-16-beta.0", "buildings", "building"),
            "overturemaps-us-west-2/release/2024-05-16-beta.0/theme=buildings/type=building/"
        );
    }

    #[test]
    fn test_catalog_view_lists_everything() {
        let view = CatalogView::new(DEFAULT_RELEASE);
        assert_eq!(view.categories.len(), 14);
        assert_eq!(view.file_formats, vec!["geojson", "geojsonseq", "geoparquet"]);
        assert_eq!(view.default_release, DEFAULT_RELEASE);
    }
}
