//! Country boundaries for global organizations, read from a GeoJSON
//! `FeatureCollection` whose features carry `NAME` and `ISO_A2` properties.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tally_core::remote::{Geometry, RemoteBoundary};
use tally_core::Boundary;

use crate::RemoteFetchError;

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    properties: CountryProperties,
    #[serde(default)]
    geometry: Option<Geometry>,
}

#[derive(Debug, Deserialize)]
struct CountryProperties {
    #[serde(rename = "NAME")]
    name: String,
    #[serde(rename = "ISO_A2")]
    iso_a2: String,
}

/// Parses a countries FeatureCollection into country-level boundaries.
pub fn parse_country_boundaries(raw: &str) -> Result<Vec<RemoteBoundary>, serde_json::Error> {
    let collection: FeatureCollection = serde_json::from_str(raw)?;
    Ok(collection
        .features
        .into_iter()
        .map(|feature| RemoteBoundary {
            osm_id: feature.properties.iso_a2,
            name: feature.properties.name,
            level: Boundary::COUNTRY_LEVEL,
            parent: None,
            aliases: Vec::new(),
            geometry: feature.geometry,
        })
        .collect())
}

pub fn load_country_boundaries(path: impl AsRef<Path>) -> Result<Vec<RemoteBoundary>, RemoteFetchError> {
    let path = path.as_ref();
    let error = |detail: String| RemoteFetchError::Fixture {
        path: path.display().to_string(),
        detail,
    };
    let raw = std::fs::read_to_string(path).map_err(|err| error(err.to_string()))?;
    parse_country_boundaries(&raw).map_err(|err| error(err.to_string()))
}

/// A stored boundary as a GeoJSON `Feature`.
pub fn boundary_feature(boundary: &Boundary) -> JsonValue {
    serde_json::json!({
        "type": "Feature",
        "geometry": boundary.geometry,
        "properties": {
            "id": boundary.osm_id,
            "level": boundary.level,
            "name": boundary.name,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::OrgId;

    #[test]
    fn countries_become_level_zero_boundaries() {
        let raw = r#"{"type":"FeatureCollection","features":[
            {"type":"Feature","properties":{"NAME":"Rwanda","ISO_A2":"RW"},
             "geometry":{"type":"Polygon","coordinates":[[[30.0,-2.0],[30.5,-2.0],[30.0,-2.0]]]}},
            {"type":"Feature","properties":{"NAME":"Uganda","ISO_A2":"UG"}}
        ]}"#;
        let boundaries = parse_country_boundaries(raw).unwrap();
        assert_eq!(boundaries.len(), 2);
        assert_eq!(boundaries[0].osm_id, "RW");
        assert_eq!(boundaries[0].level, 0);
        assert_eq!(boundaries[0].geometry_json()["type"], "Polygon");
        assert!(boundaries[1].geometry.is_none());
    }

    #[test]
    fn missing_file_is_a_fixture_error() {
        let err = load_country_boundaries("/nonexistent/countries.json").unwrap_err();
        assert!(matches!(err, RemoteFetchError::Fixture { .. }));
    }

    #[test]
    fn boundaries_render_as_features() {
        let boundary = Boundary {
            org_id: OrgId(1),
            osm_id: "R1".into(),
            name: "Kigali".into(),
            level: 1,
            parent_osm_id: None,
            geometry: serde_json::json!({"type":"Point","coordinates":[30.0,-1.9]}),
            is_active: true,
        };
        let feature = boundary_feature(&boundary);
        assert_eq!(feature["properties"]["id"], "R1");
        assert_eq!(feature["geometry"]["type"], "Point");
    }
}
