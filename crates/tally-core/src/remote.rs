//! Records as the remote platform's paginated API yields them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A contact field definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteField {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub value_type: String,
}

/// Reference to another remote object by id and display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectRef {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryRef {
    #[serde(alias = "id")]
    pub osm_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    pub coordinates: JsonValue,
}

impl Geometry {
    pub fn to_json(&self) -> JsonValue {
        serde_json::json!({ "type": self.kind, "coordinates": self.coordinates })
    }
}

/// An administrative boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBoundary {
    #[serde(alias = "id")]
    pub osm_id: String,
    pub name: String,
    #[serde(default)]
    pub level: i32,
    #[serde(default, deserialize_with = "deserialize_parent")]
    pub parent: Option<BoundaryRef>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

impl RemoteBoundary {
    /// Geometry as stored locally; an empty object when the remote has none.
    pub fn geometry_json(&self) -> JsonValue {
        self.geometry
            .as_ref()
            .map(Geometry::to_json)
            .unwrap_or_else(|| JsonValue::Object(Default::default()))
    }
}

/// Parents arrive either as `{"osm_id": ..}` objects or as bare id strings.
fn deserialize_parent<'de, D>(deserializer: D) -> Result<Option<BoundaryRef>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ParentRepr {
        Ref(BoundaryRef),
        Id(String),
    }

    Ok(match Option::<ParentRepr>::deserialize(deserializer)? {
        Some(ParentRepr::Ref(r)) => Some(r),
        Some(ParentRepr::Id(osm_id)) => Some(BoundaryRef { osm_id, name: None }),
        None => None,
    })
}

/// A contact as reported by the changed-since or deleted-since queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteContact {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub urns: Vec<String>,
    #[serde(default)]
    pub groups: Vec<ObjectRef>,
    #[serde(default)]
    pub fields: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub created_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_on: Option<DateTime<Utc>>,
}

impl RemoteContact {
    /// Value of a contact field as text; numbers are rendered, nulls and
    /// empty strings are absent.
    pub fn field_text(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn in_group(&self, group_name: &str) -> bool {
        self.groups
            .iter()
            .any(|g| g.name.eq_ignore_ascii_case(group_name))
    }

    /// URN scheme of the first URN, e.g. `tel` for `tel:+250788123123`.
    pub fn scheme(&self) -> Option<String> {
        self.urns
            .first()
            .and_then(|urn| urn.split_once(':'))
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .filter(|scheme| !scheme.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRef {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRef {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// One recorded answer step in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunValue {
    pub node: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

/// A respondent's pass through a survey flow. The visited `path` in the
/// payload is not kept: only `values` steps carry categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRun {
    pub id: i64,
    pub flow: FlowRef,
    pub contact: ContactRef,
    #[serde(default)]
    pub values: BTreeMap<String, RunValue>,
    #[serde(default)]
    pub exit_type: Option<String>,
    pub modified_on: DateTime<Utc>,
}

impl RemoteRun {
    pub fn completed(&self) -> bool {
        self.exit_type.as_deref() == Some("completed")
    }

    /// Answer steps ordered by time; steps without a time sort first.
    pub fn ordered_values(&self) -> Vec<&RunValue> {
        let mut values: Vec<_> = self.values.values().collect();
        values.sort_by_key(|v| v.time);
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_accepts_short_ids_and_bare_parents() {
        let boundary: RemoteBoundary =
            serde_json::from_str(r#"{"id":"R2","name":"South","parent":"R1","level":1}"#).unwrap();
        assert_eq!(boundary.osm_id, "R2");
        assert_eq!(boundary.parent.unwrap().osm_id, "R1");
        assert!(boundary.geometry.is_none());

        let boundary: RemoteBoundary = serde_json::from_str(
            r#"{"osm_id":"R3","name":"East","parent":{"osm_id":"R1","name":"North"},"level":1,
                "geometry":{"type":"MultiPolygon","coordinates":[[[1,2]]]}}"#,
        )
        .unwrap();
        assert_eq!(boundary.parent.as_ref().unwrap().name.as_deref(), Some("North"));
        assert_eq!(boundary.geometry_json()["type"], "MultiPolygon");
    }

    #[test]
    fn contact_field_text_renders_numbers_and_skips_blanks() {
        let contact: RemoteContact = serde_json::from_str(
            r#"{"uuid":"C1","urns":["tel:+250788"],"groups":[{"uuid":"G1","name":"Reporters"}],
                "fields":{"born":1990,"state":"","gender":"Female","ward":null}}"#,
        )
        .unwrap();
        assert_eq!(contact.field_text("born").as_deref(), Some("1990"));
        assert_eq!(contact.field_text("state"), None);
        assert_eq!(contact.field_text("ward"), None);
        assert_eq!(contact.field_text("gender").as_deref(), Some("Female"));
        assert!(contact.in_group("reporters"));
        assert_eq!(contact.scheme().as_deref(), Some("tel"));
    }

    #[test]
    fn run_values_are_ordered_by_time() {
        let run: RemoteRun = serde_json::from_str(
            r#"{"id":1,"flow":{"uuid":"F1"},"contact":{"uuid":"C1"},
                "path":[{"node":"menu","time":"2024-01-01T00:00:00Z"}],
                "values":{
                  "b":{"node":"Q2","category":"Yes","time":"2024-01-02T00:00:00Z"},
                  "a":{"node":"Q1","category":"No","time":"2024-01-01T00:00:00Z"}},
                "exit_type":"completed","modified_on":"2024-01-02T00:00:00Z"}"#,
        )
        .unwrap();
        let nodes: Vec<_> = run.ordered_values().iter().map(|v| v.node.as_str()).collect();
        assert_eq!(nodes, vec!["Q1", "Q2"]);
        assert!(run.completed());
    }
}
