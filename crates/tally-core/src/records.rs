//! Locally persisted counterparts of remote records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::counters::CounterSet;
use crate::OrgId;

/// Categories that never count as a chosen answer category.
pub const IGNORED_CATEGORIES: [&str; 2] = ["other", "no response"];

/// Maximum stored length of a free-text answer, in characters.
pub const MAX_ANSWER_TEXT: usize = 2560;

/// Shared behavior of every locally persisted record.
pub trait LocalRecord: Clone + Send + Sync + 'static {
    fn org_id(&self) -> OrgId;

    /// Key matching this record to its remote counterpart.
    fn natural_key(&self) -> String;

    fn is_active(&self) -> bool {
        true
    }

    fn set_active(&mut self, _active: bool) {}

    /// Counter contributions of this record in its current state.
    fn counters(&self) -> CounterSet {
        CounterSet::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValueType {
    Text,
    Decimal,
    Datetime,
    State,
    District,
    Ward,
}

impl FieldValueType {
    /// Maps the remote platform's type name; unknown names are text.
    pub fn from_remote(value_type: &str) -> Self {
        match value_type {
            "numeric" => FieldValueType::Decimal,
            "datetime" => FieldValueType::Datetime,
            "state" => FieldValueType::State,
            "district" => FieldValueType::District,
            "ward" => FieldValueType::Ward,
            _ => FieldValueType::Text,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            FieldValueType::Text => "T",
            FieldValueType::Decimal => "N",
            FieldValueType::Datetime => "D",
            FieldValueType::State => "S",
            FieldValueType::District => "I",
            FieldValueType::Ward => "W",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "T" => FieldValueType::Text,
            "N" => FieldValueType::Decimal,
            "D" => FieldValueType::Datetime,
            "S" => FieldValueType::State,
            "I" => FieldValueType::District,
            "W" => FieldValueType::Ward,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactField {
    pub org_id: OrgId,
    pub key: String,
    pub label: String,
    pub value_type: FieldValueType,
    pub is_active: bool,
}

impl LocalRecord for ContactField {
    fn org_id(&self) -> OrgId {
        self.org_id
    }

    fn natural_key(&self) -> String {
        self.key.clone()
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boundary {
    pub org_id: OrgId,
    pub osm_id: String,
    pub name: String,
    pub level: i32,
    pub parent_osm_id: Option<String>,
    pub geometry: JsonValue,
    pub is_active: bool,
}

impl Boundary {
    pub const COUNTRY_LEVEL: i32 = 0;
    pub const STATE_LEVEL: i32 = 1;
    pub const DISTRICT_LEVEL: i32 = 2;
    pub const WARD_LEVEL: i32 = 3;
}

impl LocalRecord for Boundary {
    fn org_id(&self) -> OrgId {
        self.org_id
    }

    fn natural_key(&self) -> String {
        self.osm_id.clone()
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Female,
    Male,
}

impl Gender {
    pub fn code(self) -> &'static str {
        match self {
            Gender::Female => "F",
            Gender::Male => "M",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "F" | "f" => Some(Gender::Female),
            "M" | "m" => Some(Gender::Male),
            _ => None,
        }
    }
}

/// A respondent tracked in the organization's reporter cohort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub org_id: OrgId,
    pub uuid: String,
    pub gender: Option<Gender>,
    pub born: Option<i32>,
    pub occupation: Option<String>,
    pub registered_on: Option<DateTime<Utc>>,
    pub state: Option<String>,
    pub district: Option<String>,
    pub ward: Option<String>,
    pub scheme: Option<String>,
    pub is_active: bool,
}

impl Contact {
    /// An active contact with no demographic data.
    pub fn bare(org_id: OrgId, uuid: impl Into<String>) -> Self {
        Self {
            org_id,
            uuid: uuid.into(),
            gender: None,
            born: None,
            occupation: None,
            registered_on: None,
            state: None,
            district: None,
            ward: None,
            scheme: None,
            is_active: true,
        }
    }
}

impl LocalRecord for Contact {
    fn org_id(&self) -> OrgId {
        self.org_id
    }

    fn natural_key(&self) -> String {
        self.uuid.clone()
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }

    fn counters(&self) -> CounterSet {
        let mut set = CounterSet::new();
        if !self.is_active {
            return set;
        }
        set.incr("total-reporters");
        if let Some(gender) = self.gender {
            set.incr(format!("gender:{}", gender.code().to_ascii_lowercase()));
        }
        if let Some(born) = self.born.filter(|b| *b > 0) {
            set.incr(format!("born:{born}"));
        }
        if let Some(occupation) = non_empty(&self.occupation) {
            set.incr(format!("occupation:{}", occupation.to_ascii_lowercase()));
        }
        if let Some(registered_on) = self.registered_on {
            set.incr(format!("registered_on:{}", registered_on.format("%Y-%m-%d")));
        }
        if let Some(state) = non_empty(&self.state) {
            set.incr(format!("state:{}", state.to_ascii_uppercase()));
        }
        if let Some(district) = non_empty(&self.district) {
            set.incr(format!("district:{}", district.to_ascii_uppercase()));
        }
        if let Some(ward) = non_empty(&self.ward) {
            set.incr(format!("ward:{}", ward.to_ascii_uppercase()));
        }
        if let Some(scheme) = non_empty(&self.scheme) {
            set.incr(format!("scheme:{scheme}"));
        }
        set
    }
}

/// The single current answer of one respondent to one question of one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAnswer {
    pub org_id: OrgId,
    pub flow: String,
    pub question: String,
    pub respondent: String,
    pub category: Option<String>,
    pub text: Option<String>,
    pub answered_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub state: Option<String>,
    pub district: Option<String>,
    pub ward: Option<String>,
    pub gender: Option<Gender>,
    pub born: Option<i32>,
    pub scheme: Option<String>,
}

impl ResolvedAnswer {
    pub fn identity_key(flow: &str, question: &str, respondent: &str) -> String {
        format!("{flow}/{question}/{respondent}")
    }

    /// Copies the respondent's demographic and location snapshot.
    pub fn with_snapshot(mut self, contact: Option<&Contact>) -> Self {
        match contact {
            Some(c) => {
                self.state = c.state.clone();
                self.district = c.district.clone();
                self.ward = c.ward.clone();
                self.gender = c.gender;
                self.born = c.born;
                self.scheme = c.scheme.clone();
            }
            None => {
                self.state = None;
                self.district = None;
                self.ward = None;
                self.gender = None;
                self.born = None;
                self.scheme = None;
            }
        }
        self
    }

    fn counted_category(&self) -> Option<String> {
        let category = self.category.as_deref()?.to_ascii_lowercase();
        if category.is_empty() || IGNORED_CATEGORIES.contains(&category.as_str()) {
            None
        } else {
            Some(category)
        }
    }
}

impl LocalRecord for ResolvedAnswer {
    fn org_id(&self) -> OrgId {
        self.org_id
    }

    fn natural_key(&self) -> String {
        Self::identity_key(&self.flow, &self.question, &self.respondent)
    }

    fn counters(&self) -> CounterSet {
        let mut set = CounterSet::new();
        let question = self.question.to_ascii_lowercase();
        let prefix = format!("ruleset:{question}");

        set.incr(format!("{prefix}:total-ruleset-polled"));

        let category = self.counted_category();
        let has_text = non_empty(&self.text).is_some_and(|t| t != "None");
        let responded_without_category = self.category.as_deref().is_some_and(|c| {
            !IGNORED_CATEGORIES.contains(&c.to_ascii_lowercase().as_str())
        }) && has_text;
        if category.is_some() || responded_without_category {
            set.incr(format!("{prefix}:total-ruleset-responded"));
        }

        let segment_prefix = match &category {
            Some(c) => {
                set.incr(format!("{prefix}:category:{c}"));
                format!("{prefix}:category:{c}")
            }
            None => format!("{prefix}:nocategory"),
        };

        let segments = [
            ("born", self.born.filter(|b| *b > 0).map(|b| b.to_string())),
            (
                "gender",
                self.gender.map(|g| g.code().to_ascii_lowercase()),
            ),
            ("state", non_empty(&self.state).map(|s| s.to_ascii_uppercase())),
            (
                "district",
                non_empty(&self.district).map(|s| s.to_ascii_uppercase()),
            ),
            ("ward", non_empty(&self.ward).map(|s| s.to_ascii_uppercase())),
            ("scheme", non_empty(&self.scheme).map(str::to_string)),
        ];
        for (dimension, value) in segments {
            if let Some(value) = value {
                set.incr(format!("{segment_prefix}:{dimension}:{value}"));
            }
        }
        set
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Truncates answer text to [`MAX_ANSWER_TEXT`] characters.
pub fn truncate_answer_text(text: &str) -> String {
    text.chars().take(MAX_ANSWER_TEXT).collect()
}
