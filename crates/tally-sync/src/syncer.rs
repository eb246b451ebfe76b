//! Per-kind outcome classifiers.
//!
//! A [`Syncer`] knows how a remote record maps onto its local counterpart:
//! the natural key, the derived local attributes, whether a stored record is
//! stale, and how a record is retired. Reconcilers are generic over it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tally_core::remote::{RemoteBoundary, RemoteContact, RemoteField};
use tally_core::{
    Boundary, Contact, ContactField, FieldValueType, Gender, LocalRecord, OrgId, ResourceKind,
};

use crate::config::ContactLabels;
use crate::error::ClassificationError;

pub trait Syncer: Send + Sync {
    type Remote: Send + Sync + 'static;
    type Local: LocalRecord;

    fn kind(&self) -> ResourceKind;

    fn remote_key(&self, remote: &Self::Remote) -> String;

    /// Local attributes for `remote`, or `None` when the record is not
    /// tracked locally (for example a contact outside the reporter cohort).
    fn local_attributes(
        &self,
        org: OrgId,
        remote: &Self::Remote,
    ) -> Result<Option<Self::Local>, ClassificationError>;

    /// Whether `local` differs meaningfully from `derived`.
    fn update_required(
        &self,
        local: &Self::Local,
        remote: &Self::Remote,
        derived: &Self::Local,
    ) -> Result<bool, ClassificationError>;

    fn retire(&self, local: &mut Self::Local) {
        local.set_active(false);
    }
}

/// What should happen to one local record after seeing its remote record.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision<L> {
    Create(L),
    Update(L),
    Retire(L),
    Ignore,
}

/// Classifies `remote` against the stored record with the same key.
///
/// A retired record that is seen again is reactivated and counts as an
/// update. A record whose attributes derive to `None` is retired when an
/// active local copy exists.
pub fn decide<S: Syncer + ?Sized>(
    syncer: &S,
    org: OrgId,
    remote: &S::Remote,
    local: Option<&S::Local>,
) -> Result<Decision<S::Local>, ClassificationError> {
    let derived = syncer.local_attributes(org, remote)?;
    Ok(match (local, derived) {
        (None, Some(derived)) => Decision::Create(derived),
        (None, None) => Decision::Ignore,
        (Some(local), None) => retire_decision(syncer, local),
        (Some(local), Some(mut derived)) => {
            if !local.is_active() {
                derived.set_active(true);
                Decision::Update(derived)
            } else if syncer.update_required(local, remote, &derived)? {
                Decision::Update(derived)
            } else {
                Decision::Ignore
            }
        }
    })
}

/// Retires `local` unless it is already retired.
pub fn retire_decision<S: Syncer + ?Sized>(syncer: &S, local: &S::Local) -> Decision<S::Local> {
    if !local.is_active() {
        return Decision::Ignore;
    }
    let mut retired = local.clone();
    syncer.retire(&mut retired);
    Decision::Retire(retired)
}

fn require_key(key: &str) -> Result<(), ClassificationError> {
    if key.trim().is_empty() {
        Err(ClassificationError::MissingKey)
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FieldSyncer;

impl Syncer for FieldSyncer {
    type Remote = RemoteField;
    type Local = ContactField;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Fields
    }

    fn remote_key(&self, remote: &RemoteField) -> String {
        remote.key.clone()
    }

    fn local_attributes(
        &self,
        org: OrgId,
        remote: &RemoteField,
    ) -> Result<Option<ContactField>, ClassificationError> {
        require_key(&remote.key)?;
        Ok(Some(ContactField {
            org_id: org,
            key: remote.key.clone(),
            label: remote.label.clone(),
            value_type: FieldValueType::from_remote(&remote.value_type),
            is_active: true,
        }))
    }

    fn update_required(
        &self,
        local: &ContactField,
        _remote: &RemoteField,
        derived: &ContactField,
    ) -> Result<bool, ClassificationError> {
        Ok(local.label != derived.label || local.value_type != derived.value_type)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BoundarySyncer;

impl Syncer for BoundarySyncer {
    type Remote = RemoteBoundary;
    type Local = Boundary;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Boundaries
    }

    fn remote_key(&self, remote: &RemoteBoundary) -> String {
        remote.osm_id.clone()
    }

    fn local_attributes(
        &self,
        org: OrgId,
        remote: &RemoteBoundary,
    ) -> Result<Option<Boundary>, ClassificationError> {
        require_key(&remote.osm_id)?;
        if !(Boundary::COUNTRY_LEVEL..=Boundary::WARD_LEVEL).contains(&remote.level) {
            return Err(ClassificationError::InvalidValue {
                field: "level",
                value: remote.level.to_string(),
            });
        }
        Ok(Some(Boundary {
            org_id: org,
            osm_id: remote.osm_id.clone(),
            name: remote.name.clone(),
            level: remote.level,
            parent_osm_id: remote.parent.as_ref().map(|p| p.osm_id.clone()),
            geometry: remote.geometry_json(),
            is_active: true,
        }))
    }

    fn update_required(
        &self,
        local: &Boundary,
        _remote: &RemoteBoundary,
        derived: &Boundary,
    ) -> Result<bool, ClassificationError> {
        let parent_changed = match (&local.parent_osm_id, &derived.parent_osm_id) {
            (Some(old), Some(new)) => !old.eq_ignore_ascii_case(new),
            (None, Some(_)) => true,
            _ => false,
        };
        Ok(local.name != derived.name
            || local.level != derived.level
            || parent_changed
            || local.geometry != derived.geometry)
    }
}

/// Case-insensitive boundary name lookup: state names at the top, district
/// names within a state, ward names within a district.
#[derive(Debug, Clone, Default)]
pub struct BoundaryIndex {
    states: HashMap<String, String>,
    districts: HashMap<String, HashMap<String, String>>,
    wards: HashMap<String, HashMap<String, String>>,
}

impl BoundaryIndex {
    /// Indexes the active boundaries of one organization.
    pub fn build(boundaries: &[Boundary]) -> Self {
        let mut index = BoundaryIndex::default();
        for boundary in boundaries.iter().filter(|b| b.is_active) {
            let name = boundary.name.to_lowercase();
            let id = boundary.osm_id.clone();
            match (boundary.level, &boundary.parent_osm_id) {
                (Boundary::STATE_LEVEL, _) => {
                    index.states.insert(name, id);
                }
                (Boundary::DISTRICT_LEVEL, Some(parent)) => {
                    index.districts.entry(parent.clone()).or_default().insert(name, id);
                }
                (Boundary::WARD_LEVEL, Some(parent)) => {
                    index.wards.entry(parent.clone()).or_default().insert(name, id);
                }
                _ => {}
            }
        }
        index
    }

    pub fn state(&self, name: &str) -> Option<&str> {
        self.states.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn district(&self, state_id: &str, name: &str) -> Option<&str> {
        self.districts
            .get(state_id)?
            .get(&name.to_lowercase())
            .map(String::as_str)
    }

    pub fn ward(&self, district_id: &str, name: &str) -> Option<&str> {
        self.wards
            .get(district_id)?
            .get(&name.to_lowercase())
            .map(String::as_str)
    }
}

/// Last segment of a location path such as `"Rwanda > Kigali > Gasabo"`.
pub fn location_leaf(path: &str) -> &str {
    path.rsplit(" > ").next().unwrap_or(path).trim()
}

/// Derives reporter contacts from remote contacts.
#[derive(Debug, Clone)]
pub struct ContactSyncer {
    reporter_group: String,
    labels: ContactLabels,
    is_global: bool,
    boundaries: BoundaryIndex,
    field_keys: HashMap<String, String>,
}

impl ContactSyncer {
    pub fn new(
        reporter_group: impl Into<String>,
        labels: ContactLabels,
        is_global: bool,
        boundaries: BoundaryIndex,
        fields: &[ContactField],
    ) -> Self {
        Self {
            reporter_group: reporter_group.into(),
            labels,
            is_global,
            boundaries,
            field_keys: fields
                .iter()
                .map(|f| (f.label.to_lowercase(), f.key.clone()))
                .collect(),
        }
    }

    /// Value of the contact field whose label is configured as `label`.
    fn labelled_value(&self, remote: &RemoteContact, label: Option<&str>) -> Option<String> {
        let label = label.filter(|l| !l.is_empty())?.to_lowercase();
        let key = self.field_keys.get(&label)?;
        remote.field_text(key)
    }

    fn locations(&self, remote: &RemoteContact) -> (Option<String>, Option<String>, Option<String>) {
        let Some(state_value) = self.labelled_value(remote, self.labels.state.as_deref()) else {
            return (None, None, None);
        };
        if self.is_global {
            return (Some(state_value), None, None);
        }

        let state = self
            .boundaries
            .state(location_leaf(&state_value))
            .map(str::to_string);
        let district = state.as_deref().and_then(|state_id| {
            let value = self.labelled_value(remote, self.labels.district.as_deref())?;
            self.boundaries
                .district(state_id, location_leaf(&value))
                .map(str::to_string)
        });
        let ward = district.as_deref().and_then(|district_id| {
            let value = self.labelled_value(remote, self.labels.ward.as_deref())?;
            self.boundaries
                .ward(district_id, location_leaf(&value))
                .map(str::to_string)
        });
        (state, district, ward)
    }

    fn gender(&self, remote: &RemoteContact) -> Option<Gender> {
        let value = self.labelled_value(remote, self.labels.gender.as_deref())?;
        let matches = |label: &Option<String>| {
            label
                .as_deref()
                .is_some_and(|l| !l.is_empty() && l.eq_ignore_ascii_case(&value))
        };
        if matches(&self.labels.female) {
            Some(Gender::Female)
        } else if matches(&self.labels.male) {
            Some(Gender::Male)
        } else {
            None
        }
    }

    fn born(&self, remote: &RemoteContact) -> Option<i32> {
        self.labelled_value(remote, self.labels.born.as_deref())?
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|born| i32::try_from(born).ok())
            .filter(|born| *born >= 0)
    }

    fn registered_on(&self, remote: &RemoteContact) -> Option<DateTime<Utc>> {
        self.labelled_value(remote, self.labels.registration.as_deref())
            .and_then(|value| DateTime::parse_from_rfc3339(value.trim()).ok())
            .map(|at| at.with_timezone(&Utc))
            .or(remote.created_on)
    }
}

impl Syncer for ContactSyncer {
    type Remote = RemoteContact;
    type Local = Contact;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Contacts
    }

    fn remote_key(&self, remote: &RemoteContact) -> String {
        remote.uuid.clone()
    }

    fn local_attributes(
        &self,
        org: OrgId,
        remote: &RemoteContact,
    ) -> Result<Option<Contact>, ClassificationError> {
        require_key(&remote.uuid)?;
        if !remote.in_group(&self.reporter_group) {
            return Ok(None);
        }
        let (state, district, ward) = self.locations(remote);
        Ok(Some(Contact {
            org_id: org,
            uuid: remote.uuid.clone(),
            gender: self.gender(remote),
            born: self.born(remote),
            occupation: self.labelled_value(remote, self.labels.occupation.as_deref()),
            registered_on: self.registered_on(remote),
            state,
            district,
            ward,
            scheme: remote.scheme(),
            is_active: true,
        }))
    }

    fn update_required(
        &self,
        local: &Contact,
        _remote: &RemoteContact,
        derived: &Contact,
    ) -> Result<bool, ClassificationError> {
        Ok(local.gender != derived.gender
            || local.born != derived.born
            || local.occupation != derived.occupation
            || local.registered_on != derived.registered_on
            || local.state != derived.state
            || local.district != derived.district
            || local.ward != derived.ward
            || local.scheme != derived.scheme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::remote::ObjectRef;

    const ORG: OrgId = OrgId(1);

    fn boundary(osm_id: &str, name: &str, level: i32, parent: Option<&str>) -> Boundary {
        Boundary {
            org_id: ORG,
            osm_id: osm_id.into(),
            name: name.into(),
            level,
            parent_osm_id: parent.map(str::to_string),
            geometry: serde_json::json!({}),
            is_active: true,
        }
    }

    fn field(key: &str, label: &str) -> ContactField {
        ContactField {
            org_id: ORG,
            key: key.into(),
            label: label.into(),
            value_type: FieldValueType::Text,
            is_active: true,
        }
    }

    fn labels() -> ContactLabels {
        ContactLabels {
            state: Some("Province".into()),
            district: Some("District".into()),
            ward: Some("Sector".into()),
            gender: Some("Gender".into()),
            born: Some("Born".into()),
            occupation: Some("Occupation".into()),
            registration: Some("Registration Date".into()),
            female: Some("Female".into()),
            male: Some("Male".into()),
        }
    }

    fn contact_syncer(is_global: bool) -> ContactSyncer {
        let boundaries = BoundaryIndex::build(&[
            boundary("R0", "Rwanda", 0, None),
            boundary("R1", "Kigali", 1, Some("R0")),
            boundary("R2", "Gasabo", 2, Some("R1")),
            boundary("R3", "Kacyiru", 3, Some("R2")),
        ]);
        let fields = [
            field("province", "Province"),
            field("district", "District"),
            field("sector", "Sector"),
            field("gender", "Gender"),
            field("born", "Born"),
            field("occupation", "Occupation"),
            field("registration_date", "Registration Date"),
        ];
        ContactSyncer::new("U-Reporters", labels(), is_global, boundaries, &fields)
    }

    fn remote_contact(fields: serde_json::Value) -> RemoteContact {
        RemoteContact {
            uuid: "C1".into(),
            name: None,
            urns: vec!["tel:+250788000001".into()],
            groups: vec![ObjectRef {
                uuid: Some("G1".into()),
                name: "u-reporters".into(),
            }],
            fields: serde_json::from_value(fields).unwrap(),
            created_on: Some("2023-05-01T08:00:00Z".parse().unwrap()),
            modified_on: None,
        }
    }

    #[test]
    fn contact_attributes_resolve_locations_and_demographics() {
        let syncer = contact_syncer(false);
        let remote = remote_contact(serde_json::json!({
            "province": "Rwanda > Kigali",
            "district": "Rwanda > Kigali > GASABO",
            "sector": "Kacyiru",
            "gender": "female",
            "born": "1994",
            "occupation": "Student",
            "registration_date": "2024-02-03T10:00:00Z",
        }));
        let contact = syncer.local_attributes(ORG, &remote).unwrap().unwrap();
        assert_eq!(contact.state.as_deref(), Some("R1"));
        assert_eq!(contact.district.as_deref(), Some("R2"));
        assert_eq!(contact.ward.as_deref(), Some("R3"));
        assert_eq!(contact.gender, Some(Gender::Female));
        assert_eq!(contact.born, Some(1994));
        assert_eq!(contact.occupation.as_deref(), Some("Student"));
        assert_eq!(
            contact.registered_on,
            Some("2024-02-03T10:00:00Z".parse().unwrap())
        );
        assert_eq!(contact.scheme.as_deref(), Some("tel"));
    }

    #[test]
    fn contact_outside_reporter_group_is_not_tracked() {
        let syncer = contact_syncer(false);
        let mut remote = remote_contact(serde_json::json!({}));
        remote.groups.clear();
        assert_eq!(syncer.local_attributes(ORG, &remote).unwrap(), None);
    }

    #[test]
    fn invalid_values_fall_back() {
        let syncer = contact_syncer(false);
        let remote = remote_contact(serde_json::json!({
            "province": "Atlantis",
            "district": "Gasabo",
            "born": "-4",
            "gender": "other",
            "registration_date": "not a date",
        }));
        let contact = syncer.local_attributes(ORG, &remote).unwrap().unwrap();
        assert_eq!(contact.state, None);
        assert_eq!(contact.district, None);
        assert_eq!(contact.born, None);
        assert_eq!(contact.gender, None);
        assert_eq!(contact.registered_on, remote.created_on);
    }

    #[test]
    fn global_orgs_keep_raw_state_values() {
        let syncer = contact_syncer(true);
        let remote = remote_contact(serde_json::json!({"province": "UG", "district": "Gasabo"}));
        let contact = syncer.local_attributes(ORG, &remote).unwrap().unwrap();
        assert_eq!(contact.state.as_deref(), Some("UG"));
        assert_eq!(contact.district, None);
    }

    #[test]
    fn empty_keys_are_classification_errors() {
        let remote = RemoteField {
            key: " ".into(),
            label: "Blank".into(),
            value_type: "text".into(),
        };
        assert_eq!(
            FieldSyncer.local_attributes(ORG, &remote),
            Err(ClassificationError::MissingKey)
        );
    }

    #[test]
    fn decisions_cover_reactivation_and_retirement() {
        let remote = RemoteField {
            key: "born".into(),
            label: "Born".into(),
            value_type: "numeric".into(),
        };
        let current = FieldSyncer.local_attributes(ORG, &remote).unwrap().unwrap();

        assert_eq!(
            decide(&FieldSyncer, ORG, &remote, None).unwrap(),
            Decision::Create(current.clone())
        );
        assert_eq!(
            decide(&FieldSyncer, ORG, &remote, Some(&current)).unwrap(),
            Decision::Ignore
        );

        let mut retired = current.clone();
        retired.is_active = false;
        assert_eq!(
            decide(&FieldSyncer, ORG, &remote, Some(&retired)).unwrap(),
            Decision::Update(current.clone())
        );
        assert_eq!(retire_decision(&FieldSyncer, &current), Decision::Retire(retired.clone()));
        assert_eq!(retire_decision(&FieldSyncer, &retired), Decision::Ignore);
    }

    #[test]
    fn boundary_updates_track_parent_and_geometry() {
        let remote: RemoteBoundary =
            serde_json::from_str(r#"{"osm_id":"R2","name":"South","level":1,"parent":"R1"}"#)
                .unwrap();
        let derived = BoundarySyncer.local_attributes(ORG, &remote).unwrap().unwrap();
        let mut local = derived.clone();
        assert!(!BoundarySyncer.update_required(&local, &remote, &derived).unwrap());
        local.parent_osm_id = None;
        assert!(BoundarySyncer.update_required(&local, &remote, &derived).unwrap());
        local.parent_osm_id = Some("r1".into());
        local.geometry = serde_json::json!({"type": "Point", "coordinates": [0, 0]});
        assert!(BoundarySyncer.update_required(&local, &remote, &derived).unwrap());

        let bad: RemoteBoundary =
            serde_json::from_str(r#"{"osm_id":"R9","name":"Deep","level":7}"#).unwrap();
        assert!(matches!(
            BoundarySyncer.local_attributes(ORG, &bad),
            Err(ClassificationError::InvalidValue { field: "level", .. })
        ));
    }

    #[test]
    fn location_leaf_takes_last_segment() {
        assert_eq!(location_leaf("Rwanda > Kigali > Gasabo"), "Gasabo");
        assert_eq!(location_leaf("Kigali"), "Kigali");
    }
}
