//! Three-state delta fields for partial state updates.
//!
//! `stream/update`, `server/state` and `group/update` payloads distinguish a
//! field that is *absent* (retain prior value), explicitly *null* (clear the
//! prior value) and *present* (replace). [`DeltaField`] carries that
//! trichotomy through serde: `#[serde(default)]` maps a missing key to
//! [`DeltaField::Absent`], JSON `null` maps to [`DeltaField::Null`], and a
//! value maps to [`DeltaField::Value`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One field of a delta-merged payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeltaField<T> {
    /// Field was not present; receiver keeps its prior value.
    #[default]
    Absent,
    /// Field was explicitly `null`; receiver clears its prior value.
    Null,
    /// Field was present; receiver replaces its prior value.
    Value(T),
}

impl<T> DeltaField<T> {
    /// True when the field should be skipped during serialization.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Returns the carried value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Applies the delta-merge rule to an accumulated slot.
    pub fn apply(self, slot: &mut Option<T>) {
        match self {
            Self::Absent => {}
            Self::Null => *slot = None,
            Self::Value(v) => *slot = Some(v),
        }
    }

    /// Builds the delta that turns `prior` into `next`.
    ///
    /// Equal values produce [`DeltaField::Absent`] so unchanged fields stay
    /// off the wire; a cleared value produces [`DeltaField::Null`].
    pub fn diff(prior: Option<&T>, next: Option<&T>) -> Self
    where
        T: PartialEq + Clone,
    {
        match (prior, next) {
            (Some(a), Some(b)) if a == b => Self::Absent,
            (None, None) => Self::Absent,
            (_, Some(b)) => Self::Value(b.clone()),
            (Some(_), None) => Self::Null,
        }
    }
}

impl<T> From<Option<T>> for DeltaField<T> {
    /// `None` becomes an explicit clear, not an omission.
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => Self::Value(v),
            None => Self::Null,
        }
    }
}

impl<T: Serialize> Serialize for DeltaField<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            // Absent fields are expected to be skipped via
            // `skip_serializing_if = "DeltaField::is_absent"`; if one is
            // serialized anyway it degrades to null.
            Self::Absent | Self::Null => serializer.serialize_none(),
            Self::Value(v) => v.serialize(serializer),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for DeltaField<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => Self::Value(v),
            None => Self::Null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize, Default)]
    struct Probe {
        #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
        title: DeltaField<String>,
        #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
        year: DeltaField<u32>,
    }

    #[test]
    fn absent_null_and_present_are_disjoint() {
        let p: Probe = serde_json::from_str(r#"{"year": null}"#).unwrap();
        assert_eq!(p.title, DeltaField::Absent);
        assert_eq!(p.year, DeltaField::Null);

        let p: Probe = serde_json::from_str(r#"{"title": "x", "year": 2024}"#).unwrap();
        assert_eq!(p.title, DeltaField::Value("x".into()));
        assert_eq!(p.year, DeltaField::Value(2024));
    }

    #[test]
    fn absent_fields_stay_off_the_wire() {
        let p = Probe {
            title: DeltaField::Null,
            year: DeltaField::Absent,
        };
        assert_eq!(serde_json::to_string(&p).unwrap(), r#"{"title":null}"#);
    }

    #[test]
    fn merge_follows_last_non_absent_occurrence() {
        let mut slot = Some("a".to_string());
        DeltaField::<String>::Absent.apply(&mut slot);
        assert_eq!(slot.as_deref(), Some("a"));
        DeltaField::Value("b".to_string()).apply(&mut slot);
        assert_eq!(slot.as_deref(), Some("b"));
        DeltaField::<String>::Null.apply(&mut slot);
        assert_eq!(slot, None);
        DeltaField::<String>::Absent.apply(&mut slot);
        assert_eq!(slot, None);
    }

    #[test]
    fn diff_emits_only_changes() {
        assert_eq!(
            DeltaField::diff(Some(&1u32), Some(&1u32)),
            DeltaField::Absent
        );
        assert_eq!(
            DeltaField::diff(Some(&1u32), Some(&2u32)),
            DeltaField::Value(2)
        );
        assert_eq!(DeltaField::diff(Some(&1u32), None), DeltaField::Null);
        assert_eq!(DeltaField::<u32>::diff(None, None), DeltaField::Absent);
    }
}
