// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Query predicates for tapes and queue payloads.
//!
//! Both kinds of criteria render into a [`QueryBuilder`] as a sequence of
//! `AND ...` clauses with bound parameters.  The caller is responsible for
//! pushing a leading `WHERE` clause.

use crate::model::{QueueState, TapeLocation, TapeLocationType, TapeState};
use sqlx::{QueryBuilder, Sqlite};

/// Conjunction of tape properties.  An empty criteria matches every tape.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TapeCriteria {
    library: Option<String>,
    code: Option<String>,
    alternative_code: Option<String>,
    location: Option<TapeLocation>,
    location_types: Vec<TapeLocationType>,
    tape_states: Vec<TapeState>,
    queue_state: Option<QueueState>,
    bucket: Option<Option<String>>,
}

impl TapeCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn library<S: Into<String>>(mut self, library: S) -> Self {
        self.library = Some(library.into());
        self
    }

    pub fn code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn alternative_code<S: Into<String>>(mut self, code: S) -> Self {
        self.alternative_code = Some(code.into());
        self
    }

    pub fn location(mut self, location: TapeLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn location_types<I>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = TapeLocationType>,
    {
        self.location_types = types.into_iter().collect();
        self
    }

    pub fn tape_states<I>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = TapeState>,
    {
        self.tape_states = states.into_iter().collect();
        self
    }

    pub fn queue_state(mut self, state: QueueState) -> Self {
        self.queue_state = Some(state);
        self
    }

    /// Matches tapes dedicated to `bucket`, or unassigned tapes for `None`.
    pub fn bucket(mut self, bucket: Option<&str>) -> Self {
        self.bucket = Some(bucket.map(str::to_owned));
        self
    }

    pub(crate) fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if let Some(library) = &self.library {
            qb.push(" AND library = ").push_bind(library.clone());
        }
        if let Some(code) = &self.code {
            qb.push(" AND code = ").push_bind(code.clone());
        }
        if let Some(code) = &self.alternative_code {
            qb.push(" AND alternative_code = ").push_bind(code.clone());
        }
        if let Some(location) = &self.location {
            qb.push(" AND current_location_type = ")
                .push_bind(location.location_type.as_str())
                .push(" AND current_location_index = ")
                .push_bind(i64::from(location.index));
        }
        if !self.location_types.is_empty() {
            qb.push(" AND current_location_type IN (");
            let mut list = qb.separated(", ");
            for t in &self.location_types {
                list.push_bind(t.as_str());
            }
            list.push_unseparated(")");
        }
        if !self.tape_states.is_empty() {
            qb.push(" AND tape_state IN (");
            let mut list = qb.separated(", ");
            for s in &self.tape_states {
                list.push_bind(s.as_str());
            }
            list.push_unseparated(")");
        }
        if let Some(state) = &self.queue_state {
            qb.push(" AND queue_state = ").push_bind(state.as_str());
        }
        match &self.bucket {
            None => {}
            Some(None) => {
                qb.push(" AND bucket IS NULL");
            }
            Some(Some(bucket)) => {
                qb.push(" AND bucket = ").push_bind(bucket.clone());
            }
        }
    }
}

/// Scalar compared against a JSON payload field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterValue {
    Text(String),
    Integer(i64),
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        FilterValue::Text(s.to_owned())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        FilterValue::Text(s)
    }
}

impl From<i64> for FilterValue {
    fn from(i: i64) -> Self {
        FilterValue::Integer(i)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum PayloadCondition {
    Eq(String, FilterValue),
    In(String, Vec<FilterValue>),
    NotIn(String, Vec<FilterValue>),
}

/// Conjunction of conditions on top-level payload fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PayloadFilter {
    conditions: Vec<PayloadCondition>,
}

impl PayloadFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq<V: Into<FilterValue>>(mut self, field: &str, value: V) -> Self {
        self.conditions.push(PayloadCondition::Eq(json_path(field), value.into()));
        self
    }

    /// An empty value list matches nothing.
    pub fn is_in<I, V>(mut self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FilterValue>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.conditions.push(PayloadCondition::In(json_path(field), values));
        self
    }

    /// An empty value list excludes nothing.
    pub fn not_in<I, V>(mut self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FilterValue>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.conditions.push(PayloadCondition::NotIn(json_path(field), values));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub(crate) fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        for condition in &self.conditions {
            match condition {
                PayloadCondition::Eq(path, value) => {
                    push_extract(qb, path);
                    qb.push(" = ");
                    push_value(qb, value);
                }
                PayloadCondition::In(_, values) if values.is_empty() => {
                    qb.push(" AND 0 = 1");
                }
                PayloadCondition::In(path, values) => {
                    push_extract(qb, path);
                    push_list(qb, " IN (", values);
                }
                PayloadCondition::NotIn(_, values) if values.is_empty() => {}
                PayloadCondition::NotIn(path, values) => {
                    push_extract(qb, path);
                    push_list(qb, " NOT IN (", values);
                }
            }
        }
    }
}

fn json_path(field: &str) -> String {
    format!("$.{}", field)
}

fn push_extract(qb: &mut QueryBuilder<'_, Sqlite>, path: &str) {
    qb.push(" AND json_extract(payload, ")
        .push_bind(path.to_owned())
        .push(")");
}

fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: &FilterValue) {
    match value {
        FilterValue::Text(s) => qb.push_bind(s.clone()),
        FilterValue::Integer(i) => qb.push_bind(*i),
    };
}

fn push_list(
    qb: &mut QueryBuilder<'_, Sqlite>,
    open: &str,
    values: &[FilterValue],
) {
    qb.push(open);
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        push_value(qb, value);
    }
    qb.push(")");
}

#[cfg(test)]
mod test {
    use super::*;

    fn render_tape(criteria: &TapeCriteria) -> String {
        let mut qb = QueryBuilder::new("SELECT id FROM tape_catalog WHERE 1 = 1");
        criteria.push_conditions(&mut qb);
        qb.sql().to_owned()
    }

    fn render_payload(filter: &PayloadFilter) -> String {
        let mut qb = QueryBuilder::new("SELECT id FROM tape_queue WHERE 1 = 1");
        filter.push_conditions(&mut qb);
        qb.sql().to_owned()
    }

    #[test]
    fn test_tape_criteria_sql() {
        assert_eq!(
            render_tape(&TapeCriteria::new()),
            "SELECT id FROM tape_catalog WHERE 1 = 1"
        );
        let criteria = TapeCriteria::new()
            .library("lib")
            .location_types([TapeLocationType::Slot, TapeLocationType::ImportExport])
            .bucket(None);
        assert_eq!(
            render_tape(&criteria),
            "SELECT id FROM tape_catalog WHERE 1 = 1 AND library = ? \
             AND current_location_type IN (?, ?) AND bucket IS NULL"
        );
    }

    #[test]
    fn test_payload_filter_sql() {
        let filter = PayloadFilter::new()
            .eq("bucket", "b1")
            .not_in("bucket", Vec::<String>::new())
            .is_in("tape_code", ["T1", "T2"]);
        assert_eq!(
            render_payload(&filter),
            "SELECT id FROM tape_queue WHERE 1 = 1 \
             AND json_extract(payload, ?) = ? \
             AND json_extract(payload, ?) IN (?, ?)"
        );

        let nothing = PayloadFilter::new().is_in("bucket", Vec::<String>::new());
        assert!(render_payload(&nothing).ends_with(" AND 0 = 1"));
    }
}
