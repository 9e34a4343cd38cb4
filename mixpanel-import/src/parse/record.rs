use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ImportError;

use super::{
    escape::{escape_field_name, EVENT_NAME_FIELD},
    schema::{OutputSchema, RAW_EVENT_FIELD},
};

// One line of a Mixpanel export. `properties` keeps the order the line lists them in.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MixpanelEvent {
    pub event: String,
    pub properties: Map<String, Value>,
}

impl MixpanelEvent {
    // Derived struct impls also accept the sequence form (`["e", {}]`), so we insist on an
    // object before handing over to serde
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let object: Map<String, Value> = serde_json::from_str(line)?;
        serde_json::from_value(Value::Object(object))
    }
}

/// One output record. Every field of the schema it was built against is present,
/// with `None` standing in for a null value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Record {
    values: BTreeMap<String, Option<String>>,
}

impl Record {
    fn empty(schema: &OutputSchema) -> Self {
        let values = schema
            .field_names()
            .into_iter()
            .map(|name| (name.to_string(), None))
            .collect();
        Self { values }
    }

    /// `None` if the field is null or not part of the record's schema
    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).and_then(|v| v.as_deref())
    }

    pub fn contains_field(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    fn set(&mut self, field: &str, value: Option<String>) {
        if let Some(slot) = self.values.get_mut(field) {
            *slot = value;
        }
    }
}

pub fn map_line(line: &str, schema: &OutputSchema) -> Result<Record, ImportError> {
    let mut record = Record::empty(schema);

    match schema {
        OutputSchema::RawEvent => {
            record.set(RAW_EVENT_FIELD, Some(line.to_string()));
        }
        OutputSchema::Dynamic(_) => {
            let parsed =
                MixpanelEvent::parse(line).map_err(|source| ImportError::MalformedEvent {
                    line: line.to_string(),
                    source,
                })?;

            record.set(EVENT_NAME_FIELD, Some(parsed.event));
            // Applied in line order. When several properties escape to the same field
            // (`$os`, `os`), the last one wins.
            for (name, value) in parsed.properties {
                let escaped = escape_field_name(&name);
                // Properties the schema doesn't know about are dropped
                if schema.has_field(&escaped) {
                    record.set(&escaped, coerce_to_string(value));
                }
            }
        }
    }

    Ok(record)
}

fn coerce_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn dynamic_schema(fields: &[&str]) -> OutputSchema {
        OutputSchema::Dynamic(fields.iter().map(|f| f.to_string()).collect::<BTreeSet<_>>())
    }

    #[test]
    fn test_raw_mode_keeps_line_verbatim() {
        let records: Vec<Record> = ["data1", "data2"]
            .iter()
            .map(|line| map_line(line, &OutputSchema::RawEvent).unwrap())
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("raw_event"), Some("data1"));
        assert_eq!(records[1].get("raw_event"), Some("data2"));
    }

    #[test]
    fn test_raw_mode_does_not_parse() {
        let line = r#"{"event": "broken", "properties": {"#;
        let record = map_line(line, &OutputSchema::RawEvent).unwrap();
        assert_eq!(record.get("raw_event"), Some(line));
    }

    #[test]
    fn test_dynamic_mode_maps_known_fields() {
        let schema = dynamic_schema(&[
            "event_name",
            "distinct_id",
            "time",
            "data_1",
            "New_Plan",
            "lib_version",
        ]);
        let line = r#"{"event":"Custom Event","properties":{"data_1":"data 1 value","lib_version":"1.0"}}"#;

        let record = map_line(line, &schema).unwrap();

        assert_eq!(record.get("event_name"), Some("Custom Event"));
        assert_eq!(record.get("data_1"), Some("data 1 value"));
        assert_eq!(record.get("lib_version"), Some("1.0"));
        assert!(record.contains_field("New_Plan"));
        assert_eq!(record.get("New_Plan"), None);
        assert_eq!(record.get("distinct_id"), None);
    }

    #[test]
    fn test_dynamic_mode_escapes_and_drops_unknown_properties() {
        let schema = dynamic_schema(&["event_name", "distinct_id", "time", "os"]);
        let line = r#"{"event":"Signup","properties":{"$os":"Linux","$browser":"Firefox","distinct_id":"user-1"}}"#;

        let record = map_line(line, &schema).unwrap();

        assert_eq!(record.get("os"), Some("Linux"));
        assert_eq!(record.get("distinct_id"), Some("user-1"));
        assert!(!record.contains_field("browser"));
        assert_eq!(record.fields().count(), 4);
    }

    #[test]
    fn test_values_coerced_to_strings() {
        let schema = dynamic_schema(&["event_name", "distinct_id", "time", "count", "paid", "tags", "gone"]);
        let line = r#"{"event":"e","properties":{"time":1704067200,"count":1.5,"paid":true,"tags":["a","b"],"gone":null}}"#;

        let record = map_line(line, &schema).unwrap();

        assert_eq!(record.get("time"), Some("1704067200"));
        assert_eq!(record.get("count"), Some("1.5"));
        assert_eq!(record.get("paid"), Some("true"));
        assert_eq!(record.get("tags"), Some(r#"["a","b"]"#));
        assert_eq!(record.get("gone"), None);
    }

    #[test]
    fn test_malformed_lines_fail_in_dynamic_mode() {
        let schema = dynamic_schema(&["event_name", "distinct_id", "time"]);

        let bad_lines = [
            "not json at all",
            r#"{"event":"e"}"#,
            r#"{"properties":{}}"#,
            r#"{"event":"e","properties":{},"extra":1}"#,
            r#"{"event":1,"properties":{}}"#,
            r#"["e", {}]"#,
            "",
        ];
        for line in bad_lines {
            let err = map_line(line, &schema).unwrap_err();
            assert!(
                matches!(err, ImportError::MalformedEvent { .. }),
                "line {line:?}"
            );
        }
    }

    #[test]
    fn test_colliding_properties_last_one_wins() {
        let schema = dynamic_schema(&["event_name", "distinct_id", "time", "os"]);
        let line = r#"{"event":"e","properties":{"$os":"first","os":"second","$$os":"third"}}"#;

        for _ in 0..50 {
            let record = map_line(line, &schema).unwrap();
            assert_eq!(record.get("os"), Some("third"));
        }

        let reversed = r#"{"event":"e","properties":{"$$os":"third","os":"second","$os":"first"}}"#;
        assert_eq!(map_line(reversed, &schema).unwrap().get("os"), Some("first"));
    }

    #[test]
    fn test_event_name_property_overrides_event() {
        let schema = dynamic_schema(&["event_name", "distinct_id", "time"]);
        let line = r#"{"event":"Signup","properties":{"$event_name":"Renamed"}}"#;

        let record = map_line(line, &schema).unwrap();
        assert_eq!(record.get("event_name"), Some("Renamed"));
    }

    #[test]
    fn test_sequence_form_rejected() {
        let schema = dynamic_schema(&["event_name", "distinct_id", "time"]);
        let err = map_line(r#"["e", {}]"#, &schema).unwrap_err();
        assert!(matches!(err, ImportError::MalformedEvent { .. }));
    }

    #[test]
    fn test_record_serializes_as_flat_object() {
        let schema = dynamic_schema(&["event_name", "distinct_id", "time"]);
        let record = map_line(r#"{"event":"e","properties":{"time":"12"}}"#, &schema).unwrap();

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event_name": "e", "distinct_id": null, "time": "12"})
        );
    }
}
