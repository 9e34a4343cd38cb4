use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{error::ImportError, job::config::IngestionConfig};

use super::escape::{escape_field_name, EVENT_NAME_FIELD};

pub const RAW_EVENT_FIELD: &str = "raw_event";
pub const DISTINCT_ID_FIELD: &str = "distinct_id";
pub const TIME_FIELD: &str = "time";

// Always present in a by-events schema, whatever the top fields say
const MANDATORY_FIELDS: [&str; 3] = [EVENT_NAME_FIELD, DISTINCT_ID_FIELD, TIME_FIELD];

/// Anything that can tell us the most common property names for an event.
#[async_trait]
pub trait PropertyCatalogue: Send + Sync {
    async fn fetch_top_fields(&self, event_name: &str) -> Result<BTreeSet<String>, ImportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSchema {
    /// One non-null string field, `raw_event`, holding the export line untouched
    RawEvent,
    /// Nullable string fields derived from the configured events' top properties
    Dynamic(BTreeSet<String>),
}

impl OutputSchema {
    pub fn field_names(&self) -> Vec<&str> {
        match self {
            OutputSchema::RawEvent => vec![RAW_EVENT_FIELD],
            OutputSchema::Dynamic(fields) => fields.iter().map(String::as_str).collect(),
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        match self {
            OutputSchema::RawEvent => name == RAW_EVENT_FIELD,
            OutputSchema::Dynamic(fields) => fields.contains(name),
        }
    }

    pub fn is_nullable(&self, name: &str) -> bool {
        matches!(self, OutputSchema::Dynamic(fields) if fields.contains(name))
    }

    pub fn len(&self) -> usize {
        match self {
            OutputSchema::RawEvent => 1,
            OutputSchema::Dynamic(fields) => fields.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub async fn infer_schema(
    config: &IngestionConfig,
    catalogue: &dyn PropertyCatalogue,
) -> Result<OutputSchema, ImportError> {
    if !config.schema_by_events() {
        return Ok(OutputSchema::RawEvent);
    }

    // escaped name -> the raw name that first produced it. Lives only as long as this call.
    let mut mapped_fields: HashMap<String, String> = HashMap::new();
    let mut field_names: BTreeSet<String> = BTreeSet::new();

    for event_name in config.events() {
        let top_fields = catalogue.fetch_top_fields(event_name).await?;
        debug!(
            "Got {} top fields for event '{}'",
            top_fields.len(),
            event_name
        );

        for field_name in top_fields {
            let escaped = escape_field_name(&field_name);
            if escaped.is_empty() {
                return Err(ImportError::EmptyFieldName { raw: field_name });
            }

            match mapped_fields.get(&escaped) {
                None => {
                    mapped_fields.insert(escaped.clone(), field_name);
                }
                Some(previous) if *previous != field_name => {
                    return Err(ImportError::SchemaConflict {
                        raw: field_name,
                        escaped,
                        previous: previous.clone(),
                    });
                }
                Some(_) => {}
            }

            field_names.insert(escaped);
        }
    }

    field_names.extend(MANDATORY_FIELDS.iter().map(|f| f.to_string()));

    info!(
        "Inferred schema with {} fields from {} events",
        field_names.len(),
        config.events().len()
    );

    Ok(OutputSchema::Dynamic(field_names))
}
