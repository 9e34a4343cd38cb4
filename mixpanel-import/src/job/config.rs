use std::{sync::LazyLock, time::Duration};

use anyhow::Error;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    emit::{Emitter, FileEmitter, NoOpEmitter, StdoutEmitter},
    error::{ImportError, ValidationFailure},
};

pub const DEFAULT_DATA_URL: &str = "https://data.mixpanel.com/api/2.0/export";
pub const DEFAULT_REST_API_URL: &str = "https://mixpanel.com";

pub const PROPERTY_FROM_DATE: &str = "fromDate";
pub const PROPERTY_TO_DATE: &str = "toDate";
pub const PROPERTY_DATA_URL: &str = "mixPanelDataUrl";
pub const PROPERTY_REST_URL: &str = "mixPanelRestApiUrl";
pub const PROPERTY_SCHEMA_BY_EVENTS: &str = "schemaByEvents";

// Format only - we leave it to Mixpanel to reject dates that don't exist
static DATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$").expect("date regex is valid"));

/// Everything one import run needs to know. Built (and validated) through
/// [`IngestionConfig::builder`], read-only afterwards.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    api_secret: String,
    from_date: String,
    to_date: String,
    events: Vec<String>,
    filter: Option<String>,
    data_url: Url,
    rest_api_url: Url,
    schema_by_events: bool,
    request_timeout: Option<Duration>,
}

impl IngestionConfig {
    pub fn builder() -> IngestionConfigBuilder {
        IngestionConfigBuilder::default()
    }

    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }

    pub fn from_date(&self) -> &str {
        &self.from_date
    }

    pub fn to_date(&self) -> &str {
        &self.to_date
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn data_url(&self) -> &Url {
        &self.data_url
    }

    pub fn rest_api_url(&self) -> &Url {
        &self.rest_api_url
    }

    pub fn schema_by_events(&self) -> bool {
        self.schema_by_events
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionConfigBuilder {
    api_secret: String,
    from_date: String,
    to_date: String,
    events: Vec<String>,
    filter: Option<String>,
    data_url: Option<String>,
    rest_api_url: Option<String>,
    schema_by_events: bool,
    request_timeout: Option<Duration>,
}

impl IngestionConfigBuilder {
    pub fn api_secret(mut self, api_secret: impl Into<String>) -> Self {
        self.api_secret = api_secret.into();
        self
    }

    pub fn from_date(mut self, from_date: impl Into<String>) -> Self {
        self.from_date = from_date.into();
        self
    }

    pub fn to_date(mut self, to_date: impl Into<String>) -> Self {
        self.to_date = to_date.into();
        self
    }

    /// Comma separated, e.g. `"Signup,Purchase"`. Order is kept.
    pub fn events(self, events: &str) -> Self {
        let events = events
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from)
            .collect();
        self.event_list(events)
    }

    pub fn event_list(mut self, events: Vec<String>) -> Self {
        self.events = events;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn data_url(mut self, data_url: impl Into<String>) -> Self {
        self.data_url = Some(data_url.into());
        self
    }

    pub fn rest_api_url(mut self, rest_api_url: impl Into<String>) -> Self {
        self.rest_api_url = Some(rest_api_url.into());
        self
    }

    pub fn schema_by_events(mut self, schema_by_events: bool) -> Self {
        self.schema_by_events = schema_by_events;
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<IngestionConfig, ImportError> {
        let mut failures = Vec::new();

        let data_url_raw = non_empty_or(self.data_url, DEFAULT_DATA_URL);
        let data_url = parse_url(&data_url_raw).map_err(|_| ValidationFailure {
            property: PROPERTY_DATA_URL,
            message: format!("Invalid data URL '{data_url_raw}'."),
            correction: "Change MixPanel data url to valid.".to_string(),
        });

        let rest_url_raw = non_empty_or(self.rest_api_url, DEFAULT_REST_API_URL);
        let rest_api_url = parse_url(&rest_url_raw).map_err(|_| ValidationFailure {
            property: PROPERTY_REST_URL,
            message: format!("Invalid rest api URL '{rest_url_raw}'."),
            correction: "Change MixPanel rest api url to valid.".to_string(),
        });

        for (property, date) in [
            (PROPERTY_FROM_DATE, &self.from_date),
            (PROPERTY_TO_DATE, &self.to_date),
        ] {
            if !DATE_REGEX.is_match(date) {
                failures.push(ValidationFailure {
                    property,
                    message: format!("Invalid date '{date}'."),
                    correction: "Change date to YYYY-MM-DD format.".to_string(),
                });
            }
        }

        if self.schema_by_events && self.events.is_empty() {
            failures.push(ValidationFailure {
                property: PROPERTY_SCHEMA_BY_EVENTS,
                message: "No events specified.".to_string(),
                correction: "Specify event names or uncheck schemaByEvents.".to_string(),
            });
        }

        let (data_url, rest_api_url) = match (data_url, rest_api_url) {
            (Ok(data), Ok(rest)) if failures.is_empty() => (data, rest),
            (data, rest) => {
                // Url failures first, matching the order properties are declared in
                let mut all: Vec<_> = [data.err(), rest.err()].into_iter().flatten().collect();
                all.extend(failures);
                return Err(ImportError::ConfigValidation(all));
            }
        };

        Ok(IngestionConfig {
            api_secret: self.api_secret,
            from_date: self.from_date,
            to_date: self.to_date,
            events: self.events,
            filter: self.filter.filter(|f| !f.is_empty()),
            data_url,
            rest_api_url,
            schema_by_events: self.schema_by_events,
            request_timeout: self.request_timeout,
        })
    }
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

// Absolute http(s) urls with a host only
fn parse_url(raw: &str) -> Result<Url, Error> {
    let url = Url::parse(raw)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::msg(format!("Unsupported scheme: {}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(Error::msg("Missing host"));
    }
    Ok(url)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    Stdout {
        as_json: bool,
    },
    File {
        path: String,
        as_json: bool,
        cleanup: bool,
    },
    NoOp,
}

impl SinkConfig {
    pub async fn construct(&self) -> Result<Box<dyn Emitter>, Error> {
        match self {
            SinkConfig::Stdout { as_json } => Ok(Box::new(StdoutEmitter { as_json: *as_json })),
            SinkConfig::NoOp => Ok(Box::new(NoOpEmitter {})),
            SinkConfig::File {
                path,
                as_json,
                cleanup,
            } => Ok(Box::new(
                FileEmitter::new(path.clone(), *as_json, *cleanup).await?,
            )),
        }
    }
}
