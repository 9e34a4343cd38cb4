use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{Map, Value};
use tracing::{debug, info};
use url::Url;

use crate::{
    error::{ImportError, ValidationFailure},
    job::config::{IngestionConfig, PROPERTY_DATA_URL, PROPERTY_REST_URL},
    parse::schema::PropertyCatalogue,
};

use super::stream::EventStream;

const TOP_FIELDS_PATH: &str = "/api/2.0/events/properties/top/";

/// Basic auth credentials for Mixpanel. The API secret is the username, the password is empty.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HostKey {
    host: String,
    port: Option<u16>,
}

impl HostKey {
    fn of(url: &Url) -> Option<Self> {
        Some(Self {
            host: url.host_str()?.to_ascii_lowercase(),
            port: url.port_or_known_default(),
        })
    }
}

/// Credentials scoped per target host, so a secret bound to one host is never sent to another.
#[derive(Debug, Clone, Default)]
pub struct HostCredentials {
    by_host: HashMap<HostKey, Credentials>,
}

impl HostCredentials {
    pub fn insert(&mut self, url: &Url, credentials: Credentials) {
        if let Some(key) = HostKey::of(url) {
            self.by_host.insert(key, credentials);
        }
    }

    pub fn for_url(&self, url: &Url) -> Option<&Credentials> {
        HostKey::of(url).and_then(|key| self.by_host.get(&key))
    }

    pub fn len(&self) -> usize {
        self.by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_host.is_empty()
    }

    fn authorize(&self, url: &Url, request: RequestBuilder) -> RequestBuilder {
        match self.for_url(url) {
            Some(creds) => request.basic_auth(&creds.username, Some(&creds.password)),
            None => request,
        }
    }
}

pub struct MixpanelApi {
    data_url: Url,
    rest_api_url: Url,
    credentials: HostCredentials,
    timeout: Option<Duration>,
}

impl MixpanelApi {
    pub fn new(secret: &str, rest_api_url: &Url, data_url: &Url) -> Self {
        let mut credentials = HostCredentials::default();
        for url in [rest_api_url, data_url] {
            credentials.insert(
                url,
                Credentials {
                    username: secret.to_string(),
                    password: String::new(),
                },
            );
        }

        Self {
            data_url: data_url.clone(),
            rest_api_url: rest_api_url.clone(),
            credentials,
            timeout: None,
        }
    }

    pub fn from_config(config: &IngestionConfig) -> Self {
        Self::new(
            config.api_secret(),
            config.rest_api_url(),
            config.data_url(),
        )
        .with_timeout(config.request_timeout())
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn credentials(&self) -> &HostCredentials {
        &self.credentials
    }

    // Trailing slashes are dropped so base urls can be given either way
    fn top_fields_url(&self) -> Result<Url, ImportError> {
        let base = self.rest_api_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}{TOP_FIELDS_PATH}")).map_err(|e| {
            ImportError::ConfigValidation(vec![ValidationFailure {
                property: PROPERTY_REST_URL,
                message: format!("Invalid rest api URL '{base}': {e}"),
                correction: "Change MixPanel rest api url to valid.".to_string(),
            }])
        })
    }

    fn export_url(&self) -> Result<Url, ImportError> {
        let raw = self.data_url.as_str().trim_end_matches('/');
        Url::parse(raw).map_err(|e| {
            ImportError::ConfigValidation(vec![ValidationFailure {
                property: PROPERTY_DATA_URL,
                message: format!("Invalid data URL '{raw}': {e}"),
                correction: "Change MixPanel data url to valid.".to_string(),
            }])
        })
    }

    // A fresh client per call - nothing is pooled between requests
    fn new_client(&self) -> Result<Client, ImportError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder.build().map_err(|source| ImportError::Transport {
            context: "Failed to build http client".to_string(),
            source,
        })
    }

    async fn post_form(
        &self,
        client: &Client,
        url: &Url,
        params: &[(String, String)],
        context: &str,
    ) -> Result<Response, ImportError> {
        let request = client.post(url.clone()).form(params);
        let request = self.credentials.authorize(url, request);

        let response = request
            .send()
            .await
            .map_err(|source| ImportError::Transport {
                context: context.to_string(),
                source,
            })?;

        check_response_status(response, context).await
    }

    pub async fn open_event_stream(
        &self,
        params: &[(String, String)],
    ) -> Result<EventStream, ImportError> {
        let url = self.export_url()?;
        let client = self.new_client()?;

        info!("Requesting raw events from {}", url);
        let response = self
            .post_form(&client, &url, params, "Failed to fetch raw events")
            .await?;

        Ok(EventStream::new(client, response))
    }
}

#[async_trait]
impl PropertyCatalogue for MixpanelApi {
    async fn fetch_top_fields(&self, event_name: &str) -> Result<BTreeSet<String>, ImportError> {
        let url = self.top_fields_url()?;
        let client = self.new_client()?;
        let context = format!("Failed to fetch fields event: '{event_name}',");

        debug!("Fetching top fields for event '{}'", event_name);
        let response = self
            .post_form(
                &client,
                &url,
                &[("event".to_string(), event_name.to_string())],
                &context,
            )
            .await?;

        let body = response
            .text()
            .await
            .map_err(|source| ImportError::Transport {
                context: context.clone(),
                source,
            })?;

        let fields: Map<String, Value> =
            serde_json::from_str(&body)
                .map_err(|source| ImportError::MalformedResponse { context, source })?;

        Ok(fields.into_iter().map(|(k, _)| k).collect())
    }
}

// Anything below 300 is success. Otherwise, we read the body for diagnostics and bail.
async fn check_response_status(response: Response, context: &str) -> Result<Response, ImportError> {
    let status = response.status().as_u16();
    if status < 300 {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ImportError::RemoteApi {
        context: context.to_string(),
        status,
        body,
    })
}

/// The form sent to the export endpoint: dates, then the event list and filter if present
pub fn export_params(config: &IngestionConfig) -> Vec<(String, String)> {
    let mut params = vec![
        ("from_date".to_string(), config.from_date().to_string()),
        ("to_date".to_string(), config.to_date().to_string()),
    ];

    if !config.events().is_empty() {
        let events = Value::from(config.events().to_vec());
        params.push(("event".to_string(), events.to_string()));
    }

    if let Some(filter) = config.filter() {
        params.push(("where".to_string(), filter.to_string()));
    }

    params
}
