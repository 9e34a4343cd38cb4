use std::time::Duration;

use anyhow::Error;
use envconfig::Envconfig;

use crate::{
    error::ImportError,
    job::config::{IngestionConfig, SinkConfig, DEFAULT_DATA_URL, DEFAULT_REST_API_URL},
};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "MIXPANEL_API_SECRET")]
    pub api_secret: String,

    // YYYY-MM-DD, both inclusive
    #[envconfig(from = "FROM_DATE")]
    pub from_date: String,

    #[envconfig(from = "TO_DATE")]
    pub to_date: String,

    // comma separated list of event names
    #[envconfig(from = "EVENTS", default = "")]
    pub events: String,

    #[envconfig(from = "FILTER", default = "")]
    pub filter: String,

    #[envconfig(from = "MIXPANEL_DATA_URL", default = "https://data.mixpanel.com/api/2.0/export")]
    pub data_url: String,

    #[envconfig(from = "MIXPANEL_REST_API_URL", default = "https://mixpanel.com")]
    pub rest_api_url: String,

    #[envconfig(from = "SCHEMA_BY_EVENTS", default = "false")]
    pub schema_by_events: bool,

    #[envconfig(from = "BATCH_SIZE", default = "1000")]
    pub batch_size: usize,

    // 0 means we don't set a timeout at all
    #[envconfig(from = "REQUEST_TIMEOUT_SECONDS", default = "0")]
    pub request_timeout_seconds: u64,

    // One of stdout, file, noop
    #[envconfig(from = "SINK", default = "stdout")]
    pub sink: String,

    #[envconfig(from = "SINK_FILE_PATH", default = "mixpanel_import.jsonl")]
    pub sink_file_path: String,

    // Remove any previous output at SINK_FILE_PATH before writing
    #[envconfig(from = "SINK_FILE_CLEANUP", default = "false")]
    pub sink_file_cleanup: bool,

    #[envconfig(from = "SINK_AS_JSON", default = "true")]
    pub sink_as_json: bool,
}

impl Config {
    pub fn ingestion_config(&self) -> Result<IngestionConfig, ImportError> {
        let timeout = match self.request_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        IngestionConfig::builder()
            .api_secret(self.api_secret.clone())
            .from_date(self.from_date.clone())
            .to_date(self.to_date.clone())
            .events(&self.events)
            .filter(self.filter.clone())
            .data_url(self.data_url.clone())
            .rest_api_url(self.rest_api_url.clone())
            .schema_by_events(self.schema_by_events)
            .request_timeout(timeout)
            .build()
    }

    pub fn sink_config(&self) -> Result<SinkConfig, Error> {
        match self.sink.as_str() {
            "stdout" => Ok(SinkConfig::Stdout {
                as_json: self.sink_as_json,
            }),
            "file" => Ok(SinkConfig::File {
                path: self.sink_file_path.clone(),
                as_json: self.sink_as_json,
                cleanup: self.sink_file_cleanup,
            }),
            "noop" => Ok(SinkConfig::NoOp),
            _ => Err(Error::msg(format!("Unknown sink: {}", self.sink))),
        }
    }
}
