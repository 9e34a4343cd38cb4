use std::sync::Arc;

use anyhow::Error;
use metrics::counter;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{
    emit::Emitter,
    error::{with_user_message, ImportError},
    parse::{
        record::{map_line, Record},
        schema::{infer_schema, OutputSchema, PropertyCatalogue},
    },
    source::{export_params, EventStream, MixpanelApi},
};

use config::IngestionConfig;

pub mod config;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

const LINES_READ: &str = "mixpanel_import_lines_read";
const RECORDS_EMITTED: &str = "mixpanel_import_records_emitted";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub lines_read: usize,
    pub records_emitted: usize,
    pub batches: usize,
}

/// One import run: infer the schema once, then pull the export stream line by line,
/// map each line against that schema, and hand the records to the sink in batches.
pub struct ImportJob {
    pub config: IngestionConfig,
    pub api: MixpanelApi,
    pub sink: Box<dyn Emitter>,
    batch_size: usize,
    // Computed on first use, then shared read-only for the rest of the run
    schema: OnceCell<Arc<OutputSchema>>,
}

impl ImportJob {
    pub fn new(config: IngestionConfig, sink: Box<dyn Emitter>) -> Self {
        let api = MixpanelApi::from_config(&config);
        Self {
            config,
            api,
            sink,
            batch_size: DEFAULT_BATCH_SIZE,
            schema: OnceCell::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn schema(&self) -> Result<Arc<OutputSchema>, ImportError> {
        self.schema
            .get_or_try_init(|| async {
                let catalogue: &dyn PropertyCatalogue = &self.api;
                infer_schema(&self.config, catalogue).await.map(Arc::new)
            })
            .await
            .cloned()
    }

    pub async fn run(mut self) -> Result<ImportSummary, Error> {
        info!(
            "Starting import from {} to {}, schema by events: {}",
            self.config.from_date(),
            self.config.to_date(),
            self.config.schema_by_events()
        );

        let schema = with_user_message(self.schema().await)?;
        info!("Using schema with fields {:?}", schema.field_names());

        let params = export_params(&self.config);
        let mut stream = with_user_message(self.api.open_event_stream(&params).await)?;

        let summary = self.drain_and_close(&mut stream, &schema).await?;
        info!(
            "Import complete: {} lines read, {} records emitted in {} batches",
            summary.lines_read, summary.records_emitted, summary.batches
        );
        Ok(summary)
    }

    // The stream is released whichever way draining ends. Close also runs on drop, but we
    // want the connection gone before we report back.
    async fn drain_and_close(
        &mut self,
        stream: &mut EventStream,
        schema: &OutputSchema,
    ) -> Result<ImportSummary, Error> {
        let result = self.drain(stream, schema).await;
        stream.close();
        result
    }

    async fn drain(
        &mut self,
        stream: &mut EventStream,
        schema: &OutputSchema,
    ) -> Result<ImportSummary, Error> {
        let mut summary = ImportSummary::default();
        let mut batch = Vec::with_capacity(self.batch_size);

        while with_user_message(stream.has_next().await)? {
            let line = with_user_message(stream.next_line().await)?;
            summary.lines_read += 1;
            counter!(LINES_READ).increment(1);

            batch.push(with_user_message(map_line(&line, schema))?);

            if batch.len() >= self.batch_size {
                self.emit_batch(&mut batch, &mut summary).await?;
            }
        }

        if !batch.is_empty() {
            self.emit_batch(&mut batch, &mut summary).await?;
        }

        Ok(summary)
    }

    async fn emit_batch(
        &mut self,
        batch: &mut Vec<Record>,
        summary: &mut ImportSummary,
    ) -> Result<(), Error> {
        let txn = self.sink.begin_write().await?;
        txn.emit(batch).await?;
        let delay = txn.commit_write().await?;

        summary.records_emitted += batch.len();
        summary.batches += 1;
        counter!(RECORDS_EMITTED).increment(batch.len() as u64);
        debug!("Committed batch of {} records", batch.len());
        batch.clear();

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}
