use std::{sync::Arc, time::Duration};

use anyhow::Error;
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, sync::Mutex};
use tracing::info;

use crate::parse::record::Record;

#[async_trait]
pub trait Emitter: Send + Sync {
    async fn begin_write<'a>(&'a mut self) -> Result<Box<dyn Transaction<'a> + 'a>, Error>;
}

#[async_trait]
pub trait Transaction<'a>: Send + Sync {
    async fn emit(&self, data: &[Record]) -> Result<(), Error>;

    // Commits return a delay to wait before the next commit start
    async fn commit_write(self: Box<Self>) -> Result<Duration, Error> {
        Ok(Duration::from_secs(0))
    }
}

fn render(record: &Record, as_json: bool) -> Result<String, Error> {
    if as_json {
        Ok(serde_json::to_string(record)?)
    } else {
        Ok(format!("{record:?}"))
    }
}

pub struct StdoutEmitter {
    pub as_json: bool,
}

#[async_trait]
impl Emitter for StdoutEmitter {
    async fn begin_write<'a>(&'a mut self) -> Result<Box<dyn Transaction<'a> + 'a>, Error> {
        let to_store: &'a Self = self;
        Ok(Box::new(to_store))
    }
}

#[async_trait]
impl<'a> Transaction<'a> for &'a StdoutEmitter {
    async fn emit(&self, data: &[Record]) -> Result<(), Error> {
        for record in data {
            println!("{}", render(record, self.as_json)?);
        }
        Ok(())
    }
}

pub struct NoOpEmitter;

#[async_trait]
impl Emitter for NoOpEmitter {
    async fn begin_write<'a>(&'a mut self) -> Result<Box<dyn Transaction<'a> + 'a>, Error> {
        let to_store: &'a Self = self;
        Ok(Box::new(to_store))
    }
}

#[async_trait]
impl<'a> Transaction<'a> for &'a NoOpEmitter {
    async fn emit(&self, _data: &[Record]) -> Result<(), Error> {
        Ok(())
    }
}

pub struct FileEmitter {
    pub path: String,
    pub as_json: bool,
}

impl FileEmitter {
    pub async fn new(path: String, as_json: bool, cleanup: bool) -> Result<Self, Error> {
        info!("Creating file emitter at {}", path);
        if cleanup {
            tokio::fs::remove_file(&path).await.ok();
        }
        Ok(Self { path, as_json })
    }
}

#[async_trait]
impl Emitter for FileEmitter {
    async fn begin_write<'a>(&'a mut self) -> Result<Box<dyn Transaction<'a> + 'a>, Error> {
        let to_store: &'a Self = self;
        Ok(Box::new(to_store))
    }
}

#[async_trait]
impl<'a> Transaction<'a> for &'a FileEmitter {
    async fn emit(&self, data: &[Record]) -> Result<(), Error> {
        info!("Writing {} records to file {}", data.len(), self.path);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        for record in data {
            let line = format!("{}\n", render(record, self.as_json)?);
            file.write_all(line.as_bytes()).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// Keeps every committed record in memory. Records emitted in a transaction only become
/// visible once it commits. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryEmitter {
    records: Arc<Mutex<Vec<Record>>>,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<Record> {
        self.records.lock().await.clone()
    }
}

pub struct MemoryTransaction<'a> {
    emitter: &'a MemoryEmitter,
    pending: Mutex<Vec<Record>>,
}

#[async_trait]
impl Emitter for MemoryEmitter {
    async fn begin_write<'a>(&'a mut self) -> Result<Box<dyn Transaction<'a> + 'a>, Error> {
        Ok(Box::new(MemoryTransaction {
            emitter: self,
            pending: Mutex::new(Vec::new()),
        }))
    }
}

#[async_trait]
impl<'a> Transaction<'a> for MemoryTransaction<'a> {
    async fn emit(&self, data: &[Record]) -> Result<(), Error> {
        self.pending.lock().await.extend_from_slice(data);
        Ok(())
    }

    async fn commit_write(self: Box<Self>) -> Result<Duration, Error> {
        let pending = self.pending.into_inner();
        self.emitter.records.lock().await.extend(pending);
        Ok(Duration::from_secs(0))
    }
}
