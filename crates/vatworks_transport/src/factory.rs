//! Worker construction.

use crate::error::TransportError;
use crate::local::{LocalWorker, VatDispatch};
use crate::subprocess::{SubprocessConfig, SubprocessWorker};
use crate::transport::WorkerTransport;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use vatworks_core::VatId;

/// Where a new worker gets its initial heap from
#[derive(Debug, Clone)]
pub enum WorkerSource {
    /// Evaluate a bundle from scratch
    Bundle {
        /// Bundle contents
        bundle: Arc<Value>,
        /// Parameters for `startVat`
        vat_parameters: Value,
    },
    /// Restore a heap snapshot
    Snapshot(Arc<Vec<u8>>),
}

/// Everything needed to start a worker
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Vat the worker will run
    pub vat_id: VatId,
    /// Initial heap
    pub source: WorkerSource,
}

impl WorkerSpec {
    /// Worker evaluating a bundle
    #[must_use]
    pub fn from_bundle(vat_id: VatId, bundle: Arc<Value>, vat_parameters: Value) -> Self {
        Self {
            vat_id,
            source: WorkerSource::Bundle {
                bundle,
                vat_parameters,
            },
        }
    }

    /// Worker restored from a snapshot
    #[must_use]
    pub fn from_snapshot(vat_id: VatId, snapshot: Vec<u8>) -> Self {
        Self {
            vat_id,
            source: WorkerSource::Snapshot(Arc::new(snapshot)),
        }
    }
}

/// Creates workers
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Start a worker
    ///
    /// # Errors
    ///
    /// Returns error if the worker cannot be started
    async fn create(&self, spec: WorkerSpec) -> Result<Box<dyn WorkerTransport>, TransportError>;
}

/// Starts subprocess workers
#[derive(Debug, Clone)]
pub struct SubprocessFactory {
    config: SubprocessConfig,
}

impl SubprocessFactory {
    /// Create a factory for a worker program
    #[must_use]
    pub fn new(config: SubprocessConfig) -> Self {
        Self { config }
    }

    /// Worker configuration
    #[must_use]
    pub fn config(&self) -> &SubprocessConfig {
        &self.config
    }
}

#[async_trait]
impl WorkerFactory for SubprocessFactory {
    async fn create(&self, spec: WorkerSpec) -> Result<Box<dyn WorkerTransport>, TransportError> {
        let worker = SubprocessWorker::start(self.config.clone(), spec).await?;
        Ok(Box::new(worker))
    }
}

/// Builds vat code for a [`WorkerSpec`]
pub type DispatchBuilder =
    dyn Fn(&WorkerSpec) -> Result<Box<dyn VatDispatch>, TransportError> + Send + Sync;

/// Starts in-process workers
#[derive(Clone)]
pub struct LocalFactory {
    build: Arc<DispatchBuilder>,
}

impl LocalFactory {
    /// Create a factory from a dispatch builder
    #[must_use]
    pub fn new<F>(build: F) -> Self
    where
        F: Fn(&WorkerSpec) -> Result<Box<dyn VatDispatch>, TransportError> + Send + Sync + 'static,
    {
        Self {
            build: Arc::new(build),
        }
    }
}

impl std::fmt::Debug for LocalFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFactory").finish_non_exhaustive()
    }
}

#[async_trait]
impl WorkerFactory for LocalFactory {
    async fn create(&self, spec: WorkerSpec) -> Result<Box<dyn WorkerTransport>, TransportError> {
        let dispatch = (self.build)(&spec)?;
        Ok(Box::new(LocalWorker::new(spec.vat_id, dispatch)))
    }
}
