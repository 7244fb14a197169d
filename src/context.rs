use anyhow::{Context, Result};
use log::info;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt;
use std::sync::Arc;

const DEFAULT_CHUNK_SIZE: usize = 64;

/// Opaque handle describing where model work runs.
#[derive(Clone)]
pub struct ExecutionContext {
    device: String,
    pool: Arc<ThreadPool>,
    chunk_size: usize,
}

impl ExecutionContext {
    pub fn new<S: Into<String>>(device: S, threads: usize, chunk_size: usize) -> Result<Self> {
        let threads = threads.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("forecaster-worker-{idx}"))
            .build()
            .context("Failed to build worker pool")?;
        Ok(Self {
            device: device.into(),
            pool: Arc::new(pool),
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn cpu() -> Result<Self> {
        Self::new("cpu", 1, DEFAULT_CHUNK_SIZE)
    }

    pub fn device_label(&self) -> &str {
        &self.device
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Number of training windows evaluated per parallel gradient task.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("device", &self.device)
            .field("threads", &self.threads())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

pub trait CapabilityProbe {
    fn detect(&self) -> Result<ExecutionContext>;
}

#[derive(Debug, Clone, Default)]
pub struct HostProbe {
    pub preferred_device: Option<String>,
    pub worker_threads: Option<usize>,
}

impl CapabilityProbe for HostProbe {
    fn detect(&self) -> Result<ExecutionContext> {
        let device = self
            .preferred_device
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("cpu")
            .to_string();
        let threads = self
            .worker_threads
            .filter(|threads| *threads > 0)
            .unwrap_or_else(|| std::cmp::max(1, num_cpus::get()));
        let context = ExecutionContext::new(device, threads, DEFAULT_CHUNK_SIZE)?;
        info!(
            "Execution context: device={} threads={}",
            context.device_label(),
            context.threads()
        );
        Ok(context)
    }
}
