//! Scripted transport for hardware-free testing.
//!
//! Each call to `acquire` consumes the next scripted link. A link replays its
//! steps in order and then stays open and silent.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;

use super::link::{ChunkSource, CommandSink, PortLink, PortProvider, ReadOutcome};
use crate::error::{DashError, Result};

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Read(ReadOutcome),
    /// Suspends the reader before the next step.
    Delay(Duration),
}

impl ScriptStep {
    pub fn data(bytes: &[u8]) -> Self {
        ScriptStep::Read(ReadOutcome::Data(bytes.to_vec()))
    }

    pub fn transient(msg: &str) -> Self {
        ScriptStep::Read(ReadOutcome::Transient(msg.to_string()))
    }

    pub fn closed() -> Self {
        ScriptStep::Read(ReadOutcome::Closed)
    }

    pub fn failed(msg: &str) -> Self {
        ScriptStep::Read(ReadOutcome::Failed(msg.to_string()))
    }
}

enum ScriptedLink {
    Refuse(String),
    Open(Vec<ScriptStep>),
}

#[derive(Default)]
struct ScriptInner {
    links: VecDeque<ScriptedLink>,
    written: Vec<u8>,
    acquisitions: usize,
    releases: usize,
    fail_writes: bool,
}

/// Mock port provider for unit and integration tests.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    inner: Arc<Mutex<ScriptInner>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a link that replays `steps`.
    pub fn push_link(&self, steps: Vec<ScriptStep>) -> &Self {
        self.lock().links.push_back(ScriptedLink::Open(steps));
        self
    }

    /// Queues an acquire attempt that fails.
    pub fn push_refusal(&self, reason: &str) -> &Self {
        self.lock()
            .links
            .push_back(ScriptedLink::Refuse(reason.to_string()));
        self
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Every byte written through any link so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    pub fn acquisitions(&self) -> usize {
        self.lock().acquisitions
    }

    /// Reader and writer halves released so far.
    pub fn releases(&self) -> usize {
        self.lock().releases
    }
}

#[async_trait]
impl PortProvider for ScriptedProvider {
    async fn acquire(&self) -> Result<PortLink> {
        let next = {
            let mut inner = self.lock();
            inner.acquisitions += 1;
            inner.links.pop_front()
        };

        match next {
            Some(ScriptedLink::Open(steps)) => {
                let n = self.acquisitions();
                Ok(PortLink {
                    description: format!("scripted link #{n}"),
                    reader: Box::new(ScriptedReader {
                        steps: steps.into(),
                        provider: self.clone(),
                    }),
                    writer: Box::new(ScriptedWriter {
                        provider: self.clone(),
                        released: false,
                    }),
                })
            }
            Some(ScriptedLink::Refuse(reason)) => Err(DashError::Connection(reason)),
            None => Err(DashError::Connection("no port selected".into())),
        }
    }
}

struct ScriptedReader {
    steps: VecDeque<ScriptStep>,
    provider: ScriptedProvider,
}

#[async_trait]
impl ChunkSource for ScriptedReader {
    async fn next_chunk(&mut self) -> ReadOutcome {
        loop {
            match self.steps.pop_front() {
                Some(ScriptStep::Read(outcome)) => return outcome,
                Some(ScriptStep::Delay(d)) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        }
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        self.provider.lock().releases += 1;
        Ok(())
    }
}

struct ScriptedWriter {
    provider: ScriptedProvider,
    released: bool,
}

#[async_trait]
impl CommandSink for ScriptedWriter {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.released {
            return Err(DashError::NotConnected);
        }
        let mut inner = self.provider.lock();
        if inner.fail_writes {
            return Err(DashError::Command("port is not writable".into()));
        }
        inner.written.extend_from_slice(bytes);
        Ok(())
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        self.released = true;
        self.provider.lock().releases += 1;
        Ok(())
    }
}
