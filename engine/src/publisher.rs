//! Publish contract and a channel-backed implementation.

use async_trait::async_trait;
use fxrelay_common::{PipelineId, Rate};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Message-bus sink used by the pipeline stages.
#[async_trait]
pub trait RatePublisher: Send + Sync {
    /// Emit a single raw rate.
    async fn publish_raw_rate(&self, rate: &Rate) -> EngineResult<()>;

    /// Emit a single calculated rate.
    async fn publish_calculated_rate(&self, rate: &Rate) -> EngineResult<()>;

    /// Emit the ordered snapshot records of one pipeline run.
    async fn publish_immediate_snapshot(
        &self,
        records: Vec<String>,
        pipeline_id: PipelineId,
    ) -> EngineResult<()>;
}

/// Event emitted by [`ChannelPublisher`].
#[derive(Debug, Clone, PartialEq)]
pub enum PublishedEvent {
    Raw(Rate),
    Calculated(Rate),
    Snapshot {
        pipeline_id: PipelineId,
        records: Vec<String>,
    },
}

/// Publisher forwarding every event onto an unbounded channel.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<PublishedEvent>,
}

impl ChannelPublisher {
    /// Create a publisher and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PublishedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: PublishedEvent) -> EngineResult<()> {
        self.tx
            .send(event)
            .map_err(|_| EngineError::Publish("receiver dropped".to_string()))
    }
}

#[async_trait]
impl RatePublisher for ChannelPublisher {
    async fn publish_raw_rate(&self, rate: &Rate) -> EngineResult<()> {
        self.send(PublishedEvent::Raw(rate.clone()))
    }

    async fn publish_calculated_rate(&self, rate: &Rate) -> EngineResult<()> {
        self.send(PublishedEvent::Calculated(rate.clone()))
    }

    async fn publish_immediate_snapshot(
        &self,
        records: Vec<String>,
        pipeline_id: PipelineId,
    ) -> EngineResult<()> {
        debug!(pipeline_id = %pipeline_id, records = records.len(), "Publishing snapshot");
        self.send(PublishedEvent::Snapshot {
            pipeline_id,
            records,
        })
    }
}

/// Shared publisher handle.
pub type SharedRatePublisher = Arc<dyn RatePublisher>;
