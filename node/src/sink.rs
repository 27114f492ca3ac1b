//! Consumer of published events.
//!
//! Stands in for the message bus: every snapshot is logged and the latest
//! record per identifier is kept for inspection.

use std::sync::Arc;

use dashmap::DashMap;
use fxrelay_engine::PublishedEvent;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::metrics::SharedMetrics;

/// Logs published events and remembers the newest snapshot records.
pub struct SnapshotSink {
    latest: DashMap<String, String>,
    metrics: SharedMetrics,
}

impl SnapshotSink {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self {
            latest: DashMap::new(),
            metrics,
        }
    }

    /// Handle one event.
    pub fn consume(&self, event: PublishedEvent) {
        match event {
            PublishedEvent::Raw(rate) => {
                debug!(symbol = %rate.symbol, provider = rate.provider(), "Raw rate published");
            }
            PublishedEvent::Calculated(rate) => {
                debug!(
                    symbol = %rate.symbol,
                    rate_type = %rate.rate_type,
                    strategy = rate.calculated_by_strategy.as_deref().unwrap_or(""),
                    "Calculated rate published"
                );
            }
            PublishedEvent::Snapshot {
                pipeline_id,
                records,
            } => {
                info!(pipeline_id = %pipeline_id, records = records.len(), snapshot = %records.join(";"), "Snapshot published");
                self.metrics.snapshot_published(records.len());
                for record in records {
                    if let Some((id, _)) = record.split_once('|') {
                        self.latest.insert(id.to_string(), record.clone());
                    }
                }
            }
        }
    }

    /// Newest record for a snapshot identifier (`PF1-USDTRY`, `USDTRY_AVG`).
    pub fn latest(&self, identifier: &str) -> Option<String> {
        self.latest.get(identifier).map(|r| r.value().clone())
    }

    /// Identifiers seen so far, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.latest.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Drain `events` until every sender is gone.
    pub fn spawn(self: &Arc<Self>, mut events: UnboundedReceiver<PublishedEvent>) -> JoinHandle<()> {
        let sink = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                sink.consume(event);
            }
            debug!("Publish channel closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use fxrelay_common::PipelineId;

    #[test]
    fn test_keeps_latest_record_per_identifier() {
        let metrics = Arc::new(Metrics::new());
        let sink = SnapshotSink::new(Arc::clone(&metrics));

        sink.consume(PublishedEvent::Snapshot {
            pipeline_id: PipelineId::new(),
            records: vec![
                "PF1-USDTRY|34.10000|34.12000|2024-05-01T10:00:00.000Z".to_string(),
                "USDTRY_AVG|34.09000|34.13000|2024-05-01T10:00:00.000Z".to_string(),
            ],
        });
        sink.consume(PublishedEvent::Snapshot {
            pipeline_id: PipelineId::new(),
            records: vec!["USDTRY_AVG|34.10000|34.14000|2024-05-01T10:00:01.000Z".to_string()],
        });

        assert_eq!(
            sink.latest("USDTRY_AVG").as_deref(),
            Some("USDTRY_AVG|34.10000|34.14000|2024-05-01T10:00:01.000Z")
        );
        assert_eq!(sink.identifiers(), vec!["PF1-USDTRY", "USDTRY_AVG"]);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.snapshots_published, 2);
        assert_eq!(snapshot.snapshot_records, 3);
    }
}
