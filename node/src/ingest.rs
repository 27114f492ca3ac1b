//! JSON-lines tick ingress.
//!
//! One `Rate` object per line, e.g.
//! `{"symbol":"PF1_USDTRY","bid":"34.08","ask":"34.12","timestamp":1714557600000,"providerName":"PF1","rateType":"RAW"}`.
//! Blank lines and lines starting with `#` are skipped.

use fxrelay_common::Rate;
use fxrelay_engine::AcceptOutcome;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::error::{NodeError, NodeResult};
use crate::service::RateService;

/// Totals for one ingestion session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub lines: u64,
    pub malformed: u64,
    pub triggered: u64,
}

/// Parse one line. `Ok(None)` for lines carrying no tick.
pub fn parse_line(line: &str) -> Result<Option<Rate>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Feed every line of `reader` into the service until EOF or shutdown.
pub async fn run_json_lines<R>(service: &RateService, reader: R) -> NodeResult<IngestSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = IngestSummary::default();

    while let Some(line) = lines.next_line().await? {
        summary.lines += 1;
        let rate = match parse_line(&line) {
            Ok(Some(rate)) => rate,
            Ok(None) => continue,
            Err(e) => {
                summary.malformed += 1;
                warn!(line = summary.lines, error = %e, "Malformed tick");
                continue;
            }
        };

        match service.ingest(rate).await {
            Ok(AcceptOutcome::Triggered { providers }) => {
                summary.triggered += 1;
                debug!(line = summary.lines, providers, "Window triggered");
            }
            Ok(_) => {}
            Err(NodeError::NotRunning(state)) => {
                debug!(?state, "Ingestion stopped");
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(summary)
}
