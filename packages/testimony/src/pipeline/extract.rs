//! Extraction stage driver.
//!
//! Groups stored documents into units, runs the agent over several units at
//! once and writes what it produces. Sources that already have records are
//! skipped, so an interrupted run resumes where it stopped.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{ConfigError, Result};
use crate::pipeline::agent::{ExtractionAgent, UnitOutcome};
use crate::traits::{
    reasoner::Reasoner,
    store::{RawStore, RecordStore},
};
use crate::types::{config::ExtractConfig, record::StructuredRecord};

/// Counts for one extraction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    /// Documents in the raw store
    pub sources: usize,
    /// Documents skipped because they already have records
    pub skipped: usize,
    pub units: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub records_written: usize,
    /// The run stopped on cancellation
    pub cancelled: bool,
}

enum UnitResult {
    Accepted { records: usize },
    Rejected,
    NotStarted,
}

/// Drives the extraction agent over the raw store.
pub struct ExtractionStage<R, S, O> {
    agent: ExtractionAgent<R>,
    raw: Arc<S>,
    records: Arc<O>,
    config: ExtractConfig,
}

impl<R, S, O> ExtractionStage<R, S, O>
where
    R: Reasoner,
    S: RawStore,
    O: RecordStore,
{
    pub fn new(
        reasoner: R,
        raw: Arc<S>,
        records: Arc<O>,
        config: ExtractConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let agent = ExtractionAgent::new(reasoner, config.agent.clone())?;
        Ok(Self {
            agent,
            raw,
            records,
            config,
        })
    }

    /// Extract every stored document that has no records yet.
    ///
    /// Rejected units are recorded and counted; only fatal reasoner or
    /// store failures are returned as errors. Units not yet started when
    /// `cancel` fires are left for the next run.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ExtractionSummary> {
        let mut summary = ExtractionSummary::default();

        let hashes = self.raw.list_hashes().await?;
        summary.sources = hashes.len();

        let mut pending = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if !self.config.reextract && self.records.has_records(&hash).await? {
                summary.skipped += 1;
                continue;
            }
            pending.push(hash);
        }

        let units: Vec<Vec<String>> = pending
            .chunks(self.config.documents_per_unit)
            .map(<[String]>::to_vec)
            .collect();
        summary.units = units.len();
        info!(
            sources = summary.sources,
            skipped = summary.skipped,
            units = summary.units,
            concurrency = self.config.concurrency,
            "Extraction starting"
        );

        let mut results = stream::iter(units)
            .map(|unit| self.process(unit, cancel))
            .buffer_unordered(self.config.concurrency);

        while let Some(result) = results.next().await {
            match result? {
                UnitResult::Accepted { records } => {
                    summary.accepted += 1;
                    summary.records_written += records;
                }
                UnitResult::Rejected => summary.rejected += 1,
                UnitResult::NotStarted => {}
            }
        }

        summary.cancelled = cancel.is_cancelled();
        info!(
            accepted = summary.accepted,
            rejected = summary.rejected,
            records = summary.records_written,
            cancelled = summary.cancelled,
            "Extraction finished"
        );
        Ok(summary)
    }

    async fn process(&self, unit: Vec<String>, cancel: &CancellationToken) -> Result<UnitResult> {
        if cancel.is_cancelled() {
            return Ok(UnitResult::NotStarted);
        }

        let mut documents = Vec::with_capacity(unit.len());
        for hash in &unit {
            documents.push(self.raw.get(hash).await?);
        }

        match self.agent.run(&documents).await? {
            UnitOutcome::Accepted { records, .. } => {
                // Every document gets a batch, empty ones included
                for hash in &unit {
                    let batch: Vec<StructuredRecord> = records
                        .iter()
                        .filter(|r| &r.source_hash == hash)
                        .cloned()
                        .collect();
                    self.records.put_records(hash, &batch).await?;
                }
                Ok(UnitResult::Accepted {
                    records: records.len(),
                })
            }
            UnitOutcome::Rejected(rejection) => {
                self.records.record_rejection(&rejection).await?;
                Ok(UnitResult::Rejected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{MemoryRawStore, MemoryRecordStore};
    use crate::testing::{valid_draft, MockReasoner};
    use crate::traits::reasoner::Action;
    use crate::types::config::{AgentConfig, RetryPolicy};

    const STORY: &str = "I have lived with ME/CFS since 2018.\n\nSome days I cannot lift the kettle.";

    fn config() -> ExtractConfig {
        ExtractConfig::new()
            .with_concurrency(2)
            .with_agent(AgentConfig::new().with_reasoner_retry(RetryPolicy::immediate(2)))
    }

    fn reasoner() -> MockReasoner {
        MockReasoner::new()
            .then_actions([Action::Read { start: 0, end: 30 }, Action::Finish])
            .with_draft_fn(|_| Ok(vec![valid_draft(0..20)]))
    }

    #[tokio::test]
    async fn test_extracts_and_skips_on_rerun() {
        let raw = Arc::new(MemoryRawStore::new());
        let hash = raw.put("https://forum.example/t/1", STORY).await.unwrap();
        let records = Arc::new(MemoryRecordStore::new());

        let stage = ExtractionStage::new(reasoner(), raw.clone(), records.clone(), config()).unwrap();
        let summary = stage.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.records_written, 1);
        assert_eq!(records.records(&hash).await.unwrap()[0].source_hash, hash);

        let summary = stage.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.units, 0);
    }

    #[tokio::test]
    async fn test_rejection_is_recorded_and_retried_next_run() {
        let raw = Arc::new(MemoryRawStore::new());
        let hash = raw.put("https://forum.example/t/1", STORY).await.unwrap();
        let records = Arc::new(MemoryRecordStore::new());

        // Finishes without reading anything
        let stage = ExtractionStage::new(
            MockReasoner::new().then_action(Action::Finish),
            raw.clone(),
            records.clone(),
            config(),
        )
        .unwrap();
        let summary = stage.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.rejected, 1);
        assert!(!records.has_records(&hash).await.unwrap());
        assert_eq!(records.rejections().await.unwrap().len(), 1);

        let stage = ExtractionStage::new(reasoner(), raw, records.clone(), config()).unwrap();
        assert_eq!(stage.run(&CancellationToken::new()).await.unwrap().accepted, 1);
        assert!(records.rejections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_unit_is_recorded_for_each_document() {
        let raw = Arc::new(MemoryRawStore::new());
        let first = raw.put("https://forum.example/t/1", STORY).await.unwrap();
        let second = raw
            .put("https://forum.example/t/2", "Diagnosed with POTS in 2021.")
            .await
            .unwrap();
        let records = Arc::new(MemoryRecordStore::new());

        let stage = ExtractionStage::new(
            MockReasoner::new().then_action(Action::Finish),
            raw,
            records.clone(),
            config().with_documents_per_unit(2),
        )
        .unwrap();
        let summary = stage.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.units, 1);
        assert_eq!(summary.rejected, 1);

        let on_first = records.rejection(&first).await.unwrap().unwrap();
        let on_second = records.rejection(&second).await.unwrap().unwrap();
        assert_eq!(on_first, on_second);
        assert_eq!(on_first.source_hashes.len(), 2);
        assert_eq!(records.rejections().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_document_without_cases_is_marked_processed() {
        let raw = Arc::new(MemoryRawStore::new());
        let hash = raw.put("https://forum.example/t/1", STORY).await.unwrap();
        let records = Arc::new(MemoryRecordStore::new());

        let reasoner = MockReasoner::new().then_action(Action::Read { start: 0, end: 10 });
        let stage = ExtractionStage::new(reasoner, raw, records.clone(), config()).unwrap();
        let summary = stage.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.records_written, 0);
        assert!(records.has_records(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let raw = Arc::new(MemoryRawStore::new());
        raw.put("https://forum.example/t/1", STORY).await.unwrap();
        let records = Arc::new(MemoryRecordStore::new());

        let stage = ExtractionStage::new(reasoner(), raw, records, config()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = stage.run(&cancel).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.accepted + summary.rejected, 0);
    }
}
