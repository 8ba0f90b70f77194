use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::infrastructure::instrument_catalog::{InstrumentCatalogTrait, StagedInstrument, IMPORT_ACTOR};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub staged: i64,
    pub batches: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Copies the staged instrument catalogue into securities, one page at a
/// time so memory stays bounded by `batch_size`.
pub struct BulkImportProcessor {
    catalog: Arc<dyn InstrumentCatalogTrait>,
    batch_size: i64,
}

impl BulkImportProcessor {
    pub fn new(catalog: Arc<dyn InstrumentCatalogTrait>, batch_size: i64) -> Self {
        Self {
            catalog,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(&self, job_id: i64, reference_id: &str) -> Result<ImportSummary> {
        let staged = self.catalog.count_staged().await?;
        info!(
            "Starting bulk import for job {} ({}) as {}: {} staged instruments, batch size {}",
            job_id, reference_id, IMPORT_ACTOR, staged, self.batch_size
        );

        let mut summary = ImportSummary {
            staged,
            ..Default::default()
        };
        let mut offset = 0;
        while offset < staged {
            let page = self.catalog.fetch_staged(offset, self.batch_size).await?;
            if page.is_empty() {
                break;
            }
            summary.batches += 1;

            let (valid, invalid): (Vec<StagedInstrument>, Vec<StagedInstrument>) =
                page.into_iter().partition(|i| i.validate().is_ok());
            for instrument in &invalid {
                if let Err(reason) = instrument.validate() {
                    warn!("Skipping staged instrument: {}", reason);
                }
            }
            summary.skipped += invalid.len();

            let counts = self.catalog.upsert_securities(&valid).await?;
            summary.created += counts.created;
            summary.updated += counts.updated;
            debug!(
                "Batch {} of job {}: created {}, updated {}, skipped {}",
                summary.batches,
                job_id,
                counts.created,
                counts.updated,
                invalid.len()
            );

            offset += self.batch_size;
        }

        info!(
            "Bulk import for job {} finished: {} created, {} updated, {} skipped in {} batches",
            job_id, summary.created, summary.updated, summary.skipped, summary.batches
        );
        Ok(summary)
    }
}
