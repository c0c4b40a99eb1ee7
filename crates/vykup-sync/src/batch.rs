//! Paged recompute over the whole customer base.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use vykup_core::BuyoutFormula;
use vykup_crm::PageLimit;

use crate::{BuyoutService, Reconciliation};

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub formula: BuyoutFormula,
    pub pages_fetched: u32,
    pub processed: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Default)]
struct Counters {
    pages_fetched: u32,
    processed: usize,
    updated: usize,
    skipped: usize,
    errors: usize,
}

impl BuyoutService {
    /// Recompute every customer, page by page, until a short page comes
    /// back or `max_customers` have been processed.
    ///
    /// Per-customer failures are counted and the run moves on. A failed
    /// customer-page fetch ends the run; the summary is returned either way.
    pub async fn recompute_all(&self, max_customers: usize, page_size: u32) -> BatchSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let limit = PageLimit::normalize(page_size);
        let span = info_span!("recompute_all", %run_id, max_customers, page_size = limit.get());

        let counters = self.run_pages(max_customers, limit).instrument(span).await;

        let summary = BatchSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            formula: self.settings.formula,
            pages_fetched: counters.pages_fetched,
            processed: counters.processed,
            updated: counters.updated,
            skipped: counters.skipped,
            errors: counters.errors,
        };
        info!(
            %run_id,
            pages = summary.pages_fetched,
            processed = summary.processed,
            updated = summary.updated,
            skipped = summary.skipped,
            errors = summary.errors,
            "recompute finished"
        );
        summary
    }

    async fn run_pages(&self, max_customers: usize, limit: PageLimit) -> Counters {
        let mut counters = Counters::default();
        let mut page = 1u32;

        'pages: while counters.processed < max_customers {
            let customers = match self.gateway.list_customers(page, limit).await {
                Ok(customers) => customers,
                Err(err) => {
                    warn!(page, error = %err, "customer page fetch failed; ending run");
                    counters.errors += 1;
                    break;
                }
            };
            counters.pages_fetched += 1;
            debug!(
                page,
                rows = customers.items.len(),
                total = ?customers.total_count,
                "customer page fetched"
            );

            for customer in &customers.items {
                if counters.processed >= max_customers {
                    break 'pages;
                }
                counters.processed += 1;
                debug!(customer_id = customer.id, name = %customer.display_name(), "recomputing customer");

                match self.reconcile(customer, customer.site.as_ref()).await {
                    Ok(Reconciliation::Written { .. }) => counters.updated += 1,
                    Ok(Reconciliation::NoUsableIdentity) => {
                        debug!(customer_id = customer.id, "no id or email to look orders up by; skipped");
                        counters.skipped += 1;
                    }
                    Ok(Reconciliation::NoHistory(_)) => counters.skipped += 1,
                    Ok(Reconciliation::WriteFailed { .. }) => counters.errors += 1,
                    Err(err) => {
                        warn!(customer_id = customer.id, error = %err, "customer recompute failed");
                        counters.errors += 1;
                    }
                }
            }

            if customers.is_last() {
                break;
            }
            page += 1;
            if !self.settings.page_delay.is_zero() {
                tokio::time::sleep(self.settings.page_delay).await;
            }
        }

        counters
    }
}
