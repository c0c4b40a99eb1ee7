//! Order history aggregation.

use tracing::{debug, instrument, warn};
use vykup_core::{HistoryKey, OrderTally};
use vykup_crm::{CrmGateway, PageLimit};

use crate::BuyoutError;

pub struct HistoryAggregator<'a> {
    gateway: &'a dyn CrmGateway,
    limit: PageLimit,
}

impl<'a> HistoryAggregator<'a> {
    pub fn new(gateway: &'a dyn CrmGateway, limit: PageLimit) -> Self {
        Self { gateway, limit }
    }

    /// Walk every page of the customer's orders and classify each one.
    ///
    /// Pages are fetched one after another starting at 1 until a page comes
    /// back shorter than the limit; the provider's total count is not
    /// consulted. A failed page aborts the walk, partial tallies are never
    /// returned.
    #[instrument(skip_all, fields(%key, limit = self.limit.get()))]
    pub async fn aggregate(&self, key: &HistoryKey) -> Result<OrderTally, BuyoutError> {
        let mut tally = OrderTally::default();
        let mut page = 1u32;

        loop {
            let orders = match self.gateway.list_orders(page, self.limit, key).await {
                Ok(orders) => orders,
                Err(source) => {
                    warn!(%key, page, error = %source, "order page fetch failed");
                    return Err(BuyoutError::TransientFetch {
                        context: format!("orders for {key}, page {page}"),
                        source,
                    });
                }
            };

            for order in &orders.items {
                tally.record(&order.status);
            }
            debug!(%key, page, rows = orders.items.len(), "order page aggregated");

            if orders.is_last() {
                break;
            }
            page += 1;
        }

        Ok(tally)
    }
}
