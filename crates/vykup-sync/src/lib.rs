//! Buyout-rate reconciliation: identity resolution, order history
//! aggregation, write-back and batch recompute.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use vykup_core::{BuyoutFormula, BuyoutMetric, Customer, HistoryKey, HistoryKeyKind, OrderTally, Site, SiteList};
use vykup_crm::{CrmClientConfig, CrmError, CrmGateway, PageLimit, RetailCrmClient};

pub mod batch;
pub mod history;
pub mod identity;
pub mod resolver;
pub mod writer;

pub use batch::BatchSummary;
pub use identity::{CustomerIdentity, IdentityInput};
pub use writer::WriteReceipt;

pub const CRATE_NAME: &str = "vykup-sync";

pub const DEFAULT_FIELD_CODE: &str = "vykup";

/// Daily at 03:00. The scheduler's cron dialect starts with a seconds field.
pub const DEFAULT_RECOMPUTE_CRON: &str = "0 0 3 * * *";

#[derive(Debug, Error)]
pub enum BuyoutError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("{identity} not found: {detail}")]
    IdentityNotFound { identity: String, detail: String },
    #[error("fetch failed for {context}: {source}")]
    TransientFetch {
        context: String,
        #[source]
        source: CrmError,
    },
    #[error("all {attempts} write attempts failed for customer {customer_id}{}", last_error_suffix(.last_error))]
    WriteCascadeExhausted {
        customer_id: i64,
        attempts: usize,
        last_error: Option<CrmError>,
    },
}

fn last_error_suffix(last_error: &Option<CrmError>) -> String {
    last_error
        .as_ref()
        .map(|err| format!(" (last error: {err})"))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteRegistry {
    pub sites: SiteList,
}

impl SiteRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing site registry")
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }
}

/// Knobs of the reconciliation core itself, independent of transport.
#[derive(Debug, Clone)]
pub struct BuyoutSettings {
    pub sites: SiteList,
    pub formula: BuyoutFormula,
    pub history_key: HistoryKeyKind,
    pub field_code: String,
    pub order_page_limit: PageLimit,
    /// Pause between customer pages of a batch run.
    pub page_delay: Duration,
}

impl BuyoutSettings {
    pub fn new(sites: SiteList) -> Self {
        Self {
            sites,
            formula: BuyoutFormula::default(),
            history_key: HistoryKeyKind::default(),
            field_code: DEFAULT_FIELD_CODE.to_string(),
            order_page_limit: PageLimit::MAX,
            page_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub crm: CrmClientConfig,
    pub settings: BuyoutSettings,
    pub max_customers: usize,
    pub customer_page_size: u32,
    pub scheduler_enabled: bool,
    pub recompute_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let base_url = var("RETAILCRM_URL").ok_or_else(|| anyhow!("RETAILCRM_URL must be set"))?;
        let api_key = var("RETAILCRM_API_KEY").ok_or_else(|| anyhow!("RETAILCRM_API_KEY must be set"))?;

        let sites = match var("RETAILCRM_SITES") {
            Some(csv) => SiteList::parse_csv(&csv).context("parsing RETAILCRM_SITES")?,
            None => {
                let path = var("VYKUP_SITES_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("sites.yaml"));
                SiteRegistry::load(&path)
                    .context("no RETAILCRM_SITES set and the site registry could not be loaded")?
                    .sites
            }
        };

        let mut crm = CrmClientConfig::new(base_url, SecretString::from(api_key));
        crm.timeout = Duration::from_secs(parse_or(&var, "VYKUP_HTTP_TIMEOUT_SECS", 30)?);
        crm.user_agent = Some(var("VYKUP_USER_AGENT").unwrap_or_else(|| "vykup-sync/0.1".to_string()));

        let mut settings = BuyoutSettings::new(sites);
        if let Some(formula) = var("VYKUP_FORMULA") {
            settings.formula = formula.parse().map_err(|e: String| anyhow!(e)).context("VYKUP_FORMULA")?;
        }
        if let Some(kind) = var("VYKUP_HISTORY_KEY") {
            settings.history_key = kind.parse().map_err(|e: String| anyhow!(e)).context("VYKUP_HISTORY_KEY")?;
        }
        if let Some(code) = var("VYKUP_FIELD") {
            settings.field_code = code;
        }
        settings.order_page_limit = PageLimit::normalize(parse_or(&var, "VYKUP_ORDER_PAGE_SIZE", 100)?);
        settings.page_delay = Duration::from_millis(parse_or(&var, "VYKUP_PAGE_DELAY_MS", 500)?);

        Ok(Self {
            crm,
            settings,
            max_customers: parse_or(&var, "VYKUP_MAX_CUSTOMERS", 100)?,
            customer_page_size: parse_or(&var, "VYKUP_PAGE_SIZE", 20)?,
            scheduler_enabled: var("VYKUP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            recompute_cron: var("VYKUP_RECOMPUTE_CRON").unwrap_or_else(|| DEFAULT_RECOMPUTE_CRON.to_string()),
        })
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| anyhow!("invalid {key}={raw}: {e}")),
        None => Ok(default),
    }
}

/// Outcome of one customer's recompute.
#[derive(Debug)]
pub enum Reconciliation {
    /// Neither an ID nor an email to pull orders by.
    NoUsableIdentity,
    /// No completed, canceled or returned orders; nothing is written.
    NoHistory(OrderTally),
    Written {
        metric: BuyoutMetric,
        tally: OrderTally,
        receipt: WriteReceipt,
    },
    WriteFailed {
        metric: BuyoutMetric,
        tally: OrderTally,
        error: BuyoutError,
    },
}

/// Result of a single-customer trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerBuyoutReport {
    pub customer_id: i64,
    pub site: Option<Site>,
    pub formula: BuyoutFormula,
    pub percent: u32,
    pub completed: u32,
    pub canceled: u32,
    pub returned: u32,
    pub total_orders: u32,
    pub updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct BuyoutService {
    gateway: Arc<dyn CrmGateway>,
    settings: BuyoutSettings,
}

impl BuyoutService {
    pub fn new(gateway: Arc<dyn CrmGateway>, settings: BuyoutSettings) -> Self {
        Self { gateway, settings }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let client = RetailCrmClient::new(config.crm.clone())?;
        Ok(Self::new(Arc::new(client), config.settings.clone()))
    }

    /// Recompute and write back the buyout rate of one customer.
    ///
    /// Identity and history errors are returned as `Err`. A failed write
    /// still yields a report, with `updated: false` and the error text, since
    /// the metric itself was computed.
    pub async fn compute_for_customer(&self, identity: &CustomerIdentity) -> Result<CustomerBuyoutReport, BuyoutError> {
        let span = info_span!("compute_for_customer", %identity, formula = %self.settings.formula);
        async move {
            let resolved = identity::IdentityResolver::new(self.gateway.as_ref(), &self.settings.sites)
                .resolve(identity)
                .await?;
            let customer_id = resolved.customer.id;
            let site = resolved.site.clone();

            let report = |tally: OrderTally, percent: u32, updated: bool, error: Option<String>| CustomerBuyoutReport {
                customer_id,
                site: site.clone(),
                formula: self.settings.formula,
                percent,
                completed: tally.completed,
                canceled: tally.canceled,
                returned: tally.returned,
                total_orders: tally.total_fetched,
                updated,
                error,
            };

            match self.reconcile(&resolved.customer, resolved.site.as_ref()).await? {
                Reconciliation::NoUsableIdentity => Err(BuyoutError::IdentityNotFound {
                    identity: format!("customer:{customer_id}"),
                    detail: "record has no id or email to look orders up by".to_string(),
                }),
                Reconciliation::NoHistory(tally) => Ok(report(tally, 0, false, None)),
                Reconciliation::Written { metric, tally, .. } => Ok(report(tally, metric.percent, true, None)),
                Reconciliation::WriteFailed { metric, tally, error } => {
                    Ok(report(tally, metric.percent, false, Some(error.to_string())))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Aggregate, compute and write back for an already-resolved customer.
    /// Only history failures are `Err`; write failures are a variant so the
    /// caller can tell them apart.
    pub async fn reconcile(&self, customer: &Customer, site: Option<&Site>) -> Result<Reconciliation, BuyoutError> {
        let Some(key) = HistoryKey::for_customer(customer, self.settings.history_key) else {
            return Ok(Reconciliation::NoUsableIdentity);
        };

        let tally = history::HistoryAggregator::new(self.gateway.as_ref(), self.settings.order_page_limit)
            .aggregate(&key)
            .await?;

        if !tally.has_relevant_history() {
            info!(
                customer_id = customer.id,
                orders = tally.total_fetched,
                "no completed, canceled or returned orders"
            );
            return Ok(Reconciliation::NoHistory(tally));
        }

        let metric = tally.metric(self.settings.formula);
        info!(
            customer_id = customer.id,
            completed = metric.completed,
            canceled = metric.canceled,
            returned = metric.returned,
            percent = metric.percent,
            "buyout computed"
        );

        let writer = writer::ReconciliationWriter::new(
            self.gateway.as_ref(),
            &self.settings.sites,
            &self.settings.field_code,
        );
        match writer.write_back(customer, site, metric.percent).await {
            Ok(receipt) => Ok(Reconciliation::Written { metric, tally, receipt }),
            Err(error) => {
                warn!(customer_id = customer.id, error = %error, "buyout write-back failed");
                Ok(Reconciliation::WriteFailed { metric, tally, error })
            }
        }
    }

    /// Register the recurring batch run when the scheduler is enabled.
    /// Overlapping firings are skipped rather than run side by side.
    pub async fn maybe_build_scheduler(self: Arc<Self>, config: &SyncConfig) -> Result<Option<JobScheduler>> {
        if !config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let guard = RunGuard::default();
        let max_customers = config.max_customers;
        let page_size = config.customer_page_size;
        let cron = config.recompute_cron.as_str();

        let job = Job::new_async(cron, move |_uuid, _l| {
            let service = Arc::clone(&self);
            let guard = guard.clone();
            Box::pin(async move {
                if let Some(summary) = guard.run_exclusive(&service, max_customers, page_size).await {
                    info!(
                        run_id = %summary.run_id,
                        processed = summary.processed,
                        updated = summary.updated,
                        skipped = summary.skipped,
                        errors = summary.errors,
                        "scheduled recompute finished"
                    );
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(cron, max_customers, page_size, "recompute scheduled");
        Ok(Some(sched))
    }
}

/// Keeps batch runs sharing one guard from overlapping.
#[derive(Debug, Clone, Default)]
pub struct RunGuard(Arc<Mutex<()>>);

impl RunGuard {
    /// Run the batch unless another run holding this guard is in progress,
    /// in which case `None` is returned straight away.
    pub async fn run_exclusive(
        &self,
        service: &BuyoutService,
        max_customers: usize,
        page_size: u32,
    ) -> Option<BatchSummary> {
        let Ok(_running) = self.0.try_lock() else {
            warn!("previous recompute still running; skipping this firing");
            return None;
        };
        Some(service.recompute_all(max_customers, page_size).await)
    }
}

pub async fn compute_for_customer_from_env(input: IdentityInput) -> Result<CustomerBuyoutReport> {
    let identity = CustomerIdentity::try_from(input)?;
    let config = SyncConfig::from_env()?;
    let service = BuyoutService::from_config(&config)?;
    Ok(service.compute_for_customer(&identity).await?)
}

pub async fn recompute_all_from_env(max_customers: Option<usize>, page_size: Option<u32>) -> Result<BatchSummary> {
    let config = SyncConfig::from_env()?;
    let service = BuyoutService::from_config(&config)?;
    Ok(service
        .recompute_all(
            max_customers.unwrap_or(config.max_customers),
            page_size.unwrap_or(config.customer_page_size),
        )
        .await)
}
