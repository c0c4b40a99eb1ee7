//! Typed gateway to the RetailCRM v5 REST API.
//!
//! Owns API-key injection, query construction, envelope validation and error
//! classification. Business rules live in `vykup-sync`; this crate only
//! moves typed values across the wire.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use vykup_core::{Customer, CustomerRef, HistoryKey, Order, OrderRef, PhoneNumber, Site};

mod client;
pub mod wire;

pub use client::{CrmClientConfig, RetailCrmClient};

pub const CRATE_NAME: &str = "vykup-crm";

/// Page sizes the provider accepts for list endpoints.
pub const ALLOWED_PAGE_LIMITS: [u32; 3] = [20, 50, 100];

/// Page size snapped to one of [`ALLOWED_PAGE_LIMITS`]: the largest allowed
/// value not above the request, never below the smallest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PageLimit(u32);

impl PageLimit {
    pub const MIN: PageLimit = PageLimit(20);
    pub const MAX: PageLimit = PageLimit(100);

    pub fn normalize(requested: u32) -> Self {
        let limit = ALLOWED_PAGE_LIMITS
            .iter()
            .copied()
            .filter(|allowed| *allowed <= requested)
            .max()
            .unwrap_or(Self::MIN.0);
        Self(limit)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Default for PageLimit {
    fn default() -> Self {
        Self::MIN
    }
}

/// One page of a list endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: PageLimit,
    /// Provider-reported total. Informational only; filtered totals are not
    /// reliable, so pagination ends on a short page instead.
    pub total_count: Option<u64>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, page: u32, limit: PageLimit) -> Self {
        Self {
            items,
            page,
            limit,
            total_count: None,
        }
    }

    /// A page is the last one when it holds fewer rows than the limit.
    pub fn is_last(&self) -> bool {
        self.items.len() < self.limit.as_usize()
    }
}

/// Custom field values for a customer edit, keyed by field code.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CustomFields(BTreeMap<String, JsonValue>);

impl CustomFields {
    pub fn single(code: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        let mut fields = Self::default();
        fields.insert(code, value);
        fields
    }

    pub fn insert(&mut self, code: impl Into<String>, value: impl Into<JsonValue>) {
        self.0.insert(code.into(), value.into());
    }

    pub fn get(&self, code: &str) -> Option<&JsonValue> {
        self.0.get(code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Network trouble, 5xx or throttling; a later attempt may succeed.
    Transient,
    Permanent,
}

pub fn classify_status(status: StatusCode) -> Disposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Disposition::Transient
    } else {
        Disposition::Permanent
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> Disposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Disposition::Transient
    } else {
        Disposition::Permanent
    }
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned http {status}: {message}")]
    HttpStatus {
        endpoint: String,
        status: u16,
        message: String,
    },
    #[error("{endpoint}: not found")]
    NotFound { endpoint: String },
    #[error("{endpoint} rejected the request: {message}")]
    Api { endpoint: String, message: String },
    #[error("could not decode {endpoint} response: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not encode {endpoint} request body: {source}")]
    Encode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CrmError {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Transport { source, .. } => classify_reqwest_error(source),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(Disposition::Permanent),
            Self::NotFound { .. } | Self::Api { .. } | Self::Decode { .. } | Self::Encode { .. } => {
                Disposition::Permanent
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn endpoint(&self) -> &str {
        match self {
            Self::Transport { endpoint, .. }
            | Self::HttpStatus { endpoint, .. }
            | Self::NotFound { endpoint }
            | Self::Api { endpoint, .. }
            | Self::Decode { endpoint, .. }
            | Self::Encode { endpoint, .. } => endpoint,
        }
    }
}

/// Operations the reconciliation core needs from the CRM.
///
/// Calls are awaited one at a time by every caller in this workspace;
/// implementations do not need to handle concurrent use for correctness.
#[async_trait]
pub trait CrmGateway: Send + Sync {
    async fn list_orders(
        &self,
        page: u32,
        limit: PageLimit,
        filter: &HistoryKey,
    ) -> Result<Page<Order>, CrmError>;

    /// Read one customer. `Ok(None)` when the record does not exist under
    /// the given site (or under the default site when `site` is `None`).
    async fn get_customer(&self, id: i64, site: Option<&Site>) -> Result<Option<Customer>, CrmError>;

    async fn list_customers(&self, page: u32, limit: PageLimit) -> Result<Page<Customer>, CrmError>;

    async fn find_customers_by_phone(&self, phone: &PhoneNumber) -> Result<Vec<Customer>, CrmError>;

    async fn find_order(&self, reference: &OrderRef) -> Result<Option<Order>, CrmError>;

    async fn update_customer_fields(
        &self,
        target: &CustomerRef,
        site: &Site,
        fields: &CustomFields,
    ) -> Result<(), CrmError>;
}
