//! Core domain model for buyout-rate reconciliation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod buyout;

pub use buyout::{compute_percent, ratio_percent, return_aware_percent, BuyoutFormula, BuyoutMetric, OrderTally};

pub const CRATE_NAME: &str = "vykup-core";

/// Site (tenant partition) code as used by the CRM, e.g. `ashrussia-ru`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Site(String);

impl Site {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Site {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SiteListError {
    #[error("site list is empty; at least one site code must be configured")]
    Empty,
    #[error("site `{0}` is listed more than once")]
    Duplicate(String),
}

/// Ordered, non-empty set of site codes probed during site discovery and
/// used as write candidates when a customer's site is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteList {
    sites: Vec<Site>,
}

impl SiteList {
    pub fn new(sites: Vec<Site>) -> Result<Self, SiteListError> {
        if sites.is_empty() {
            return Err(SiteListError::Empty);
        }
        for (idx, site) in sites.iter().enumerate() {
            if sites[..idx].contains(site) {
                return Err(SiteListError::Duplicate(site.0.clone()));
            }
        }
        Ok(Self { sites })
    }

    /// Parse a comma separated list (`a, b ,c`), ignoring empty entries.
    pub fn parse_csv(input: &str) -> Result<Self, SiteListError> {
        let sites = input
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Site::new)
            .collect();
        Self::new(sites)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Site> {
        self.sites.iter()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

impl<'a> IntoIterator for &'a SiteList {
    type Item = &'a Site;
    type IntoIter = std::slice::Iter<'a, Site>;

    fn into_iter(self) -> Self::IntoIter {
        self.sites.iter()
    }
}

impl<'de> Deserialize<'de> for SiteList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let sites = Vec::<Site>::deserialize(deserializer)?;
        Self::new(sites).map_err(serde::de::Error::custom)
    }
}

/// Customer record as the reconciliation core sees it.
///
/// `site` is frequently absent from list responses; write addressing needs
/// it, so it may have to be discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Customer {
    pub id: i64,
    pub external_id: Option<String>,
    pub site: Option<Site>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl Customer {
    pub fn display_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if name.is_empty() {
            format!("#{}", self.id)
        } else {
            name
        }
    }

    /// Email with surrounding whitespace removed, `None` when blank.
    pub fn usable_email(&self) -> Option<&str> {
        self.email.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }
}

/// Order status code. Only three codes feed the metric; everything else is
/// kept verbatim and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OrderStatus {
    Completed,
    CancelOther,
    ReturnToSender,
    Other(String),
}

impl OrderStatus {
    pub const COMPLETED: &'static str = "completed";
    pub const CANCEL_OTHER: &'static str = "cancel-other";
    pub const RETURN_TO_SENDER: &'static str = "vozvrat-im";

    pub fn as_str(&self) -> &str {
        match self {
            Self::Completed => Self::COMPLETED,
            Self::CancelOther => Self::CANCEL_OTHER,
            Self::ReturnToSender => Self::RETURN_TO_SENDER,
            Self::Other(code) => code,
        }
    }
}

impl From<String> for OrderStatus {
    fn from(code: String) -> Self {
        match code.as_str() {
            Self::COMPLETED => Self::Completed,
            Self::CANCEL_OTHER => Self::CancelOther,
            Self::RETURN_TO_SENDER => Self::ReturnToSender,
            _ => Self::Other(code),
        }
    }
}

impl From<&str> for OrderStatus {
    fn from(code: &str) -> Self {
        Self::from(code.to_string())
    }
}

impl From<OrderStatus> for String {
    fn from(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Other(code) => code,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only order projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub number: Option<String>,
    pub customer_id: Option<i64>,
    pub site: Option<Site>,
    pub status: OrderStatus,
    pub email: Option<String>,
}

/// Which server-side filter pulls a customer's order history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryKeyKind {
    #[default]
    CustomerId,
    Email,
}

impl FromStr for HistoryKeyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "customer-id" | "customer_id" | "id" => Ok(Self::CustomerId),
            "email" => Ok(Self::Email),
            other => Err(format!("unknown history key `{other}` (expected customer-id or email)")),
        }
    }
}

/// Identity used to filter a customer's orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryKey {
    CustomerId(i64),
    Email(String),
}

impl HistoryKey {
    /// Pick the history key for `customer`. Email mode falls back to the
    /// customer ID when no usable email is on record; `None` means the
    /// customer has no usable identity at all.
    pub fn for_customer(customer: &Customer, kind: HistoryKeyKind) -> Option<Self> {
        match kind {
            HistoryKeyKind::CustomerId if customer.id > 0 => Some(Self::CustomerId(customer.id)),
            HistoryKeyKind::CustomerId => customer.usable_email().map(|e| Self::Email(e.to_string())),
            HistoryKeyKind::Email => customer
                .usable_email()
                .map(|e| Self::Email(e.to_string()))
                .or_else(|| (customer.id > 0).then_some(Self::CustomerId(customer.id))),
        }
    }
}

impl fmt::Display for HistoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CustomerId(id) => write!(f, "customer:{id}"),
            Self::Email(email) => write!(f, "email:{email}"),
        }
    }
}

/// Phone number reduced to its digits, the form the CRM's phone filter
/// matches on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Returns `None` when the input carries no digits at all.
    pub fn parse(raw: &str) -> Option<Self> {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        (!digits.is_empty()).then_some(Self(digits))
    }

    pub fn digits(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to an order supplied by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRef {
    Id(i64),
    Number(String),
}

impl fmt::Display for OrderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "order:{id}"),
            Self::Number(number) => write!(f, "order-number:{number}"),
        }
    }
}

/// Addressing mode for customer writes; always paired with a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomerRef {
    Id(i64),
    ExternalId(String),
}

impl CustomerRef {
    /// Value of the CRM's `by` query parameter.
    pub fn by(&self) -> &'static str {
        match self {
            Self::Id(_) => "id",
            Self::ExternalId(_) => "externalId",
        }
    }

    pub fn path_segment(&self) -> String {
        match self {
            Self::Id(id) => id.to_string(),
            Self::ExternalId(external) => external.clone(),
        }
    }
}

impl fmt::Display for CustomerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{id}"),
            Self::ExternalId(external) => write!(f, "externalId:{external}"),
        }
    }
}
