//! RetailCRM v5 wire shapes and their conversion into domain types.
//!
//! Responses are validated in two steps: the status envelope
//! (`success`, `errorMsg`, `errors`) first, then the typed payload. Nothing
//! untyped leaves this module.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use vykup_core::{Customer, HistoryKey, Order, OrderRef, OrderStatus, PhoneNumber, Site};

use crate::{CrmError, CustomFields, PageLimit};

#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(rename = "errorMsg")]
    error_msg: Option<String>,
    #[serde(default)]
    errors: Option<JsonValue>,
}

fn default_success() -> bool {
    true
}

impl StatusEnvelope {
    fn message(&self) -> String {
        let mut parts = Vec::new();
        if let Some(msg) = self.error_msg.as_deref().filter(|m| !m.is_empty()) {
            parts.push(msg.to_string());
        }
        match &self.errors {
            Some(JsonValue::Object(map)) => {
                parts.extend(map.iter().map(|(k, v)| format!("{k}: {}", value_text(v))));
            }
            Some(JsonValue::Array(items)) => parts.extend(items.iter().map(value_text)),
            Some(JsonValue::String(s)) => parts.push(s.clone()),
            _ => {}
        }
        if parts.is_empty() {
            "unknown error".to_string()
        } else {
            parts.join("; ")
        }
    }
}

fn value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Validate the HTTP status and envelope of `body`, then decode the payload.
pub fn decode<T: DeserializeOwned>(endpoint: &str, status: StatusCode, body: &[u8]) -> Result<T, CrmError> {
    let envelope: Option<StatusEnvelope> = serde_json::from_slice(body).ok();

    if !status.is_success() {
        if status == StatusCode::NOT_FOUND {
            return Err(CrmError::NotFound {
                endpoint: endpoint.to_string(),
            });
        }
        let message = envelope
            .as_ref()
            .map(StatusEnvelope::message)
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_default();
        return Err(CrmError::HttpStatus {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            message,
        });
    }

    match envelope {
        Some(env) if !env.success => Err(CrmError::Api {
            endpoint: endpoint.to_string(),
            message: env.message(),
        }),
        _ => serde_json::from_slice(body).map_err(|source| CrmError::Decode {
            endpoint: endpoint.to_string(),
            source,
        }),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub limit: Option<u32>,
    pub total_count: Option<u64>,
    pub current_page: Option<u32>,
    pub total_page_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct OrdersPayload {
    #[serde(default)]
    pub orders: Vec<WireOrder>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
pub struct CustomersPayload {
    #[serde(default)]
    pub customers: Vec<WireCustomer>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
pub struct CustomerPayload {
    pub customer: Option<WireCustomer>,
}

/// Payload of write endpoints; only the envelope matters.
#[derive(Debug, Deserialize)]
pub struct Acknowledgement {
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePhone {
    pub number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCustomer {
    pub id: i64,
    pub external_id: Option<String>,
    pub site: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub phones: Vec<WirePhone>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl From<WireCustomer> for Customer {
    fn from(wire: WireCustomer) -> Self {
        Customer {
            id: wire.id,
            external_id: non_blank(wire.external_id),
            site: non_blank(wire.site).map(Site::new),
            email: non_blank(wire.email),
            phone: wire.phones.into_iter().find_map(|p| non_blank(p.number)),
            first_name: wire.first_name,
            last_name: wire.last_name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireOrderCustomer {
    pub id: Option<i64>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireOrder {
    pub id: i64,
    pub number: Option<String>,
    pub site: Option<String>,
    pub status: Option<String>,
    pub email: Option<String>,
    pub customer: Option<WireOrderCustomer>,
}

impl From<WireOrder> for Order {
    fn from(wire: WireOrder) -> Self {
        let customer_email = wire.customer.as_ref().and_then(|c| c.email.clone());
        Order {
            id: wire.id,
            number: non_blank(wire.number),
            customer_id: wire.customer.as_ref().and_then(|c| c.id),
            site: non_blank(wire.site).map(Site::new),
            status: OrderStatus::from(wire.status.unwrap_or_default()),
            email: non_blank(wire.email).or_else(|| non_blank(customer_email)),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Body of `POST /customers/{id}/edit`, sent as the `customer` form field.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerEdit<'a> {
    pub custom_fields: &'a CustomFields,
}

pub fn page_query(page: u32, limit: PageLimit) -> Vec<(String, String)> {
    vec![
        ("limit".to_string(), limit.get().to_string()),
        ("page".to_string(), page.max(1).to_string()),
    ]
}

pub fn order_filter_query(filter: &HistoryKey) -> Vec<(String, String)> {
    match filter {
        HistoryKey::CustomerId(id) => vec![("filter[customerId]".to_string(), id.to_string())],
        HistoryKey::Email(email) => vec![("filter[email]".to_string(), email.clone())],
    }
}

pub fn order_ref_query(reference: &OrderRef) -> Vec<(String, String)> {
    match reference {
        OrderRef::Id(id) => vec![("filter[ids][]".to_string(), id.to_string())],
        OrderRef::Number(number) => vec![("filter[number]".to_string(), number.clone())],
    }
}

pub fn phone_query(phone: &PhoneNumber) -> Vec<(String, String)> {
    vec![("filter[phone]".to_string(), phone.digits().to_string())]
}
