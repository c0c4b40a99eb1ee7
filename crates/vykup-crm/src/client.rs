use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::{debug, info_span, Instrument};
use vykup_core::{Customer, CustomerRef, HistoryKey, Order, OrderRef, PhoneNumber, Site};

use crate::wire::{self, Acknowledgement, CustomerEdit, CustomerPayload, CustomersPayload, OrdersPayload};
use crate::{CrmError, CrmGateway, CustomFields, Page, PageLimit};

/// Lookups by phone or order reference only need the first match.
const LOOKUP_LIMIT: PageLimit = PageLimit::MIN;

#[derive(Clone)]
pub struct CrmClientConfig {
    /// Account root, e.g. `https://example.retailcrm.ru`.
    pub base_url: String,
    pub api_key: SecretString,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl CrmClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

impl fmt::Debug for CrmClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrmClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// reqwest-backed [`CrmGateway`].
pub struct RetailCrmClient {
    client: reqwest::Client,
    api_root: String,
    api_key: SecretString,
}

impl fmt::Debug for RetailCrmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetailCrmClient")
            .field("api_root", &self.api_root)
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl RetailCrmClient {
    pub fn new(config: CrmClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            api_root: format!("{}/api/v5", config.base_url.trim_end_matches('/')),
            api_key: config.api_key,
        })
    }

    fn request(&self, method: Method, endpoint: &str, query: &[(String, String)]) -> RequestBuilder {
        self.client
            .request(method, format!("{}{endpoint}", self.api_root))
            .query(&[("apiKey", self.api_key.expose_secret())])
            .query(query)
    }

    async fn execute<T: DeserializeOwned>(&self, endpoint: &str, request: RequestBuilder) -> Result<T, CrmError> {
        // The full URL carries the API key; only the endpoint path is logged.
        let span = info_span!("crm_request", endpoint);
        async move {
            let response = request.send().await.map_err(|source| CrmError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;
            let status = response.status();
            let body = response.bytes().await.map_err(|source| CrmError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;
            debug!(status = status.as_u16(), bytes = body.len(), "crm response");
            wire::decode(endpoint, status, &body)
        }
        .instrument(span)
        .await
    }

    /// `POST /customers/{ref}/edit?by=..&site=..` with the custom fields as
    /// the form-encoded `customer` JSON document.
    fn edit_request(
        &self,
        target: &CustomerRef,
        site: &Site,
        fields: &CustomFields,
    ) -> Result<(String, RequestBuilder), CrmError> {
        let endpoint = format!("/customers/{}/edit", target.path_segment());
        let customer_json =
            serde_json::to_string(&CustomerEdit { custom_fields: fields }).map_err(|source| CrmError::Encode {
                endpoint: endpoint.clone(),
                source,
            })?;
        let query = vec![
            ("by".to_string(), target.by().to_string()),
            ("site".to_string(), site.as_str().to_string()),
        ];
        let request = self
            .request(Method::POST, &endpoint, &query)
            .form(&[("customer", customer_json)]);
        Ok((endpoint, request))
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str, query: Vec<(String, String)>) -> Result<T, CrmError> {
        let request = self.request(Method::GET, endpoint, &query);
        self.execute(endpoint, request).await
    }
}

#[async_trait]
impl CrmGateway for RetailCrmClient {
    async fn list_orders(
        &self,
        page: u32,
        limit: PageLimit,
        filter: &HistoryKey,
    ) -> Result<Page<Order>, CrmError> {
        let mut query = wire::page_query(page, limit);
        query.extend(wire::order_filter_query(filter));
        let payload: OrdersPayload = self.get("/orders", query).await?;
        Ok(Page {
            items: payload.orders.into_iter().map(Order::from).collect(),
            page,
            limit,
            total_count: payload.pagination.and_then(|p| p.total_count),
        })
    }

    async fn get_customer(&self, id: i64, site: Option<&Site>) -> Result<Option<Customer>, CrmError> {
        let endpoint = format!("/customers/{id}");
        let mut query = vec![("by".to_string(), "id".to_string())];
        if let Some(site) = site {
            query.push(("site".to_string(), site.as_str().to_string()));
        }
        match self.get::<CustomerPayload>(&endpoint, query).await {
            Ok(payload) => Ok(payload.customer.map(Customer::from)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_customers(&self, page: u32, limit: PageLimit) -> Result<Page<Customer>, CrmError> {
        let payload: CustomersPayload = self.get("/customers", wire::page_query(page, limit)).await?;
        Ok(Page {
            items: payload.customers.into_iter().map(Customer::from).collect(),
            page,
            limit,
            total_count: payload.pagination.and_then(|p| p.total_count),
        })
    }

    async fn find_customers_by_phone(&self, phone: &PhoneNumber) -> Result<Vec<Customer>, CrmError> {
        let mut query = wire::page_query(1, LOOKUP_LIMIT);
        query.extend(wire::phone_query(phone));
        let payload: CustomersPayload = self.get("/customers", query).await?;
        Ok(payload.customers.into_iter().map(Customer::from).collect())
    }

    async fn find_order(&self, reference: &OrderRef) -> Result<Option<Order>, CrmError> {
        let mut query = wire::page_query(1, LOOKUP_LIMIT);
        query.extend(wire::order_ref_query(reference));
        let payload: OrdersPayload = self.get("/orders", query).await?;
        let wanted = |order: &Order| match reference {
            OrderRef::Id(id) => order.id == *id,
            OrderRef::Number(number) => order.number.as_deref() == Some(number.as_str()),
        };
        Ok(payload.orders.into_iter().map(Order::from).find(wanted))
    }

    async fn update_customer_fields(
        &self,
        target: &CustomerRef,
        site: &Site,
        fields: &CustomFields,
    ) -> Result<(), CrmError> {
        let (endpoint, request) = self.edit_request(target, site, fields)?;
        let _ack: Acknowledgement = self.execute(&endpoint, request).await?;
        Ok(())
    }
}
