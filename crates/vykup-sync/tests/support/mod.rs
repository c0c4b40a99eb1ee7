#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vykup_core::{Customer, CustomerRef, HistoryKey, Order, OrderRef, OrderStatus, PhoneNumber, Site, SiteList};
use vykup_crm::{CrmError, CrmGateway, CustomFields, Page, PageLimit};
use vykup_sync::{BuyoutService, BuyoutSettings};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ListOrders { page: u32, key: String },
    GetCustomer { id: i64, site: Option<Site> },
    ListCustomers { page: u32 },
    FindByPhone(String),
    FindOrder(OrderRef),
    Update { target: CustomerRef, site: Site, fields: CustomFields },
}

/// In-memory CRM. Each customer lives under exactly one site; reads and
/// writes addressed to another site behave like the real API and miss.
#[derive(Default)]
pub struct FakeCrm {
    customers: Vec<(Customer, Site)>,
    orders: Vec<Order>,
    list_hides_site: bool,
    failing_histories: HashSet<String>,
    rejected_writes: HashSet<String>,
    failing_customer_pages: HashSet<u32>,
    calls: Mutex<Vec<Call>>,
}

impl FakeCrm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_customer(mut self, customer: Customer, home: &str) -> Self {
        self.customers.push((customer, Site::new(home)));
        self
    }

    /// Attach orders with the given statuses to `customer_id`.
    pub fn with_orders(mut self, customer_id: i64, statuses: &[&str]) -> Self {
        let email = self
            .customers
            .iter()
            .find(|(c, _)| c.id == customer_id)
            .and_then(|(c, _)| c.email.clone());
        for status in statuses {
            let id = self.orders.len() as i64 + 1;
            self.orders.push(Order {
                id,
                number: Some(format!("{id}A")),
                customer_id: Some(customer_id),
                site: None,
                status: OrderStatus::from(*status),
                email: email.clone(),
            });
        }
        self
    }

    pub fn with_order(mut self, order: Order) -> Self {
        self.orders.push(order);
        self
    }

    /// Customer list responses omit `site`, as the real API often does.
    pub fn hiding_list_sites(mut self) -> Self {
        self.list_hides_site = true;
        self
    }

    pub fn failing_history(mut self, key: &HistoryKey) -> Self {
        self.failing_histories.insert(key.to_string());
        self
    }

    pub fn rejecting_write(mut self, target: &CustomerRef) -> Self {
        self.rejected_writes.insert(target.to_string());
        self
    }

    pub fn failing_customer_page(mut self, page: u32) -> Self {
        self.failing_customer_pages.insert(page);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub fn order_fetches(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::ListOrders { .. }))
            .count()
    }

    pub fn probed_sites(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::GetCustomer { site: Some(site), .. } => Some(site.as_str().to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn updates(&self) -> Vec<(CustomerRef, Site, CustomFields)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Update { target, site, fields } => Some((target, site, fields)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn home_of(&self, target: &CustomerRef) -> Option<&(Customer, Site)> {
        self.customers.iter().find(|(c, _)| match target {
            CustomerRef::Id(id) => c.id == *id,
            CustomerRef::ExternalId(ext) => c.external_id.as_deref() == Some(ext.as_str()),
        })
    }
}

fn paginate<T: Clone>(items: &[T], page: u32, limit: PageLimit) -> Page<T> {
    let start = (page.saturating_sub(1) as usize) * limit.as_usize();
    let slice = items.iter().skip(start).take(limit.as_usize()).cloned().collect();
    Page::new(slice, page, limit)
}

fn unavailable(endpoint: &str) -> CrmError {
    CrmError::HttpStatus {
        endpoint: endpoint.to_string(),
        status: 503,
        message: "Service Unavailable".to_string(),
    }
}

#[async_trait]
impl CrmGateway for FakeCrm {
    async fn list_orders(&self, page: u32, limit: PageLimit, filter: &HistoryKey) -> Result<Page<Order>, CrmError> {
        self.record(Call::ListOrders {
            page,
            key: filter.to_string(),
        });
        if self.failing_histories.contains(&filter.to_string()) {
            return Err(unavailable("/orders"));
        }
        let matching: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| match filter {
                HistoryKey::CustomerId(id) => o.customer_id == Some(*id),
                HistoryKey::Email(email) => o.email.as_deref() == Some(email.as_str()),
            })
            .cloned()
            .collect();
        Ok(paginate(&matching, page, limit))
    }

    async fn get_customer(&self, id: i64, site: Option<&Site>) -> Result<Option<Customer>, CrmError> {
        self.record(Call::GetCustomer {
            id,
            site: site.cloned(),
        });
        Ok(self
            .customers
            .iter()
            .find(|(c, home)| c.id == id && site == Some(home))
            .map(|(c, _)| Customer {
                site: None,
                ..c.clone()
            }))
    }

    async fn list_customers(&self, page: u32, limit: PageLimit) -> Result<Page<Customer>, CrmError> {
        self.record(Call::ListCustomers { page });
        if self.failing_customer_pages.contains(&page) {
            return Err(unavailable("/customers"));
        }
        let listed: Vec<Customer> = self
            .customers
            .iter()
            .map(|(c, home)| Customer {
                site: (!self.list_hides_site).then(|| home.clone()),
                ..c.clone()
            })
            .collect();
        Ok(paginate(&listed, page, limit))
    }

    async fn find_customers_by_phone(&self, phone: &PhoneNumber) -> Result<Vec<Customer>, CrmError> {
        self.record(Call::FindByPhone(phone.digits().to_string()));
        Ok(self
            .customers
            .iter()
            .filter(|(c, _)| {
                c.phone
                    .as_deref()
                    .and_then(PhoneNumber::parse)
                    .is_some_and(|p| p == *phone)
            })
            .map(|(c, home)| Customer {
                site: Some(home.clone()),
                ..c.clone()
            })
            .collect())
    }

    async fn find_order(&self, reference: &OrderRef) -> Result<Option<Order>, CrmError> {
        self.record(Call::FindOrder(reference.clone()));
        Ok(self
            .orders
            .iter()
            .find(|o| match reference {
                OrderRef::Id(id) => o.id == *id,
                OrderRef::Number(number) => o.number.as_deref() == Some(number.as_str()),
            })
            .cloned())
    }

    async fn update_customer_fields(
        &self,
        target: &CustomerRef,
        site: &Site,
        fields: &CustomFields,
    ) -> Result<(), CrmError> {
        self.record(Call::Update {
            target: target.clone(),
            site: site.clone(),
            fields: fields.clone(),
        });
        let endpoint = format!("/customers/{}/edit", target.path_segment());
        if self.rejected_writes.contains(&target.to_string()) {
            return Err(CrmError::Api {
                endpoint,
                message: "Customer is not editable".to_string(),
            });
        }
        match self.home_of(target) {
            Some((_, home)) if home == site => Ok(()),
            _ => Err(CrmError::Api {
                endpoint,
                message: "Not found".to_string(),
            }),
        }
    }
}

pub fn customer(id: i64) -> Customer {
    Customer {
        id,
        email: Some(format!("c{id}@example.test")),
        ..Default::default()
    }
}

pub fn settings(sites: &str) -> BuyoutSettings {
    let mut settings = BuyoutSettings::new(SiteList::parse_csv(sites).expect("site list"));
    settings.page_delay = Duration::ZERO;
    settings
}

pub fn service(crm: &Arc<FakeCrm>, settings: BuyoutSettings) -> BuyoutService {
    BuyoutService::new(Arc::clone(crm) as Arc<dyn CrmGateway>, settings)
}

pub fn written_value(fields: &CustomFields) -> Option<u64> {
    fields.get("vykup").and_then(|v| v.as_u64())
}
