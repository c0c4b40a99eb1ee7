//! Caller-supplied customer identities and their resolution.

use serde::Deserialize;
use tracing::{debug, info};
use vykup_core::{Customer, OrderRef, PhoneNumber, Site, SiteList};
use vykup_crm::CrmGateway;

use crate::resolver::SiteResolver;
use crate::BuyoutError;

/// Raw identity fields as a trigger hands them over. At least one must be
/// set; when several are, the most precise wins: customer ID, then order ID,
/// then order number, then phone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityInput {
    pub phone: Option<String>,
    pub customer_id: Option<i64>,
    pub order_id: Option<i64>,
    pub order_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerIdentity {
    Phone(PhoneNumber),
    CustomerId(i64),
    Order(OrderRef),
}

impl TryFrom<IdentityInput> for CustomerIdentity {
    type Error = BuyoutError;

    fn try_from(input: IdentityInput) -> Result<Self, Self::Error> {
        if let Some(id) = input.customer_id {
            return positive(id, "customer id").map(Self::CustomerId);
        }
        if let Some(id) = input.order_id {
            return positive(id, "order id").map(|id| Self::Order(OrderRef::Id(id)));
        }
        if let Some(number) = input.order_number.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return Ok(Self::Order(OrderRef::Number(number.to_string())));
        }
        match input.phone.as_deref() {
            Some(raw) => PhoneNumber::parse(raw)
                .map(Self::Phone)
                .ok_or_else(|| BuyoutError::InvalidIdentity(format!("phone `{raw}` contains no digits"))),
            None => Err(BuyoutError::InvalidIdentity(
                "one of phone, customer id, order id or order number is required".to_string(),
            )),
        }
    }
}

fn positive(id: i64, what: &str) -> Result<i64, BuyoutError> {
    if id > 0 {
        Ok(id)
    } else {
        Err(BuyoutError::InvalidIdentity(format!("{what} must be positive, got {id}")))
    }
}

impl std::fmt::Display for CustomerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Phone(phone) => write!(f, "phone:{phone}"),
            Self::CustomerId(id) => write!(f, "customer:{id}"),
            Self::Order(reference) => write!(f, "{reference}"),
        }
    }
}

/// Customer plus the site to address writes to, when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCustomer {
    pub customer: Customer,
    pub site: Option<Site>,
}

pub struct IdentityResolver<'a> {
    gateway: &'a dyn CrmGateway,
    sites: &'a SiteList,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(gateway: &'a dyn CrmGateway, sites: &'a SiteList) -> Self {
        Self { gateway, sites }
    }

    pub async fn resolve(&self, identity: &CustomerIdentity) -> Result<ResolvedCustomer, BuyoutError> {
        match identity {
            CustomerIdentity::CustomerId(id) => self.by_customer_id(*id).await,
            CustomerIdentity::Phone(phone) => self.by_phone(phone).await,
            CustomerIdentity::Order(reference) => self.by_order(reference).await,
        }
    }

    async fn by_customer_id(&self, id: i64) -> Result<ResolvedCustomer, BuyoutError> {
        let resolved = SiteResolver::new(self.gateway, self.sites).resolve(id).await?;
        Ok(ResolvedCustomer {
            customer: resolved.customer,
            site: Some(resolved.site),
        })
    }

    async fn by_phone(&self, phone: &PhoneNumber) -> Result<ResolvedCustomer, BuyoutError> {
        let matches = self
            .gateway
            .find_customers_by_phone(phone)
            .await
            .map_err(|source| BuyoutError::TransientFetch {
                context: format!("customer lookup by phone {phone}"),
                source,
            })?;
        if matches.len() > 1 {
            debug!(%phone, matches = matches.len(), "several customers share the phone, taking the first");
        }
        let customer = matches.into_iter().next().ok_or_else(|| BuyoutError::IdentityNotFound {
            identity: format!("phone:{phone}"),
            detail: "no customer with this phone".to_string(),
        })?;
        let site = customer.site.clone();
        Ok(ResolvedCustomer { customer, site })
    }

    async fn by_order(&self, reference: &OrderRef) -> Result<ResolvedCustomer, BuyoutError> {
        let order = self
            .gateway
            .find_order(reference)
            .await
            .map_err(|source| BuyoutError::TransientFetch {
                context: format!("lookup of {reference}"),
                source,
            })?
            .ok_or_else(|| BuyoutError::IdentityNotFound {
                identity: reference.to_string(),
                detail: "order does not exist".to_string(),
            })?;

        let customer_id = order.customer_id.ok_or_else(|| BuyoutError::IdentityNotFound {
            identity: reference.to_string(),
            detail: "order has no customer attached".to_string(),
        })?;

        // The order's site is the best first guess for its customer.
        if let Some(site) = &order.site {
            match self.gateway.get_customer(customer_id, Some(site)).await {
                Ok(Some(mut customer)) => {
                    customer.site.get_or_insert_with(|| site.clone());
                    info!(order_id = order.id, customer_id, %site, "customer resolved from order site");
                    return Ok(ResolvedCustomer {
                        customer,
                        site: Some(site.clone()),
                    });
                }
                Ok(None) => debug!(customer_id, %site, "customer not under order site, probing"),
                Err(err) => debug!(customer_id, %site, error = %err, "order site read failed, probing"),
            }
        }
        self.by_customer_id(customer_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_invalid() {
        let err = CustomerIdentity::try_from(IdentityInput::default()).unwrap_err();
        assert!(matches!(err, BuyoutError::InvalidIdentity(_)));
    }

    #[test]
    fn customer_id_takes_precedence() {
        let input = IdentityInput {
            phone: Some("+7 900 111 22 33".into()),
            customer_id: Some(5),
            order_id: Some(9),
            order_number: None,
        };
        assert_eq!(CustomerIdentity::try_from(input).unwrap(), CustomerIdentity::CustomerId(5));
    }

    #[test]
    fn order_before_phone() {
        let input = IdentityInput {
            phone: Some("8-900-111-22-33".into()),
            order_number: Some(" 1042A ".into()),
            ..Default::default()
        };
        assert_eq!(
            CustomerIdentity::try_from(input).unwrap(),
            CustomerIdentity::Order(OrderRef::Number("1042A".into()))
        );
    }

    #[test]
    fn phone_without_digits_is_invalid() {
        let input = IdentityInput {
            phone: Some("n/a".into()),
            ..Default::default()
        };
        assert!(matches!(
            CustomerIdentity::try_from(input),
            Err(BuyoutError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn non_positive_ids_are_invalid() {
        let input = IdentityInput {
            customer_id: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            CustomerIdentity::try_from(input),
            Err(BuyoutError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn input_deserializes_from_camel_case() {
        let input: IdentityInput = serde_json::from_str(r#"{"orderId": 17}"#).unwrap();
        assert_eq!(
            CustomerIdentity::try_from(input).unwrap(),
            CustomerIdentity::Order(OrderRef::Id(17))
        );
    }
}
