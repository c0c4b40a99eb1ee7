//! Write-back of the computed percentage onto the customer record.

use serde::Serialize;
use tracing::{info, warn};
use vykup_core::{Customer, CustomerRef, Site, SiteList};
use vykup_crm::{CrmError, CrmGateway, CustomFields};

use crate::BuyoutError;

/// One `(identifier, site)` combination to try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteAttempt {
    pub target: CustomerRef,
    pub site: Site,
}

/// Ordered write cascade for one customer:
///
/// 1. `(externalId, site)` when both are known,
/// 2. `(id, site)` when the site is known,
/// 3. `(id, s)` for every configured site `s` when it is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    attempts: Vec<WriteAttempt>,
}

impl WritePlan {
    pub fn for_customer(customer: &Customer, site: Option<&Site>, sites: &SiteList) -> Self {
        let mut attempts = Vec::new();
        match site {
            Some(site) => {
                if let Some(external_id) = customer.external_id.as_deref().filter(|e| !e.is_empty()) {
                    attempts.push(WriteAttempt {
                        target: CustomerRef::ExternalId(external_id.to_string()),
                        site: site.clone(),
                    });
                }
                attempts.push(WriteAttempt {
                    target: CustomerRef::Id(customer.id),
                    site: site.clone(),
                });
            }
            None => attempts.extend(sites.iter().map(|candidate| WriteAttempt {
                target: CustomerRef::Id(customer.id),
                site: candidate.clone(),
            })),
        }
        Self { attempts }
    }

    pub fn attempts(&self) -> &[WriteAttempt] {
        &self.attempts
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    pub target: CustomerRef,
    pub site: Site,
    /// Attempts made, the successful one included.
    pub attempts: usize,
}

pub struct ReconciliationWriter<'a> {
    gateway: &'a dyn CrmGateway,
    sites: &'a SiteList,
    field_code: &'a str,
}

impl<'a> ReconciliationWriter<'a> {
    pub fn new(gateway: &'a dyn CrmGateway, sites: &'a SiteList, field_code: &'a str) -> Self {
        Self {
            gateway,
            sites,
            field_code,
        }
    }

    /// Run the write cascade, stopping at the first acknowledged write.
    /// Failed attempts are logged and the next strategy is tried; there is no
    /// retry within an attempt.
    pub async fn write_back(
        &self,
        customer: &Customer,
        site: Option<&Site>,
        percent: u32,
    ) -> Result<WriteReceipt, BuyoutError> {
        let plan = WritePlan::for_customer(customer, site, self.sites);
        let fields = CustomFields::single(self.field_code, percent);
        let mut last_error: Option<CrmError> = None;

        for (idx, attempt) in plan.attempts().iter().enumerate() {
            match self
                .gateway
                .update_customer_fields(&attempt.target, &attempt.site, &fields)
                .await
            {
                Ok(()) => {
                    info!(
                        customer_id = customer.id,
                        target = %attempt.target,
                        site = %attempt.site,
                        percent,
                        attempt = idx + 1,
                        "buyout written"
                    );
                    return Ok(WriteReceipt {
                        target: attempt.target.clone(),
                        site: attempt.site.clone(),
                        attempts: idx + 1,
                    });
                }
                Err(err) => {
                    warn!(
                        customer_id = customer.id,
                        target = %attempt.target,
                        site = %attempt.site,
                        attempt = idx + 1,
                        of = plan.len(),
                        error = %err,
                        "write attempt failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(BuyoutError::WriteCascadeExhausted {
            customer_id: customer.id,
            attempts: plan.len(),
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sites() -> SiteList {
        SiteList::parse_csv("a,b,c").unwrap()
    }

    #[test]
    fn known_site_with_external_id_tries_external_first() {
        let customer = Customer {
            id: 10,
            external_id: Some("ext-10".into()),
            ..Default::default()
        };
        let plan = WritePlan::for_customer(&customer, Some(&Site::new("b")), &sites());
        assert_eq!(
            plan.attempts(),
            &[
                WriteAttempt {
                    target: CustomerRef::ExternalId("ext-10".into()),
                    site: Site::new("b"),
                },
                WriteAttempt {
                    target: CustomerRef::Id(10),
                    site: Site::new("b"),
                },
            ]
        );
    }

    #[test]
    fn known_site_without_external_id_uses_internal_id() {
        let customer = Customer {
            id: 10,
            external_id: Some(String::new()),
            ..Default::default()
        };
        let plan = WritePlan::for_customer(&customer, Some(&Site::new("c")), &sites());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.attempts()[0].target, CustomerRef::Id(10));
    }

    #[test]
    fn unknown_site_fans_out_over_configured_sites() {
        let customer = Customer {
            id: 10,
            external_id: Some("ext-10".into()),
            ..Default::default()
        };
        let plan = WritePlan::for_customer(&customer, None, &sites());
        let sites: Vec<_> = plan.attempts().iter().map(|a| a.site.as_str()).collect();
        assert_eq!(sites, vec!["a", "b", "c"]);
        assert!(plan
            .attempts()
            .iter()
            .all(|a| a.target == CustomerRef::Id(10)));
    }
}
