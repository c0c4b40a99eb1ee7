//! Site discovery for a customer ID.
//!
//! The CRM's read-by-id endpoint needs a site when the partition is not the
//! default one, and there is no endpoint that reports a record's partition.
//! Sites are therefore probed one by one, in configured order.

use std::collections::VecDeque;

use tracing::{debug, info, warn};
use vykup_core::{Customer, Site, SiteList};
use vykup_crm::{CrmError, CrmGateway};

use crate::BuyoutError;

/// A customer together with the site it was found under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSite {
    pub customer: Customer,
    pub site: Site,
    pub probes: usize,
}

#[derive(Debug)]
pub enum ProbeState {
    Probing(SiteProbe),
    Found(ResolvedSite),
    Exhausted {
        probes: usize,
        last_error: Option<CrmError>,
    },
}

/// Remaining candidates of an in-progress probe.
#[derive(Debug)]
pub struct SiteProbe {
    remaining: VecDeque<Site>,
    probes: usize,
    last_error: Option<CrmError>,
}

impl SiteProbe {
    pub fn start(sites: &SiteList) -> ProbeState {
        let probe = Self {
            remaining: sites.iter().cloned().collect(),
            probes: 0,
            last_error: None,
        };
        if probe.remaining.is_empty() {
            probe.exhaust()
        } else {
            ProbeState::Probing(probe)
        }
    }

    pub fn next_site(&self) -> Option<&Site> {
        self.remaining.front()
    }

    /// Feed the outcome of reading the customer under [`Self::next_site`].
    pub fn advance(mut self, outcome: Result<Option<Customer>, CrmError>) -> ProbeState {
        let Some(site) = self.remaining.pop_front() else {
            return self.exhaust();
        };
        self.probes += 1;

        match outcome {
            Ok(Some(mut customer)) => {
                customer.site.get_or_insert_with(|| site.clone());
                return ProbeState::Found(ResolvedSite {
                    customer,
                    site,
                    probes: self.probes,
                });
            }
            Ok(None) => {}
            Err(err) => self.last_error = Some(err),
        }

        if self.remaining.is_empty() {
            self.exhaust()
        } else {
            ProbeState::Probing(self)
        }
    }

    fn exhaust(self) -> ProbeState {
        ProbeState::Exhausted {
            probes: self.probes,
            last_error: self.last_error,
        }
    }
}

pub struct SiteResolver<'a> {
    gateway: &'a dyn CrmGateway,
    sites: &'a SiteList,
}

impl<'a> SiteResolver<'a> {
    pub fn new(gateway: &'a dyn CrmGateway, sites: &'a SiteList) -> Self {
        Self { gateway, sites }
    }

    /// Find the site holding `customer_id`. Probes run sequentially and stop
    /// at the first site that returns a record; failed reads move on to the
    /// next candidate.
    pub async fn resolve(&self, customer_id: i64) -> Result<ResolvedSite, BuyoutError> {
        let mut state = SiteProbe::start(self.sites);
        loop {
            state = match state {
                ProbeState::Probing(probe) => {
                    let Some(site) = probe.next_site().cloned() else {
                        break Err(not_found(customer_id, probe.probes, None));
                    };
                    let outcome = self.gateway.get_customer(customer_id, Some(&site)).await;
                    match &outcome {
                        Ok(Some(_)) => debug!(customer_id, %site, "customer found"),
                        Ok(None) => debug!(customer_id, %site, "customer not under site"),
                        Err(err) => warn!(
                            customer_id,
                            %site,
                            disposition = ?err.disposition(),
                            error = %err,
                            "site probe failed"
                        ),
                    }
                    probe.advance(outcome)
                }
                ProbeState::Found(resolved) => {
                    info!(
                        customer_id,
                        site = %resolved.site,
                        probes = resolved.probes,
                        "resolved customer site"
                    );
                    break Ok(resolved);
                }
                ProbeState::Exhausted { probes, last_error } => {
                    break Err(not_found(customer_id, probes, last_error));
                }
            };
        }
    }
}

fn not_found(customer_id: i64, probes: usize, last_error: Option<CrmError>) -> BuyoutError {
    BuyoutError::IdentityNotFound {
        identity: format!("customer:{customer_id}"),
        detail: match last_error {
            Some(err) => format!("not found under any of {probes} sites (last error: {err})"),
            None => format!("not found under any of {probes} sites"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sites() -> SiteList {
        SiteList::parse_csv("a,b,c").unwrap()
    }

    fn customer(id: i64) -> Customer {
        Customer {
            id,
            ..Default::default()
        }
    }

    #[test]
    fn probe_walks_sites_in_order_and_stops_at_hit() {
        let ProbeState::Probing(probe) = SiteProbe::start(&sites()) else {
            panic!("expected probing state");
        };
        assert_eq!(probe.next_site(), Some(&Site::new("a")));

        let ProbeState::Probing(probe) = probe.advance(Ok(None)) else {
            panic!("expected probing state");
        };
        assert_eq!(probe.next_site(), Some(&Site::new("b")));

        match probe.advance(Ok(Some(customer(9)))) {
            ProbeState::Found(resolved) => {
                assert_eq!(resolved.site, Site::new("b"));
                assert_eq!(resolved.probes, 2);
                assert_eq!(resolved.customer.site, Some(Site::new("b")));
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn probe_errors_do_not_stop_the_walk() {
        let mut state = SiteProbe::start(&sites());
        for _ in 0..3 {
            let ProbeState::Probing(probe) = state else {
                panic!("expected probing state");
            };
            state = probe.advance(Err(CrmError::HttpStatus {
                endpoint: "/customers/1".into(),
                status: 502,
                message: "Bad Gateway".into(),
            }));
        }
        match state {
            ProbeState::Exhausted { probes, last_error } => {
                assert_eq!(probes, 3);
                assert!(last_error.is_some());
            }
            other => panic!("unexpected state {other:?}"),
        }
    }
}
