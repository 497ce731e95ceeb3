//! Billing rates and the rate-snapshot cascade
//!
//! A time entry's `rate_at_time` is taken once from the first source in the
//! cascade that yields an active rate: explicit reference, ticket, user,
//! account, system default.

use serde::{Deserialize, Serialize};

use core_kernel::{AccountId, BillingRateId, Money, TicketId, UserId};

/// What a billing rate applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum RateScope {
    Ticket(TicketId),
    User(UserId),
    Account(AccountId),
    System,
}

impl RateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateScope::Ticket(_) => "ticket",
            RateScope::User(_) => "user",
            RateScope::Account(_) => "account",
            RateScope::System => "system",
        }
    }
}

/// An hourly billing rate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingRate {
    pub id: BillingRateId,
    pub scope: RateScope,
    pub name: String,
    pub hourly_rate: Money,
    pub is_active: bool,
}

impl BillingRate {
    pub fn new(scope: RateScope, name: impl Into<String>, hourly_rate: Money) -> Self {
        Self {
            id: BillingRateId::new_v7(),
            scope,
            name: name.into(),
            hourly_rate,
            is_active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Inputs to the cascade
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateQuery {
    pub explicit: Option<BillingRateId>,
    pub ticket_id: Option<TicketId>,
    pub user_id: Option<UserId>,
    pub account_id: Option<AccountId>,
}

/// One link of the cascade
pub trait RateSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn select<'a>(&self, query: &RateQuery, rates: &'a [BillingRate]) -> Option<&'a BillingRate>;
}

fn active_with_scope(rates: &[BillingRate], scope: RateScope) -> Option<&BillingRate> {
    rates
        .iter()
        .filter(|r| r.is_active && r.scope == scope)
        .min_by_key(|r| r.id)
}

#[derive(Debug, Default)]
pub struct ExplicitRate;

impl RateSource for ExplicitRate {
    fn name(&self) -> &'static str {
        "explicit"
    }

    fn select<'a>(&self, query: &RateQuery, rates: &'a [BillingRate]) -> Option<&'a BillingRate> {
        let id = query.explicit?;
        rates.iter().find(|r| r.id == id && r.is_active)
    }
}

#[derive(Debug, Default)]
pub struct TicketRate;

impl RateSource for TicketRate {
    fn name(&self) -> &'static str {
        "ticket"
    }

    fn select<'a>(&self, query: &RateQuery, rates: &'a [BillingRate]) -> Option<&'a BillingRate> {
        active_with_scope(rates, RateScope::Ticket(query.ticket_id?))
    }
}

#[derive(Debug, Default)]
pub struct UserRate;

impl RateSource for UserRate {
    fn name(&self) -> &'static str {
        "user"
    }

    fn select<'a>(&self, query: &RateQuery, rates: &'a [BillingRate]) -> Option<&'a BillingRate> {
        active_with_scope(rates, RateScope::User(query.user_id?))
    }
}

#[derive(Debug, Default)]
pub struct AccountRate;

impl RateSource for AccountRate {
    fn name(&self) -> &'static str {
        "account"
    }

    fn select<'a>(&self, query: &RateQuery, rates: &'a [BillingRate]) -> Option<&'a BillingRate> {
        active_with_scope(rates, RateScope::Account(query.account_id?))
    }
}

#[derive(Debug, Default)]
pub struct SystemRate;

impl RateSource for SystemRate {
    fn name(&self) -> &'static str {
        "system"
    }

    fn select<'a>(&self, _query: &RateQuery, rates: &'a [BillingRate]) -> Option<&'a BillingRate> {
        active_with_scope(rates, RateScope::System)
    }
}

/// Ordered list of rate sources
pub struct RateCascade {
    sources: Vec<Box<dyn RateSource>>,
}

impl RateCascade {
    pub fn new(sources: Vec<Box<dyn RateSource>>) -> Self {
        Self { sources }
    }

    /// explicit > ticket > user > account > system
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(ExplicitRate),
            Box::new(TicketRate),
            Box::new(UserRate),
            Box::new(AccountRate),
            Box::new(SystemRate),
        ])
    }

    /// The rate the first matching source selects
    pub fn resolve<'a>(&self, query: &RateQuery, rates: &'a [BillingRate]) -> Option<&'a BillingRate> {
        self.sources.iter().find_map(|s| s.select(query, rates))
    }

    /// Hourly amount to snapshot, if any source applies
    pub fn snapshot(&self, query: &RateQuery, rates: &[BillingRate]) -> Option<Money> {
        self.resolve(query, rates).map(|r| r.hourly_rate)
    }
}

impl Default for RateCascade {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for RateCascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sources.iter().map(|s| s.name()))
            .finish()
    }
}
