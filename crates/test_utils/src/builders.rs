//! Test Data Builders
//!
//! Builders for billing inputs with sensible defaults, plus [`BillingHarness`],
//! which wires every billing service to one in-memory store and a manual
//! clock. Tests specify only the fields they care about.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use core_kernel::{AccountId, BillingRateId, Clock, ManualClock, Money, TicketId, UserId};
use domain_billing::{
    AccountRef, AddonKind, BillingConsolidationEngine, BillingRate, BillingSetting, BillingStore,
    InMemoryBillingStore, InvoiceNumberAllocator, NewTicketAddon, NewTimeEntry,
    PaymentReconciler, RateScope, TaxConfiguration, TicketAddon, TicketRef, TimeEntry,
    TimeEntryApproval, TimerLifecycle,
};

use crate::fixtures::{fake_description, BillingFixtures, MoneyFixtures, TemporalFixtures};

/// Builder for [`NewTimeEntry`]
pub struct TestTimeEntryBuilder {
    user_id: UserId,
    account_id: AccountId,
    ticket_id: Option<TicketId>,
    description: String,
    started_at: DateTime<Utc>,
    duration_seconds: i64,
    billable: bool,
    billing_rate_id: Option<BillingRateId>,
    rate_override: Option<Money>,
}

impl TestTimeEntryBuilder {
    /// One billable hour for `account_id` starting at the fixture work start
    pub fn new(account_id: AccountId) -> Self {
        Self {
            user_id: BillingFixtures::user(),
            account_id,
            ticket_id: None,
            description: fake_description(),
            started_at: TemporalFixtures::work_start(),
            duration_seconds: 3600,
            billable: true,
            billing_rate_id: None,
            rate_override: None,
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_ticket(mut self, ticket_id: TicketId) -> Self {
        self.ticket_id = Some(ticket_id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn with_duration_seconds(mut self, seconds: i64) -> Self {
        self.duration_seconds = seconds;
        self
    }

    pub fn non_billable(mut self) -> Self {
        self.billable = false;
        self
    }

    pub fn with_billing_rate(mut self, rate_id: BillingRateId) -> Self {
        self.billing_rate_id = Some(rate_id);
        self
    }

    /// Sets a manual hourly rate
    pub fn with_hourly_rate(mut self, rate: Money) -> Self {
        self.rate_override = Some(rate);
        self
    }

    pub fn build(self) -> NewTimeEntry {
        NewTimeEntry {
            user_id: self.user_id,
            account_id: self.account_id,
            ticket_id: self.ticket_id,
            description: self.description,
            started_at: self.started_at,
            ended_at: None,
            duration_seconds: Some(self.duration_seconds),
            billable: self.billable,
            billing_rate_id: self.billing_rate_id,
            rate_override: self.rate_override,
        }
    }
}

/// Builder for [`NewTicketAddon`]
pub struct TestAddonBuilder {
    ticket_id: TicketId,
    name: String,
    kind: AddonKind,
    unit_price: Money,
    quantity: Decimal,
    discount: Option<Money>,
    billable: bool,
    taxable: bool,
}

impl TestAddonBuilder {
    /// One taxable $50.00 product on `ticket_id`
    pub fn new(ticket_id: TicketId) -> Self {
        Self {
            ticket_id,
            name: "Replacement part".to_string(),
            kind: AddonKind::Product,
            unit_price: MoneyFixtures::usd(dec!(50.00)),
            quantity: dec!(1),
            discount: None,
            billable: true,
            taxable: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_kind(mut self, kind: AddonKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_unit_price(mut self, price: Money) -> Self {
        self.unit_price = price;
        self
    }

    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_discount(mut self, discount: Money) -> Self {
        self.discount = Some(discount);
        self
    }

    pub fn non_billable(mut self) -> Self {
        self.billable = false;
        self
    }

    pub fn non_taxable(mut self) -> Self {
        self.taxable = false;
        self
    }

    pub fn build(self) -> NewTicketAddon {
        NewTicketAddon {
            ticket_id: self.ticket_id,
            name: self.name,
            description: None,
            kind: self.kind,
            unit_price: self.unit_price,
            quantity: self.quantity,
            discount: self.discount,
            billable: self.billable,
            taxable: self.taxable,
        }
    }
}

/// Every billing service over one shared in-memory store and manual clock
pub struct BillingHarness {
    pub store: InMemoryBillingStore,
    pub clock: ManualClock,
    pub timers: TimerLifecycle,
    pub approvals: TimeEntryApproval,
    pub engine: BillingConsolidationEngine,
    pub reconciler: PaymentReconciler,
    pub allocator: InvoiceNumberAllocator,
    /// Approver recorded on decisions made through the harness
    pub approver: UserId,
}

impl BillingHarness {
    /// Empty store, clock at the fixture work start
    pub fn bare() -> Self {
        let store = InMemoryBillingStore::new();
        let clock = ManualClock::new(TemporalFixtures::work_start());
        let port: Arc<dyn BillingStore> = Arc::new(store.clone());
        let time: Arc<dyn Clock> = Arc::new(clock.clone());

        Self {
            timers: TimerLifecycle::new(port.clone(), time.clone()),
            approvals: TimeEntryApproval::new(port.clone(), time.clone()),
            engine: BillingConsolidationEngine::new(port.clone(), time.clone()),
            reconciler: PaymentReconciler::new(port.clone(), time),
            allocator: InvoiceNumberAllocator::new(port),
            store,
            clock,
            approver: BillingFixtures::user(),
        }
    }

    /// Harness with the global USD `INV-` setting in place
    pub async fn new() -> Self {
        let harness = Self::bare();
        harness.store.put_billing_setting(BillingFixtures::global_setting()).await;
        harness
    }

    pub async fn setting(&self, setting: BillingSetting) {
        self.store.put_billing_setting(setting).await;
    }

    pub async fn tax(&self, configuration: TaxConfiguration) {
        self.store.add_tax_configuration(configuration).await;
    }

    /// Adds an active system-wide hourly rate
    pub async fn system_rate(&self, hourly: Money) -> BillingRate {
        let rate = BillingRate::new(RateScope::System, "Standard", hourly);
        self.store.add_billing_rate(rate.clone()).await;
        rate
    }

    pub async fn account(&self, jurisdiction: Option<&str>) -> AccountRef {
        let account = BillingFixtures::account(jurisdiction);
        self.store.add_account(account.clone()).await;
        account
    }

    pub async fn ticket(&self, account_id: AccountId) -> TicketRef {
        let ticket = BillingFixtures::ticket(account_id);
        self.store.add_ticket(ticket).await;
        ticket
    }

    /// Creates and approves a time entry
    ///
    /// # Panics
    ///
    /// Panics if creation or approval fails
    pub async fn approved_entry(&self, builder: TestTimeEntryBuilder) -> TimeEntry {
        let entry = self
            .approvals
            .create_entry(builder.build())
            .await
            .expect("Failed to create time entry");
        self.approvals
            .approve(entry.id, self.approver, None)
            .await
            .expect("Failed to approve time entry")
    }

    /// Creates and approves a ticket add-on
    ///
    /// # Panics
    ///
    /// Panics if creation or approval fails
    pub async fn approved_addon(&self, builder: TestAddonBuilder) -> TicketAddon {
        let addon = self
            .approvals
            .create_addon(builder.build())
            .await
            .expect("Failed to create add-on");
        self.approvals
            .approve_addon(addon.id, self.approver, None)
            .await
            .expect("Failed to approve add-on")
    }
}
