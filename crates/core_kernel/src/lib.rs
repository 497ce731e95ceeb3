//! Core Kernel - Foundational types for the billing system
//!
//! This crate provides the building blocks shared by every billing crate:
//! - Money and Rate types with precise fixed-point decimal arithmetic
//! - A `Clock` abstraction so time-dependent logic stays testable
//! - Strongly-typed identifiers
//! - Port error and health types for the hexagonal architecture

pub mod money;
pub mod clock;
pub mod identifiers;
pub mod ports;

pub use money::{Money, Currency, MoneyError, Rate, round_money};
pub use clock::{Clock, SystemClock, ManualClock};
pub use identifiers::{
    AccountId, UserId, TicketId, TimerId, TimeEntryId, TicketAddonId,
    InvoiceId, LineItemId, PaymentId, BillingRateId, TaxConfigurationId,
    BillingSettingId,
};
pub use ports::{PortError, DomainPort, HealthCheckable, HealthCheckResult, AdapterHealth};
