//! Integration tests for domain_billing against the in-memory store

use std::collections::BTreeSet;

use chrono::Days;
use proptest::prelude::*;
use rust_decimal_macros::dec;

use core_kernel::{Currency, Money, PortError, Rate};
use domain_billing::{
    format_invoice_number, BillingError, BillingSetting, BillingStore, CommitOverrides, ConsolidationRequest,
    InvoiceStatus, InvoiceTaxPolicy, LineSource, ManualCharge, NewPayment, PaymentMethod,
    PaymentStatus, StartTimer, TaxApplication, TaxConfiguration, Timer, TimeEntryChanges,
    TimerStatus,
};
use test_utils::{
    assert_billed_once, assert_money_eq, assert_money_zero, assert_totals_reconcile,
    duration_seconds_strategy, hourly_rate_strategy, quantity_strategy, tax_mode_strategy,
    tax_rate_strategy, timer_script_strategy, unit_price_strategy, BillingFixtures,
    BillingHarness, MoneyFixtures, RateFixtures, TemporalFixtures, TestAddonBuilder,
    TestTimeEntryBuilder,
};

fn request() -> ConsolidationRequest {
    ConsolidationRequest::as_of(TemporalFixtures::invoice_date())
}

fn payment(amount: Money) -> NewPayment {
    NewPayment {
        method: PaymentMethod::BankTransfer,
        amount,
        fees: None,
        payment_date: TemporalFixtures::invoice_date(),
        external_reference: None,
        notes: None,
    }
}

/// Account with an 8.25 % account tax, one 1h entry at $200 and two $50 parts with $10 off
async fn scenario_c(harness: &BillingHarness) -> domain_billing::Invoice {
    let account = harness.account(None).await;
    let ticket = harness.ticket(account.id).await;
    harness
        .tax(TaxConfiguration::new(
            Some(account.id),
            "State sales tax",
            RateFixtures::sales_tax(),
            TemporalFixtures::tax_year_start(),
        ))
        .await;

    harness
        .approved_entry(
            TestTimeEntryBuilder::new(account.id)
                .with_ticket(ticket.id)
                .with_hourly_rate(MoneyFixtures::usd(dec!(200.00))),
        )
        .await;
    harness
        .approved_addon(
            TestAddonBuilder::new(ticket.id)
                .with_unit_price(MoneyFixtures::usd(dec!(50.00)))
                .with_quantity(dec!(2))
                .with_discount(MoneyFixtures::usd(dec!(10.00))),
        )
        .await;

    harness
        .engine
        .consolidate(account.id, request())
        .await
        .expect("consolidation should succeed")
}

// ============================================================================
// Timer Lifecycle Tests
// ============================================================================

mod timer_tests {
    use super::*;

    #[tokio::test]
    async fn test_pause_resume_stop_excludes_paused_time() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let user = BillingFixtures::user();

        let timer = harness
            .timers
            .start(StartTimer {
                user_id: user,
                account_id: Some(account.id),
                ..Default::default()
            })
            .await
            .unwrap();

        harness.clock.advance_secs(10);
        harness.timers.pause(timer.id).await.unwrap();
        harness.clock.advance_secs(5);
        harness.timers.resume(timer.id).await.unwrap();
        harness.clock.advance_secs(10);
        let stopped = harness.timers.stop(timer.id).await.unwrap();

        assert_eq!(stopped.status, TimerStatus::Stopped);
        assert_eq!(harness.timers.elapsed_seconds(timer.id).await.unwrap(), 20);

        harness.clock.advance_secs(60);
        assert_eq!(harness.timers.elapsed_seconds(timer.id).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_start_returns_existing_active_timer() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let ticket = harness.ticket(account.id).await;
        let input = StartTimer {
            user_id: BillingFixtures::user(),
            ticket_id: Some(ticket.id),
            ..Default::default()
        };

        let first = harness.timers.start(input.clone()).await.unwrap();
        let second = harness.timers.start(input).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.account_id, Some(account.id));
    }

    #[tokio::test]
    async fn test_commit_creates_pending_entry_once() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;

        let timer = harness
            .timers
            .start(StartTimer {
                user_id: BillingFixtures::user(),
                account_id: Some(account.id),
                description: Some("Server migration".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        harness.clock.advance_secs(1800);

        let entry = harness
            .timers
            .commit(timer.id, CommitOverrides::default())
            .await
            .unwrap();
        let again = harness
            .timers
            .commit(timer.id, CommitOverrides::default())
            .await
            .unwrap();

        assert_eq!(entry.id, again.id);
        assert_eq!(entry.duration_seconds, 1800);
        assert_eq!(entry.timer_id, Some(timer.id));
        assert!(entry.approval.is_pending());
        assert_eq!(entry.description, "Server migration");

        let committed = harness.timers.get(timer.id).await.unwrap();
        assert_eq!(committed.time_entry_id, Some(entry.id));
        assert!(matches!(
            harness.timers.cancel(timer.id).await,
            Err(BillingError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_without_account_or_ticket_is_rejected() {
        let harness = BillingHarness::new().await;
        let timer = harness
            .timers
            .start(StartTimer {
                user_id: BillingFixtures::user(),
                ..Default::default()
            })
            .await
            .unwrap();

        let result = harness.timers.commit(timer.id, CommitOverrides::default()).await;

        assert!(matches!(result, Err(BillingError::Validation(_))));
    }

    #[tokio::test]
    async fn test_canceled_timer_cannot_be_committed() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let timer = harness
            .timers
            .start(StartTimer {
                user_id: BillingFixtures::user(),
                account_id: Some(account.id),
                ..Default::default()
            })
            .await
            .unwrap();

        harness.timers.cancel(timer.id).await.unwrap();
        let result = harness.timers.commit(timer.id, CommitOverrides::default()).await;

        assert!(matches!(result, Err(BillingError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_stale_timer_write_cannot_revive_canceled_timer() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let timer = harness
            .timers
            .start(StartTimer {
                user_id: BillingFixtures::user(),
                account_id: Some(account.id),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut stale = harness.store.get_timer(timer.id).await.unwrap();
        harness.timers.cancel(timer.id).await.unwrap();

        assert!(stale.pause(TemporalFixtures::hours_after_start(1)));
        let result = harness.store.update_timer(&stale, TimerStatus::Running).await;

        assert!(matches!(result, Err(PortError::Conflict { .. })));
        let stored = harness.timers.get(timer.id).await.unwrap();
        assert_eq!(stored.status, TimerStatus::Canceled);
        assert!(stored.paused_at.is_none());
    }

    proptest! {
        #[test]
        fn test_elapsed_never_decreases_and_never_exceeds_wall_time(
            script in timer_script_strategy()
        ) {
            let start = TemporalFixtures::work_start();
            let mut now = start;
            let mut timer = Timer::start(BillingFixtures::user(), None, None, None, None, now);
            let mut previous = 0;

            for (op, advance) in script {
                now += chrono::Duration::seconds(advance);
                match op {
                    0 => { timer.pause(now); }
                    1 => { timer.resume(now); }
                    _ => {}
                }
                let elapsed = timer.elapsed_seconds(now);
                prop_assert!(elapsed >= previous);
                prop_assert!(elapsed <= (now - start).num_seconds());
                previous = elapsed;
            }
        }
    }
}

// ============================================================================
// Approval Workflow Tests
// ============================================================================

mod approval_tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_snapshot_bills_duration_times_rate() {
        let harness = BillingHarness::new().await;
        harness.system_rate(MoneyFixtures::usd_100_hourly()).await;
        let account = harness.account(None).await;

        let entry = harness
            .approved_entry(TestTimeEntryBuilder::new(account.id).with_duration_seconds(3600))
            .await;

        assert_eq!(entry.rate_at_time, Some(MoneyFixtures::usd_100_hourly()));
        assert_money_eq(&entry.calculated_amount(Currency::USD), dec!(100.00));
    }

    #[tokio::test]
    async fn test_cross_account_ticket_is_rejected() {
        let harness = BillingHarness::new().await;
        let owner = harness.account(None).await;
        let other = harness.account(None).await;
        let ticket = harness.ticket(owner.id).await;

        let result = harness
            .approvals
            .create_entry(TestTimeEntryBuilder::new(other.id).with_ticket(ticket.id).build())
            .await;

        assert!(matches!(
            result,
            Err(BillingError::CrossAccountReference { ticket_account, .. }) if ticket_account == owner.id
        ));
    }

    #[tokio::test]
    async fn test_decided_entry_must_be_reopened_before_deciding_again() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let entry = harness.approved_entry(TestTimeEntryBuilder::new(account.id)).await;

        let again = harness.approvals.reject(entry.id, harness.approver, None).await;
        assert!(matches!(again, Err(BillingError::InvalidState(_))));

        let reopened = harness.approvals.reopen(entry.id).await.unwrap();
        assert!(reopened.approval.is_pending());
        let rejected = harness
            .approvals
            .reject(entry.id, harness.approver, Some("duplicate".to_string()))
            .await
            .unwrap();
        assert_eq!(rejected.approval.notes.as_deref(), Some("duplicate"));
    }

    #[tokio::test]
    async fn test_invoiced_entry_is_frozen() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let entry = harness
            .approved_entry(
                TestTimeEntryBuilder::new(account.id).with_hourly_rate(MoneyFixtures::usd_100_hourly()),
            )
            .await;
        harness.engine.consolidate(account.id, request()).await.unwrap();

        assert!(matches!(
            harness.approvals.reopen(entry.id).await,
            Err(BillingError::InvalidState(_))
        ));
        assert!(matches!(
            harness.approvals.approve(entry.id, harness.approver, None).await,
            Err(BillingError::InvalidState(_))
        ));
        assert!(matches!(
            harness
                .approvals
                .edit(
                    entry.id,
                    TimeEntryChanges {
                        duration_seconds: Some(60),
                        ..Default::default()
                    }
                )
                .await,
            Err(BillingError::InvalidState(_))
        ));
        assert!(matches!(
            harness.approvals.delete(entry.id).await,
            Err(BillingError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_addon_inherits_ticket_account_and_computes_total() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let ticket = harness.ticket(account.id).await;

        let addon = harness
            .approved_addon(
                TestAddonBuilder::new(ticket.id)
                    .with_quantity(dec!(2))
                    .with_discount(MoneyFixtures::usd(dec!(10.00))),
            )
            .await;

        assert_eq!(addon.account_id, account.id);
        assert_money_eq(&addon.total, dec!(90.00));
        assert!(addon.approval.is_approved());
    }
}

// ============================================================================
// Consolidation Tests
// ============================================================================

mod consolidation_tests {
    use super::*;

    #[tokio::test]
    async fn test_scenario_invoice_tax_and_totals() {
        let harness = BillingHarness::new().await;
        let invoice = scenario_c(&harness).await;

        assert_eq!(invoice.status, InvoiceStatus::Draft);
        assert_eq!(invoice.invoice_number, "INV-000001");
        assert_eq!(invoice.due_date, TemporalFixtures::due_date());
        assert_eq!(invoice.lines.len(), 2);

        let labor = &invoice.lines[0];
        assert!(labor.source.is_time_entry());
        assert_money_eq(&labor.tax_amount, dec!(16.50));

        let parts = &invoice.lines[1];
        assert_money_eq(&parts.pre_tax_amount().unwrap(), dec!(90.00));
        assert_money_eq(&parts.tax_amount, dec!(7.43));

        assert_money_eq(&invoice.subtotal, dec!(290.00));
        assert_money_eq(&invoice.tax_amount, dec!(23.93));
        assert_money_eq(&invoice.total, dec!(313.93));
        assert_totals_reconcile(&invoice);
    }

    #[tokio::test]
    async fn test_preview_consumes_nothing() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let entry = harness
            .approved_entry(
                TestTimeEntryBuilder::new(account.id).with_hourly_rate(MoneyFixtures::usd_100_hourly()),
            )
            .await;

        let draft = harness.engine.preview(account.id, &request()).await.unwrap();
        assert_eq!(draft.time_entry_ids, vec![entry.id]);
        assert_eq!(harness.store.invoice_count().await, 0);

        let stored = harness.approvals.get_entry(entry.id).await.unwrap();
        assert!(!stored.billing.is_billed());

        let invoice = harness.engine.consolidate(account.id, request()).await.unwrap();
        assert_eq!(invoice.invoice_number, "INV-000001");
    }

    #[tokio::test]
    async fn test_only_approved_billable_items_are_consolidated() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let rate = MoneyFixtures::usd_100_hourly();

        let billed = harness
            .approved_entry(TestTimeEntryBuilder::new(account.id).with_hourly_rate(rate))
            .await;
        let non_billable = harness
            .approved_entry(
                TestTimeEntryBuilder::new(account.id).with_hourly_rate(rate).non_billable(),
            )
            .await;
        let pending = harness
            .approvals
            .create_entry(TestTimeEntryBuilder::new(account.id).with_hourly_rate(rate).build())
            .await
            .unwrap();

        let invoice = harness.engine.consolidate(account.id, request()).await.unwrap();

        assert!(invoice.line_for_time_entry(billed.id).is_some());
        assert!(invoice.line_for_time_entry(non_billable.id).is_none());
        assert!(invoice.line_for_time_entry(pending.id).is_none());
    }

    #[tokio::test]
    async fn test_commit_refuses_items_reopened_after_preview() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let ticket = harness.ticket(account.id).await;
        let entry = harness
            .approved_entry(
                TestTimeEntryBuilder::new(account.id).with_hourly_rate(MoneyFixtures::usd_100_hourly()),
            )
            .await;
        let addon = harness.approved_addon(TestAddonBuilder::new(ticket.id)).await;

        let draft = harness.engine.preview(account.id, &request()).await.unwrap();
        harness.approvals.reopen_addon(addon.id).await.unwrap();

        let result = harness
            .store
            .commit_consolidation(&draft, TemporalFixtures::hours_after_start(2))
            .await;

        assert!(matches!(result, Err(PortError::Conflict { .. })));
        assert_eq!(harness.store.invoice_count().await, 0);
        let entry = harness.approvals.get_entry(entry.id).await.unwrap();
        assert!(!entry.billing.is_billed());
        let addon = harness.approvals.get_addon(addon.id).await.unwrap();
        assert!(!addon.billing.is_billed());
        assert!(addon.approval.is_pending());
    }

    #[tokio::test]
    async fn test_commit_refuses_entry_made_non_billable_after_preview() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let entry = harness
            .approved_entry(
                TestTimeEntryBuilder::new(account.id).with_hourly_rate(MoneyFixtures::usd_100_hourly()),
            )
            .await;

        let draft = harness.engine.preview(account.id, &request()).await.unwrap();
        let mut changed = harness.approvals.get_entry(entry.id).await.unwrap();
        changed.billable = false;
        harness.store.update_time_entry(&changed).await.unwrap();

        let result = harness
            .store
            .commit_consolidation(&draft, TemporalFixtures::hours_after_start(2))
            .await;

        assert!(matches!(result, Err(PortError::Conflict { .. })));
        assert!(!harness.approvals.get_entry(entry.id).await.unwrap().billing.is_billed());
    }

    #[tokio::test]
    async fn test_zero_duration_entry_bills_a_zero_line() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let entry = harness
            .approved_entry(
                TestTimeEntryBuilder::new(account.id)
                    .with_duration_seconds(0)
                    .with_hourly_rate(MoneyFixtures::usd_100_hourly()),
            )
            .await;

        let invoice = harness.engine.consolidate(account.id, request()).await.unwrap();

        let line = invoice
            .line_for_time_entry(entry.id)
            .expect("zero-hour entry is still invoiced");
        assert_eq!(line.quantity, dec!(0));
        assert_money_zero(&line.total_amount);
        assert_money_eq(&invoice.total, dec!(0.00));
        assert_totals_reconcile(&invoice);
    }

    #[tokio::test]
    async fn test_foreign_currency_entry_is_rejected_before_pricing() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        harness
            .approved_entry(
                TestTimeEntryBuilder::new(account.id).with_hourly_rate(MoneyFixtures::usd_100_hourly()),
            )
            .await;
        let euro = harness
            .approved_entry(TestTimeEntryBuilder::new(account.id).with_hourly_rate(MoneyFixtures::eur_100()))
            .await;

        let result = harness.engine.preview(account.id, &request()).await;

        match result {
            Err(BillingError::Validation(message)) => {
                assert!(message.contains(&euro.id.to_string()), "{message}");
                assert!(message.contains("EUR"), "{message}");
            }
            other => panic!("expected a validation error, got {other:?}"),
        }
        assert!(matches!(
            harness.engine.consolidate(account.id, request()).await,
            Err(BillingError::Validation(_))
        ));
        assert_eq!(harness.store.invoice_count().await, 0);
    }

    #[tokio::test]
    async fn test_second_consolidation_finds_nothing() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        harness
            .approved_entry(
                TestTimeEntryBuilder::new(account.id).with_hourly_rate(MoneyFixtures::usd_100_hourly()),
            )
            .await;

        harness.engine.consolidate(account.id, request()).await.unwrap();
        let second = harness.engine.consolidate(account.id, request()).await;

        assert!(matches!(second, Err(BillingError::NoUnbilledItems(id)) if id == account.id));
    }

    #[tokio::test]
    async fn test_missing_settings_is_reported() {
        let harness = BillingHarness::bare();
        let account = harness.account(None).await;
        harness.approved_entry(TestTimeEntryBuilder::new(account.id)).await;

        let result = harness.engine.consolidate(account.id, request()).await;

        assert!(matches!(result, Err(BillingError::MissingBillingSettings(_))));
    }

    #[tokio::test]
    async fn test_account_setting_wins_over_global() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        harness
            .setting(
                BillingSetting::for_account(account.id, "ACME-", Currency::USD)
                    .with_number_padding(4)
                    .with_next_number(42)
                    .with_payment_terms(14),
            )
            .await;
        harness
            .approved_entry(
                TestTimeEntryBuilder::new(account.id).with_hourly_rate(MoneyFixtures::usd_100_hourly()),
            )
            .await;

        let invoice = harness.engine.consolidate(account.id, request()).await.unwrap();

        assert_eq!(invoice.invoice_number, "ACME-0042");
        assert_eq!(
            invoice.due_date,
            TemporalFixtures::invoice_date().checked_add_days(Days::new(14)).unwrap()
        );
        let global = harness.store.stored_billing_setting(None).await.unwrap();
        assert_eq!(global.next_invoice_number, 1);
    }

    #[tokio::test]
    async fn test_discard_releases_items_and_leaves_number_gap() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let entry = harness
            .approved_entry(
                TestTimeEntryBuilder::new(account.id).with_hourly_rate(MoneyFixtures::usd_100_hourly()),
            )
            .await;

        let first = harness.engine.consolidate(account.id, request()).await.unwrap();
        harness.engine.discard_draft(first.id).await.unwrap();

        let released = harness.approvals.get_entry(entry.id).await.unwrap();
        assert!(!released.billing.is_billed());
        assert!(matches!(
            harness.engine.get_invoice(first.id).await,
            Err(BillingError::NotFound { .. })
        ));

        let second = harness.engine.consolidate(account.id, request()).await.unwrap();
        assert_eq!(second.invoice_number, "INV-000002");
        assert!(second.line_for_time_entry(entry.id).is_some());
    }

    #[tokio::test]
    async fn test_sent_invoice_cannot_be_discarded() {
        let harness = BillingHarness::new().await;
        let invoice = scenario_c(&harness).await;
        harness.engine.send(invoice.id).await.unwrap();

        let result = harness.engine.discard_draft(invoice.id).await;

        assert!(matches!(result, Err(BillingError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_canceled_invoice_keeps_items_billed() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let entry = harness
            .approved_entry(
                TestTimeEntryBuilder::new(account.id).with_hourly_rate(MoneyFixtures::usd_100_hourly()),
            )
            .await;
        let invoice = harness.engine.consolidate(account.id, request()).await.unwrap();

        let canceled = harness.engine.cancel(invoice.id).await.unwrap();

        assert_eq!(canceled.status, InvoiceStatus::Canceled);
        let stored = harness.approvals.get_entry(entry.id).await.unwrap();
        assert_eq!(stored.invoice_id(), Some(invoice.id));
    }

    #[tokio::test]
    async fn test_section_headings_and_manual_charges() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        harness
            .approved_entry(
                TestTimeEntryBuilder::new(account.id).with_hourly_rate(MoneyFixtures::usd_100_hourly()),
            )
            .await;

        let invoice = harness
            .engine
            .consolidate(
                account.id,
                request()
                    .with_section_headings()
                    .with_notes("March support")
                    .with_manual_charge(ManualCharge {
                        description: "Travel".to_string(),
                        quantity: dec!(1),
                        unit_price: MoneyFixtures::usd(dec!(25.00)),
                        taxable: Some(false),
                    }),
            )
            .await
            .unwrap();

        let sources: Vec<_> = invoice.lines.iter().map(|l| l.source.line_type()).collect();
        assert_eq!(sources, vec!["separator", "time_entry", "separator", "manual"]);
        assert_money_eq(&invoice.subtotal, dec!(125.00));
        assert_eq!(invoice.notes.as_deref(), Some("March support"));
        assert_totals_reconcile(&invoice);
    }

    #[tokio::test]
    async fn test_manual_charge_alone_is_not_enough_to_invoice() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;

        let result = harness
            .engine
            .consolidate(
                account.id,
                request().with_manual_charge(ManualCharge {
                    description: "Travel".to_string(),
                    quantity: dec!(1),
                    unit_price: MoneyFixtures::usd(dec!(25.00)),
                    taxable: None,
                }),
            )
            .await;

        assert!(matches!(result, Err(BillingError::NoUnbilledItems(_))));
    }

    #[tokio::test]
    async fn test_allocator_reserves_numbers_outside_consolidation() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;

        let first = harness.allocator.next_number(account.id).await.unwrap();
        let second = harness.allocator.next_number(account.id).await.unwrap();

        assert_eq!(first, format_invoice_number("INV-", 1, 6));
        assert_eq!(second, "INV-000002");
    }
}

// ============================================================================
// Tax Resolution Tests
// ============================================================================

mod tax_tests {
    use super::*;

    async fn entry_and_part(harness: &BillingHarness) -> core_kernel::AccountId {
        let account = harness.account(Some("TX")).await;
        let ticket = harness.ticket(account.id).await;
        harness
            .approved_entry(
                TestTimeEntryBuilder::new(account.id)
                    .with_ticket(ticket.id)
                    .with_hourly_rate(MoneyFixtures::usd_100_hourly()),
            )
            .await;
        harness
            .approved_addon(TestAddonBuilder::new(ticket.id).with_unit_price(MoneyFixtures::usd(dec!(100.00))))
            .await;
        account.id
    }

    #[tokio::test]
    async fn test_non_service_mode_exempts_time_entries() {
        let harness = BillingHarness::new().await;
        harness.tax(BillingFixtures::global_sales_tax()).await;
        let account = entry_and_part(&harness).await;

        let invoice = harness
            .engine
            .consolidate(
                account,
                request().with_tax_policy(InvoiceTaxPolicy::with_mode(TaxApplication::NonServiceItems)),
            )
            .await
            .unwrap();

        assert_money_zero(&invoice.lines[0].tax_amount);
        assert_money_eq(&invoice.lines[1].tax_amount, dec!(8.25));
        assert_totals_reconcile(&invoice);
    }

    #[tokio::test]
    async fn test_override_rate_replaces_configured_rate() {
        let harness = BillingHarness::new().await;
        harness.tax(BillingFixtures::global_sales_tax()).await;
        let account = entry_and_part(&harness).await;

        let invoice = harness
            .engine
            .consolidate(
                account,
                request().with_tax_policy(InvoiceTaxPolicy::overridden(
                    TaxApplication::AllItems,
                    RateFixtures::override_rate(),
                )),
            )
            .await
            .unwrap();

        assert_money_eq(&invoice.tax_amount, dec!(10.00));
    }

    #[tokio::test]
    async fn test_custom_mode_flags_unflagged_time_entries() {
        let harness = BillingHarness::new().await;
        harness.tax(BillingFixtures::global_sales_tax()).await;
        let account = entry_and_part(&harness).await;

        let invoice = harness
            .engine
            .consolidate(
                account,
                request().with_tax_policy(InvoiceTaxPolicy::with_mode(TaxApplication::Custom)),
            )
            .await
            .unwrap();

        let labor = &invoice.lines[0];
        assert!(labor.tax_unresolved);
        assert_money_zero(&labor.tax_amount);
        let part = &invoice.lines[1];
        assert!(!part.tax_unresolved);
        assert_money_eq(&part.tax_amount, dec!(8.25));
    }

    #[tokio::test]
    async fn test_jurisdiction_specific_rate_beats_unrestricted() {
        let harness = BillingHarness::new().await;
        harness.tax(BillingFixtures::global_sales_tax()).await;
        harness
            .tax(
                TaxConfiguration::new(
                    None,
                    "Texas",
                    RateFixtures::master_rate(),
                    TemporalFixtures::tax_year_start(),
                )
                .with_jurisdiction("TX"),
            )
            .await;
        let account = entry_and_part(&harness).await;

        let invoice = harness.engine.consolidate(account, request()).await.unwrap();

        assert_money_eq(&invoice.tax_amount, dec!(20.00));
    }

    #[tokio::test]
    async fn test_master_rate_applies_without_configurations() {
        let harness = BillingHarness::new().await;
        harness
            .setting(
                BillingFixtures::global_setting().with_master_tax_rate(RateFixtures::master_rate()),
            )
            .await;
        let account = entry_and_part(&harness).await;

        let invoice = harness.engine.consolidate(account, request()).await.unwrap();

        assert_money_eq(&invoice.tax_amount, dec!(20.00));
        assert_eq!(invoice.lines[0].tax_rate, Rate::from_percentage(dec!(10)));
    }
}

// ============================================================================
// Payment Reconciliation Tests
// ============================================================================

mod payment_tests {
    use super::*;

    #[tokio::test]
    async fn test_full_payment_marks_invoice_paid() {
        let harness = BillingHarness::new().await;
        let invoice = scenario_c(&harness).await;

        let recorded = harness
            .reconciler
            .apply_payment(invoice.id, payment(MoneyFixtures::usd(dec!(313.93))))
            .await
            .unwrap();
        assert_eq!(recorded.status, PaymentStatus::Pending);

        let settled = harness.reconciler.mark_completed(recorded.id).await.unwrap();

        assert_eq!(settled.invoice.status, InvoiceStatus::Paid);
        assert!(settled.reconciliation.status_changed);
        assert_money_zero(&harness.reconciler.outstanding_balance(invoice.id).await.unwrap());
        assert_money_eq(&harness.reconciler.total_paid(invoice.id).await.unwrap(), dec!(313.93));
    }

    #[tokio::test]
    async fn test_partial_payment_leaves_balance() {
        let harness = BillingHarness::new().await;
        let invoice = scenario_c(&harness).await;
        harness.engine.send(invoice.id).await.unwrap();

        let recorded = harness
            .reconciler
            .apply_payment(invoice.id, payment(MoneyFixtures::usd(dec!(100.00))))
            .await
            .unwrap();
        let settled = harness.reconciler.mark_completed(recorded.id).await.unwrap();

        assert_eq!(settled.invoice.status, InvoiceStatus::Sent);
        assert_money_eq(&settled.reconciliation.outstanding, dec!(213.93));
    }

    #[tokio::test]
    async fn test_refund_reopens_sent_invoice() {
        let harness = BillingHarness::new().await;
        let invoice = scenario_c(&harness).await;
        harness.engine.send(invoice.id).await.unwrap();
        let recorded = harness
            .reconciler
            .apply_payment(invoice.id, payment(invoice.total))
            .await
            .unwrap();
        harness.reconciler.mark_completed(recorded.id).await.unwrap();

        let refunded = harness.reconciler.refund_payment(recorded.id).await.unwrap();

        assert_eq!(refunded.payment.status, PaymentStatus::Refunded);
        assert_eq!(refunded.invoice.status, InvoiceStatus::Sent);
        assert_money_eq(&refunded.reconciliation.outstanding, dec!(313.93));
    }

    #[tokio::test]
    async fn test_refund_after_due_date_reopens_overdue() {
        let harness = BillingHarness::new().await;
        let invoice = scenario_c(&harness).await;
        harness.engine.send(invoice.id).await.unwrap();
        let recorded = harness
            .reconciler
            .apply_payment(invoice.id, payment(invoice.total))
            .await
            .unwrap();
        harness.reconciler.mark_completed(recorded.id).await.unwrap();

        let after_due = TemporalFixtures::due_date().checked_add_days(Days::new(1)).unwrap();
        harness.clock.set(after_due.and_hms_opt(9, 0, 0).unwrap().and_utc());
        let refunded = harness.reconciler.refund_payment(recorded.id).await.unwrap();

        assert_eq!(refunded.invoice.status, InvoiceStatus::Overdue);
        assert!(refunded.invoice.paid_at.is_none());
        assert_money_eq(&refunded.reconciliation.outstanding, dec!(313.93));
    }

    #[tokio::test]
    async fn test_stale_send_cannot_overwrite_paid_invoice() {
        let harness = BillingHarness::new().await;
        let invoice = scenario_c(&harness).await;
        let mut stale = harness.engine.get_invoice(invoice.id).await.unwrap();

        let recorded = harness
            .reconciler
            .apply_payment(invoice.id, payment(invoice.total))
            .await
            .unwrap();
        harness.reconciler.mark_completed(recorded.id).await.unwrap();

        stale.send(TemporalFixtures::hours_after_start(3)).unwrap();
        let result = harness
            .store
            .update_invoice_status(&stale, InvoiceStatus::Draft)
            .await;

        assert!(matches!(result, Err(PortError::Conflict { .. })));
        let stored = harness.engine.get_invoice(invoice.id).await.unwrap();
        assert_eq!(stored.status, InvoiceStatus::Paid);
        assert!(stored.paid_at.is_some());
        assert!(stored.sent_at.is_none());
        assert!(matches!(
            harness.engine.cancel(invoice.id).await,
            Err(BillingError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_payment_never_counts() {
        let harness = BillingHarness::new().await;
        let invoice = scenario_c(&harness).await;
        let recorded = harness
            .reconciler
            .apply_payment(invoice.id, payment(invoice.total))
            .await
            .unwrap();

        let failed = harness.reconciler.mark_failed(recorded.id).await.unwrap();

        assert_eq!(failed.invoice.status, InvoiceStatus::Draft);
        assert!(matches!(
            harness.reconciler.mark_completed(recorded.id).await,
            Err(BillingError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_payment_currency_must_match_invoice() {
        let harness = BillingHarness::new().await;
        let invoice = scenario_c(&harness).await;

        let result = harness
            .reconciler
            .apply_payment(invoice.id, payment(MoneyFixtures::eur_100()))
            .await;

        assert!(matches!(result, Err(BillingError::Money(_))));
    }

    #[tokio::test]
    async fn test_overdue_refresh_flags_sent_invoices_past_due() {
        let harness = BillingHarness::new().await;
        let invoice = scenario_c(&harness).await;
        harness.engine.send(invoice.id).await.unwrap();

        let on_due_date = harness
            .reconciler
            .refresh_overdue(TemporalFixtures::due_date())
            .await
            .unwrap();
        assert!(on_due_date.is_empty());

        let after = TemporalFixtures::due_date().checked_add_days(Days::new(1)).unwrap();
        let changed = harness.reconciler.refresh_overdue(after).await.unwrap();
        assert_eq!(changed, vec![invoice.id]);
        assert_eq!(
            harness.engine.get_invoice(invoice.id).await.unwrap().status,
            InvoiceStatus::Overdue
        );
    }
}

// ============================================================================
// Concurrency Tests
// ============================================================================

mod concurrency_tests {
    use super::*;
    use tokio::task::JoinSet;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_consolidations_bill_each_item_once() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        for _ in 0..5 {
            harness
                .approved_entry(
                    TestTimeEntryBuilder::new(account.id)
                        .with_hourly_rate(MoneyFixtures::usd_100_hourly()),
                )
                .await;
        }

        let account_id = account.id;
        let mut set = JoinSet::new();
        for _ in 0..8 {
            let engine = harness.engine.clone();
            set.spawn(async move { engine.consolidate(account_id, request()).await });
        }

        let mut invoices = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined.unwrap() {
                Ok(invoice) => invoices.push(invoice),
                Err(BillingError::ConcurrentBillingConflict(_)) | Err(BillingError::NoUnbilledItems(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].lines.len(), 5);
        assert_eq!(harness.store.invoice_count().await, 1);
        assert_billed_once(&invoices);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pauses_all_settle_on_paused() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let timer = harness
            .timers
            .start(StartTimer {
                user_id: BillingFixtures::user(),
                account_id: Some(account.id),
                ..Default::default()
            })
            .await
            .unwrap();
        harness.clock.advance_secs(10);

        let timer_id = timer.id;
        let mut set = JoinSet::new();
        for _ in 0..8 {
            let timers = harness.timers.clone();
            set.spawn(async move { timers.pause(timer_id).await });
        }
        while let Some(joined) = set.join_next().await {
            let paused = joined.unwrap().expect("a lost pause race is not an error");
            assert_eq!(paused.status, TimerStatus::Paused);
        }

        harness.clock.advance_secs(30);
        assert_eq!(harness.timers.elapsed_seconds(timer_id).await.unwrap(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pause_racing_cancel_never_revives_timer() {
        let harness = BillingHarness::new().await;
        let account = harness.account(None).await;
        let timer = harness
            .timers
            .start(StartTimer {
                user_id: BillingFixtures::user(),
                account_id: Some(account.id),
                ..Default::default()
            })
            .await
            .unwrap();

        let timer_id = timer.id;
        let mut set = JoinSet::new();
        for i in 0..8 {
            let timers = harness.timers.clone();
            if i == 4 {
                set.spawn(async move { (true, timers.cancel(timer_id).await) });
            } else {
                set.spawn(async move { (false, timers.pause(timer_id).await) });
            }
        }
        let mut canceled = false;
        while let Some(joined) = set.join_next().await {
            match joined.unwrap() {
                (is_cancel, Ok(timer)) => {
                    if is_cancel {
                        assert_eq!(timer.status, TimerStatus::Canceled);
                        canceled = true;
                    }
                }
                (_, Err(BillingError::InvalidState(_))) => {}
                (_, Err(other)) => panic!("unexpected error: {other}"),
            }
        }

        let stored = harness.timers.get(timer_id).await.unwrap();
        if canceled {
            assert_eq!(stored.status, TimerStatus::Canceled);
        } else {
            assert_eq!(stored.status, TimerStatus::Paused);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shared_setting_issues_unique_sequential_numbers() {
        let harness = BillingHarness::new().await;
        let mut accounts = Vec::new();
        for _ in 0..100 {
            let account = harness.account(None).await;
            harness
                .approved_entry(
                    TestTimeEntryBuilder::new(account.id)
                        .with_hourly_rate(MoneyFixtures::usd_100_hourly()),
                )
                .await;
            accounts.push(account.id);
        }

        let mut set = JoinSet::new();
        for account in accounts {
            let engine = harness.engine.clone();
            set.spawn(async move { engine.consolidate(account, request()).await });
        }

        let mut numbers = BTreeSet::new();
        while let Some(joined) = set.join_next().await {
            let invoice = joined.unwrap().expect("each account consolidates once");
            assert!(numbers.insert(invoice.invoice_number));
        }

        let expected: BTreeSet<_> = (1..=100).map(|n| format_invoice_number("INV-", n, 6)).collect();
        assert_eq!(numbers, expected);
        let setting = harness.store.stored_billing_setting(None).await.unwrap();
        assert_eq!(setting.next_invoice_number, 101);
    }
}

// ============================================================================
// Property Tests
// ============================================================================

mod property_tests {
    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_totals_always_reconcile(
            entries in prop::collection::vec((duration_seconds_strategy(), hourly_rate_strategy()), 1..5),
            addons in prop::collection::vec((unit_price_strategy(), quantity_strategy()), 0..4),
            rate in tax_rate_strategy(),
            mode in tax_mode_strategy(),
        ) {
            let invoice = runtime().block_on(async {
                let harness = BillingHarness::new().await;
                harness
                    .tax(TaxConfiguration::new(None, "Sales", rate, TemporalFixtures::tax_year_start()))
                    .await;
                let account = harness.account(None).await;
                let ticket = harness.ticket(account.id).await;
                for (seconds, hourly) in entries {
                    harness
                        .approved_entry(
                            TestTimeEntryBuilder::new(account.id)
                                .with_duration_seconds(seconds)
                                .with_hourly_rate(hourly),
                        )
                        .await;
                }
                for (price, quantity) in addons {
                    harness
                        .approved_addon(
                            TestAddonBuilder::new(ticket.id)
                                .with_unit_price(price)
                                .with_quantity(quantity),
                        )
                        .await;
                }
                harness
                    .engine
                    .consolidate(account.id, request().with_tax_policy(InvoiceTaxPolicy::with_mode(mode)))
                    .await
                    .unwrap()
            });

            prop_assert_eq!(
                invoice.total.amount(),
                invoice.subtotal.amount() + invoice.tax_amount.amount()
            );
            prop_assert!(invoice.totals_reconcile());
            for line in &invoice.lines {
                prop_assert_eq!(
                    line.total_amount.amount(),
                    line.pre_tax_amount().unwrap().amount() + line.tax_amount.amount()
                );
            }
        }

        #[test]
        fn test_items_are_billed_at_most_once(
            batches in prop::collection::vec(1usize..4, 1..5),
            discard_first in any::<bool>(),
        ) {
            let (invoices, approved) = runtime().block_on(async {
                let harness = BillingHarness::new().await;
                let account = harness.account(None).await;
                let mut invoices = Vec::new();
                let mut approved = Vec::new();

                for (round, size) in batches.into_iter().enumerate() {
                    for _ in 0..size {
                        let entry = harness
                            .approved_entry(
                                TestTimeEntryBuilder::new(account.id)
                                    .with_hourly_rate(MoneyFixtures::usd_100_hourly()),
                            )
                            .await;
                        approved.push(entry.id);
                    }
                    let invoice = harness.engine.consolidate(account.id, request()).await.unwrap();
                    if round == 0 && discard_first {
                        harness.engine.discard_draft(invoice.id).await.unwrap();
                    } else {
                        invoices.push(invoice);
                    }
                }
                match harness.engine.consolidate(account.id, request()).await {
                    Ok(invoice) => invoices.push(invoice),
                    Err(BillingError::NoUnbilledItems(_)) => {}
                    Err(other) => panic!("unexpected error: {other}"),
                }
                (invoices, approved)
            });

            assert_billed_once(&invoices);
            let billed: BTreeSet<_> = invoices
                .iter()
                .flat_map(|i| i.lines.iter())
                .filter_map(|l| match l.source {
                    LineSource::TimeEntry(id) => Some(id),
                    _ => None,
                })
                .collect();
            let expected: BTreeSet<_> = approved.into_iter().collect();
            prop_assert_eq!(billed, expected);
        }
    }
}
