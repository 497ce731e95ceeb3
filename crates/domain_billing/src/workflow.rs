//! Approval workflow service for time entries and ticket add-ons

use std::sync::Arc;

use tracing::{info, instrument};

use core_kernel::{AccountId, Clock, PortError, TicketAddonId, TicketId, TimeEntryId, UserId};

use crate::addon::{NewTicketAddon, TicketAddon};
use crate::error::BillingError;
use crate::ports::BillingStore;
use crate::rate::{RateCascade, RateQuery};
use crate::time_entry::{NewTimeEntry, TimeEntry, TimeEntryChanges};

/// Resolves the owning account of work on `ticket_id` / `account_id`
///
/// With a ticket, the ticket's account wins and a different explicit account
/// is a `CrossAccountReference`. Without one, the explicit account is used.
pub async fn resolve_account(
    store: &dyn BillingStore,
    ticket_id: Option<TicketId>,
    account_id: Option<AccountId>,
) -> Result<Option<AccountId>, BillingError> {
    let Some(ticket_id) = ticket_id else {
        return Ok(account_id);
    };
    let ticket = store.get_ticket(ticket_id).await?;
    match account_id {
        Some(account_id) if account_id != ticket.account_id => {
            Err(BillingError::CrossAccountReference {
                ticket_id,
                ticket_account: ticket.account_id,
                account_id,
            })
        }
        _ => Ok(Some(ticket.account_id)),
    }
}

fn frozen(e: PortError) -> BillingError {
    match e {
        PortError::Conflict { message } => BillingError::InvalidState(message),
        other => other.into(),
    }
}

/// Approve, reject, reopen, edit and delete billable items
#[derive(Clone)]
pub struct TimeEntryApproval {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    rates: Arc<RateCascade>,
}

impl TimeEntryApproval {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            rates: Arc::new(RateCascade::standard()),
        }
    }

    // ========================================================================
    // Time entries
    // ========================================================================

    /// Records a time entry directly, without a timer
    #[instrument(skip(self, input), fields(account_id = %input.account_id))]
    pub async fn create_entry(&self, input: NewTimeEntry) -> Result<TimeEntry, BillingError> {
        resolve_account(self.store.as_ref(), input.ticket_id, Some(input.account_id)).await?;

        let mut entry = TimeEntry::create(input, self.clock.now())?;
        self.snapshot_rate(&mut entry).await?;
        self.store.insert_time_entry(&entry).await?;
        info!(time_entry_id = %entry.id, "Time entry created");
        Ok(entry)
    }

    pub async fn get_entry(&self, entry_id: TimeEntryId) -> Result<TimeEntry, BillingError> {
        Ok(self.store.get_time_entry(entry_id).await?)
    }

    #[instrument(skip(self, notes), fields(time_entry_id = %entry_id, approver = %approver))]
    pub async fn approve(
        &self,
        entry_id: TimeEntryId,
        approver: UserId,
        notes: Option<String>,
    ) -> Result<TimeEntry, BillingError> {
        let mut entry = self.store.get_time_entry(entry_id).await?;
        entry.approve(approver, notes, self.clock.now())?;
        self.snapshot_rate(&mut entry).await?;
        self.store.update_time_entry(&entry).await.map_err(frozen)?;
        info!("Time entry approved");
        Ok(entry)
    }

    #[instrument(skip(self, notes), fields(time_entry_id = %entry_id, approver = %approver))]
    pub async fn reject(
        &self,
        entry_id: TimeEntryId,
        approver: UserId,
        notes: Option<String>,
    ) -> Result<TimeEntry, BillingError> {
        let mut entry = self.store.get_time_entry(entry_id).await?;
        entry.reject(approver, notes, self.clock.now())?;
        self.store.update_time_entry(&entry).await.map_err(frozen)?;
        info!("Time entry rejected");
        Ok(entry)
    }

    #[instrument(skip(self), fields(time_entry_id = %entry_id))]
    pub async fn reopen(&self, entry_id: TimeEntryId) -> Result<TimeEntry, BillingError> {
        let mut entry = self.store.get_time_entry(entry_id).await?;
        entry.reopen(self.clock.now())?;
        self.store.update_time_entry(&entry).await.map_err(frozen)?;
        info!("Time entry reopened");
        Ok(entry)
    }

    #[instrument(skip(self, changes), fields(time_entry_id = %entry_id))]
    pub async fn edit(
        &self,
        entry_id: TimeEntryId,
        changes: TimeEntryChanges,
    ) -> Result<TimeEntry, BillingError> {
        let mut entry = self.store.get_time_entry(entry_id).await?;
        entry.apply_changes(changes, self.clock.now())?;
        self.store.update_time_entry(&entry).await.map_err(frozen)?;
        Ok(entry)
    }

    /// Soft-deletes an unbilled entry
    #[instrument(skip(self), fields(time_entry_id = %entry_id))]
    pub async fn delete(&self, entry_id: TimeEntryId) -> Result<TimeEntry, BillingError> {
        let mut entry = self.store.get_time_entry(entry_id).await?;
        entry.soft_delete(self.clock.now())?;
        self.store.update_time_entry(&entry).await.map_err(frozen)?;
        info!("Time entry deleted");
        Ok(entry)
    }

    // ========================================================================
    // Ticket add-ons
    // ========================================================================

    #[instrument(skip(self, input), fields(ticket_id = %input.ticket_id))]
    pub async fn create_addon(&self, input: NewTicketAddon) -> Result<TicketAddon, BillingError> {
        let ticket = self.store.get_ticket(input.ticket_id).await?;
        let addon = TicketAddon::create(&ticket, input, self.clock.now())?;
        self.store.insert_addon(&addon).await?;
        info!(addon_id = %addon.id, total = %addon.total, "Ticket add-on created");
        Ok(addon)
    }

    pub async fn get_addon(&self, addon_id: TicketAddonId) -> Result<TicketAddon, BillingError> {
        Ok(self.store.get_addon(addon_id).await?)
    }

    #[instrument(skip(self, notes), fields(addon_id = %addon_id, approver = %approver))]
    pub async fn approve_addon(
        &self,
        addon_id: TicketAddonId,
        approver: UserId,
        notes: Option<String>,
    ) -> Result<TicketAddon, BillingError> {
        let mut addon = self.store.get_addon(addon_id).await?;
        addon.approve(approver, notes, self.clock.now())?;
        self.store.update_addon(&addon).await.map_err(frozen)?;
        info!("Ticket add-on approved");
        Ok(addon)
    }

    #[instrument(skip(self, notes), fields(addon_id = %addon_id, approver = %approver))]
    pub async fn reject_addon(
        &self,
        addon_id: TicketAddonId,
        approver: UserId,
        notes: Option<String>,
    ) -> Result<TicketAddon, BillingError> {
        let mut addon = self.store.get_addon(addon_id).await?;
        addon.reject(approver, notes, self.clock.now())?;
        self.store.update_addon(&addon).await.map_err(frozen)?;
        info!("Ticket add-on rejected");
        Ok(addon)
    }

    #[instrument(skip(self), fields(addon_id = %addon_id))]
    pub async fn reopen_addon(&self, addon_id: TicketAddonId) -> Result<TicketAddon, BillingError> {
        let mut addon = self.store.get_addon(addon_id).await?;
        addon.reopen(self.clock.now())?;
        self.store.update_addon(&addon).await.map_err(frozen)?;
        Ok(addon)
    }

    async fn snapshot_rate(&self, entry: &mut TimeEntry) -> Result<(), BillingError> {
        if entry.rate_at_time.is_some() {
            return Ok(());
        }
        let query = RateQuery {
            explicit: entry.billing_rate_id,
            ticket_id: entry.ticket_id,
            user_id: Some(entry.user_id),
            account_id: Some(entry.account_id),
        };
        let candidates = self.store.billing_rates(&query).await?;
        entry.snapshot_rate(self.rates.snapshot(&query, &candidates));
        Ok(())
    }
}
