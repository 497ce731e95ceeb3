//! Timer lifecycle service
//!
//! Drives [`Timer`] state through the store and turns a finished timer into
//! exactly one pending [`TimeEntry`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use core_kernel::{AccountId, BillingRateId, Clock, Money, PortError, TicketId, TimerId, UserId};

use crate::error::BillingError;
use crate::ports::BillingStore;
use crate::rate::{RateCascade, RateQuery};
use crate::time_entry::{NewTimeEntry, TimeEntry};
use crate::timer::{Timer, TimerStatus};
use crate::workflow::resolve_account;

/// Input for starting a timer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTimer {
    pub user_id: UserId,
    pub account_id: Option<AccountId>,
    pub ticket_id: Option<TicketId>,
    pub description: Option<String>,
    pub billing_rate_id: Option<BillingRateId>,
}

/// Values that replace the timer's own when committing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOverrides {
    pub description: Option<String>,
    pub account_id: Option<AccountId>,
    pub ticket_id: Option<TicketId>,
    pub billable: Option<bool>,
    pub rate_override: Option<Money>,
}

/// Start, pause, resume, stop, cancel and commit timers
#[derive(Clone)]
pub struct TimerLifecycle {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    rates: Arc<RateCascade>,
}

impl TimerLifecycle {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            rates: Arc::new(RateCascade::standard()),
        }
    }

    /// Starts a timer, or returns the user's active timer on the same ticket
    #[instrument(skip(self, input), fields(user_id = %input.user_id))]
    pub async fn start(&self, input: StartTimer) -> Result<Timer, BillingError> {
        let account_id = resolve_account(self.store.as_ref(), input.ticket_id, input.account_id).await?;

        if let Some(existing) = self
            .store
            .find_active_timer(input.user_id, input.ticket_id)
            .await?
        {
            debug!(timer_id = %existing.id, "Returning existing active timer");
            return Ok(existing);
        }

        let timer = Timer::start(
            input.user_id,
            account_id,
            input.ticket_id,
            input.description,
            input.billing_rate_id,
            self.clock.now(),
        );
        match self.store.insert_timer(&timer).await {
            Ok(()) => {
                info!(timer_id = %timer.id, "Timer started");
                Ok(timer)
            }
            Err(PortError::Conflict { .. }) => {
                // Lost a start race; the winner's timer is the active one
                self.store
                    .find_active_timer(input.user_id, input.ticket_id)
                    .await?
                    .ok_or_else(|| BillingError::invalid_state("active timer vanished during start"))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, timer_id: TimerId) -> Result<Timer, BillingError> {
        Ok(self.store.get_timer(timer_id).await?)
    }

    /// Running and paused timers of `user_id`
    pub async fn active_timers(&self, user_id: UserId) -> Result<Vec<Timer>, BillingError> {
        Ok(self.store.active_timers(user_id).await?)
    }

    #[instrument(skip(self), fields(timer_id = %timer_id))]
    pub async fn pause(&self, timer_id: TimerId) -> Result<Timer, BillingError> {
        let mut timer = self.store.get_timer(timer_id).await?;
        let expected = timer.status;
        if timer.pause(self.clock.now()) {
            timer = self.persist(timer, expected).await?;
            info!("Timer paused");
        }
        Ok(timer)
    }

    #[instrument(skip(self), fields(timer_id = %timer_id))]
    pub async fn resume(&self, timer_id: TimerId) -> Result<Timer, BillingError> {
        let mut timer = self.store.get_timer(timer_id).await?;
        let expected = timer.status;
        if timer.resume(self.clock.now()) {
            timer = self.persist(timer, expected).await?;
            info!(paused_seconds = timer.paused_seconds, "Timer resumed");
        }
        Ok(timer)
    }

    #[instrument(skip(self), fields(timer_id = %timer_id))]
    pub async fn stop(&self, timer_id: TimerId) -> Result<Timer, BillingError> {
        let mut timer = self.store.get_timer(timer_id).await?;
        let expected = timer.status;
        if timer.stop(self.clock.now())? {
            timer = self.persist(timer, expected).await?;
            info!("Timer stopped");
        }
        Ok(timer)
    }

    #[instrument(skip(self), fields(timer_id = %timer_id))]
    pub async fn cancel(&self, timer_id: TimerId) -> Result<Timer, BillingError> {
        let mut timer = self.store.get_timer(timer_id).await?;
        let expected = timer.status;
        if timer.cancel(self.clock.now())? {
            timer = self.persist(timer, expected).await?;
            info!("Timer canceled");
        }
        Ok(timer)
    }

    /// Billable seconds so far
    pub async fn elapsed_seconds(&self, timer_id: TimerId) -> Result<i64, BillingError> {
        let timer = self.store.get_timer(timer_id).await?;
        Ok(timer.elapsed_seconds(self.clock.now()))
    }

    /// Commits the timer to a pending time entry
    ///
    /// Stops the timer first if needed. Committing again returns the entry
    /// created the first time.
    #[instrument(skip(self, overrides), fields(timer_id = %timer_id))]
    pub async fn commit(
        &self,
        timer_id: TimerId,
        overrides: CommitOverrides,
    ) -> Result<TimeEntry, BillingError> {
        let mut timer = self.store.get_timer(timer_id).await?;
        if let Some(entry_id) = timer.time_entry_id {
            return Ok(self.store.get_time_entry(entry_id).await?);
        }
        if timer.status == TimerStatus::Canceled {
            return Err(BillingError::invalid_state(format!("timer {} is canceled", timer_id)));
        }

        let now = self.clock.now();
        timer.stop(now)?;

        let ticket_id = overrides.ticket_id.or(timer.ticket_id);
        let account_id = resolve_account(
            self.store.as_ref(),
            ticket_id,
            overrides.account_id.or(timer.account_id),
        )
        .await?
        .ok_or_else(|| BillingError::validation("a time entry requires an account or a ticket"))?;

        let query = RateQuery {
            explicit: timer.billing_rate_id,
            ticket_id,
            user_id: Some(timer.user_id),
            account_id: Some(account_id),
        };
        let candidates = self.store.billing_rates(&query).await?;

        let mut entry = TimeEntry::create(
            NewTimeEntry {
                user_id: timer.user_id,
                account_id,
                ticket_id,
                description: overrides
                    .description
                    .or_else(|| timer.description.clone())
                    .unwrap_or_default(),
                started_at: timer.started_at,
                ended_at: timer.stopped_at,
                duration_seconds: Some(timer.elapsed_seconds(now)),
                billable: overrides.billable.unwrap_or(true),
                billing_rate_id: timer.billing_rate_id,
                rate_override: overrides.rate_override,
            },
            now,
        )?;
        entry.timer_id = Some(timer.id);
        entry.snapshot_rate(self.rates.snapshot(&query, &candidates));
        timer.mark_committed(entry.id, now)?;

        match self.store.commit_timer(&timer, &entry).await {
            Ok(()) => {
                info!(
                    time_entry_id = %entry.id,
                    duration_seconds = entry.duration_seconds,
                    "Timer committed"
                );
                Ok(entry)
            }
            Err(PortError::Conflict { .. }) => {
                let stored = self.store.get_timer(timer_id).await?;
                let entry_id = stored.time_entry_id.ok_or_else(|| {
                    BillingError::invalid_state(format!(
                        "timer {} is {}",
                        timer_id,
                        stored.status.as_str()
                    ))
                })?;
                warn!("Timer committed concurrently; returning existing entry");
                Ok(self.store.get_time_entry(entry_id).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes `timer` if nobody moved it away from `expected` first
    ///
    /// A lost race that already reached the same status is a no-op.
    async fn persist(&self, timer: Timer, expected: TimerStatus) -> Result<Timer, BillingError> {
        match self.store.update_timer(&timer, expected).await {
            Ok(()) => Ok(timer),
            Err(PortError::Conflict { message }) => {
                let stored = self.store.get_timer(timer.id).await?;
                if stored.status == timer.status {
                    debug!(status = stored.status.as_str(), "Timer already in requested state");
                    Ok(stored)
                } else {
                    warn!(stored = stored.status.as_str(), "Timer changed concurrently");
                    Err(BillingError::InvalidState(message))
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
