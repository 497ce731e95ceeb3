//! Timer entity
//!
//! A timer measures work as wall-clock time minus paused intervals. Status
//! moves `running ⇄ paused`, then ends in `canceled` or, through `stopped`,
//! in `committed`. Nothing leaves `canceled` or `committed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use core_kernel::{AccountId, BillingRateId, TicketId, TimeEntryId, TimerId, UserId};
use crate::error::BillingError;

/// Timer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Running,
    Paused,
    /// Only reached on the way to commit
    Stopped,
    Canceled,
    Committed,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerStatus::Running => "running",
            TimerStatus::Paused => "paused",
            TimerStatus::Stopped => "stopped",
            TimerStatus::Canceled => "canceled",
            TimerStatus::Committed => "committed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(TimerStatus::Running),
            "paused" => Some(TimerStatus::Paused),
            "stopped" => Some(TimerStatus::Stopped),
            "canceled" => Some(TimerStatus::Canceled),
            "committed" => Some(TimerStatus::Committed),
            _ => None,
        }
    }

    /// Running or paused
    pub fn is_active(&self) -> bool {
        matches!(self, TimerStatus::Running | TimerStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TimerStatus::Canceled | TimerStatus::Committed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    pub id: TimerId,
    pub user_id: UserId,
    pub account_id: Option<AccountId>,
    pub ticket_id: Option<TicketId>,
    pub description: Option<String>,
    pub status: TimerStatus,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Sum of all closed pause intervals
    pub paused_seconds: i64,
    pub billing_rate_id: Option<BillingRateId>,
    /// Set once, when the timer is committed
    pub time_entry_id: Option<TimeEntryId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Timer {
    /// Starts a new running timer at `now`
    pub fn start(
        user_id: UserId,
        account_id: Option<AccountId>,
        ticket_id: Option<TicketId>,
        description: Option<String>,
        billing_rate_id: Option<BillingRateId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TimerId::new_v7(),
            user_id,
            account_id,
            ticket_id,
            description,
            status: TimerStatus::Running,
            started_at: now,
            paused_at: None,
            stopped_at: None,
            paused_seconds: 0,
            billing_rate_id,
            time_entry_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Pauses a running timer; returns false (no-op) in any other state
    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != TimerStatus::Running {
            return false;
        }
        self.status = TimerStatus::Paused;
        self.paused_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Resumes a paused timer; returns false (no-op) in any other state
    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != TimerStatus::Paused {
            return false;
        }
        self.close_pause(now);
        self.status = TimerStatus::Running;
        self.updated_at = now;
        true
    }

    /// Stops an active timer, flushing any open pause interval
    ///
    /// Stopping a stopped timer is a no-op.
    pub fn stop(&mut self, now: DateTime<Utc>) -> Result<bool, BillingError> {
        match self.status {
            TimerStatus::Running | TimerStatus::Paused => {
                self.close_pause(now);
                self.stopped_at = Some(now);
                self.status = TimerStatus::Stopped;
                self.updated_at = now;
                Ok(true)
            }
            TimerStatus::Stopped => Ok(false),
            other => Err(BillingError::invalid_state(format!(
                "timer {} is {} and cannot be stopped",
                self.id,
                other.as_str()
            ))),
        }
    }

    /// Cancels the timer without producing a time entry
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<bool, BillingError> {
        match self.status {
            TimerStatus::Canceled => Ok(false),
            TimerStatus::Committed => Err(BillingError::invalid_state(format!(
                "timer {} is already committed",
                self.id
            ))),
            _ => {
                self.close_pause(now);
                if self.stopped_at.is_none() {
                    self.stopped_at = Some(now);
                }
                self.status = TimerStatus::Canceled;
                self.updated_at = now;
                Ok(true)
            }
        }
    }

    /// Billable seconds as of `now`
    ///
    /// `(end_or_now − started_at) − paused_seconds − open pause`, floored at 0.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        let end = self.stopped_at.unwrap_or(now);
        let open_pause = match (self.status, self.paused_at) {
            (TimerStatus::Paused, Some(paused_at)) => (end - paused_at).num_seconds().max(0),
            _ => 0,
        };
        let gross = (end - self.started_at).num_seconds();
        (gross - self.paused_seconds - open_pause).max(0)
    }

    /// Records the time entry created from this (stopped) timer
    pub fn mark_committed(
        &mut self,
        time_entry_id: TimeEntryId,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        if self.status != TimerStatus::Stopped || self.time_entry_id.is_some() {
            return Err(BillingError::invalid_state(format!(
                "timer {} is {} and cannot be committed",
                self.id,
                self.status.as_str()
            )));
        }
        self.time_entry_id = Some(time_entry_id);
        self.status = TimerStatus::Committed;
        self.updated_at = now;
        Ok(())
    }

    fn close_pause(&mut self, now: DateTime<Utc>) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_seconds += (now - paused_at).num_seconds().max(0);
        }
    }
}
