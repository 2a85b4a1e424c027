use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::aggregate;
use crate::debounce::{DEFAULT_DELAY, SingleFlight};
use crate::error::SyncError;
use crate::models::{
    DailyHealthRecord, ExternalDayBundle, ProvenanceChange, RecordDetails, TrackedEdit,
    TrackedField,
};
use crate::provider::ExternalMetricsProvider;
use crate::store::DailyRecordStore;
use crate::sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormState {
    Idle,
    Initializing,
    Ready,
    Saving,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FormOptions {
    /// Let today's provider step count replace a step value already on the
    /// record.
    pub overwrite: bool,
}

/// Editing session for one day's record.
///
/// Built with [`RecordForm::load`], which only returns once the form is
/// ready. Edits are rejected while the form is not interactive.
pub struct RecordForm {
    store: Arc<dyn DailyRecordStore>,
    provider: Arc<dyn ExternalMetricsProvider>,
    record: DailyHealthRecord,
    is_new: bool,
    state: FormState,
    authorized: bool,
    has_unsaved_changes: bool,
    live_steps: SingleFlight<NaiveDate, i64>,
}

impl RecordForm {
    /// Populate a form for `day` from `existing` (if any) while authorizing
    /// the provider and, when `day == today`, fetching today's step count.
    pub async fn load(
        store: Arc<dyn DailyRecordStore>,
        provider: Arc<dyn ExternalMetricsProvider>,
        existing: Option<DailyHealthRecord>,
        day: NaiveDate,
        today: NaiveDate,
        options: FormOptions,
    ) -> Self {
        let mut form = Self {
            store,
            provider,
            record: DailyHealthRecord::new(day),
            is_new: true,
            state: FormState::Idle,
            authorized: false,
            has_unsaved_changes: false,
            live_steps: SingleFlight::new(DEFAULT_DELAY),
        };
        form.state = FormState::Initializing;

        let provider = Arc::clone(&form.provider);
        let fetch_current_steps = async {
            let authorized = provider.authorize().await;
            if !authorized {
                tracing::warn!(%day, "health data not authorized, skipping step fetch");
                return (false, None);
            }
            if day != today {
                return (true, None);
            }
            (true, Some(sync::fetch_steps_bundle(provider.as_ref(), day).await))
        };
        let populate = async {
            match existing {
                Some(record) if record.day == day => (record, false),
                _ => (DailyHealthRecord::new(day), true),
            }
        };
        let ((authorized, steps), (record, is_new)) = tokio::join!(fetch_current_steps, populate);

        form.record = record;
        form.is_new = is_new;
        form.authorized = authorized;
        if let Some(bundle) = steps {
            form.apply_steps(&bundle, options.overwrite);
        }
        form.has_unsaved_changes = false;
        form.state = FormState::Ready;
        form
    }

    /// Run [`load`](Self::load) on a background task.
    pub fn spawn_load(
        store: Arc<dyn DailyRecordStore>,
        provider: Arc<dyn ExternalMetricsProvider>,
        existing: Option<DailyHealthRecord>,
        day: NaiveDate,
        today: NaiveDate,
        options: FormOptions,
    ) -> JoinHandle<Self> {
        tokio::spawn(Self::load(store, provider, existing, day, today, options))
    }

    fn apply_steps(&mut self, bundle: &ExternalDayBundle, overwrite: bool) {
        let outcome = sync::merge_fields(&mut self.record, bundle, &[TrackedField::Steps], overwrite);
        if outcome.changed() {
            tracing::debug!(day = %self.record.day, steps = ?bundle.steps, "applied current steps");
        }
    }

    #[must_use]
    pub fn state(&self) -> FormState {
        self.state
    }

    #[must_use]
    pub fn is_interactive(&self) -> bool {
        matches!(self.state, FormState::Idle | FormState::Ready)
    }

    #[must_use]
    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    #[must_use]
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    #[must_use]
    pub fn has_unsaved_changes(&self) -> bool {
        self.has_unsaved_changes
    }

    #[must_use]
    pub fn record(&self) -> &DailyHealthRecord {
        &self.record
    }

    fn ensure_interactive(&self) -> Result<()> {
        if !self.is_interactive() {
            bail!("Form is busy ({:?})", self.state);
        }
        Ok(())
    }

    /// Write a tracked field. Clears its provenance flag.
    pub fn edit(&mut self, edit: TrackedEdit) -> Result<ProvenanceChange> {
        self.ensure_interactive()?;
        edit.validate()?;
        let change = self.record.apply_edit(edit);
        self.has_unsaved_changes = true;
        Ok(change)
    }

    /// Change user-owned fields (notes, habits, meal times, ...).
    pub fn edit_details(&mut self, f: impl FnOnce(&mut RecordDetails)) -> Result<()> {
        self.ensure_interactive()?;
        f(&mut self.record.details);
        self.has_unsaved_changes = true;
        Ok(())
    }

    /// Persist the full record and refresh its week total cache.
    ///
    /// On failure the form returns to ready with its changes still unsaved.
    pub fn save(&mut self) -> Result<&DailyHealthRecord, SyncError> {
        let day = self.record.day;
        if !self.is_interactive() {
            return Err(SyncError::persistence(
                day,
                anyhow::anyhow!("form is busy ({:?})", self.state),
            ));
        }
        self.state = FormState::Saving;
        self.live_steps.cancel();

        let result = self.write_record();
        self.state = FormState::Ready;
        match result {
            Ok(()) => {
                self.is_new = false;
                self.has_unsaved_changes = false;
                tracing::info!(%day, "saved record");
                Ok(&self.record)
            }
            Err(e) => {
                tracing::error!(%day, error = ?e, "failed to save record");
                Err(SyncError::persistence(day, e))
            }
        }
    }

    fn write_record(&mut self) -> Result<()> {
        let total = aggregate::week_total_with(self.store.as_ref(), &self.record)?;
        let previous = self.record.week_total_steps_cache();
        self.record.set_week_total_steps_cache(Some(total));

        let written = if self.is_new {
            self.store.insert(&self.record)
        } else {
            self.store.save(&mut self.record)
        };
        if written.is_err() {
            self.record.set_week_total_steps_cache(previous);
            if self.is_new {
                self.adopt_stored_identity();
            }
        }
        written
    }

    /// After a failed insert, take over the id of a record another writer
    /// created for the same day so the next save updates it.
    fn adopt_stored_identity(&mut self) {
        match self.store.fetch_by_day(self.record.day) {
            Ok(Some(stored)) => {
                tracing::warn!(
                    day = %self.record.day,
                    id = %stored.id,
                    "day already stored, next save updates it"
                );
                self.record.id = stored.id;
                self.record.created_at = stored.created_at;
                self.is_new = false;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(day = %self.record.day, error = ?e, "could not look up stored record");
            }
        }
    }

    /// Debounced provider step lookup for `day`; results arrive on
    /// [`live_steps`](Self::live_steps).
    pub fn request_live_steps(&self, day: NaiveDate) {
        let provider = Arc::clone(&self.provider);
        self.live_steps.trigger(day, move |day| async move {
            match provider.steps_for_day(day).await {
                Ok(steps) => Some(steps),
                Err(e) => {
                    tracing::warn!(%day, error = %e, "live step lookup failed");
                    None
                }
            }
        });
    }

    #[must_use]
    pub fn live_steps(&self) -> watch::Receiver<Option<(NaiveDate, i64)>> {
        self.live_steps.subscribe()
    }
}
