//! Completion recorder.
//!
//! Persists one stress entry per completed session. Recording runs in the
//! background; a failed insert is logged and never reaches the session.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::store::DataStore;
use crate::types::{ExercisePlan, StressEntry, StressLevel};

/// Notes stored with the entry for a completed plan.
pub fn session_notes(plan: &ExercisePlan) -> String {
    match &plan.interpreted_mood {
        Some(mood) => format!(
            "Completed a {} session for feeling {}.",
            plan.display_name,
            mood.to_lowercase()
        ),
        None => format!("Completed a {} breathing session.", plan.display_name),
    }
}

#[derive(Clone)]
pub struct CompletionRecorder {
    store: Arc<dyn DataStore>,
}

impl CompletionRecorder {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Insert the entry in the background. The handle resolves to whether the
    /// insert succeeded.
    pub fn record(
        &self,
        user_id: impl Into<String>,
        score: StressLevel,
        notes: Option<String>,
    ) -> JoinHandle<bool> {
        let store = Arc::clone(&self.store);
        let entry = StressEntry::new(user_id, score, notes);
        tokio::spawn(async move {
            match store.insert_stress_entry(&entry).await {
                Ok(()) => {
                    info!(score = %entry.stress_score, "Recorded stress entry");
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Failed to record stress entry");
                    false
                }
            }
        })
    }
}
