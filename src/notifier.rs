//! Desktop notifications via notify-rust (D-Bus).

use notify_rust::Notification;
use tracing::{debug, warn};

use crate::history::truncate;
use crate::summary::{SummaryPhase, SummaryState};

pub struct Notifier {
    enabled: bool,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Announce a finished summary. Other phases are ignored.
    pub fn summary_finished(&self, state: &SummaryState) {
        if !self.enabled {
            return;
        }
        let Some((title, body)) = summary_message(state) else {
            return;
        };
        debug!("Notification: {title}");

        let shown = Notification::new()
            .summary(title)
            .body(&body)
            .icon("accessories-text-editor")
            .timeout(5000)
            .show();
        if let Err(e) = shown {
            warn!("Failed to show summary notification: {e}");
        }
    }
}

fn summary_message(state: &SummaryState) -> Option<(&'static str, String)> {
    match state.phase {
        SummaryPhase::Succeeded => Some((
            "Summary ready",
            truncate(state.text.as_deref().unwrap_or_default(), 200),
        )),
        SummaryPhase::Failed => Some((
            "Summary failed",
            state
                .error_message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string()),
        )),
        SummaryPhase::Idle | SummaryPhase::Generating => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_finished_summaries_are_announced() {
        let mut state = SummaryState::default();
        assert_eq!(summary_message(&state), None);

        state.phase = SummaryPhase::Generating;
        assert_eq!(summary_message(&state), None);

        state.phase = SummaryPhase::Succeeded;
        state.text = Some("x".repeat(300));
        let (title, body) = summary_message(&state).unwrap();
        assert_eq!(title, "Summary ready");
        assert_eq!(body.chars().count(), 200);
        assert!(body.ends_with("..."));

        state.phase = SummaryPhase::Failed;
        state.error_message = None;
        assert_eq!(
            summary_message(&state),
            Some(("Summary failed", "Unknown error".to_string()))
        );
    }
}
