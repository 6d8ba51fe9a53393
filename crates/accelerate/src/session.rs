//! Page session, sub-session and foreground timing state.

use crate::types::EventSession;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Page visibility as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Scroll offsets in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollPosition {
    pub scroll_top: f64,
    pub viewport_height: f64,
    pub document_height: f64,
}

impl ScrollPosition {
    /// Percentage of the document scrolled into view, `0..=100`.
    pub fn depth(&self) -> u32 {
        if self.document_height <= 0.0 {
            return 0;
        }
        let depth = (self.scroll_top + self.viewport_height) / self.document_height * 100.0;
        depth.round().clamp(0.0, 100.0) as u32
    }
}

/// Outcome of a visibility change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Became visible; a new sub-session started.
    Started,
    /// Became hidden; the sub-session lasted `duration_ms`.
    Stopped {
        duration_ms: u64,
        stopped_at: DateTime<Utc>,
    },
    /// Already in the requested state.
    Unchanged,
}

/// Format a timestamp the way the ingest API expects.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Foreground/background state machine for one page.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    page_session: String,
    sub_session_id: String,
    sub_session_start: DateTime<Utc>,
    start: DateTime<Utc>,
    elapsed_ms: i64,
    visibility: Visibility,
    scroll_depth_max: u32,
    scroll_depth_now: u32,
}

impl SessionTracker {
    pub fn new(visibility: Visibility, now: DateTime<Utc>) -> Self {
        Self {
            page_session: new_id(),
            sub_session_id: new_id(),
            sub_session_start: now,
            start: now,
            elapsed_ms: 0,
            visibility,
            scroll_depth_max: 0,
            scroll_depth_now: 0,
        }
    }

    /// Identifier for this page load. Never changes.
    pub fn page_session(&self) -> &str {
        &self.page_session
    }

    pub fn sub_session_id(&self) -> &str {
        &self.sub_session_id
    }

    #[cfg(test)]
    pub fn sub_session_start(&self) -> DateTime<Utc> {
        self.sub_session_start
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    /// Foreground time so far, including the running interval.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        match self.visibility {
            Visibility::Visible => self.elapsed_ms + (now - self.start).num_milliseconds().max(0),
            Visibility::Hidden => self.elapsed_ms,
        }
    }

    pub fn set_visibility(&mut self, visibility: Visibility, now: DateTime<Utc>) -> Transition {
        if visibility == self.visibility {
            return Transition::Unchanged;
        }
        self.visibility = visibility;

        match visibility {
            Visibility::Hidden => {
                self.elapsed_ms += (now - self.start).num_milliseconds().max(0);
                let duration_ms = (now - self.sub_session_start).num_milliseconds().max(0) as u64;
                Transition::Stopped {
                    duration_ms,
                    stopped_at: now,
                }
            }
            Visibility::Visible => {
                self.start = now;
                self.sub_session_id = new_id();
                self.sub_session_start = now;
                Transition::Started
            }
        }
    }

    pub fn scrolled(&mut self, position: ScrollPosition) {
        self.scroll_depth_now = position.depth();
        self.scroll_depth_max = self.scroll_depth_max.max(self.scroll_depth_now);
    }

    #[cfg(test)]
    pub fn scroll_depth_max(&self) -> u32 {
        self.scroll_depth_max
    }

    #[cfg(test)]
    pub fn scroll_depth_now(&self) -> u32 {
        self.scroll_depth_now
    }

    /// Timing metrics carried on every event.
    pub fn metrics(&self, now: DateTime<Utc>) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("elapsed".to_string(), self.elapsed_ms(now) as f64),
            ("scrollDepthMax".to_string(), f64::from(self.scroll_depth_max)),
            ("scrollDepthNow".to_string(), f64::from(self.scroll_depth_now)),
        ])
    }

    /// Session block for an event recorded now.
    pub fn event_session(&self) -> EventSession {
        EventSession {
            id: self.sub_session_id.clone(),
            start_timestamp: timestamp(self.sub_session_start),
            duration: None,
            stop_timestamp: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_706_400_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_hidden_accumulates_elapsed() {
        let mut tracker = SessionTracker::new(Visibility::Visible, at(0));

        let transition = tracker.set_visibility(Visibility::Hidden, at(30));
        assert_eq!(
            transition,
            Transition::Stopped {
                duration_ms: 30_000,
                stopped_at: at(30),
            }
        );
        assert_eq!(tracker.elapsed_ms(at(100)), 30_000);
    }

    #[test]
    fn test_visible_starts_new_sub_session() {
        let mut tracker = SessionTracker::new(Visibility::Visible, at(0));
        let page_session = tracker.page_session().to_string();
        let first_sub = tracker.sub_session_id().to_string();

        tracker.set_visibility(Visibility::Hidden, at(10));
        let transition = tracker.set_visibility(Visibility::Visible, at(20));

        assert_eq!(transition, Transition::Started);
        assert_ne!(tracker.sub_session_id(), first_sub);
        assert_eq!(tracker.page_session(), page_session);
        assert_eq!(tracker.sub_session_start(), at(20));
        assert_eq!(tracker.elapsed_ms(at(25)), 15_000);
    }

    #[test]
    fn test_repeated_state_is_unchanged() {
        let mut tracker = SessionTracker::new(Visibility::Visible, at(0));
        assert_eq!(
            tracker.set_visibility(Visibility::Visible, at(5)),
            Transition::Unchanged
        );
    }

    #[test]
    fn test_stop_duration_measures_sub_session() {
        let mut tracker = SessionTracker::new(Visibility::Visible, at(0));
        tracker.set_visibility(Visibility::Hidden, at(10));
        tracker.set_visibility(Visibility::Visible, at(50));

        match tracker.set_visibility(Visibility::Hidden, at(50) + Duration::seconds(5)) {
            Transition::Stopped { duration_ms, .. } => assert_eq!(duration_ms, 5_000),
            other => panic!("expected stop, got {:?}", other),
        }
        assert_eq!(tracker.elapsed_ms(at(60)), 15_000);
    }

    #[test]
    fn test_scroll_depth() {
        let mut tracker = SessionTracker::new(Visibility::Visible, at(0));
        tracker.scrolled(ScrollPosition {
            scroll_top: 1000.0,
            viewport_height: 1000.0,
            document_height: 4000.0,
        });
        tracker.scrolled(ScrollPosition {
            scroll_top: 0.0,
            viewport_height: 1000.0,
            document_height: 4000.0,
        });

        assert_eq!(tracker.scroll_depth_now(), 25);
        assert_eq!(tracker.scroll_depth_max(), 50);

        let metrics = tracker.metrics(at(2));
        assert_eq!(metrics["scrollDepthMax"], 50.0);
        assert_eq!(metrics["elapsed"], 2_000.0);
    }

    #[test]
    fn test_event_session_block() {
        let tracker = SessionTracker::new(Visibility::Visible, at(0));
        let session = tracker.event_session();
        assert_eq!(session.id, tracker.sub_session_id());
        assert_eq!(session.start_timestamp, "2024-01-28T00:00:00.000Z");
    }
}
