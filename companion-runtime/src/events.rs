//! Append-only log of session exits with monotonically increasing cursors,
//! truncated at the head once over capacity. Cursors are never reused, so a
//! client polling with `after=<cursor>` sees each exit exactly once.

use std::collections::VecDeque;

use serde::Serialize;

pub const EVENT_LOG_CAP: usize = 500;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub cursor: u64,
    pub event: String,
    pub session_id: String,
    pub command: String,
    pub cwd: String,
    pub timed_out: bool,
    pub exit_code: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub duration_ms: i64,
}

#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<SessionEvent>,
    next_cursor: u64,
    cap: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(EVENT_LOG_CAP)
    }
}

impl EventLog {
    pub fn new(cap: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_cursor: 1,
            cap: cap.max(1),
        }
    }

    pub fn append(&mut self, mut event: SessionEvent) -> SessionEvent {
        event.cursor = self.next_cursor;
        self.next_cursor += 1;
        self.events.push_back(event.clone());
        while self.events.len() > self.cap {
            self.events.pop_front();
        }
        event
    }

    /// Events with cursor strictly greater than `after`, oldest first.
    pub fn list_after(&self, after: u64, limit: usize) -> Vec<SessionEvent> {
        self.events
            .iter()
            .filter(|e| e.cursor > after)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn latest_cursor(&self) -> u64 {
        self.next_cursor - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(session_id: &str) -> SessionEvent {
        SessionEvent {
            cursor: 0,
            event: "session_exited".into(),
            session_id: session_id.into(),
            command: "true".into(),
            cwd: "/tmp".into(),
            timed_out: false,
            exit_code: 0,
            started_at: 1,
            finished_at: 2,
            duration_ms: 1,
        }
    }

    #[test]
    fn cursors_increase_and_are_not_reused() {
        let mut log = EventLog::new(2);
        let a = log.append(event("a"));
        let b = log.append(event("b"));
        let c = log.append(event("c"));
        assert_eq!((a.cursor, b.cursor, c.cursor), (1, 2, 3));

        // Head truncation drops the oldest but keeps cursors stable.
        let all = log.list_after(0, 10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].cursor, 2);
        assert_eq!(all[1].cursor, 3);
    }

    #[test]
    fn list_after_is_strictly_greater() {
        let mut log = EventLog::default();
        log.append(event("a"));
        let b = log.append(event("b"));
        log.append(event("c"));

        let tail = log.list_after(b.cursor, 10);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].session_id, "c");

        assert!(log.list_after(log.latest_cursor(), 10).is_empty());
    }

    #[test]
    fn limit_caps_the_page() {
        let mut log = EventLog::default();
        for i in 0..5 {
            log.append(event(&format!("s{i}")));
        }
        let page = log.list_after(0, 2);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].cursor, 1);
    }
}
