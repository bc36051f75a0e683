//! User-visible acknowledgments: desktop notifications via notify-rust (D-Bus)
//! plus a short in-memory history served on the status endpoint.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use notify_rust::Notification;
use serde::Serialize;
use tracing::{debug, warn};

const RECENT_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub summary: String,
    pub body: String,
    pub shown_at: DateTime<Utc>,
}

pub struct Notifier {
    enabled: bool,
    recent: Mutex<VecDeque<Notice>>,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        }
    }

    pub fn notify(&self, summary: &str, body: &str) {
        self.push(NoticeLevel::Info, summary, body);
        self.show(summary, body, "dialog-information");
    }

    pub fn error(&self, summary: &str, body: &str) {
        warn!("{summary}: {body}");
        self.push(NoticeLevel::Error, summary, body);
        self.show(summary, body, "dialog-error");
    }

    /// Most recent notices, newest first.
    pub fn recent(&self) -> Vec<Notice> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn push(&self, level: NoticeLevel, summary: &str, body: &str) {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == RECENT_CAPACITY {
            recent.pop_back();
        }
        recent.push_front(Notice {
            level,
            summary: summary.to_string(),
            body: body.to_string(),
            shown_at: Utc::now(),
        });
    }

    fn show(&self, summary: &str, body: &str, icon: &str) {
        if !self.enabled {
            return;
        }

        debug!("Notification: {summary}");

        if let Err(e) = Notification::new()
            .summary(summary)
            .body(body)
            .icon(icon)
            .timeout(3000)
            .show()
        {
            warn!("Failed to show notification: {e}");
        }
    }
}
