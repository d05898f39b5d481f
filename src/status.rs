// Read-only status snapshots for the API and WebSocket clients.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayStatus {
    Playing,
    Stuck,
    Guide,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// Tuned channel number, or -1 when nothing is tuned.
    pub channel: i64,
    pub name: String,
    pub title: String,
    pub stream_url: Option<String>,
    pub reception_quality: f64,
    pub status: PlayStatus,
    /// `h:mm:ss/h:mm:ss` position within the current entry, or `n/a`.
    pub progress: String,
}

impl StatusSnapshot {
    pub fn stopped() -> Self {
        Self {
            channel: -1,
            name: String::new(),
            title: String::new(),
            stream_url: None,
            reception_quality: 1.0,
            status: PlayStatus::Stopped,
            progress: "n/a".into(),
        }
    }
}

fn hms(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

pub fn format_progress(position: f64, duration: f64) -> String {
    if duration <= 0.0 {
        return "n/a".into();
    }
    format!("{}/{}", hms(position.min(duration)), hms(duration))
}
