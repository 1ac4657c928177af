//! Per-event static attributes derived from free-text fields.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::events::{Event, DAY_MS};

pub const UNKNOWN_REGION: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    Mac,
    Windows,
    Linux,
    Ios,
    Android,
    Other,
    Unknown,
}

impl Platform {
    pub const ALL: [Platform; 7] = [
        Platform::Mac,
        Platform::Windows,
        Platform::Linux,
        Platform::Ios,
        Platform::Android,
        Platform::Other,
        Platform::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mac => "mac",
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }
}

// Evaluated top to bottom: iOS agents claim "like Mac OS X" and Android
// agents claim "Linux", so the narrower markers come first.
const PLATFORM_RULES: [(&[&str], Platform); 5] = [
    (&["iPhone", "iPad", "iPod"], Platform::Ios),
    (&["Android"], Platform::Android),
    (&["Windows"], Platform::Windows),
    (&["Macintosh", "Mac OS X"], Platform::Mac),
    (&["Linux", "X11"], Platform::Linux),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributedEvent {
    pub event: Event,
    pub platform: Platform,
    pub region: String,
    /// Account age at the moment of this event, not at any cutoff.
    pub account_age_days: Option<f64>,
}

impl AttributedEvent {
    pub fn user_id(&self) -> &str {
        &self.event.user_id
    }

    pub fn ts_ms_utc(&self) -> i64 {
        self.event.ts_ms_utc
    }
}

pub fn platform_from_user_agent(user_agent: Option<&str>) -> Platform {
    let Some(agent) = user_agent.map(str::trim).filter(|agent| !agent.is_empty()) else {
        return Platform::Unknown;
    };

    PLATFORM_RULES
        .iter()
        .find(|(markers, _)| markers.iter().any(|marker| agent.contains(marker)))
        .map(|(_, platform)| *platform)
        .unwrap_or(Platform::Other)
}

/// Second comma-separated token of a `"City, ST"` location.
pub fn region_from_location(location: Option<&str>) -> String {
    location
        .and_then(|location| location.split(',').nth(1))
        .map(str::trim)
        .filter(|region| !region.is_empty())
        .unwrap_or(UNKNOWN_REGION)
        .to_string()
}

pub fn account_age_days(ts_ms_utc: i64, registration_ts_ms_utc: Option<i64>) -> Option<f64> {
    registration_ts_ms_utc
        .map(|registration| ts_ms_utc.saturating_sub(registration) as f64 / DAY_MS as f64)
}

pub fn attribute_event(event: Event) -> AttributedEvent {
    let platform = platform_from_user_agent(event.user_agent.as_deref());
    let region = region_from_location(event.location.as_deref());
    let account_age_days = account_age_days(event.ts_ms_utc, event.registration_ts_ms_utc);
    AttributedEvent {
        event,
        platform,
        region,
        account_age_days,
    }
}

pub fn extract_attributes(events: &[Event]) -> Vec<AttributedEvent> {
    let attributed: Vec<AttributedEvent> = events.iter().cloned().map(attribute_event).collect();

    info!(
        component = "attributes",
        event = "attributes.extract.finish",
        events = attributed.len()
    );

    attributed
}
