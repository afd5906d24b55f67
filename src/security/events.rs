//! Security audit events.
//!
//! Every event is logged on the `security` target with an `event` field
//! naming it and a JSON `details` payload, so an external sink can consume
//! them without parsing free-form messages.

use std::net::IpAddr;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEvent {
    RateLimitWarning {
        ip: IpAddr,
        violations: i64,
        threshold: u32,
    },
    IpBanned {
        ip: IpAddr,
        start: u64,
        until: u64,
        duration_secs: u64,
    },
    IpUnbanned {
        ip: IpAddr,
    },
    BanExpired {
        ip: IpAddr,
        expired_at: u64,
    },
    BannedRequestBlocked {
        ip: IpAddr,
        remaining_secs: u64,
    },
}

impl SecurityEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SecurityEvent::RateLimitWarning { .. } => "RATE_LIMIT_WARNING",
            SecurityEvent::IpBanned { .. } => "IP_BANNED",
            SecurityEvent::IpUnbanned { .. } => "IP_UNBANNED",
            SecurityEvent::BanExpired { .. } => "BAN_EXPIRED",
            SecurityEvent::BannedRequestBlocked { .. } => "BANNED_REQUEST_BLOCKED",
        }
    }

    pub fn emit(&self) {
        let details = serde_json::to_string(self).unwrap_or_default();
        match self {
            SecurityEvent::RateLimitWarning { .. }
            | SecurityEvent::IpBanned { .. }
            | SecurityEvent::BannedRequestBlocked { .. } => {
                tracing::warn!(target: "security", event = self.name(), %details, "Security event");
            }
            SecurityEvent::IpUnbanned { .. } | SecurityEvent::BanExpired { .. } => {
                tracing::info!(target: "security", event = self.name(), %details, "Security event");
            }
        }
    }
}
