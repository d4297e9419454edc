use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::constants::METADATA_TURN_INTERVAL;
use crate::types::ChatSession;

/// Timestamps arrive as ISO-8601 strings from realtime pushes and as epoch
/// millis from internal callers; both compare in epoch millis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PatchTimestamp {
    EpochMillis(i64),
    Iso(String),
}

impl PatchTimestamp {
    /// Epoch millis when the value parses; None otherwise.
    pub fn parsed_epoch_millis(&self) -> Option<i64> {
        match self {
            PatchTimestamp::EpochMillis(ms) => Some(*ms),
            PatchTimestamp::Iso(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(dt) => Some(dt.timestamp_millis()),
                Err(_) => None,
            },
        }
    }

    /// Comparison value: unparseable timestamps sort before everything and
    /// are never propagated onto the session.
    pub fn epoch_millis(&self) -> i64 {
        match self.parsed_epoch_millis() {
            Some(ms) => ms,
            None => 0,
        }
    }
}

/// A metadata patch about a session: realtime UPDATE payloads and
/// metadata-generation replies both take this shape. Absent fields leave the
/// session's values alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "sessionSummary", skip_serializing_if = "Option::is_none")]
    pub session_summary: Option<String>,
    #[serde(default, alias = "lastUpdated", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<PatchTimestamp>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.session_summary.is_none()
    }

    pub fn touch(now_ms: i64) -> Self {
        Self {
            name: None,
            session_summary: None,
            last_updated: Some(PatchTimestamp::EpochMillis(now_ms)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    Discarded,
}

/// Last-writer-wins by timestamp. A patch strictly older than the session's
/// `last_updated` is discarded whole — an older patch never partially wins.
/// Equal timestamps apply. Idempotent: applying the same accepted patch
/// twice leaves the same state as applying it once.
///
/// Every writer — realtime push, RPC reply, internal touch — funnels through
/// here, so arrival order cannot regress the session.
pub fn apply_patch(session: &mut ChatSession, patch: &SessionPatch) -> PatchOutcome {
    let patch_ms = match patch.last_updated.as_ref() {
        Some(ts) => ts.epoch_millis(),
        None => 0,
    };

    if let Some(current) = session.last_updated {
        if current > patch_ms {
            return PatchOutcome::Discarded;
        }
    }

    if let Some(name) = &patch.name {
        session.name = Some(name.clone());
    }
    if let Some(summary) = &patch.session_summary {
        session.session_summary = Some(summary.clone());
    }
    if let Some(ms) = patch.last_updated.as_ref().and_then(|t| t.parsed_epoch_millis()) {
        session.last_updated = Some(ms);
    }

    PatchOutcome::Applied
}

/// Decides when to fire a metadata-generation round trip: after assistant
/// turns 3, 6, 9, …, never while a response is in flight, never twice for
/// one turn count. One trigger per session id; keying the map by session is
/// what resets the counter on session switch.
#[derive(Debug, Default, Clone)]
pub struct MetadataTrigger {
    last_fired: u32,
}

impl MetadataTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_fire(&mut self, assistant_turns: u32, in_flight: bool) -> bool {
        if in_flight {
            return false;
        }
        if assistant_turns == 0 || assistant_turns % METADATA_TURN_INTERVAL != 0 {
            return false;
        }
        if assistant_turns == self.last_fired {
            return false;
        }
        self.last_fired = assistant_turns;
        true
    }
}
