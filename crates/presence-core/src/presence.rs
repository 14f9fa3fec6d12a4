//! Presence debounce.
//!
//! Turns the flickering per-frame set of recognized names into stable
//! arrival / departure events. Each subject moves through
//! unconfirmed → confirmed → departing → departed, and its record is
//! forgotten after a long continuous absence.
//!
//! Besides one record per recognized name there is an anonymous record,
//! keyed `None`, that follows "any face at all". It lets unknown visitors
//! produce arrival and departure events with no name.
//!
//! Timers are evaluated only when a frame is reported through
//! [`PresenceTracker::update`]: a frame that failed inference is not
//! evidence of absence, so callers simply skip the update.

use crate::config::PresenceConfig;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEventKind {
    Arrived,
    Departed,
}

impl PresenceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceEventKind::Arrived => "arrived",
            PresenceEventKind::Departed => "departed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    /// Recognized name, or `None` for the anonymous "someone is here" record.
    pub name: Option<String>,
    pub kind: PresenceEventKind,
    pub at: Instant,
}

impl PresenceEvent {
    pub fn label(&self) -> &str {
        label(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    /// Seen, not yet for enough consecutive frames.
    Unconfirmed,
    Confirmed,
    /// Absent with the departure timer running.
    Departing,
    /// Visit ended; record kept until forgotten.
    Departed,
}

#[derive(Debug, Clone)]
pub struct PresenceRecord {
    pub first_seen_at: Instant,
    pub last_seen_at: Instant,
    pub consecutive_frames_seen: u32,
    pub eligible_for_departure: bool,
    pub departure_deadline: Option<Instant>,
}

impl PresenceRecord {
    fn new(now: Instant) -> Self {
        Self {
            first_seen_at: now,
            last_seen_at: now,
            consecutive_frames_seen: 0,
            eligible_for_departure: false,
            departure_deadline: None,
        }
    }

    fn visit_open(&self) -> bool {
        self.consecutive_frames_seen > 0
    }

    fn is_present(&self) -> bool {
        self.eligible_for_departure && self.visit_open()
    }

    pub fn state(&self) -> PresenceState {
        if self.departure_deadline.is_some() {
            PresenceState::Departing
        } else if !self.visit_open() {
            PresenceState::Departed
        } else if self.eligible_for_departure {
            PresenceState::Confirmed
        } else {
            PresenceState::Unconfirmed
        }
    }
}

type Subject = Option<String>;

fn label(subject: &Subject) -> &str {
    subject.as_deref().unwrap_or("<someone>")
}

/// Debounce state for every tracked subject.
///
/// Owned by one pipeline driver and mutated only from its frame loop.
#[derive(Debug)]
pub struct PresenceTracker {
    confirm_frames: u32,
    departure: Duration,
    forget: Duration,
    records: BTreeMap<Subject, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            confirm_frames: config.confirm_frames.max(1),
            departure: config.departure(),
            forget: config.forget(),
            records: BTreeMap::new(),
        }
    }

    pub fn record(&self, name: &str) -> Option<&PresenceRecord> {
        self.records.get(&Some(name.to_string()))
    }

    /// The record following any face, recognized or not.
    pub fn anonymous(&self) -> Option<&PresenceRecord> {
        self.records.get(&None)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Names whose presence is confirmed and not yet departed, sorted.
    pub fn present(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, r)| r.is_present())
            .filter_map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether somebody, known or not, is confirmed present.
    pub fn someone_present(&self) -> bool {
        self.anonymous().is_some_and(PresenceRecord::is_present)
    }

    /// Feed one successfully processed frame: how many faces it held and
    /// which names were accepted.
    ///
    /// Returns the events this frame caused: sightings first (a visit that
    /// expired unobserved departs before its subject can arrive again), then
    /// departures of absent subjects.
    pub fn update<'a, I>(&mut self, now: Instant, faces: usize, names: I) -> Vec<PresenceEvent>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen: BTreeSet<Subject> = names.into_iter().map(|n| Some(n.to_string())).collect();
        if faces > 0 || !seen.is_empty() {
            seen.insert(None);
        }
        let mut events = Vec::new();

        for subject in &seen {
            let record = self
                .records
                .entry(subject.clone())
                .or_insert_with(|| PresenceRecord::new(now));

            // Absent past the forget interval without an update in between: close
            // the old visit and start over
            if now.saturating_duration_since(record.last_seen_at) >= self.forget {
                if record.is_present() {
                    tracing::info!(name = label(subject), "visit expired unobserved");
                    events.push(PresenceEvent {
                        name: subject.clone(),
                        kind: PresenceEventKind::Departed,
                        at: now,
                    });
                }
                *record = PresenceRecord::new(now);
            }
            if !record.visit_open() {
                record.first_seen_at = now;
            }

            if record.departure_deadline.take().is_some() {
                tracing::debug!(name = label(subject), "reappeared before departure; timer cancelled");
            }
            record.last_seen_at = now;
            record.consecutive_frames_seen = record.consecutive_frames_seen.saturating_add(1);

            if !record.eligible_for_departure && record.consecutive_frames_seen >= self.confirm_frames {
                record.eligible_for_departure = true;
                tracing::info!(name = label(subject), frames = record.consecutive_frames_seen, "presence confirmed");
                events.push(PresenceEvent {
                    name: subject.clone(),
                    kind: PresenceEventKind::Arrived,
                    at: now,
                });
            }
        }

        let mut dropped = Vec::new();

        for (subject, record) in self.records.iter_mut() {
            if seen.contains(subject) {
                continue;
            }

            if now.saturating_duration_since(record.last_seen_at) >= self.forget {
                if record.is_present() {
                    events.push(PresenceEvent {
                        name: subject.clone(),
                        kind: PresenceEventKind::Departed,
                        at: now,
                    });
                }
                dropped.push(subject.clone());
                continue;
            }

            if record.departure_deadline.is_none() && record.visit_open() {
                record.departure_deadline = Some(now + self.departure);
            }

            let Some(deadline) = record.departure_deadline else {
                continue;
            };
            if now < deadline {
                continue;
            }

            if record.eligible_for_departure {
                tracing::info!(name = label(subject), "departure confirmed");
                events.push(PresenceEvent {
                    name: subject.clone(),
                    kind: PresenceEventKind::Departed,
                    at: now,
                });
                record.consecutive_frames_seen = 0;
                record.eligible_for_departure = false;
                record.departure_deadline = None;
            } else {
                tracing::debug!(name = label(subject), "unconfirmed sighting expired");
                dropped.push(subject.clone());
            }
        }

        for subject in dropped {
            self.records.remove(&subject);
        }

        events
    }
}
