//! Marker bookkeeping shared by every delivery path.
//!
//! Push and poll both feed messages through a [`DeliveryCursor`]; only the
//! cursor decides what is new, so switching modes cannot desynchronise the
//! marker. Pushed messages that skip ahead of the marker are held back until
//! the missing sequence numbers arrive, either by push or by a poll page.

use std::collections::BTreeMap;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::types::{Marker, Message};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Push,
    Poll,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Push => "push",
            DeliveryMode::Poll => "poll",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DeliveryCursor {
    marker: Marker,
    held: BTreeMap<u64, Message>,
}

impl DeliveryCursor {
    pub fn new(marker: Marker) -> Self {
        Self {
            marker,
            held: BTreeMap::new(),
        }
    }

    pub fn marker(&self) -> Marker {
        self.marker
    }

    /// Number of pushed messages waiting for an earlier gap to close.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Admits a single pushed message and returns whatever became
    /// deliverable, in sequence order.
    pub fn accept(&mut self, message: Message) -> Vec<Message> {
        if message.seq <= self.marker.seq() {
            counter!("support_duplicates_dropped_total", "path" => "push").increment(1);
            trace!(seq = message.seq, marker = %self.marker, "dropping already delivered message");
            return Vec::new();
        }
        self.held.entry(message.seq).or_insert(message);
        self.drain_contiguous(Vec::new())
    }

    /// Admits a page returned by the store for this cursor's marker. Store
    /// pages are authoritative: everything newer than the marker is delivered
    /// even if held messages were expected to come first.
    pub fn accept_page(&mut self, page: Vec<Message>) -> Vec<Message> {
        let mut page = page;
        page.sort_by_key(|message| message.seq);
        let mut delivered = Vec::with_capacity(page.len());
        let mut dropped = 0u64;
        for message in page {
            if message.seq <= self.marker.seq() {
                dropped += 1;
                continue;
            }
            self.marker = message.marker();
            delivered.push(message);
        }
        if dropped > 0 {
            counter!("support_duplicates_dropped_total", "path" => "poll").increment(dropped);
        }
        let marker = self.marker.seq();
        self.held.retain(|seq, _| *seq > marker);
        self.drain_contiguous(delivered)
    }

    fn drain_contiguous(&mut self, mut delivered: Vec<Message>) -> Vec<Message> {
        while let Some(entry) = self.held.first_entry() {
            if *entry.key() != self.marker.seq() + 1 {
                break;
            }
            let message = entry.remove();
            self.marker = message.marker();
            delivered.push(message);
        }
        delivered
    }
}
