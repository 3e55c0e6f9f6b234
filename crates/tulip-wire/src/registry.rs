//! Session registry: display alias to live talk.
//!
//! The registry is owned by the command loop and mutated only there. Talks
//! never write to it; they record security events and the command loop runs
//! [`SessionRegistry::reconcile`] once per iteration to bind, re-key and drop
//! entries.

use crate::address_book::AddressBook;
use crate::talk::{Talk, TalkId};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tulip_types::Fingerprint;

/// One bound session.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub talk: Arc<Talk>,
    /// Name the entry was bound under, before any `#n` disambiguation.
    pub base_name: String,
    pub fingerprint: Fingerprint,
    pub bound_at: DateTime<Utc>,
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Keys of talks that became secure and were added.
    pub bound: Vec<String>,
    /// `(old key, new key)` for entries whose resolved name changed.
    pub renamed: Vec<(String, String)>,
    /// Keys of entries whose talk had ended.
    pub dropped: Vec<String>,
    /// `(wanted, assigned)` where a different identity already held the name.
    pub collisions: Vec<(String, String)>,
    /// Keys of older talks hung up because the same identity bound again.
    pub replaced: Vec<String>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
            && self.renamed.is_empty()
            && self.dropped.is_empty()
            && self.collisions.is_empty()
            && self.replaced.is_empty()
    }
}

/// Mapping from display alias to talk.
///
/// At most one key maps to any talk, and at most one live talk exists per
/// peer identity after each pass.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: BTreeMap<String, RegistryEntry>,
    pending: Vec<Arc<Talk>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly created talk. It gets a key once it is secure.
    pub fn admit(&mut self, talk: Arc<Talk>) {
        debug!(talk = %talk.id(), "Talk admitted to registry");
        self.pending.push(talk);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Talk>> {
        self.entries.get(name).map(|entry| &entry.talk)
    }

    pub fn entry(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    /// Key a talk is currently registered under.
    pub fn name_of(&self, id: TalkId) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.talk.id() == id)
            .map(|(name, _)| name.as_str())
    }

    /// Registered keys in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegistryEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Talks still waiting for their handshake.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ask every talk to stop.
    pub fn hang_up_all(&self) {
        for entry in self.entries.values() {
            entry.talk.terminate();
        }
        for talk in &self.pending {
            talk.terminate();
        }
    }

    /// Bring keys in line with each talk's resolved identity.
    pub fn reconcile(&mut self, book: &AddressBook) -> Reconciliation {
        let mut report = Reconciliation::default();

        for talk in self
            .pending
            .iter()
            .chain(self.entries.values().map(|entry| &entry.talk))
        {
            for event in talk.take_security_events() {
                debug!(talk = %talk.id(), event = %event, "Reconciling security event");
            }
        }

        // Ended talks go first so their names are free for re-binding.
        let ended: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.talk.is_active())
            .map(|(name, _)| name.clone())
            .collect();
        for name in ended {
            self.entries.remove(&name);
            info!(name = %name, "Session dropped");
            report.dropped.push(name);
        }
        self.pending.retain(|talk| talk.is_active());

        // Re-key entries whose alias changed since they were bound, and
        // disambiguated entries whose plain alias has become free.
        let stale: Vec<(String, String)> = self
            .entries
            .iter()
            .filter_map(|(name, entry)| {
                let wanted = entry.talk.best_name(book);
                if wanted.is_empty() {
                    return None;
                }
                let renamed = wanted != entry.base_name;
                let reclaimable = *name != wanted && !self.entries.contains_key(&wanted);
                (renamed || reclaimable).then(|| (name.clone(), wanted))
            })
            .collect();
        for (old, wanted) in stale {
            // An earlier move in this pass may have taken the alias.
            let taken = self.entries.contains_key(&wanted);
            if taken && self.entries.get(&old).is_some_and(|e| e.base_name == wanted) {
                continue;
            }
            if let Some(mut entry) = self.entries.remove(&old) {
                entry.base_name = wanted;
                let new = self.place(entry, &mut report);
                info!(old = %old, new = %new, "Session renamed");
                report.renamed.push((old, new));
            }
        }

        // Bind talks that have gone secure.
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|talk| talk.peer_identity().is_some());
        self.pending = waiting;
        for talk in ready {
            let Some(fingerprint) = talk.peer_identity() else {
                continue;
            };
            let base_name = talk.best_name(book);
            let entry = RegistryEntry {
                talk,
                base_name,
                fingerprint,
                bound_at: Utc::now(),
            };
            let key = self.place(entry, &mut report);
            info!(name = %key, "Session bound");
            report.bound.push(key);
        }

        report
    }

    /// Insert an entry under its base name, hanging up an older talk for the
    /// same identity and disambiguating clashes with other identities.
    fn place(&mut self, entry: RegistryEntry, report: &mut Reconciliation) -> String {
        let duplicate = self
            .entries
            .iter()
            .find(|(_, other)| {
                other.fingerprint == entry.fingerprint && other.talk.id() != entry.talk.id()
            })
            .map(|(name, _)| name.clone());
        if let Some(name) = duplicate {
            if let Some(old) = self.entries.remove(&name) {
                warn!(
                    name = %name,
                    old = %old.talk.id(),
                    new = %entry.talk.id(),
                    "Identity connected twice, hanging up older talk"
                );
                old.talk.terminate();
                report.replaced.push(name);
            }
        }

        let wanted = entry.base_name.clone();
        let key = if self.entries.contains_key(&wanted) {
            let key = (2..)
                .map(|n| format!("{wanted}#{n}"))
                .find(|candidate| !self.entries.contains_key(candidate))
                .unwrap_or_else(|| format!("{wanted}#{}", entry.talk.id()));
            warn!(wanted = %wanted, assigned = %key, "Alias already in use by another identity");
            report.collisions.push((wanted, key.clone()));
            key
        } else {
            wanted
        };
        self.entries.insert(key.clone(), entry);
        key
    }
}
