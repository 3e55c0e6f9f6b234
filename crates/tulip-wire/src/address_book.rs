//! Address book: aliases mapped to the attestations that identify them.
//!
//! Owned and mutated only by the command loop. Entries are appended, never
//! deduplicated and never removed for the lifetime of the process.

use std::collections::BTreeMap;
use tracing::{debug, warn};
use tulip_types::{Attestation, AttestationKind, ContactEntry, Fingerprint, OnionAddress};

/// All attestations known for one alias. A person may have several devices,
/// so several entries of the same kind are allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Person {
    pub entries: Vec<Attestation>,
}

impl Person {
    /// First onion address recorded for this person, if any.
    pub fn onion_address(&self) -> Option<&OnionAddress> {
        self.entries.iter().find_map(|e| match e {
            Attestation::OnionAddress(addr) => Some(addr),
            _ => None,
        })
    }
}

/// Mapping from alias to [`Person`].
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    people: BTreeMap<String, Person>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a book from config entries. Entries that fail to parse are
    /// skipped with a warning.
    pub fn from_contacts(contacts: &[ContactEntry]) -> Self {
        let mut book = Self::new();
        for contact in contacts {
            match Attestation::parse(&contact.value, &contact.kind) {
                Ok(attestation) => book.add(&contact.alias, attestation),
                Err(e) => warn!(alias = %contact.alias, error = %e, "Skipping contact"),
            }
        }
        book
    }

    /// Append an entry, creating the alias if absent.
    pub fn add(&mut self, alias: &str, attestation: Attestation) {
        debug!(alias, attestation = %attestation, "Address book entry added");
        self.people
            .entry(alias.to_string())
            .or_default()
            .entries
            .push(attestation);
    }

    /// Alias owning an entry equal to `value`. First match wins.
    pub fn lookup_by_value(&self, value: &Attestation) -> Option<&str> {
        self.people
            .iter()
            .find(|(_, person)| person.entries.iter().any(|e| e == value))
            .map(|(alias, _)| alias.as_str())
    }

    /// Alias owning any entry of the given kind. First match wins.
    pub fn lookup_by_kind(&self, kind: AttestationKind) -> Option<&str> {
        self.people
            .iter()
            .find(|(_, person)| person.entries.iter().any(|e| e.kind() == kind))
            .map(|(alias, _)| alias.as_str())
    }

    /// Alias for a fingerprint, if one is recorded.
    pub fn lookup_fingerprint(&self, fingerprint: &Fingerprint) -> Option<&str> {
        self.lookup_by_value(&Attestation::Fingerprint(fingerprint.clone()))
    }

    pub fn get(&self, alias: &str) -> Option<&Person> {
        self.people.get(alias)
    }

    /// Iterate over all aliases in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Person)> {
        self.people.iter().map(|(alias, person)| (alias.as_str(), person))
    }

    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROWSER_FP: &str = "2264d806e7789a5773bdaffb798bcf3fdb456a81";

    fn fp(hex: &str) -> Attestation {
        Attestation::parse(hex, "fp").unwrap()
    }

    #[test]
    fn test_add_and_lookup_by_value() {
        let mut book = AddressBook::new();
        book.add("alice", fp(BROWSER_FP));
        assert_eq!(book.lookup_by_value(&fp(BROWSER_FP)), Some("alice"));
        assert_eq!(book.lookup_by_value(&fp("00ff")), None);
    }

    #[test]
    fn test_add_creates_person_and_never_dedups() {
        let mut book = AddressBook::new();
        book.add("alice", fp(BROWSER_FP));
        book.add("alice", fp(BROWSER_FP));
        book.add("alice", fp("abcdef"));
        assert_eq!(book.len(), 1);
        assert_eq!(book.get("alice").unwrap().entries.len(), 3);
    }

    #[test]
    fn test_lookup_by_kind() {
        let mut book = AddressBook::new();
        book.add("alice", fp(BROWSER_FP));
        assert_eq!(book.lookup_by_kind(AttestationKind::OnionAddress), None);

        book.add(
            "bob",
            Attestation::parse("bobsplace.onion", "onion").unwrap(),
        );
        assert_eq!(book.lookup_by_kind(AttestationKind::OnionAddress), Some("bob"));
        assert_eq!(
            book.get("bob").unwrap().onion_address().unwrap().as_str(),
            "bobsplace.onion"
        );
    }

    #[test]
    fn test_from_contacts_skips_bad_entries() {
        let contacts = vec![
            ContactEntry {
                alias: "browser".to_string(),
                value: BROWSER_FP.to_string(),
                kind: "otr-fp".to_string(),
            },
            ContactEntry {
                alias: "broken".to_string(),
                value: "zz".to_string(),
                kind: "fp".to_string(),
            },
        ];
        let book = AddressBook::from_contacts(&contacts);
        assert_eq!(book.len(), 1);
        assert_eq!(
            book.lookup_fingerprint(&Fingerprint::from_hex(BROWSER_FP).unwrap()),
            Some("browser")
        );
    }
}
