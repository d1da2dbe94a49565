use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard};

use crate::model::*;

/// Why a staged change was refused by [`Store::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckFailure {
    DuplicateUsername(String),
    Integrity(String),
}

/// Row tables, secondary indexes and id sequences. Rows are only ever
/// changed through [`Store::apply_commit`], which the engine calls after the
/// owning commit is durable in the WAL.
///
/// Single-row getters are atomic on their own. Readers that join several
/// rows hold [`Store::read_view`] so a commit is either fully visible or not
/// at all.
pub struct Store {
    providers: DashMap<ProviderId, Provider>,
    consumers: DashMap<String, Consumer>,
    slots: DashMap<SlotId, Slot>,
    reservations: DashMap<ReservationId, Reservation>,

    provider_slots: DashMap<ProviderId, Vec<SlotId>>,
    consumer_reservations: DashMap<String, Vec<ReservationId>>,
    /// slot → its live reservation, if booked
    slot_reservation: DashMap<SlotId, ReservationId>,

    provider_seq: AtomicI64,
    slot_seq: AtomicI64,
    reservation_seq: AtomicI64,

    visible: RwLock<()>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            consumers: DashMap::new(),
            slots: DashMap::new(),
            reservations: DashMap::new(),
            provider_slots: DashMap::new(),
            consumer_reservations: DashMap::new(),
            slot_reservation: DashMap::new(),
            provider_seq: AtomicI64::new(0),
            slot_seq: AtomicI64::new(0),
            reservation_seq: AtomicI64::new(0),
            visible: RwLock::new(()),
        }
    }

    // ── Sequences ────────────────────────────────────────────

    pub fn next_provider_id(&self) -> ProviderId {
        self.provider_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_slot_id(&self) -> SlotId {
        self.slot_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_reservation_id(&self) -> ReservationId {
        self.reservation_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ── Providers ────────────────────────────────────────────

    pub fn provider_exists(&self, id: ProviderId) -> bool {
        self.providers.contains_key(&id)
    }

    pub fn provider(&self, id: ProviderId) -> Option<Provider> {
        self.providers.get(&id).map(|e| e.value().clone())
    }

    /// All providers ordered by id.
    pub fn providers(&self) -> Vec<Provider> {
        let mut all: Vec<Provider> = self.providers.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|p| p.id);
        all
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    // ── Consumers ────────────────────────────────────────────

    pub fn consumer_exists(&self, username: &str) -> bool {
        self.consumers.contains_key(username)
    }

    pub fn consumer(&self, username: &str) -> Option<Consumer> {
        self.consumers.get(username).map(|e| e.value().clone())
    }

    /// All consumers ordered by username.
    pub fn consumers(&self) -> Vec<Consumer> {
        let mut all: Vec<Consumer> = self.consumers.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.username.cmp(&b.username));
        all
    }

    // ── Slots ────────────────────────────────────────────────

    pub fn slot(&self, id: SlotId) -> Option<Slot> {
        self.slots.get(&id).map(|e| e.value().clone())
    }

    /// Slots published by `provider_id`, ordered by `(day, start)`.
    pub fn slots_of(&self, provider_id: ProviderId) -> Vec<Slot> {
        let ids = self
            .provider_slots
            .get(&provider_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut slots: Vec<Slot> = ids.into_iter().filter_map(|id| self.slot(id)).collect();
        slots.sort_by_key(|s| (s.day, s.span.start, s.id));
        slots
    }

    // ── Reservations ─────────────────────────────────────────

    pub fn reservation(&self, id: ReservationId) -> Option<Reservation> {
        self.reservations.get(&id).map(|e| e.value().clone())
    }

    pub fn reservations_of(&self, username: &str) -> Vec<Reservation> {
        let ids = self
            .consumer_reservations
            .get(username)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.reservation(id)).collect()
    }

    pub fn reservation_for_slot(&self, slot_id: SlotId) -> Option<ReservationId> {
        self.slot_reservation.get(&slot_id).map(|e| *e.value())
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    // ── Integrity check ──────────────────────────────────────

    /// Validate a whole commit against current rows, with earlier changes of
    /// the same commit visible to later ones. Nothing is mutated.
    pub fn check(&self, changes: &[Change]) -> Result<(), CheckFailure> {
        let mut staged = Staged::default();
        for change in changes {
            self.check_one(change, &mut staged)?;
        }
        Ok(())
    }

    fn check_one(&self, change: &Change, staged: &mut Staged) -> Result<(), CheckFailure> {
        match change {
            Change::ProviderInserted(p) => {
                if self.provider_exists(p.id) || !staged.providers.insert(p.id) {
                    return Err(integrity(format!("provider id {} already used", p.id)));
                }
            }
            Change::ConsumerInserted(c) => {
                if self.consumer_exists(&c.username) || !staged.consumers.insert(c.username.clone()) {
                    return Err(CheckFailure::DuplicateUsername(c.username.clone()));
                }
            }
            Change::SlotInserted(s) => {
                if self.slots.contains_key(&s.id) || staged.slots.contains_key(&s.id) {
                    return Err(integrity(format!("slot id {} already used", s.id)));
                }
                if !staged.has_provider(self, s.provider_id) {
                    return Err(integrity(format!("slot {} references missing provider {}", s.id, s.provider_id)));
                }
                staged.slots.insert(s.id, s.clone());
            }
            Change::SlotBookedSet { slot_id, booked } => {
                let current = match staged.booked.get(slot_id) {
                    Some(b) => *b,
                    None => staged
                        .slot(self, *slot_id)
                        .map(|s| s.booked)
                        .ok_or_else(|| integrity(format!("slot {slot_id} does not exist")))?,
                };
                if current == *booked {
                    return Err(integrity(format!("slot {slot_id} already has booked = {booked}")));
                }
                staged.booked.insert(*slot_id, *booked);
            }
            Change::ReservationInserted(r) => {
                if self.reservations.contains_key(&r.id) || staged.reservations.contains_key(&r.id) {
                    return Err(integrity(format!("reservation id {} already used", r.id)));
                }
                if !self.consumer_exists(&r.consumer_username) && !staged.consumers.contains(&r.consumer_username) {
                    return Err(integrity(format!("reservation {} references missing consumer", r.id)));
                }
                if !staged.has_provider(self, r.provider_id) {
                    return Err(integrity(format!("reservation {} references missing provider", r.id)));
                }
                let slot = staged
                    .slot(self, r.slot_id)
                    .ok_or_else(|| integrity(format!("reservation {} references missing slot", r.id)))?;
                if slot.provider_id != r.provider_id {
                    return Err(integrity(format!("slot {} is not owned by provider {}", r.slot_id, r.provider_id)));
                }
                if staged.slot_taken(self, r.slot_id) {
                    return Err(integrity(format!("slot {} already has a live reservation", r.slot_id)));
                }
                staged.taken.insert(r.slot_id, true);
                staged.reservations.insert(r.id, r.clone());
            }
            Change::ReservationDeleted { id } => {
                let live = match staged.reservations.get(id) {
                    Some(r) => Some(r.clone()),
                    None if staged.deleted.contains(id) => None,
                    None => self.reservation(*id),
                };
                let Some(r) = live else {
                    return Err(integrity(format!("reservation {id} does not exist")));
                };
                staged.reservations.remove(id);
                staged.deleted.insert(*id);
                staged.taken.insert(r.slot_id, false);
            }
            Change::SequenceFloor { .. } => {}
        }
        Ok(())
    }

    // ── Apply ────────────────────────────────────────────────

    /// Shared view over every table. Not reentrant: never call
    /// [`Store::apply_commit`] while holding one.
    pub fn read_view(&self) -> RwLockReadGuard<'_, ()> {
        self.visible.read()
    }

    /// Apply all changes of one commit while excluding readers.
    pub fn apply_commit(&self, changes: &[Change]) {
        let _exclusive = self.visible.write();
        for change in changes {
            self.apply(change);
        }
    }

    pub fn apply(&self, change: &Change) {
        match change {
            Change::ProviderInserted(p) => {
                self.provider_seq.fetch_max(p.id, Ordering::SeqCst);
                self.providers.insert(p.id, p.clone());
            }
            Change::ConsumerInserted(c) => {
                self.consumers.insert(c.username.clone(), c.clone());
            }
            Change::SlotInserted(s) => {
                self.slot_seq.fetch_max(s.id, Ordering::SeqCst);
                self.slots.insert(s.id, s.clone());
                self.provider_slots.entry(s.provider_id).or_default().push(s.id);
            }
            Change::SlotBookedSet { slot_id, booked } => {
                if let Some(mut slot) = self.slots.get_mut(slot_id) {
                    slot.booked = *booked;
                }
            }
            Change::ReservationInserted(r) => {
                self.reservation_seq.fetch_max(r.id, Ordering::SeqCst);
                self.reservations.insert(r.id, r.clone());
                self.consumer_reservations
                    .entry(r.consumer_username.clone())
                    .or_default()
                    .push(r.id);
                self.slot_reservation.insert(r.slot_id, r.id);
            }
            Change::ReservationDeleted { id } => {
                if let Some((_, r)) = self.reservations.remove(id) {
                    if let Some(mut ids) = self.consumer_reservations.get_mut(&r.consumer_username) {
                        ids.retain(|x| x != id);
                    }
                    self.slot_reservation.remove_if(&r.slot_id, |_, rid| rid == id);
                }
            }
            Change::SequenceFloor { provider, slot, reservation } => {
                self.provider_seq.fetch_max(*provider, Ordering::SeqCst);
                self.slot_seq.fetch_max(*slot, Ordering::SeqCst);
                self.reservation_seq.fetch_max(*reservation, Ordering::SeqCst);
            }
        }
    }

    /// Every current row as one commit, parents before children. Replaying
    /// it into an empty store reproduces this store.
    pub fn snapshot(&self) -> Commit {
        let mut changes = Vec::new();
        changes.extend(self.providers().into_iter().map(Change::ProviderInserted));
        changes.extend(self.consumers().into_iter().map(Change::ConsumerInserted));

        let mut slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        slots.sort_by_key(|s| s.id);
        changes.extend(slots.into_iter().map(Change::SlotInserted));

        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);
        changes.extend(reservations.into_iter().map(Change::ReservationInserted));

        changes.push(Change::SequenceFloor {
            provider: self.provider_seq.load(Ordering::SeqCst),
            slot: self.slot_seq.load(Ordering::SeqCst),
            reservation: self.reservation_seq.load(Ordering::SeqCst),
        });
        Commit { changes }
    }
}

fn integrity(msg: String) -> CheckFailure {
    CheckFailure::Integrity(msg)
}

/// Rows written earlier in the commit being checked.
#[derive(Default)]
struct Staged {
    providers: HashSet<ProviderId>,
    consumers: HashSet<String>,
    slots: HashMap<SlotId, Slot>,
    booked: HashMap<SlotId, bool>,
    reservations: HashMap<ReservationId, Reservation>,
    deleted: HashSet<ReservationId>,
    /// slot → whether it holds a live reservation after the staged changes
    taken: HashMap<SlotId, bool>,
}

impl Staged {
    fn has_provider(&self, store: &Store, id: ProviderId) -> bool {
        self.providers.contains(&id) || store.provider_exists(id)
    }

    fn slot(&self, store: &Store, id: SlotId) -> Option<Slot> {
        self.slots.get(&id).cloned().or_else(|| store.slot(id))
    }

    fn slot_taken(&self, store: &Store, id: SlotId) -> bool {
        match self.taken.get(&id) {
            Some(taken) => *taken,
            None => store.reservation_for_slot(id).is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn provider(id: ProviderId) -> Provider {
        Provider { id, name: "Ada".into(), surname: "Lovelace".into() }
    }

    fn consumer(username: &str) -> Consumer {
        Consumer {
            username: username.into(),
            name: "Grace".into(),
            surname: "Hopper".into(),
            date_of_birth: NaiveDate::from_ymd_opt(1906, 12, 9).unwrap(),
            credential_hash: "x".into(),
        }
    }

    fn slot(id: SlotId, provider_id: ProviderId) -> Slot {
        Slot {
            id,
            provider_id,
            day: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            span: Span::new(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            )
            .unwrap(),
            booked: false,
        }
    }

    fn reservation(id: ReservationId, slot_id: SlotId) -> Reservation {
        Reservation {
            id,
            consumer_username: "grace".into(),
            provider_id: 1,
            slot_id,
            subject: "Algorithms".into(),
        }
    }

    fn seeded() -> Store {
        let store = Store::new();
        store.apply(&Change::ProviderInserted(provider(1)));
        store.apply(&Change::ConsumerInserted(consumer("grace")));
        store.apply(&Change::SlotInserted(slot(1, 1)));
        store
    }

    #[test]
    fn sequences_start_at_one_and_follow_applied_ids() {
        let store = Store::new();
        assert_eq!(store.next_provider_id(), 1);
        assert_eq!(store.next_provider_id(), 2);
        store.apply(&Change::ProviderInserted(provider(10)));
        assert_eq!(store.next_provider_id(), 11);
    }

    #[test]
    fn check_rejects_duplicate_username() {
        let store = seeded();
        let err = store
            .check(&[Change::ConsumerInserted(consumer("grace"))])
            .unwrap_err();
        assert_eq!(err, CheckFailure::DuplicateUsername("grace".into()));
    }

    #[test]
    fn check_rejects_duplicate_username_within_one_commit() {
        let store = Store::new();
        let err = store
            .check(&[
                Change::ConsumerInserted(consumer("alan")),
                Change::ConsumerInserted(consumer("alan")),
            ])
            .unwrap_err();
        assert!(matches!(err, CheckFailure::DuplicateUsername(_)));
    }

    #[test]
    fn check_sees_earlier_changes_of_same_commit() {
        let store = Store::new();
        store
            .check(&[
                Change::ProviderInserted(provider(1)),
                Change::SlotInserted(slot(1, 1)),
            ])
            .unwrap();
    }

    #[test]
    fn check_rejects_slot_for_missing_provider() {
        let store = Store::new();
        assert!(matches!(
            store.check(&[Change::SlotInserted(slot(1, 9))]),
            Err(CheckFailure::Integrity(_))
        ));
    }

    #[test]
    fn check_reserve_pair_then_second_reserve_fails() {
        let store = seeded();
        let reserve = [
            Change::ReservationInserted(reservation(1, 1)),
            Change::SlotBookedSet { slot_id: 1, booked: true },
        ];
        store.check(&reserve).unwrap();
        for c in &reserve {
            store.apply(c);
        }
        let again = [
            Change::ReservationInserted(reservation(2, 1)),
            Change::SlotBookedSet { slot_id: 1, booked: true },
        ];
        assert!(matches!(store.check(&again), Err(CheckFailure::Integrity(_))));
    }

    #[test]
    fn check_rejects_redundant_flag_flip() {
        let store = seeded();
        assert!(store
            .check(&[Change::SlotBookedSet { slot_id: 1, booked: false }])
            .is_err());
    }

    #[test]
    fn check_rejects_double_delete_in_one_commit() {
        let store = seeded();
        store.apply(&Change::ReservationInserted(reservation(1, 1)));
        assert!(store
            .check(&[
                Change::ReservationDeleted { id: 1 },
                Change::ReservationDeleted { id: 1 },
            ])
            .is_err());
    }

    #[test]
    fn apply_delete_clears_indexes() {
        let store = seeded();
        store.apply(&Change::ReservationInserted(reservation(1, 1)));
        assert_eq!(store.reservation_for_slot(1), Some(1));
        assert_eq!(store.reservations_of("grace").len(), 1);

        store.apply(&Change::ReservationDeleted { id: 1 });
        assert_eq!(store.reservation_for_slot(1), None);
        assert!(store.reservations_of("grace").is_empty());
        assert_eq!(store.reservation_count(), 0);
    }

    #[test]
    fn snapshot_rebuilds_identical_store() {
        let store = seeded();
        store.apply(&Change::ReservationInserted(reservation(1, 1)));
        store.apply(&Change::SlotBookedSet { slot_id: 1, booked: true });
        let burned = store.next_reservation_id();
        assert_eq!(burned, 2);

        let rebuilt = Store::new();
        for c in &store.snapshot().changes {
            rebuilt.apply(c);
        }
        assert_eq!(rebuilt.providers(), store.providers());
        assert_eq!(rebuilt.consumers(), store.consumers());
        assert_eq!(rebuilt.slots_of(1), store.slots_of(1));
        assert!(rebuilt.slot(1).unwrap().booked);
        assert_eq!(rebuilt.reservation_for_slot(1), Some(1));
        // The burned id is not reissued
        assert_eq!(rebuilt.next_reservation_id(), 3);
    }
}
