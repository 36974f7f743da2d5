//! Multi-granularity locking with wound-wait deadlock prevention. Locks
//! are held per table or per record; each lockable object carries a FIFO
//! request queue, its own condition variable and the strongest granted
//! mode as an aggregate. An older transaction blocked by younger holders
//! wounds them; a younger one waits its turn.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use crate::disk::FileId;
use crate::error::{EngineError, Result};
use crate::page::Rid;
use crate::transaction::{Transaction, TxnState};
use crate::TxnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentionShared,
    IntentionExclusive,
    SharedIntentionExclusive,
}

/// Flavor of a record lock; plain record locks are `NotGap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordLockKind {
    Ordinary,
    Gap,
    NotGap,
    Intention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTarget {
    Table,
    Record { rid: Rid, kind: RecordLockKind },
}

/// Unique identifier of one lockable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockDataId {
    pub fd: FileId,
    pub target: LockTarget,
}

impl LockDataId {
    pub fn table(fd: FileId) -> Self {
        Self {
            fd,
            target: LockTarget::Table,
        }
    }

    pub fn record(fd: FileId, rid: Rid) -> Self {
        Self {
            fd,
            target: LockTarget::Record {
                rid,
                kind: RecordLockKind::NotGap,
            },
        }
    }

    pub fn record_kind(fd: FileId, rid: Rid, kind: RecordLockKind) -> Self {
        Self {
            fd,
            target: LockTarget::Record { rid, kind },
        }
    }
}

/// Group modes index the compatibility matrix; `NonLock` is an empty
/// queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupMode {
    NonLock = 0,
    IntentionShared = 1,
    IntentionExclusive = 2,
    Shared = 3,
    Exclusive = 4,
    SharedIntentionExclusive = 5,
}

const COMPATIBILITY: [[bool; 6]; 6] = [
    // NO     IS     IX     S      X      SIX
    [true, true, true, true, true, true],      // NO
    [true, true, true, true, false, false],    // IS
    [true, true, true, false, false, false],   // IX
    [true, true, false, true, false, false],   // S
    [true, false, false, false, false, false], // X
    [true, false, false, false, false, true],  // SIX
];

fn group_of(mode: LockMode) -> GroupMode {
    match mode {
        LockMode::IntentionShared => GroupMode::IntentionShared,
        LockMode::IntentionExclusive => GroupMode::IntentionExclusive,
        LockMode::Shared => GroupMode::Shared,
        LockMode::Exclusive => GroupMode::Exclusive,
        LockMode::SharedIntentionExclusive => GroupMode::SharedIntentionExclusive,
    }
}

fn compatible(held: GroupMode, requested: GroupMode) -> bool {
    COMPATIBILITY[held as usize][requested as usize]
}

fn rank(mode: LockMode) -> u8 {
    match mode {
        LockMode::IntentionShared => 1,
        LockMode::IntentionExclusive => 2,
        LockMode::Shared => 3,
        LockMode::SharedIntentionExclusive => 4,
        LockMode::Exclusive => 5,
    }
}

/// Whether a held mode already satisfies a request.
fn covers(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    if held == requested {
        return true;
    }
    match held {
        Exclusive => true,
        SharedIntentionExclusive => {
            matches!(requested, Shared | IntentionShared | IntentionExclusive)
        }
        Shared => matches!(requested, IntentionShared),
        IntentionExclusive => matches!(requested, IntentionShared),
        IntentionShared => false,
    }
}

/// The combined mode a held/requested pair upgrades to:
/// S -> X, IS -> IX, and S or IX -> SIX.
fn upgrade_target(held: LockMode, requested: LockMode) -> Option<LockMode> {
    use LockMode::*;
    let target = match (held, requested) {
        (Shared, Exclusive) | (IntentionExclusive, Exclusive) | (IntentionShared, Exclusive) => {
            Exclusive
        }
        (IntentionShared, IntentionExclusive) => IntentionExclusive,
        (IntentionShared, Shared) => Shared,
        (Shared, IntentionExclusive) | (IntentionExclusive, Shared) => SharedIntentionExclusive,
        (Shared, SharedIntentionExclusive)
        | (IntentionExclusive, SharedIntentionExclusive)
        | (IntentionShared, SharedIntentionExclusive) => SharedIntentionExclusive,
        _ => return None,
    };
    Some(target)
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

struct LockQueue {
    requests: VecDeque<LockRequest>,
    group_mode: GroupMode,
    upgrading: Option<TxnId>,
    cv: Arc<Condvar>,
}

impl LockQueue {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            group_mode: GroupMode::NonLock,
            upgrading: None,
            cv: Arc::new(Condvar::new()),
        }
    }

    fn recompute_group_mode(&mut self) {
        self.group_mode = self
            .requests
            .iter()
            .filter(|r| r.granted)
            .max_by_key(|r| rank(r.mode))
            .map(|r| group_of(r.mode))
            .unwrap_or(GroupMode::NonLock);
    }

    /// Compatible with every granted request of another transaction (the
    /// aggregate is dominated by them, modulo our own grant during an
    /// upgrade).
    fn can_grant(&self, txn_id: TxnId, mode: LockMode) -> bool {
        let requested = group_of(mode);
        self.requests
            .iter()
            .filter(|r| r.granted && r.txn_id != txn_id)
            .all(|r| compatible(group_of(r.mode), requested))
    }

    /// Granted holders of other transactions incompatible with `mode`.
    fn incompatible_holders(&self, txn_id: TxnId, mode: LockMode) -> Vec<TxnId> {
        let requested = group_of(mode);
        self.requests
            .iter()
            .filter(|r| r.granted && r.txn_id != txn_id && !compatible(group_of(r.mode), requested))
            .map(|r| r.txn_id)
            .collect()
    }
}

struct LockTable {
    queues: HashMap<LockDataId, LockQueue>,
    wounded: HashSet<TxnId>,
    waiting_on: HashMap<TxnId, LockDataId>,
}

/// The process-wide lock manager. One mutex guards the whole lock table;
/// waits happen on per-queue condition variables tied to that mutex.
pub struct LockManager {
    state: Mutex<LockTable>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockTable {
                queues: HashMap::new(),
                wounded: HashSet::new(),
                waiting_on: HashMap::new(),
            }),
        }
    }

    pub fn lock_shared_on_record(&self, txn: &Transaction, fd: FileId, rid: Rid) -> Result<()> {
        self.lock(txn, LockDataId::record(fd, rid), LockMode::Shared)
    }

    pub fn lock_exclusive_on_record(&self, txn: &Transaction, fd: FileId, rid: Rid) -> Result<()> {
        self.lock(txn, LockDataId::record(fd, rid), LockMode::Exclusive)
    }

    pub fn lock_shared_on_table(&self, txn: &Transaction, fd: FileId) -> Result<()> {
        self.lock(txn, LockDataId::table(fd), LockMode::Shared)
    }

    pub fn lock_exclusive_on_table(&self, txn: &Transaction, fd: FileId) -> Result<()> {
        self.lock(txn, LockDataId::table(fd), LockMode::Exclusive)
    }

    pub fn lock_is_on_table(&self, txn: &Transaction, fd: FileId) -> Result<()> {
        self.lock(txn, LockDataId::table(fd), LockMode::IntentionShared)
    }

    pub fn lock_ix_on_table(&self, txn: &Transaction, fd: FileId) -> Result<()> {
        self.lock(txn, LockDataId::table(fd), LockMode::IntentionExclusive)
    }

    /// Acquires `mode` on `id` for `txn`, waiting if necessary. A lock
    /// already held in the same or a stronger mode returns immediately;
    /// a weaker one upgrades. Wound-wait arbitration: an older requester
    /// wounds younger incompatible holders; a wounded transaction
    /// surfaces `DeadlockPrevention` at its wait site or its next call
    /// here.
    pub fn lock(&self, txn: &Transaction, id: LockDataId, mode: LockMode) -> Result<()> {
        if txn.state() == TxnState::Shrinking {
            return Err(EngineError::LockOnShrinking(txn.id()));
        }
        let txn_id = txn.id();
        let mut guard = self.state.lock().unwrap();
        if guard.wounded.remove(&txn_id) {
            return Err(EngineError::DeadlockPrevention(txn_id));
        }

        let queue = guard.queues.entry(id).or_insert_with(LockQueue::new);
        let held = queue
            .requests
            .iter()
            .find(|r| r.txn_id == txn_id && r.granted)
            .map(|r| r.mode);

        let (target, is_upgrade) = match held {
            Some(held_mode) if covers(held_mode, mode) => return Ok(()),
            Some(held_mode) => {
                let Some(target) = upgrade_target(held_mode, mode) else {
                    return Err(EngineError::Internal(format!(
                        "no upgrade path from {held_mode:?} to {mode:?}"
                    )));
                };
                // At most one transaction may wait for an upgrade on a
                // queue at a time.
                if queue.upgrading.is_some_and(|other| other != txn_id) {
                    return Err(EngineError::UpgradeConflict(txn_id));
                }
                queue.upgrading = Some(txn_id);
                (target, true)
            }
            None => {
                queue.requests.push_back(LockRequest {
                    txn_id,
                    mode,
                    granted: false,
                });
                (mode, false)
            }
        };

        loop {
            let state = &mut *guard;
            let queue = state
                .queues
                .get_mut(&id)
                .expect("queue exists while a request is pending");
            if queue.can_grant(txn_id, target) {
                let request = queue
                    .requests
                    .iter_mut()
                    .find(|r| r.txn_id == txn_id)
                    .expect("request present until granted or abandoned");
                request.mode = target;
                request.granted = true;
                if is_upgrade {
                    queue.upgrading = None;
                }
                let cv = queue.cv.clone();
                queue.recompute_group_mode();
                state.waiting_on.remove(&txn_id);
                txn.add_lock(id);
                cv.notify_all();
                return Ok(());
            }

            // Wound-wait: wound every younger incompatible holder, then
            // wait for the queue to drain.
            let victims: Vec<TxnId> = queue
                .incompatible_holders(txn_id, target)
                .into_iter()
                .filter(|&holder| holder > txn_id)
                .collect();
            let cv = queue.cv.clone();
            for victim in victims {
                debug!("txn {txn_id} wounds younger txn {victim}");
                state.wounded.insert(victim);
                if let Some(victim_queue) = state.waiting_on.get(&victim).copied() {
                    if let Some(q) = state.queues.get(&victim_queue) {
                        q.cv.notify_all();
                    }
                }
            }

            state.waiting_on.insert(txn_id, id);
            guard = cv.wait(guard).unwrap();

            if guard.wounded.remove(&txn_id) {
                self.abandon_request(&mut guard, txn_id, id, is_upgrade);
                return Err(EngineError::DeadlockPrevention(txn_id));
            }
        }
    }

    /// Drops a pending request after its owner was wounded mid-wait. An
    /// upgrade keeps its original grant; the wounded owner is about to
    /// release everything anyway.
    fn abandon_request(
        &self,
        guard: &mut LockTable,
        txn_id: TxnId,
        id: LockDataId,
        is_upgrade: bool,
    ) {
        guard.waiting_on.remove(&txn_id);
        if let Some(queue) = guard.queues.get_mut(&id) {
            if is_upgrade {
                if queue.upgrading == Some(txn_id) {
                    queue.upgrading = None;
                }
            } else {
                queue.requests.retain(|r| r.txn_id != txn_id);
            }
            queue.recompute_group_mode();
            queue.cv.notify_all();
            if queue.requests.is_empty() {
                guard.queues.remove(&id);
            }
        }
    }

    /// Removes every request `txn` holds on `id`, waking waiters.
    pub fn unlock(&self, txn: &Transaction, id: LockDataId) -> bool {
        let mut guard = self.state.lock().unwrap();
        let Some(queue) = guard.queues.get_mut(&id) else {
            return false;
        };
        let before = queue.requests.len();
        queue.requests.retain(|r| r.txn_id != txn.id());
        if queue.upgrading == Some(txn.id()) {
            queue.upgrading = None;
        }
        queue.recompute_group_mode();
        queue.cv.notify_all();
        let removed = queue.requests.len() < before;
        if queue.requests.is_empty() {
            guard.queues.remove(&id);
        }
        removed
    }

    /// Releases every lock in the transaction's lock-set in one pass.
    pub fn release_all(&self, txn: &Transaction) {
        for id in txn.take_lock_set() {
            self.unlock(txn, id);
        }
        let mut guard = self.state.lock().unwrap();
        guard.wounded.remove(&txn.id());
        guard.waiting_on.remove(&txn.id());
    }

    /// Modes `txn` currently holds on `id`, for assertions in tests.
    pub fn held_mode(&self, txn_id: TxnId, id: LockDataId) -> Option<LockMode> {
        let guard = self.state.lock().unwrap();
        guard.queues.get(&id).and_then(|q| {
            q.requests
                .iter()
                .find(|r| r.txn_id == txn_id && r.granted)
                .map(|r| r.mode)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(id: TxnId) -> Transaction {
        let t = Transaction::new(id);
        t.set_state(TxnState::Growing);
        t
    }

    #[test]
    fn test_compatibility_matrix_spot_checks() {
        use GroupMode::*;
        assert!(compatible(IntentionShared, GroupMode::IntentionExclusive));
        assert!(compatible(Shared, GroupMode::Shared));
        assert!(!compatible(Shared, GroupMode::IntentionExclusive));
        assert!(!compatible(Exclusive, GroupMode::IntentionShared));
        assert!(!compatible(IntentionExclusive, GroupMode::Shared));
        assert!(compatible(SharedIntentionExclusive, GroupMode::SharedIntentionExclusive));
        assert!(!compatible(SharedIntentionExclusive, GroupMode::IntentionShared));
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let t2 = txn(2);
        let id = LockDataId::table(0);
        lm.lock(&t1, id, LockMode::Shared).unwrap();
        lm.lock(&t2, id, LockMode::Shared).unwrap();
        assert_eq!(lm.held_mode(1, id), Some(LockMode::Shared));
        assert_eq!(lm.held_mode(2, id), Some(LockMode::Shared));
    }

    #[test]
    fn test_stronger_held_mode_short_circuits() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let id = LockDataId::table(0);
        lm.lock(&t1, id, LockMode::Exclusive).unwrap();
        lm.lock(&t1, id, LockMode::Shared).unwrap();
        assert_eq!(lm.held_mode(1, id), Some(LockMode::Exclusive));
    }

    #[test]
    fn test_upgrade_s_to_x_when_alone() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let id = LockDataId::table(0);
        lm.lock(&t1, id, LockMode::Shared).unwrap();
        lm.lock(&t1, id, LockMode::Exclusive).unwrap();
        assert_eq!(lm.held_mode(1, id), Some(LockMode::Exclusive));
    }

    #[test]
    fn test_s_plus_ix_combines_to_six() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let id = LockDataId::table(0);
        lm.lock(&t1, id, LockMode::Shared).unwrap();
        lm.lock(&t1, id, LockMode::IntentionExclusive).unwrap();
        assert_eq!(lm.held_mode(1, id), Some(LockMode::SharedIntentionExclusive));
    }

    #[test]
    fn test_younger_requester_wounds_nobody_but_older_does() {
        let lm = LockManager::new();
        let older = txn(1);
        let younger = txn(2);
        let id = LockDataId::table(0);
        // Younger holds X; older's request wounds it.
        lm.lock(&younger, id, LockMode::Exclusive).unwrap();

        let state = lm.state.lock().unwrap();
        drop(state);
        // Older requesting against a younger holder marks the younger
        // wounded; the grant happens after the younger releases, so run
        // the release from another thread.
        std::thread::scope(|s| {
            let lm = &lm;
            let younger = &younger;
            s.spawn(move || {
                // Give the older request a moment to enqueue and wound.
                while lm.state.lock().unwrap().wounded.is_empty() {
                    std::thread::yield_now();
                }
                lm.release_all(younger);
            });
            lm.lock(&older, id, LockMode::Exclusive).unwrap();
        });
        assert_eq!(lm.held_mode(1, id), Some(LockMode::Exclusive));
        // The younger transaction learns of its wound at its next call.
        // (release_all cleared the flag here, so nothing remains held.)
        assert_eq!(lm.held_mode(2, id), None);
    }

    #[test]
    fn test_shrinking_transaction_cannot_lock() {
        let lm = LockManager::new();
        let t1 = txn(1);
        t1.set_state(TxnState::Shrinking);
        match lm.lock(&t1, LockDataId::table(0), LockMode::Shared) {
            Err(EngineError::LockOnShrinking(1)) => {}
            other => panic!("expected LockOnShrinking, got {other:?}"),
        }
    }

    #[test]
    fn test_granularity_entry_points() {
        let lm = LockManager::new();
        let reader = txn(1);
        let writer = txn(2);
        let rid = Rid::new(4, 2);

        lm.lock_is_on_table(&reader, 0).unwrap();
        lm.lock_shared_on_record(&reader, 0, rid).unwrap();
        // IS and IX coexist at the table level.
        lm.lock_ix_on_table(&writer, 0).unwrap();
        // A different record is independent.
        lm.lock_exclusive_on_record(&writer, 0, Rid::new(4, 3)).unwrap();

        assert_eq!(
            lm.held_mode(1, LockDataId::table(0)),
            Some(LockMode::IntentionShared)
        );
        assert_eq!(
            lm.held_mode(2, LockDataId::table(0)),
            Some(LockMode::IntentionExclusive)
        );
        assert_eq!(
            lm.held_mode(1, LockDataId::record(0, rid)),
            Some(LockMode::Shared)
        );
        lm.release_all(&reader);
        lm.release_all(&writer);
        assert_eq!(lm.held_mode(1, LockDataId::table(0)), None);
    }

    #[test]
    fn test_unlock_wakes_and_clears() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let id = LockDataId::record(0, Rid::new(1, 2));
        lm.lock(&t1, id, LockMode::Exclusive).unwrap();
        assert!(lm.unlock(&t1, id));
        assert!(!lm.unlock(&t1, id));
        assert_eq!(lm.held_mode(1, id), None);
    }
}
