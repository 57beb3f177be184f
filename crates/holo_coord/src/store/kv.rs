//! Key-value backend on a fjall keyspace.
//!
//! Layout:
//! - `trans_global`: gid -> JSON record
//! - `trans_branch`: len-prefixed gid + u32 sequence -> JSON branch (creation order)
//! - `trans_due`: u64 due time (big endian) + gid -> empty, the priority queue
//!   the scheduler pops from
//! - `trans_due_gid`: gid -> current due key, so entries can be moved or removed
//!
//! Each compare-then-mutate operation holds the store write lock while it
//! reads, checks and commits a single atomic batch, which gives the same
//! all-or-nothing behavior as a server-side script.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use fjall::{Batch, Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::warn;

use super::{check_finished, next_cron_time, GlobalField, StoreError, StoreResult, TransStore};
use crate::model::{unix_time_ms, BranchStatusUpdate, TransBranch, TransGlobal, TransStatus};

pub struct KvTransStore {
    keyspace: Arc<Keyspace>,
    globals: PartitionHandle,
    branches: PartitionHandle,
    due: PartitionHandle,
    due_by_gid: PartitionHandle,
    lock: RwLock<()>,
}

impl KvTransStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let keyspace = Arc::new(fjall::Config::new(path).open()?);
        Self::from_keyspace(keyspace)
    }

    pub fn from_keyspace(keyspace: Arc<Keyspace>) -> StoreResult<Self> {
        let globals = keyspace.open_partition("trans_global", PartitionCreateOptions::default())?;
        let branches = keyspace.open_partition("trans_branch", PartitionCreateOptions::default())?;
        let due = keyspace.open_partition("trans_due", PartitionCreateOptions::default())?;
        let due_by_gid =
            keyspace.open_partition("trans_due_gid", PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            globals,
            branches,
            due,
            due_by_gid,
            lock: RwLock::new(()),
        })
    }

    fn read_guard(&self) -> StoreResult<RwLockReadGuard<'_, ()>> {
        self.lock
            .read()
            .map_err(|_| StoreError::Invariant("kv store lock poisoned".to_string()))
    }

    fn write_guard(&self) -> StoreResult<RwLockWriteGuard<'_, ()>> {
        self.lock
            .write()
            .map_err(|_| StoreError::Invariant("kv store lock poisoned".to_string()))
    }

    fn load_global(&self, gid: &str) -> StoreResult<Option<TransGlobal>> {
        match self.globals.get(gid.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_branches(&self, gid: &str) -> StoreResult<Vec<(Vec<u8>, TransBranch)>> {
        let mut out = Vec::new();
        for item in self.branches.prefix(encode_key_prefix(gid.as_bytes())) {
            let (key, value) = item?;
            out.push((key.to_vec(), serde_json::from_slice(&value)?));
        }
        Ok(out)
    }

    fn put_global(&self, batch: &mut Batch, global: &TransGlobal) -> StoreResult<()> {
        batch.insert(&self.globals, global.gid.as_bytes(), serde_json::to_vec(global)?);
        Ok(())
    }

    /// Move (or insert) the due-index entry of `gid` to `due_ms`.
    fn schedule(&self, batch: &mut Batch, gid: &str, due_ms: u64) -> StoreResult<()> {
        self.unschedule(batch, gid)?;
        let key = encode_due_key(due_ms, gid);
        batch.insert(&self.due, key.clone(), Vec::<u8>::new());
        batch.insert(&self.due_by_gid, gid.as_bytes(), key);
        Ok(())
    }

    fn unschedule(&self, batch: &mut Batch, gid: &str) -> StoreResult<()> {
        if let Some(old) = self.due_by_gid.get(gid.as_bytes())? {
            batch.remove(&self.due, old.to_vec());
            batch.remove(&self.due_by_gid, gid.as_bytes());
        }
        Ok(())
    }

    fn clear_partition(&self, batch: &mut Batch, partition: &PartitionHandle) -> StoreResult<()> {
        for item in partition.iter() {
            let (key, _) = item?;
            batch.remove(partition, key.to_vec());
        }
        Ok(())
    }
}

impl TransStore for KvTransStore {
    fn name(&self) -> &'static str {
        "kv"
    }

    fn populate(&self, skip_drop: bool) -> StoreResult<()> {
        if skip_drop {
            return Ok(());
        }
        let _guard = self.write_guard()?;
        let mut batch = self.keyspace.batch();
        for partition in [&self.globals, &self.branches, &self.due, &self.due_by_gid] {
            self.clear_partition(&mut batch, partition)?;
        }
        batch.commit()?;
        Ok(())
    }

    fn save_new_trans(&self, global: &TransGlobal, branches: &[TransBranch]) -> StoreResult<()> {
        let _guard = self.write_guard()?;
        if self.globals.get(global.gid.as_bytes())?.is_some() {
            return Err(StoreError::UniqueConflict);
        }
        let mut batch = self.keyspace.batch();
        self.put_global(&mut batch, global)?;
        // First occurrence of a (branch_id, op) wins.
        let mut kept: Vec<&TransBranch> = Vec::with_capacity(branches.len());
        for branch in branches {
            if !kept.iter().any(|k| k.same_identity(branch)) {
                kept.push(branch);
            }
        }
        for (seq, branch) in kept.into_iter().enumerate() {
            batch.insert(
                &self.branches,
                encode_branch_key(&global.gid, seq as u32),
                serde_json::to_vec(branch)?,
            );
        }
        if !global.status.is_terminal() {
            self.schedule(&mut batch, &global.gid, global.next_cron_time)?;
        }
        batch.commit()?;
        Ok(())
    }

    fn get_trans_global(&self, gid: &str) -> StoreResult<TransGlobal> {
        let _guard = self.read_guard()?;
        self.load_global(gid)?.ok_or(StoreError::NotFound)
    }

    fn scan_trans_globals(
        &self,
        cursor: &mut Option<String>,
        limit: usize,
    ) -> StoreResult<Vec<TransGlobal>> {
        let _guard = self.read_guard()?;
        let limit = limit.max(1);
        let mut out = Vec::with_capacity(limit);
        // Smallest key strictly greater than the cursor.
        let start = match cursor.as_ref() {
            Some(after) => {
                let mut start = after.as_bytes().to_vec();
                start.push(0);
                start
            }
            None => Vec::new(),
        };
        for item in self.globals.range(start..) {
            let (_, value) = item?;
            out.push(serde_json::from_slice::<TransGlobal>(&value)?);
            if out.len() >= limit {
                break;
            }
        }
        if let Some(last) = out.last() {
            *cursor = Some(last.gid.clone());
        }
        Ok(out)
    }

    fn get_branches(&self, gid: &str) -> StoreResult<Vec<TransBranch>> {
        let _guard = self.read_guard()?;
        Ok(self
            .load_branches(gid)?
            .into_iter()
            .map(|(_, branch)| branch)
            .collect())
    }

    fn update_branch_statuses(&self, updates: &[BranchStatusUpdate]) -> StoreResult<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_guard()?;
        let now = unix_time_ms();
        let mut by_gid: BTreeMap<&str, Vec<&BranchStatusUpdate>> = BTreeMap::new();
        for update in updates {
            by_gid.entry(update.gid.as_str()).or_default().push(update);
        }

        let mut batch = self.keyspace.batch();
        let mut changed = 0usize;
        for (gid, gid_updates) in by_gid {
            let mut existing = self.load_branches(gid)?;
            for update in gid_updates {
                let Some((key, branch)) = existing.iter_mut().find(|(_, b)| {
                    b.branch_id == update.branch_id && b.op == update.op
                }) else {
                    continue;
                };
                if branch.status.is_terminal() {
                    continue;
                }
                branch.status = update.status;
                branch.finish_time = Some(update.finish_time);
                branch.update_time = now;
                batch.insert(&self.branches, key.clone(), serde_json::to_vec(&*branch)?);
                changed += 1;
            }
        }
        batch.commit()?;
        Ok(changed)
    }

    fn lock_global_save_branches(
        &self,
        gid: &str,
        expected: TransStatus,
        branches: &[TransBranch],
    ) -> StoreResult<()> {
        let _guard = self.write_guard()?;
        match self.load_global(gid)? {
            Some(global) if global.status == expected => {}
            _ => return Err(StoreError::NotFound),
        }

        let mut existing = self.load_branches(gid)?;
        let mut next_seq = existing.len() as u32;
        let mut batch = self.keyspace.batch();
        for branch in branches {
            match existing.iter_mut().find(|(_, b)| b.same_identity(branch)) {
                Some((_, current)) if current.status.is_terminal() => {}
                Some((key, current)) => {
                    current.status = branch.status;
                    current.update_time = branch.update_time;
                    current.finish_time = branch.finish_time;
                    batch.insert(&self.branches, key.clone(), serde_json::to_vec(&*current)?);
                }
                None => {
                    let key = encode_branch_key(gid, next_seq);
                    next_seq += 1;
                    batch.insert(&self.branches, key.clone(), serde_json::to_vec(branch)?);
                    existing.push((key, branch.clone()));
                }
            }
        }
        batch.commit()?;
        Ok(())
    }

    fn change_global_status(
        &self,
        global: &mut TransGlobal,
        new_status: TransStatus,
        fields: &[GlobalField],
        finished: bool,
    ) -> StoreResult<()> {
        check_finished(&global.gid, new_status, finished)?;
        let _guard = self.write_guard()?;
        let Some(mut stored) = self.load_global(&global.gid)? else {
            return Err(StoreError::NotFound);
        };
        if stored.status != global.status {
            return Err(StoreError::NotFound);
        }

        let now = unix_time_ms();
        stored.status = new_status;
        stored.update_time = now;
        for field in fields {
            match field {
                GlobalField::NextCron => {
                    stored.next_cron_interval = global.next_cron_interval;
                    stored.next_cron_time = global.next_cron_time;
                }
                GlobalField::CommitTime => stored.commit_time = global.commit_time,
                GlobalField::FinishTime => stored.finish_time = global.finish_time,
                GlobalField::RollbackTime => stored.rollback_time = global.rollback_time,
            }
        }

        let mut batch = self.keyspace.batch();
        self.put_global(&mut batch, &stored)?;
        if new_status.is_terminal() {
            self.unschedule(&mut batch, &stored.gid)?;
        } else if fields.contains(&GlobalField::NextCron) {
            self.schedule(&mut batch, &stored.gid, stored.next_cron_time)?;
        }
        batch.commit()?;

        global.status = new_status;
        global.update_time = now;
        Ok(())
    }

    fn touch_cron_time(&self, global: &mut TransGlobal, next_interval: u64) -> StoreResult<()> {
        let _guard = self.write_guard()?;
        let Some(mut stored) = self.load_global(&global.gid)? else {
            return Err(StoreError::Invariant(format!(
                "cron touch hit no record for gid {}",
                global.gid
            )));
        };
        if stored.status != global.status {
            return Err(StoreError::NotFound);
        }

        let now = unix_time_ms();
        let next_time = next_cron_time(now, next_interval);
        stored.next_cron_interval = next_interval;
        stored.next_cron_time = next_time;
        stored.update_time = now;

        let mut batch = self.keyspace.batch();
        self.put_global(&mut batch, &stored)?;
        self.schedule(&mut batch, &stored.gid, next_time)?;
        batch.commit()?;

        global.next_cron_interval = next_interval;
        global.next_cron_time = next_time;
        global.update_time = now;
        Ok(())
    }

    fn lock_one_global_trans(&self, visibility: Duration) -> StoreResult<TransGlobal> {
        let _guard = self.write_guard()?;
        let now = unix_time_ms();
        let mut batch = self.keyspace.batch();
        let mut claimed = None;

        for item in self.due.iter() {
            let (key, _) = item?;
            let Some((due_ms, gid)) = decode_due_key(&key) else {
                warn!("dropping undecodable due-index entry");
                batch.remove(&self.due, key.to_vec());
                continue;
            };
            if due_ms > now {
                break;
            }
            match self.load_global(&gid)? {
                Some(global) if !global.status.is_terminal() => {
                    claimed = Some(global);
                    break;
                }
                _ => {
                    warn!(gid = %gid, "dropping stale due-index entry");
                    batch.remove(&self.due, key.to_vec());
                    batch.remove(&self.due_by_gid, gid.as_bytes());
                }
            }
        }

        let Some(mut global) = claimed else {
            batch.commit()?;
            return Err(StoreError::NotFound);
        };

        // Push the entry forward by the lease so other claimers skip it
        // until this replica touches it or the lease runs out.
        let lease_ms = visibility.as_millis().min(u128::from(u64::MAX)) as u64;
        global.owner = uuid::Uuid::new_v4().simple().to_string();
        global.update_time = now;
        self.put_global(&mut batch, &global)?;
        self.schedule(&mut batch, &global.gid, now.saturating_add(lease_ms))?;
        batch.commit()?;
        Ok(global)
    }
}

pub(crate) fn encode_key_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out
}

fn encode_branch_key(gid: &str, seq: u32) -> Vec<u8> {
    let mut out = encode_key_prefix(gid.as_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out
}

fn encode_due_key(due_ms: u64, gid: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + gid.len());
    out.extend_from_slice(&due_ms.to_be_bytes());
    out.extend_from_slice(gid.as_bytes());
    out
}

fn decode_due_key(key: &[u8]) -> Option<(u64, String)> {
    if key.len() < 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[..8]);
    let gid = std::str::from_utf8(&key[8..]).ok()?.to_string();
    Some((u64::from_be_bytes(buf), gid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BranchOp, BranchStatus, TransType};

    fn open_temp() -> (tempfile::TempDir, KvTransStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KvTransStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn due_global(gid: &str, due_ms: u64) -> TransGlobal {
        let mut global = TransGlobal::new(gid, TransType::Tcc, TransStatus::Submitted);
        global.next_cron_interval = 10;
        global.next_cron_time = due_ms;
        global
    }

    #[test]
    fn due_keys_sort_by_time_then_gid() {
        let a = encode_due_key(5, "zzz");
        let b = encode_due_key(6, "aaa");
        assert!(a < b);
        assert_eq!(decode_due_key(&b), Some((6, "aaa".to_string())));
        assert_eq!(decode_due_key(&[1, 2]), None);
    }

    #[test]
    fn claim_pops_earliest_and_pushes_it_past_the_lease() {
        let (_dir, store) = open_temp();
        store.save_new_trans(&due_global("late", 20), &[]).unwrap();
        store.save_new_trans(&due_global("early", 10), &[]).unwrap();

        let lease = Duration::from_secs(30);
        let first = store.lock_one_global_trans(lease).unwrap();
        assert_eq!(first.gid, "early");
        let second = store.lock_one_global_trans(lease).unwrap();
        assert_eq!(second.gid, "late");
        assert!(store.lock_one_global_trans(lease).unwrap_err().is_not_found());
    }

    #[test]
    fn claim_skips_entries_due_in_the_future() {
        let (_dir, store) = open_temp();
        let future = unix_time_ms() + 60_000;
        store.save_new_trans(&due_global("later", future), &[]).unwrap();
        assert!(store
            .lock_one_global_trans(Duration::ZERO)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn finishing_removes_the_due_entry() {
        let (_dir, store) = open_temp();
        let mut global = due_global("g", 0);
        store.save_new_trans(&global, &[]).unwrap();
        store
            .change_global_status(&mut global, TransStatus::Succeed, &[], true)
            .unwrap();
        assert!(store
            .lock_one_global_trans(Duration::ZERO)
            .unwrap_err()
            .is_not_found());
        assert!(store.due_by_gid.get("g").unwrap().is_none());
    }

    #[test]
    fn appended_branches_keep_creation_order() {
        let (_dir, store) = open_temp();
        let global = due_global("g", 0);
        let first = TransBranch::new("g", "01", BranchOp::Try, "http://p/try", vec![]);
        store.save_new_trans(&global, &[first]).unwrap();
        let second = TransBranch::new("g", "02", BranchOp::Try, "http://p/try", vec![]);
        let third = TransBranch::new("g", "01", BranchOp::Confirm, "http://p/confirm", vec![]);
        store
            .lock_global_save_branches("g", TransStatus::Submitted, &[second, third])
            .unwrap();

        let branches = store.get_branches("g").unwrap();
        let ids: Vec<_> = branches
            .iter()
            .map(|b| (b.branch_id.as_str(), b.op))
            .collect();
        assert_eq!(
            ids,
            vec![("01", BranchOp::Try), ("02", BranchOp::Try), ("01", BranchOp::Confirm)]
        );
        assert!(branches.iter().all(|b| b.status == BranchStatus::Prepared));
    }
}
