use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use crate::catalog::{Catalog, ExtendedStat, Ino, Replica, S_IFDIR};
use crate::location::split_path;
use crate::{ErrorKind, Result};

const ROOT_INO: Ino = 1;

/// メモリベースの`Catalog`の実装.
///
/// # 注意
///
/// これは主にテストや動作確認用途を意図した実装であり、永続性は無い.
///
/// トランザクションは単一の(グローバルな)ものとして扱われ、
/// 最も外側の`begin`の時点のスナップショットが`rollback`で復元される.
///
/// また、各メソッドの呼び出し回数を記録しており、[calls]で参照できる.
///
/// [calls]: #method.calls
#[derive(Debug)]
pub struct MemoryCatalog {
    inner: Mutex<Inner>,
    calls: Mutex<BTreeMap<&'static str, usize>>,
    failures: Mutex<BTreeSet<&'static str>>,
}
impl MemoryCatalog {
    /// ルートディレクトリのみを持つ`MemoryCatalog`インスタンスを生成する.
    pub fn new() -> Self {
        let mut state = State {
            entries: BTreeMap::new(),
            children: BTreeMap::new(),
            replicas: BTreeMap::new(),
            next_ino: ROOT_INO + 1,
            next_replica_id: 1,
        };
        state.entries.insert(
            ROOT_INO,
            ExtendedStat {
                ino: ROOT_INO,
                parent: 0,
                name: "/".to_owned(),
                mode: S_IFDIR | 0o755,
                nlink: 1,
                ..ExtendedStat::default()
            },
        );
        MemoryCatalog {
            inner: Mutex::new(Inner {
                state,
                depth: 0,
                snapshot: None,
            }),
            calls: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(BTreeSet::new()),
        }
    }

    /// 指定のメソッドが呼び出された回数を返す.
    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .ok()
            .and_then(|c| c.get(method).cloned())
            .unwrap_or(0)
    }

    /// 以降の指定メソッドの呼び出しを`ErrorKind::Other`で失敗させる.
    pub fn inject_failure(&self, method: &'static str) {
        if let Ok(mut f) = self.failures.lock() {
            f.insert(method);
        }
    }

    /// 現在のトランザクションの入れ子の深さを返す.
    pub fn transaction_depth(&self) -> usize {
        self.inner.lock().map(|i| i.depth).unwrap_or(0)
    }

    fn enter(&self, method: &'static str) -> Result<MutexGuard<Inner>> {
        if let Ok(mut c) = self.calls.lock() {
            *c.entry(method).or_insert(0) += 1;
        }
        let failing = track_lock!(self.failures.lock())?.contains(method);
        track_assert!(!failing, ErrorKind::Other, "Injected failure: {}", method);
        let inner = track_lock!(self.inner.lock())?;
        Ok(inner)
    }
}
impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}
impl Catalog for MemoryCatalog {
    fn stat_by_path(&self, path: &str) -> Result<ExtendedStat> {
        let inner = track!(self.enter("stat_by_path"))?;
        let ino = track!(inner.state.resolve(path))?;
        track!(inner.state.entry(ino)).map(|e| e.clone())
    }

    fn stat_by_inode(&self, ino: Ino) -> Result<ExtendedStat> {
        let inner = track!(self.enter("stat_by_inode"))?;
        track!(inner.state.entry(ino)).map(|e| e.clone())
    }

    fn stat_by_parent_and_name(&self, parent: Ino, name: &str) -> Result<ExtendedStat> {
        let inner = track!(self.enter("stat_by_parent_and_name"))?;
        let ino = track_assert_some!(
            inner.state.children.get(&(parent, name.to_owned())).cloned(),
            ErrorKind::NoSuchFile,
            "parent={}, name={:?}",
            parent,
            name
        );
        track!(inner.state.entry(ino)).map(|e| e.clone())
    }

    fn create_entry(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<ExtendedStat> {
        let mut inner = track!(self.enter("create_entry"))?;
        let state = &mut inner.state;
        let mut components = split_path(path);
        let name = track_assert_some!(components.pop(), ErrorKind::InvalidInput; path);
        let mut parent = ROOT_INO;
        for c in components {
            parent = track_assert_some!(
                state.children.get(&(parent, c.to_owned())).cloned(),
                ErrorKind::NoSuchFile,
                "No such directory: {:?}",
                path
            );
        }
        track_assert!(
            track!(state.entry(parent))?.is_dir(),
            ErrorKind::InvalidInput,
            "Not a directory: {:?}",
            path
        );
        track_assert!(
            !state.children.contains_key(&(parent, name.to_owned())),
            ErrorKind::AlreadyExists,
            "{:?}",
            path
        );

        let stat = ExtendedStat {
            ino: state.next_ino,
            parent,
            name: name.to_owned(),
            mode,
            uid,
            gid,
            nlink: 1,
            ..ExtendedStat::default()
        };
        state.next_ino += 1;
        state.children.insert((parent, name.to_owned()), stat.ino);
        state.entries.insert(stat.ino, stat.clone());
        Ok(stat)
    }

    fn unlink(&self, ino: Ino) -> Result<()> {
        let mut inner = track!(self.enter("unlink"))?;
        let state = &mut inner.state;
        let stat = track!(state.entry(ino))?.clone();
        track_assert!(
            !state.children.keys().any(|&(p, _)| p == ino),
            ErrorKind::InvalidInput,
            "Directory not empty: ino={}",
            ino
        );
        state.children.remove(&(stat.parent, stat.name.clone()));
        state.entries.remove(&ino);
        state.replicas.retain(|_, r| r.file_id != ino);
        Ok(())
    }

    fn set_size(&self, ino: Ino, size: u64) -> Result<()> {
        let mut inner = track!(self.enter("set_size"))?;
        track!(inner.state.entry_mut(ino))?.size = size;
        Ok(())
    }

    fn set_mode(&self, ino: Ino, mode: u32, acl: &str) -> Result<()> {
        let mut inner = track!(self.enter("set_mode"))?;
        let entry = track!(inner.state.entry_mut(ino))?;
        entry.mode = mode;
        entry.acl = acl.to_owned();
        Ok(())
    }

    fn set_xattr(&self, ino: Ino, key: &str, value: &str) -> Result<()> {
        let mut inner = track!(self.enter("set_xattr"))?;
        track!(inner.state.entry_mut(ino))?
            .xattrs
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn add_replica(&self, replica: &Replica) -> Result<Replica> {
        let mut inner = track!(self.enter("add_replica"))?;
        let state = &mut inner.state;
        track!(state.entry(replica.file_id))?;
        track_assert!(
            !state.replicas.values().any(|r| r.rfn == replica.rfn),
            ErrorKind::AlreadyExists,
            "rfn={:?}",
            replica.rfn
        );
        let mut replica = replica.clone();
        replica.replica_id = state.next_replica_id;
        state.next_replica_id += 1;
        state.replicas.insert(replica.replica_id, replica.clone());
        Ok(replica)
    }

    fn delete_replica(&self, replica: &Replica) -> Result<()> {
        let mut inner = track!(self.enter("delete_replica"))?;
        track_assert_some!(
            inner.state.replicas.remove(&replica.replica_id),
            ErrorKind::NoSuchReplica,
            "replica_id={}",
            replica.replica_id
        );
        Ok(())
    }

    fn update_replica(&self, replica: &Replica) -> Result<()> {
        let mut inner = track!(self.enter("update_replica"))?;
        let r = track_assert_some!(
            inner.state.replicas.get_mut(&replica.replica_id),
            ErrorKind::NoSuchReplica,
            "replica_id={}",
            replica.replica_id
        );
        *r = replica.clone();
        Ok(())
    }

    fn get_replicas(&self, ino: Ino) -> Result<Vec<Replica>> {
        let inner = track!(self.enter("get_replicas"))?;
        track!(inner.state.entry(ino))?;
        Ok(inner
            .state
            .replicas
            .values()
            .filter(|r| r.file_id == ino)
            .cloned()
            .collect())
    }

    fn get_replica_by_rfn(&self, rfn: &str) -> Result<Replica> {
        let inner = track!(self.enter("get_replica_by_rfn"))?;
        let replica = track_assert_some!(
            inner.state.replicas.values().find(|r| r.rfn == rfn).cloned(),
            ErrorKind::NoSuchReplica,
            "rfn={:?}",
            rfn
        );
        Ok(replica)
    }

    fn begin(&self) -> Result<()> {
        let mut inner = track!(self.enter("begin"))?;
        if inner.depth == 0 {
            inner.snapshot = Some(inner.state.clone());
        }
        inner.depth += 1;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut inner = track!(self.enter("commit"))?;
        track_assert!(inner.depth > 0, ErrorKind::Other, "No transaction in progress");
        inner.depth -= 1;
        if inner.depth == 0 {
            inner.snapshot = None;
        }
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut inner = track!(self.enter("rollback"))?;
        track_assert!(inner.depth > 0, ErrorKind::Other, "No transaction in progress");
        if let Some(snapshot) = inner.snapshot.take() {
            inner.state = snapshot;
        }
        inner.depth = 0;
        Ok(())
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    depth: usize,
    snapshot: Option<State>,
}

#[derive(Debug, Clone)]
struct State {
    entries: BTreeMap<Ino, ExtendedStat>,
    children: BTreeMap<(Ino, String), Ino>,
    replicas: BTreeMap<u64, Replica>,
    next_ino: Ino,
    next_replica_id: u64,
}
impl State {
    fn resolve(&self, path: &str) -> Result<Ino> {
        let mut ino = ROOT_INO;
        for c in split_path(path) {
            ino = track_assert_some!(
                self.children.get(&(ino, c.to_owned())).cloned(),
                ErrorKind::NoSuchFile,
                "{:?}",
                path
            );
        }
        Ok(ino)
    }

    fn entry(&self, ino: Ino) -> Result<&ExtendedStat> {
        let entry = track_assert_some!(self.entries.get(&ino), ErrorKind::NoSuchFile; ino);
        Ok(entry)
    }

    fn entry_mut(&mut self, ino: Ino) -> Result<&mut ExtendedStat> {
        let entry = track_assert_some!(self.entries.get_mut(&ino), ErrorKind::NoSuchFile; ino);
        Ok(entry)
    }
}
