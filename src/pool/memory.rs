use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::catalog::Replica;
use crate::pool::{
    DiskBackend, Filesystem, FsStatus, Pool, PoolStore, PutDone, PutReply, PutRequest,
};
use crate::{ErrorKind, Result};

/// メモリベースの`PoolStore`の実装.
///
/// 主にテスト用途で、各メソッドの呼び出し回数を記録している.
#[derive(Debug, Default)]
pub struct MemoryPoolStore {
    pools: Mutex<BTreeMap<String, Pool>>,
    calls: Mutex<BTreeMap<&'static str, usize>>,
}
impl MemoryPoolStore {
    /// 空の`MemoryPoolStore`インスタンスを生成する.
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定のメソッドが呼び出された回数を返す.
    pub fn calls(&self, method: &str) -> usize {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.get(method).cloned().unwrap_or(0)
    }

    /// 全メソッドの呼び出し回数の合計を返す.
    pub fn total_calls(&self) -> usize {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.values().sum()
    }

    fn enter(&self, method: &'static str) -> MutexGuard<BTreeMap<String, Pool>> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            *calls.entry(method).or_insert(0) += 1;
        }
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }
}
impl PoolStore for MemoryPoolStore {
    fn list_pools(&self) -> Result<Vec<Pool>> {
        let pools = self.enter("list_pools");
        Ok(pools.values().cloned().collect())
    }

    fn add_pool(&self, pool: &Pool) -> Result<()> {
        let mut pools = self.enter("add_pool");
        track_assert!(
            !pools.contains_key(&pool.name),
            ErrorKind::AlreadyExists,
            "Pool {:?} already exists",
            pool.name
        );
        pools.insert(pool.name.clone(), pool.clone());
        Ok(())
    }

    fn update_pool(&self, pool: &Pool) -> Result<()> {
        let mut pools = self.enter("update_pool");
        let current = track_assert_some!(
            pools.get_mut(&pool.name),
            ErrorKind::NoSuchPool,
            "Pool {:?} not found",
            pool.name
        );
        *current = pool.clone();
        Ok(())
    }

    fn delete_pool(&self, pool: &Pool) -> Result<()> {
        let mut pools = self.enter("delete_pool");
        track_assert!(
            pools.remove(&pool.name).is_some(),
            ErrorKind::NoSuchPool,
            "Pool {:?} not found",
            pool.name
        );
        Ok(())
    }
}

/// メモリベースの`DiskBackend`の実装.
///
/// 実際のデータは保持せず、配置の決定と書き込み状態の管理のみを行う.
/// テスト用に、呼び出し回数の記録と、一時的な障害の注入([fail_next])を行うことができる.
///
/// [fail_next]: #method.fail_next
#[derive(Debug, Default)]
pub struct MemoryDiskBackend {
    state: Mutex<State>,
    calls: Mutex<BTreeMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, usize>>,
}
impl MemoryDiskBackend {
    /// 空の`MemoryDiskBackend`インスタンスを生成する.
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定のメソッドが呼び出された回数を返す.
    pub fn calls(&self, method: &str) -> usize {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.get(method).cloned().unwrap_or(0)
    }

    /// 指定のメソッドの以降`n`回の呼び出しを`ErrorKind::Other`で失敗させる.
    pub fn fail_next(&self, method: &'static str, n: usize) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.insert(method, n);
    }

    /// 最後に受け付けた`put`要求を返す.
    pub fn last_put(&self) -> Option<PutRequest> {
        self.lock().last_put.clone()
    }

    /// スペーストークンを登録する.
    pub fn add_space_token(&self, description: &str, token: &str) {
        self.lock()
            .space_tokens
            .entry(description.to_owned())
            .or_insert_with(Vec::new)
            .push(token.to_owned());
    }

    /// 書き込み中のレプリカに、クライアントがデータを書き込んだことにする.
    pub fn set_written(&self, backend_token: &str, size: u64, checksum: Option<&str>) -> Result<()> {
        let mut state = self.lock();
        let pending = track_assert_some!(
            state.pending.get_mut(backend_token),
            ErrorKind::InvalidInput,
            "Unknown backend token: {:?}",
            backend_token
        );
        pending.size = size;
        pending.checksum = checksum.map(|s| s.to_owned());
        Ok(())
    }

    /// 書き込みが完了したレプリカが存在するかどうかを判定する.
    pub fn has_replica(&self, rfn: &str) -> bool {
        self.lock().stored.contains_key(rfn)
    }

    fn lock(&self) -> MutexGuard<State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, method: &'static str) -> Result<MutexGuard<State>> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            *calls.entry(method).or_insert(0) += 1;
        }
        {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(n) = failures.get_mut(method) {
                if *n > 0 {
                    *n -= 1;
                    track_panic!(ErrorKind::Other, "Injected failure: {}", method);
                }
            }
        }
        Ok(self.lock())
    }
}
impl DiskBackend for MemoryDiskBackend {
    fn filesystems(&self, pool: &str) -> Result<Vec<Filesystem>> {
        let state = track!(self.enter("filesystems"))?;
        track!(state.check_pool(pool))?;
        Ok(state
            .filesystems
            .iter()
            .filter(|fs| fs.pool == pool)
            .cloned()
            .collect())
    }

    fn pool_space(&self, pool: &str) -> Result<(u64, u64)> {
        let state = track!(self.enter("pool_space"))?;
        track!(state.check_pool(pool))?;
        Ok(state
            .filesystems
            .iter()
            .filter(|fs| fs.pool == pool)
            .fold((0, 0), |(t, f), fs| (t + fs.capacity, f + fs.free)))
    }

    fn add_pool(&self, pool: &Pool) -> Result<()> {
        let mut state = track!(self.enter("add_pool"))?;
        track_assert!(
            !state.pools.contains_key(&pool.name),
            ErrorKind::AlreadyExists,
            "Pool {:?} already exists",
            pool.name
        );
        state.pools.insert(pool.name.clone(), pool.attributes.clone());
        Ok(())
    }

    fn modify_pool(&self, pool: &Pool) -> Result<()> {
        let mut state = track!(self.enter("modify_pool"))?;
        track!(state.check_pool(&pool.name))?;
        state.pools.insert(pool.name.clone(), pool.attributes.clone());
        Ok(())
    }

    fn remove_pool(&self, pool: &str) -> Result<()> {
        let mut state = track!(self.enter("remove_pool"))?;
        track!(state.check_pool(pool))?;
        state.pools.remove(pool);
        state.filesystems.retain(|fs| fs.pool != pool);
        Ok(())
    }

    fn add_filesystem(&self, fs: &Filesystem) -> Result<()> {
        let mut state = track!(self.enter("add_filesystem"))?;
        track!(state.check_pool(&fs.pool))?;
        track_assert!(
            state.position(fs).is_none(),
            ErrorKind::AlreadyExists,
            "Filesystem {:?} already exists",
            fs.qualified_name()
        );
        state.filesystems.push(fs.clone());
        Ok(())
    }

    fn modify_filesystem(&self, fs: &Filesystem) -> Result<()> {
        let mut state = track!(self.enter("modify_filesystem"))?;
        let i = track_assert_some!(
            state.position(fs),
            ErrorKind::NoSuchFile,
            "No such filesystem: {:?}",
            fs.qualified_name()
        );
        state.filesystems[i] = fs.clone();
        Ok(())
    }

    fn remove_filesystem(&self, fs: &Filesystem) -> Result<()> {
        let mut state = track!(self.enter("remove_filesystem"))?;
        let i = track_assert_some!(
            state.position(fs),
            ErrorKind::NoSuchFile,
            "No such filesystem: {:?}",
            fs.qualified_name()
        );
        state.filesystems.remove(i);
        Ok(())
    }

    fn put(&self, request: &PutRequest) -> Result<PutReply> {
        let mut state = track!(self.enter("put"))?;
        state.last_put = Some(request.clone());
        track!(state.check_pool(&request.pool))?;

        let candidates = state
            .filesystems
            .iter()
            .filter(|fs| fs.pool == request.pool)
            .filter(|fs| match request.filesystem {
                Some((ref server, ref name)) => fs.server == *server && fs.fs == *name,
                None => fs.status == FsStatus::Enabled,
            })
            .cloned()
            .collect::<Vec<_>>();
        track_assert!(
            !candidates.is_empty(),
            ErrorKind::NoSpace,
            "No filesystem can accept {:?}",
            request.sfn
        );

        state.next_seq += 1;
        let seq = state.next_seq;
        let fs = &candidates[seq as usize % candidates.len()];
        let basename = request.sfn.rsplit('/').next().unwrap_or("");
        let pfn = format!("{}/{}.{}", fs.fs.trim_end_matches('/'), basename, seq);
        let backend_token = Uuid::new_v4().to_string();
        state.pending.insert(
            backend_token.clone(),
            PendingPut {
                sfn: request.sfn.clone(),
                server: fs.server.clone(),
                pfn: pfn.clone(),
                pool: fs.pool.clone(),
                filesystem: fs.fs.clone(),
                size: 0,
                checksum: None,
            },
        );
        Ok(PutReply {
            server: fs.server.clone(),
            pfn,
            backend_token,
        })
    }

    fn put_done(&self, backend_token: &str, sfn: &str) -> Result<PutDone> {
        let mut state = track!(self.enter("put_done"))?;
        let matched = track_assert_some!(
            state.pending.get(backend_token).map(|p| p.sfn == sfn),
            ErrorKind::InvalidInput,
            "Unknown backend token: {:?}",
            backend_token
        );
        track_assert!(
            matched,
            ErrorKind::InvalidInput,
            "Backend token {:?} does not belong to {:?}",
            backend_token,
            sfn
        );
        let p = track_assert_some!(state.pending.remove(backend_token), ErrorKind::Other);
        state
            .stored
            .insert(format!("{}:{}", p.server, p.pfn), p.size);
        Ok(PutDone {
            server: p.server,
            pfn: p.pfn,
            size: p.size,
            pool: p.pool,
            filesystem: p.filesystem,
            checksum: p.checksum,
        })
    }

    fn abort(&self, backend_token: &str) -> Result<()> {
        let mut state = track!(self.enter("abort"))?;
        track_assert!(
            state.pending.remove(backend_token).is_some(),
            ErrorKind::InvalidInput,
            "Unknown backend token: {:?}",
            backend_token
        );
        Ok(())
    }

    fn delete_replica(&self, replica: &Replica) -> Result<()> {
        let mut state = track!(self.enter("delete_replica"))?;
        track_assert!(
            state.stored.remove(&replica.rfn).is_some(),
            ErrorKind::NoSuchFile,
            "No such replica: {:?}",
            replica.rfn
        );
        Ok(())
    }

    fn space_token_by_description(&self, description: &str) -> Result<Vec<String>> {
        let state = track!(self.enter("space_token_by_description"))?;
        Ok(state
            .space_tokens
            .get(description)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct State {
    pools: BTreeMap<String, BTreeMap<String, String>>,
    filesystems: Vec<Filesystem>,
    pending: HashMap<String, PendingPut>,
    stored: BTreeMap<String, u64>,
    space_tokens: BTreeMap<String, Vec<String>>,
    last_put: Option<PutRequest>,
    next_seq: u64,
}
impl State {
    fn check_pool(&self, pool: &str) -> Result<()> {
        track_assert!(
            self.pools.contains_key(pool),
            ErrorKind::NoSuchPool,
            "Pool {:?} not found",
            pool
        );
        Ok(())
    }

    fn position(&self, fs: &Filesystem) -> Option<usize> {
        self.filesystems
            .iter()
            .position(|x| x.pool == fs.pool && x.server == fs.server && x.fs == fs.fs)
    }
}

#[derive(Debug)]
struct PendingPut {
    sfn: String,
    server: String,
    pfn: String,
    pool: String,
    filesystem: String,
    size: u64,
    checksum: Option<String>,
}
