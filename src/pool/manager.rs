use prometrics::metrics::MetricBuilder;
use rand::{self, Rng};
use slog::{Discard, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::catalog::{Catalog, ExtendedStat, Ino, Replica, S_IFREG};
use crate::context::{Context, RequestContext};
use crate::location::{Location, Url};
use crate::metrics::PoolManagerMetrics;
use crate::pool::{Pool, PoolAvailability, PoolDriver, PoolHandler, PoolManager};
use crate::{ErrorKind, Result};

/// プールの定義を保持する永続化層.
///
/// RDBMSや、リモートのヘッドノードへのRPC等で実装される.
pub trait PoolStore {
    /// 全てのプールを返す.
    fn list_pools(&self) -> Result<Vec<Pool>>;

    /// プールを追加する.
    fn add_pool(&self, pool: &Pool) -> Result<()>;

    /// プールを更新する.
    ///
    /// 存在しない場合には`ErrorKind::NoSuchPool`を返す.
    fn update_pool(&self, pool: &Pool) -> Result<()>;

    /// プールを削除する.
    ///
    /// 存在しない場合には`ErrorKind::NoSuchPool`を返す.
    fn delete_pool(&self, pool: &Pool) -> Result<()>;
}

/// `StandardPoolManager`のビルダ.
#[derive(Debug, Clone)]
pub struct StandardPoolManagerBuilder {
    cache_ttl: Duration,
    admin_username: String,
    metrics: MetricBuilder,
    logger: Logger,
}
impl StandardPoolManagerBuilder {
    /// デフォルト設定で`StandardPoolManagerBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        StandardPoolManagerBuilder {
            cache_ttl: Duration::from_secs(60),
            admin_username: "root".to_owned(),
            metrics: MetricBuilder::new(),
            logger: Logger::root(Discard, o!()),
        }
    }

    /// コンテキストの設定値を引き継いだ`StandardPoolManagerBuilder`インスタンスを生成する.
    pub fn from_context(ctx: &Context) -> Self {
        let mut builder = Self::new();
        builder
            .cache_ttl(ctx.config().pool_cache_ttl())
            .admin_username(ctx.config().admin_username())
            .metrics(ctx.metric_builder().clone())
            .logger(ctx.root_logger().clone());
        builder
    }

    /// プール一覧キャッシュの有効期間を設定する.
    ///
    /// デフォルト値は`Duration::from_secs(60)`.
    pub fn cache_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.cache_ttl = ttl;
        self
    }

    /// 管理者とみなすユーザ名を設定する.
    ///
    /// デフォルト値は`"root"`.
    pub fn admin_username(&mut self, name: &str) -> &mut Self {
        self.admin_username = name.to_owned();
        self
    }

    /// メトリクス用の共通設定を登録する.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// logger を登録する.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// 指定の永続化層とカタログを使う`StandardPoolManager`を生成する.
    pub fn finish<S: PoolStore, C: Catalog>(&self, store: S, catalog: Arc<C>) -> StandardPoolManager<S, C> {
        StandardPoolManager {
            store,
            catalog,
            drivers: BTreeMap::new(),
            cache: RwLock::new(PoolCache::default()),
            cache_ttl: self.cache_ttl,
            admin_username: self.admin_username.clone(),
            metrics: PoolManagerMetrics::new(&self.metrics),
            logger: self.logger.clone(),
        }
    }
}
impl Default for StandardPoolManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 標準の`PoolManager`実装.
///
/// プールの定義は`PoolStore`から取得され、一定期間キャッシュされる.
/// 個々のプールに対する操作は、プールの種別に対応する`PoolDriver`に委譲される.
pub struct StandardPoolManager<S, C> {
    store: S,
    catalog: Arc<C>,
    drivers: BTreeMap<String, Box<dyn PoolDriver + Send + Sync>>,
    cache: RwLock<PoolCache>,
    cache_ttl: Duration,
    admin_username: String,
    metrics: PoolManagerMetrics,
    logger: Logger,
}
impl<S: PoolStore, C: Catalog> StandardPoolManager<S, C> {
    /// デフォルト設定で`StandardPoolManager`インスタンスを生成する.
    pub fn new(store: S, catalog: Arc<C>) -> Self {
        StandardPoolManagerBuilder::new().finish(store, catalog)
    }

    /// プールの種別に対応するドライバを登録する.
    ///
    /// 同じ種別のドライバが既に登録されている場合には置き換えられる.
    pub fn register_driver<D>(&mut self, driver: D) -> &mut Self
    where
        D: PoolDriver + Send + Sync + 'static,
    {
        let kind = driver.pool_type().to_owned();
        self.drivers.insert(kind, Box::new(driver));
        self
    }

    /// 永続化層への参照を返す.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// カタログへの参照を返す.
    pub fn catalog(&self) -> &Arc<C> {
        &self.catalog
    }

    /// メトリクスを返す.
    pub fn metrics(&self) -> &PoolManagerMetrics {
        &self.metrics
    }

    /// プール一覧のキャッシュを破棄する.
    ///
    /// 次回の`get_pools`呼び出し時に、永続化層から再取得される.
    pub fn invalidate_cache(&self) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.last_update = None;
    }

    /// 指定のレプリカ群の中から、読み込み先を一つ選択する.
    ///
    /// レプリカ群が空の場合には`ErrorKind::NoReplicasExist`が、
    /// 読み込み可能なものが一つもない場合には`ErrorKind::NoReplicasAvailable`が返される.
    pub fn where_to_read_replicas(&self, ctx: &RequestContext, replicas: &[Replica]) -> Result<Location> {
        track_assert!(!replicas.is_empty(), ErrorKind::NoReplicasExist, "No replicas");

        let mut candidates = Vec::new();
        for replica in replicas.iter().filter(|r| !r.pool.is_empty()) {
            match self.read_location(ctx, replica) {
                Ok(Some(location)) => candidates.push(location),
                Ok(None) => {
                    debug!(self.logger, "Replica is not available";
                           "rfn" => &replica.rfn, "pool" => &replica.pool);
                }
                Err(ref e) if *e.kind() == ErrorKind::NoSuchPool => {
                    debug!(self.logger, "Skipped a replica in unknown pool";
                           "rfn" => &replica.rfn, "pool" => &replica.pool);
                }
                Err(e) => return Err(track!(e)),
            }
        }
        track_assert!(
            !candidates.is_empty(),
            ErrorKind::NoReplicasAvailable,
            "None of the replicas is available for reading"
        );

        let i = rand::thread_rng().gen_range(0..candidates.len());
        self.metrics.read_locations.increment();
        Ok(candidates.swap_remove(i))
    }

    fn read_location(&self, ctx: &RequestContext, replica: &Replica) -> Result<Option<Location>> {
        let pool = track!(self.get_pool(&replica.pool))?;
        let handler = track!(self.create_pool_handler(&pool))?;
        if !track!(handler.replica_is_available(replica))? {
            return Ok(None);
        }
        track!(handler.where_to_read(ctx, replica)).map(Some)
    }

    fn driver(&self, kind: &str) -> Result<&(dyn PoolDriver + Send + Sync)> {
        let driver = track_assert_some!(
            self.drivers.get(kind),
            ErrorKind::InvalidInput,
            "Unknown pool type: {:?}",
            kind
        );
        Ok(driver.as_ref())
    }

    fn create_pool_handler(&self, pool: &Pool) -> Result<Box<dyn PoolHandler>> {
        let driver = track!(self.driver(&pool.kind))?;
        track!(driver.create_pool_handler(&pool.name))
    }

    fn cached_pools(&self) -> Result<Vec<Pool>> {
        let now = Instant::now();
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if cache.is_fresh(now, self.cache_ttl) {
                self.metrics.cache_hits.increment();
                return Ok(cache.pools.clone());
            }
        }

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        if cache.is_fresh(now, self.cache_ttl) {
            // 他のスレッドが更新済み
            self.metrics.cache_hits.increment();
            return Ok(cache.pools.clone());
        }
        let pools = track!(self.store.list_pools())?;
        debug!(self.logger, "Refreshed the pool cache"; "pools" => pools.len());
        cache.pools = pools.clone();
        cache.last_update = Some(Instant::now());
        self.metrics.cache_refreshes.increment();
        Ok(pools)
    }

    fn filter_pools(&self, pools: Vec<Pool>, availability: PoolAvailability) -> Result<Vec<Pool>> {
        if availability == PoolAvailability::Any {
            return Ok(pools);
        }
        let mut selected = Vec::with_capacity(pools.len());
        for pool in pools {
            let handler = track!(self.create_pool_handler(&pool))?;
            let available = track!(handler.pool_is_available(availability.for_write()))?;
            if available != (availability == PoolAvailability::None) {
                selected.push(pool);
            }
        }
        Ok(selected)
    }

    fn check_root(&self, ctx: &RequestContext, operation: &str) -> Result<()> {
        track_assert!(
            ctx.security.is_root(),
            ErrorKind::PermissionDenied,
            "Only root can {} pools: user={:?}",
            operation,
            ctx.security.user.name
        );
        Ok(())
    }

    fn remove_replicas(&self, ctx: &RequestContext, stat: &ExtendedStat) -> Result<()> {
        let replicas = track!(self.catalog.get_replicas(stat.ino))?;
        for replica in replicas.iter().filter(|r| !r.pool.is_empty()) {
            let pool = track!(self.get_pool(&replica.pool))?;
            let handler = track!(self.create_pool_handler(&pool))?;
            match handler.remove_replica(ctx, replica) {
                Err(ref e) if *e.kind() == ErrorKind::NoSuchFile => {}
                other => track!(other)?,
            }
            match self.catalog.delete_replica(replica) {
                Err(ref e) if *e.kind() == ErrorKind::NoSuchReplica => {}
                other => track!(other)?,
            }
            info!(self.logger, "Removed a replica for overwriting";
                  "rfn" => &replica.rfn, "pool" => &replica.pool);
        }
        Ok(())
    }

    // 未登録の場合は`None`を返す
    fn find_replica_of(&self, url: &Url) -> Result<Option<Replica>> {
        match self.catalog.get_replica_by_rfn(&url.path) {
            Err(ref e) if *e.kind() == ErrorKind::NoSuchReplica => {}
            other => return track!(other).map(Some),
        }
        let rfn = format!("{}:{}", url.domain, url.path);
        match self.catalog.get_replica_by_rfn(&rfn) {
            Err(ref e) if *e.kind() == ErrorKind::NoSuchReplica => Ok(None),
            other => track!(other).map(Some),
        }
    }

    fn abort_write(&self, ctx: &RequestContext, pool: &str, location: &Location) -> Result<()> {
        let pool = track!(self.get_pool(pool))?;
        let handler = track!(self.create_pool_handler(&pool))?;
        track!(handler.cancel_write(ctx, location))
    }

    fn unlink_cancelled(&self, replica: Option<&Replica>, sfn: Option<&str>) -> Result<()> {
        let ino = match (replica, sfn) {
            (Some(r), _) => r.file_id,
            (None, Some(sfn)) => track!(self.catalog.stat_by_path(sfn))?.ino,
            (None, None) => return Ok(()),
        };
        track!(self.catalog.unlink(ino))
    }
}
impl<S: PoolStore, C: Catalog> PoolManager for StandardPoolManager<S, C> {
    fn get_pools(&self, availability: PoolAvailability) -> Result<Vec<Pool>> {
        let pools = track!(self.cached_pools())?;
        track!(self.filter_pools(pools, availability); availability)
    }

    fn get_pool(&self, name: &str) -> Result<Pool> {
        let pools = track!(self.get_pools(PoolAvailability::Any))?;
        let pool = track_assert_some!(
            pools.into_iter().find(|p| p.name == name),
            ErrorKind::NoSuchPool,
            "Pool {:?} not found",
            name
        );
        Ok(pool)
    }

    fn new_pool(&self, ctx: &RequestContext, pool: &Pool) -> Result<()> {
        track!(self.check_root(ctx, "create"))?;
        let driver = track!(self.driver(&pool.kind))?;
        track!(driver.to_be_created(ctx, pool))?;
        track!(self.store.add_pool(pool))?;
        track!(driver.just_created(ctx, pool))?;
        self.invalidate_cache();
        info!(self.logger, "Created a new pool"; "pool" => &pool.name, "type" => &pool.kind);
        Ok(())
    }

    fn update_pool(&self, ctx: &RequestContext, pool: &Pool) -> Result<()> {
        track!(self.check_root(ctx, "modify"))?;
        let driver = track!(self.driver(&pool.kind))?;
        track!(self.store.update_pool(pool))?;
        track!(driver.update(ctx, pool))?;
        self.invalidate_cache();
        info!(self.logger, "Updated a pool"; "pool" => &pool.name);
        Ok(())
    }

    fn delete_pool(&self, ctx: &RequestContext, pool: &Pool) -> Result<()> {
        track!(self.check_root(ctx, "remove"))?;
        let driver = track!(self.driver(&pool.kind))?;
        track!(driver.to_be_deleted(ctx, pool))?;
        match self.store.delete_pool(pool) {
            Err(ref e) if *e.kind() == ErrorKind::NoSuchPool => {}
            other => track!(other)?,
        }
        self.invalidate_cache();
        info!(self.logger, "Deleted a pool"; "pool" => &pool.name);
        Ok(())
    }

    fn where_to_read(&self, ctx: &RequestContext, path: &str) -> Result<Location> {
        let stat = track!(self.catalog.stat_by_path(path))?;
        let replicas = track!(self.catalog.get_replicas(stat.ino))?;
        track!(self.where_to_read_replicas(ctx, &replicas); path)
    }

    fn where_to_read_inode(&self, ctx: &RequestContext, ino: Ino) -> Result<Location> {
        let replicas = track!(self.catalog.get_replicas(ino))?;
        track!(self.where_to_read_replicas(ctx, &replicas); ino)
    }

    fn where_to_write(&self, ctx: &RequestContext, path: &str) -> Result<Location> {
        let pools = track!(self.get_pools(PoolAvailability::ForWrite))?;
        track_assert!(
            !pools.is_empty(),
            ErrorKind::NoSpace,
            "There are no pools available for writing"
        );
        // `pool`の指定は管理者以外にも許される
        let pool = if let Some(ref name) = ctx.params.pool {
            track_assert_some!(
                pools.iter().find(|p| p.name == *name),
                ErrorKind::NoSpace,
                "The specified pool could not be selected: {:?}",
                name
            )
            .clone()
        } else {
            let i = rand::thread_rng().gen_range(0..pools.len());
            pools[i].clone()
        };
        let handler = track!(self.create_pool_handler(&pool))?;

        let mut mode = S_IFREG | 0o664;
        let mut acl = String::new();
        if ctx.params.overwrite {
            match self.catalog.stat_by_path(path) {
                Ok(stat) => {
                    mode = stat.mode;
                    acl = stat.acl.clone();
                    track!(self.remove_replicas(ctx, &stat))?;
                    if let Err(e) = self.catalog.unlink(stat.ino) {
                        warn!(self.logger, "Cannot unlink an overwritten entry";
                              "path" => path, "error" => e.to_string());
                    }
                }
                Err(ref e) if *e.kind() == ErrorKind::NoSuchFile => {}
                Err(e) => return Err(track!(e)),
            }
        }

        let replicating =
            ctx.params.replicate && ctx.security.user.name == self.admin_username;
        let create = if replicating {
            match self.catalog.stat_by_path(path) {
                Ok(_) => false,
                Err(ref e) if *e.kind() == ErrorKind::NoSuchFile => true,
                Err(e) => return Err(track!(e)),
            }
        } else {
            true
        };
        if create {
            let uid = ctx.security.user.uid;
            let gid = ctx.security.groups.first().map_or(0, |g| g.gid);
            let stat = track!(self.catalog.create_entry(path, mode, uid, gid))?;
            if !acl.is_empty() {
                track!(self.catalog.set_mode(stat.ino, stat.mode, &acl))?;
            }
        }

        let location = track!(handler.where_to_write(ctx, path); path, pool.name)?;
        self.metrics.write_locations.increment();
        info!(self.logger, "Selected a write location";
              "path" => path, "pool" => &pool.name, "location" => location.to_string());
        Ok(location)
    }

    fn cancel_write(&self, ctx: &RequestContext, location: &Location) -> Result<()> {
        let chunk = track_assert_some!(location.first(), ErrorKind::InvalidInput, "Empty location");
        let url = &chunk.url;
        let replica = track!(self.find_replica_of(url))?;
        let sfn = url.query_param("sfn");
        let pool = match replica {
            Some(ref r) if !r.pool.is_empty() => Some(r.pool.as_str()),
            _ => url.query_param("pool"),
        };
        track_assert!(
            replica.is_some() || (sfn.is_some() && url.query_param("dpmtoken").is_some()),
            ErrorKind::InvalidInput,
            "Cannot identify the write to cancel: {}",
            location
        );

        let pool = track_assert_some!(
            pool,
            ErrorKind::InvalidInput,
            "Cannot identify the pool of the cancelled write: {}",
            location
        );

        let aborted = self.abort_write(ctx, pool, location);
        if let Err(ref e) = aborted {
            warn!(self.logger, "Cannot abort a write";
                  "location" => location.to_string(), "error" => e.to_string());
        }
        if let Err(e) = self.unlink_cancelled(replica.as_ref(), sfn) {
            warn!(self.logger, "Cannot unlink a cancelled entry";
                  "location" => location.to_string(), "error" => e.to_string());
        }
        self.metrics.cancelled_writes.increment();
        info!(self.logger, "Cancelled a write"; "location" => location.to_string());
        track!(aborted)
    }
}

#[derive(Debug, Default)]
struct PoolCache {
    pools: Vec<Pool>,
    last_update: Option<Instant>,
}
impl PoolCache {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        self.last_update
            .map_or(false, |t| now.saturating_duration_since(t) < ttl)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use trackable::result::TestResult;

    use super::*;
    use crate::catalog::{MemoryCatalog, ReplicaStatus};
    use crate::context::RequestContext;
    use crate::pool::{MemoryPoolStore, PoolManager};
    use crate::security::{GroupInfo, SecurityContext, SecurityCredentials, UserInfo};
    use crate::ErrorKind;

    fn request(uid: u32, gid: u32) -> RequestContext {
        RequestContext::new(SecurityContext::new(
            SecurityCredentials::default(),
            UserInfo {
                name: format!("user{}", uid),
                uid,
                banned: false,
            },
            vec![GroupInfo {
                name: format!("group{}", gid),
                gid,
                banned: false,
            }],
        ))
    }

    fn manager(ttl: Duration) -> StandardPoolManager<MemoryPoolStore, MemoryCatalog> {
        let store = MemoryPoolStore::new();
        StandardPoolManagerBuilder::new()
            .cache_ttl(ttl)
            .finish(store, Arc::new(MemoryCatalog::new()))
    }

    #[test]
    fn pool_listings_are_cached() -> TestResult {
        let manager = manager(Duration::from_secs(60));
        track!(manager.store().add_pool(&Pool::new("a", "filesystem")))?;
        assert_eq!(track!(manager.get_pools(PoolAvailability::Any))?.len(), 1);

        // キャッシュが有効な間は永続化層の変更は見えない
        track!(manager.store().add_pool(&Pool::new("b", "filesystem")))?;
        assert_eq!(track!(manager.get_pools(PoolAvailability::Any))?.len(), 1);
        assert_eq!(manager.store().calls("list_pools"), 1);
        assert_eq!(manager.metrics().cache_hits(), 1);

        manager.invalidate_cache();
        assert_eq!(track!(manager.get_pools(PoolAvailability::Any))?.len(), 2);
        assert_eq!(manager.store().calls("list_pools"), 2);
        assert_eq!(manager.metrics().cache_refreshes(), 2);
        Ok(())
    }

    #[test]
    fn concurrent_readers_refresh_once() -> TestResult {
        let manager = Arc::new(manager(Duration::from_secs(60)));
        track!(manager.store().add_pool(&Pool::new("a", "filesystem")))?;

        let handles = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || manager.get_pools(PoolAvailability::Any).map(|p| p.len()))
            })
            .collect::<Vec<_>>();
        for h in handles {
            let n = h.join().unwrap_or_else(|_| panic!("thread panicked"));
            assert_eq!(track!(n)?, 1);
        }
        assert_eq!(manager.store().calls("list_pools"), 1);
        Ok(())
    }

    #[test]
    fn stale_cache_is_refreshed() -> TestResult {
        let manager = manager(Duration::from_millis(0));
        track!(manager.get_pools(PoolAvailability::Any))?;
        track!(manager.get_pools(PoolAvailability::Any))?;
        assert_eq!(manager.store().calls("list_pools"), 2);
        Ok(())
    }

    #[test]
    fn get_pool_reports_missing_pools() -> TestResult {
        let manager = manager(Duration::from_secs(60));
        track!(manager.store().add_pool(&Pool::new("a", "filesystem")))?;
        assert_eq!(track!(manager.get_pool("a"))?.name, "a");

        let e = manager.get_pool("b").err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::NoSuchPool));
        Ok(())
    }

    #[test]
    fn non_root_cannot_manage_pools() -> TestResult {
        let manager = manager(Duration::from_secs(60));
        let ctx = request(100, 200);
        let pool = Pool::new("a", "filesystem");
        for result in vec![
            manager.new_pool(&ctx, &pool),
            manager.update_pool(&ctx, &pool),
            manager.delete_pool(&ctx, &pool),
        ] {
            assert_eq!(result.err().map(|e| *e.kind()), Some(ErrorKind::PermissionDenied));
        }
        assert_eq!(manager.store().total_calls(), 0);

        // ドライバが未登録なら、権限があっても失敗する
        let e = manager.new_pool(&request(0, 0), &pool).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InvalidInput));
        Ok(())
    }

    #[test]
    fn reading_without_replicas() -> TestResult {
        let manager = manager(Duration::from_secs(60));
        let ctx = request(100, 200);
        let e = manager.where_to_read_replicas(&ctx, &[]).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::NoReplicasExist));

        // プールを持たない、あるいは未知のプールに属するレプリカは候補にならない
        let mut orphan = Replica::new(10, "disk01", "disk01:/srv/fs1/x");
        orphan.status = ReplicaStatus::Available;
        let mut unknown = orphan.clone();
        unknown.pool = "nowhere".to_owned();
        let e = manager
            .where_to_read_replicas(&ctx, &[orphan, unknown])
            .err()
            .map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::NoReplicasAvailable));
        Ok(())
    }

    #[test]
    fn writing_without_pools() -> TestResult {
        let manager = manager(Duration::from_secs(60));
        let e = manager
            .where_to_write(&request(100, 200), "/a")
            .err()
            .map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::NoSpace));
        assert_eq!(manager.catalog().calls("create_entry"), 0);
        Ok(())
    }
}
