use rand::{self, Rng};
use slog::Logger;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::catalog::{self, Catalog, Replica, ReplicaStatus, Transaction};
use crate::config::TokenId;
use crate::context::{Context, RequestContext};
use crate::location::{normalize_path, Chunk, Location, Url};
use crate::pool::{Filesystem, FsStatus, Pool, PoolDriver, PoolHandler};
use crate::token::{generate_token, GENERIC_USER};
use crate::{ErrorKind, Result};

/// `FilesystemPoolDriver`が扱うプールの種別.
pub const FILESYSTEM_POOL_TYPE: &str = "filesystem";

/// ディスクサーバ群を管理するバックエンド (DPMのディスクマネージャ相当).
///
/// 一時的な障害の場合には`ErrorKind::Other`を返すこと.
/// その場合、呼び出し元は設定された回数までリトライを行う.
pub trait DiskBackend {
    /// プールに所属するファイルシステムの一覧を返す.
    ///
    /// プールが存在しない場合には`ErrorKind::NoSuchPool`を返す.
    fn filesystems(&self, pool: &str) -> Result<Vec<Filesystem>>;

    /// プールの`(総容量, 空き容量)`を返す.
    ///
    /// プールが存在しない場合には`ErrorKind::NoSuchPool`を返す.
    fn pool_space(&self, pool: &str) -> Result<(u64, u64)>;

    /// プールを登録する.
    fn add_pool(&self, pool: &Pool) -> Result<()>;

    /// プールの属性を更新する.
    fn modify_pool(&self, pool: &Pool) -> Result<()>;

    /// プールの登録を削除する.
    ///
    /// プールが存在しない場合には`ErrorKind::NoSuchPool`を返す.
    fn remove_pool(&self, pool: &str) -> Result<()>;

    /// ファイルシステムをプールに追加する.
    fn add_filesystem(&self, fs: &Filesystem) -> Result<()>;

    /// ファイルシステムの状態等を更新する.
    fn modify_filesystem(&self, fs: &Filesystem) -> Result<()>;

    /// ファイルシステムをプールから取り除く.
    fn remove_filesystem(&self, fs: &Filesystem) -> Result<()>;

    /// 新しいレプリカの物理的な配置を要求する.
    fn put(&self, request: &PutRequest) -> Result<PutReply>;

    /// `put`で開始した書き込みの完了を通知する.
    fn put_done(&self, backend_token: &str, sfn: &str) -> Result<PutDone>;

    /// `put`で開始した書き込みを中断する.
    fn abort(&self, backend_token: &str) -> Result<()>;

    /// レプリカを物理的に削除する.
    ///
    /// 存在しない場合には`ErrorKind::NoSuchFile`を返す.
    fn delete_replica(&self, replica: &Replica) -> Result<()>;

    /// 説明文に対応するスペーストークンの一覧を返す.
    fn space_token_by_description(&self, description: &str) -> Result<Vec<String>>;
}

/// 物理的な配置の要求.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    /// 論理ファイル名.
    pub sfn: String,

    /// 配置先のプール.
    pub pool: String,

    /// 配置先として強制するファイルシステム (`(server, fs)`).
    pub filesystem: Option<(String, String)>,

    /// スペーストークン.
    pub space_token: Option<String>,

    /// ファイル種別.
    pub f_type: char,

    /// 要求する生存期間(秒).
    pub lifetime: u64,

    /// 書き込み予定のサイズ.
    pub requested_size: u64,

    /// 複製の作成かどうか.
    pub replicate: bool,
}

/// `DiskBackend::put`の結果.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReply {
    /// 書き込み先のディスクサーバ.
    pub server: String,

    /// 書き込み先の物理パス.
    pub pfn: String,

    /// 後続の`put_done`や`abort`で使う、バックエンド側の識別子.
    pub backend_token: String,
}

/// `DiskBackend::put_done`の結果.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutDone {
    /// 書き込み先のディスクサーバ.
    pub server: String,

    /// 書き込み先の物理パス.
    pub pfn: String,

    /// 書き込まれたサイズ.
    pub size: u64,

    /// 書き込み先のプール.
    pub pool: String,

    /// 書き込み先のファイルシステム.
    pub filesystem: String,

    /// ディスクサーバが計算したadler32チェックサム (16進表記).
    pub checksum: Option<String>,
}

/// `"filesystem"`種別のプール群を扱うドライバ.
pub struct FilesystemPoolDriver<B, C> {
    shared: Arc<Shared<B, C>>,
}
impl<B: DiskBackend, C: Catalog> FilesystemPoolDriver<B, C> {
    /// 新しい`FilesystemPoolDriver`インスタンスを生成する.
    pub fn new(ctx: &Context, backend: Arc<B>, catalog: Arc<C>) -> Self {
        let config = ctx.config();
        let shared = Shared {
            backend,
            catalog,
            token_password: config.token_password().to_owned(),
            token_id: config.token_id(),
            token_life: config.token_life(),
            admin_username: config.admin_username().to_owned(),
            retry_limit: config.retry_limit(),
            dir_space_report_depth: config.dir_space_report_depth(),
            fs_cache_ttl: config.filesystem_cache_ttl(),
            fs_cache: Mutex::new(HashMap::new()),
            logger: ctx
                .root_logger()
                .new(o!("component" => "filesystem_pool_driver")),
        };
        FilesystemPoolDriver {
            shared: Arc::new(shared),
        }
    }

    /// バックエンドへの参照を返す.
    pub fn backend(&self) -> &Arc<B> {
        &self.shared.backend
    }
}
impl<B, C> PoolDriver for FilesystemPoolDriver<B, C>
where
    B: DiskBackend + 'static,
    C: Catalog + 'static,
{
    fn pool_type(&self) -> &str {
        FILESYSTEM_POOL_TYPE
    }

    fn create_pool_handler(&self, pool_name: &str) -> Result<Box<dyn PoolHandler>> {
        Ok(Box::new(FilesystemPoolHandler {
            pool_name: pool_name.to_owned(),
            shared: Arc::clone(&self.shared),
        }))
    }

    fn to_be_created(&self, _ctx: &RequestContext, pool: &Pool) -> Result<()> {
        let s = &self.shared;
        track!(s.retry("add_pool", || s.backend.add_pool(pool)))?;
        for fs in &pool.filesystems {
            let mut fs = fs.clone();
            fs.pool = pool.name.clone();
            track!(s.retry("add_filesystem", || s.backend.add_filesystem(&fs)))?;
        }
        s.invalidate(&pool.name);
        Ok(())
    }

    fn just_created(&self, _ctx: &RequestContext, pool: &Pool) -> Result<()> {
        debug!(self.shared.logger, "Pool created"; "pool" => &pool.name);
        Ok(())
    }

    fn update(&self, _ctx: &RequestContext, pool: &Pool) -> Result<()> {
        let s = &self.shared;
        track!(s.retry("modify_pool", || s.backend.modify_pool(pool)))?;
        for fs in &pool.filesystems {
            let mut fs = fs.clone();
            fs.pool = pool.name.clone();
            track!(s.retry("modify_filesystem", || s.backend.modify_filesystem(&fs)))?;
        }
        s.invalidate(&pool.name);
        Ok(())
    }

    fn to_be_deleted(&self, _ctx: &RequestContext, pool: &Pool) -> Result<()> {
        let s = &self.shared;
        let filesystems = track!(s.retry("filesystems", || s.backend.filesystems(&pool.name)))?;
        for fs in &filesystems {
            track!(s.retry("remove_filesystem", || s.backend.remove_filesystem(fs)))?;
        }
        track!(s.retry("remove_pool", || s.backend.remove_pool(&pool.name)))?;
        s.invalidate(&pool.name);
        Ok(())
    }
}

struct Shared<B, C> {
    backend: Arc<B>,
    catalog: Arc<C>,
    token_password: String,
    token_id: TokenId,
    token_life: Duration,
    admin_username: String,
    retry_limit: u32,
    dir_space_report_depth: usize,
    fs_cache_ttl: Duration,
    fs_cache: Mutex<HashMap<String, (Instant, Vec<Filesystem>)>>,
    logger: Logger,
}
impl<B: DiskBackend, C: Catalog> Shared<B, C> {
    fn retry<T, F>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempts = 0;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if *e.kind() != ErrorKind::Other || attempts >= self.retry_limit {
                        return Err(track!(e));
                    }
                    attempts += 1;
                    warn!(self.logger, "Backend call failed; retrying";
                          "operation" => operation, "attempt" => attempts,
                          "error" => e.to_string());
                }
            }
        }
    }

    fn filesystems(&self, pool: &str) -> Result<Vec<Filesystem>> {
        let now = Instant::now();
        {
            let cache = self.fs_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((updated, filesystems)) = cache.get(pool) {
                if now.saturating_duration_since(*updated) < self.fs_cache_ttl {
                    return Ok(filesystems.clone());
                }
            }
        }
        let filesystems = track!(self.retry("filesystems", || self.backend.filesystems(pool)))?;
        let mut cache = self.fs_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(pool.to_owned(), (now, filesystems.clone()));
        Ok(filesystems)
    }

    fn invalidate(&self, pool: &str) {
        let mut cache = self.fs_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(pool);
    }

    fn token(&self, id: &str, pfn: &str, write: bool) -> String {
        generate_token(id, pfn, &self.token_password, self.token_life, write)
    }
}

struct FilesystemPoolHandler<B, C> {
    pool_name: String,
    shared: Arc<Shared<B, C>>,
}
impl<B: DiskBackend, C: Catalog> FilesystemPoolHandler<B, C> {
    fn choose_filesystem(&self, ctx: &RequestContext) -> Result<Option<(String, String)>> {
        let params = &ctx.params;
        if let Some(ref name) = params.filesystem {
            let i = track_assert_some!(
                name.find(':'),
                ErrorKind::NoSpace,
                "The specified filesystem could not be selected, \
                 it must be of format <server>:<filesystem>: {:?}",
                name
            );
            return Ok(Some((name[..i].to_owned(), name[i + 1..].to_owned())));
        }
        if params.pool.is_some() {
            let filesystems = track!(self.shared.filesystems(&self.pool_name))?
                .into_iter()
                .filter(|fs| fs.status == FsStatus::Enabled)
                .collect::<Vec<_>>();
            track_assert!(
                !filesystems.is_empty(),
                ErrorKind::NoSpace,
                "No filesystem of pool {:?} is enabled for writing",
                self.pool_name
            );
            let fs = &filesystems[rand::thread_rng().gen_range(0..filesystems.len())];
            return Ok(Some((fs.server.clone(), fs.fs.clone())));
        }
        Ok(None)
    }
}
impl<B: DiskBackend, C: Catalog> PoolHandler for FilesystemPoolHandler<B, C> {
    fn pool_type(&self) -> &str {
        FILESYSTEM_POOL_TYPE
    }

    fn pool_name(&self) -> &str {
        &self.pool_name
    }

    fn total_space(&self) -> Result<u64> {
        let s = &self.shared;
        track!(s.retry("pool_space", || s.backend.pool_space(&self.pool_name))).map(|(t, _)| t)
    }

    fn free_space(&self) -> Result<u64> {
        let s = &self.shared;
        track!(s.retry("pool_space", || s.backend.pool_space(&self.pool_name))).map(|(_, f)| f)
    }

    fn pool_is_available(&self, write: bool) -> Result<bool> {
        let filesystems = track!(self.shared.filesystems(&self.pool_name))?;
        Ok(filesystems.iter().any(|fs| {
            if write {
                fs.status == FsStatus::Enabled
            } else {
                fs.status != FsStatus::Disabled
            }
        }))
    }

    fn replica_is_available(&self, replica: &Replica) -> Result<bool> {
        if replica.status != ReplicaStatus::Available {
            return Ok(false);
        }
        let filesystems = track!(self.shared.filesystems(&self.pool_name))?;
        Ok(filesystems
            .iter()
            .find(|fs| fs.fs == replica.filesystem && fs.server == replica.server)
            .map_or(false, |fs| fs.status != FsStatus::Disabled))
    }

    fn where_to_read(&self, ctx: &RequestContext, replica: &Replica) -> Result<Location> {
        let s = &self.shared;
        let rfn = track!(Url::parse(&replica.rfn))?;
        let domain = if rfn.domain.is_empty() {
            &replica.server
        } else {
            &rfn.domain
        };
        let size = track!(s.catalog.stat_by_inode(replica.file_id))?.size;

        let mut url = Url::with_domain_and_path(domain, &rfn.path);
        let id = ctx.security.token_identity(s.token_id);
        let token = s.token(id, &url.path, false);
        url.query.insert("token".to_owned(), token);
        Ok(Location::single(Chunk::new(url, 0, size)))
    }

    fn remove_replica(&self, _ctx: &RequestContext, replica: &Replica) -> Result<()> {
        let s = &self.shared;
        track!(s.retry("delete_replica", || s.backend.delete_replica(replica)))?;

        let tx = track!(Transaction::begin(&*s.catalog))?;
        match s.catalog.delete_replica(replica) {
            Err(ref e) if *e.kind() == ErrorKind::NoSuchReplica => {}
            other => track!(other)?,
        }
        let stat = track!(s.catalog.stat_by_inode(replica.file_id))?;
        if track!(s.catalog.get_replicas(replica.file_id))?.is_empty() {
            track!(catalog::propagate_size(
                &*s.catalog,
                &stat,
                -(stat.size as i64),
                s.dir_space_report_depth
            ))?;
        }
        track!(tx.commit())?;
        info!(s.logger, "Removed a replica"; "rfn" => &replica.rfn, "size" => stat.size);
        Ok(())
    }

    fn where_to_write(&self, ctx: &RequestContext, sfn: &str) -> Result<Location> {
        let s = &self.shared;
        let params = &ctx.params;
        let mut request = PutRequest {
            sfn: sfn.to_owned(),
            pool: self.pool_name.clone(),
            filesystem: None,
            space_token: params.space_token.clone(),
            f_type: params.f_type.unwrap_or('P'),
            lifetime: params.lifetime,
            requested_size: params.requested_size,
            replicate: false,
        };
        if request.space_token.is_none() {
            if let Some(ref description) = params.user_space_token_description {
                let tokens = track!(s.retry("space_token_by_description", || {
                    s.backend.space_token_by_description(description)
                }))?;
                let token = track_assert_some!(
                    tokens.into_iter().next(),
                    ErrorKind::InvalidInput,
                    "No space tokens associated with {:?}",
                    description
                );
                request.space_token = Some(token);
            }
        }

        let filesystems = track!(s.filesystems(&self.pool_name))?;
        track_assert!(
            !filesystems.is_empty(),
            ErrorKind::NoSpace,
            "There are no filesystems in pool {:?}",
            self.pool_name
        );

        if ctx.security.user.name == s.admin_username {
            request.filesystem = track!(self.choose_filesystem(ctx))?;
            request.replicate = params.replicate;
        }

        let reply = track!(s.retry("put", || s.backend.put(&request)); request)?;
        let mut url = Url::with_domain_and_path(&reply.server, &normalize_path(&reply.pfn));
        let id = if request.replicate {
            GENERIC_USER
        } else {
            ctx.security.token_identity(s.token_id)
        };
        let token = s.token(id, &url.path, true);
        url.query.insert("sfn".to_owned(), sfn.to_owned());
        url.query.insert("pool".to_owned(), self.pool_name.clone());
        url.query.insert("dpmtoken".to_owned(), reply.backend_token);
        url.query.insert("token".to_owned(), token);
        debug!(s.logger, "Placed a new replica"; "sfn" => sfn, "url" => url.to_string());
        Ok(Location::single(Chunk::new(url, 0, 0)))
    }

    fn cancel_write(&self, _ctx: &RequestContext, location: &Location) -> Result<()> {
        let s = &self.shared;
        let chunk = track_assert_some!(location.first(), ErrorKind::InvalidInput, "Empty location");
        let token = track_assert_some!(
            chunk.url.query_param("dpmtoken"),
            ErrorKind::InvalidInput,
            "Missing dpmtoken: {}",
            location
        );
        track!(s.retry("abort", || s.backend.abort(token)))?;
        info!(s.logger, "Aborted a write"; "url" => chunk.url.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use trackable::result::TestResult;

    use super::*;
    use crate::catalog::{MemoryCatalog, S_IFDIR, S_IFREG};
    use crate::config::ConfigBuilder;
    use crate::context::RequestContext;
    use crate::location::Url;
    use crate::pool::MemoryDiskBackend;
    use crate::security::{GroupInfo, SecurityContext, SecurityCredentials, UserInfo};
    use crate::token::{validate_token, TokenResult};
    use crate::ErrorKind;

    type Driver = FilesystemPoolDriver<MemoryDiskBackend, MemoryCatalog>;

    fn setup() -> (Driver, Arc<MemoryDiskBackend>, Arc<MemoryCatalog>) {
        let ctx = Context::new(
            ConfigBuilder::new()
                .token_password("secret")
                .admin_username("root")
                .finish(),
        );
        let backend = Arc::new(MemoryDiskBackend::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let driver = FilesystemPoolDriver::new(&ctx, Arc::clone(&backend), Arc::clone(&catalog));
        (driver, backend, catalog)
    }

    fn request(name: &str, uid: u32) -> RequestContext {
        RequestContext::new(SecurityContext::new(
            SecurityCredentials {
                client_name: name.to_owned(),
                remote_address: "10.0.0.1".to_owned(),
                fqans: Vec::new(),
            },
            UserInfo {
                name: name.to_owned(),
                uid,
                banned: false,
            },
            vec![GroupInfo {
                name: "dteam".to_owned(),
                gid: uid,
                banned: false,
            }],
        ))
    }

    fn pool(name: &str, filesystems: &[(&str, &str, FsStatus)]) -> Pool {
        let mut pool = Pool::new(name, FILESYSTEM_POOL_TYPE);
        pool.filesystems = filesystems
            .iter()
            .map(|&(server, fs, status)| Filesystem::new(name, server, fs, status))
            .collect();
        pool
    }

    #[test]
    fn availability_follows_filesystem_status() -> TestResult {
        let (driver, backend, _) = setup();
        let admin = request("root", 0);
        let pool = pool(
            "p",
            &[("disk01", "/srv/fs1", FsStatus::ReadOnly), ("disk02", "/srv/fs2", FsStatus::Disabled)],
        );
        track!(driver.to_be_created(&admin, &pool))?;
        assert_eq!(backend.calls("add_filesystem"), 2);

        let handler = track!(driver.create_pool_handler("p"))?;
        assert_eq!(handler.pool_type(), "filesystem");
        assert!(track!(handler.pool_is_available(false))?);
        assert!(!track!(handler.pool_is_available(true))?);

        let mut replica = Replica::new(10, "disk02", "disk02:/srv/fs2/f");
        replica.filesystem = "/srv/fs2".to_owned();
        replica.status = ReplicaStatus::Available;
        assert!(!track!(handler.replica_is_available(&replica))?);

        replica.server = "disk01".to_owned();
        replica.filesystem = "/srv/fs1".to_owned();
        assert!(track!(handler.replica_is_available(&replica))?);

        replica.status = ReplicaStatus::BeingPopulated;
        assert!(!track!(handler.replica_is_available(&replica))?);

        // 一覧はキャッシュされる
        assert_eq!(backend.calls("filesystems"), 1);
        Ok(())
    }

    #[test]
    fn write_locations_carry_tokens() -> TestResult {
        let (driver, _, _) = setup();
        let admin = request("root", 0);
        track!(driver.to_be_created(&admin, &pool("p", &[("disk01", "/srv/fs1", FsStatus::Enabled)])))?;
        let handler = track!(driver.create_pool_handler("p"))?;

        let user = request("/CN=alice", 100);
        let location = track!(handler.where_to_write(&user, "/dteam/f"))?;
        assert_eq!(location.len(), 1);
        let url = &location.0[0].url;
        assert_eq!(url.domain, "disk01");
        assert!(url.path.starts_with("/srv/fs1/"));
        assert_eq!(url.query_param("sfn"), Some("/dteam/f"));
        assert_eq!(url.query_param("pool"), Some("p"));
        assert!(url.query_param("dpmtoken").is_some());

        let token = track_assert_some!(url.query_param("token"), ErrorKind::Other);
        assert_eq!(
            validate_token(token, "/CN=alice", &url.path, "secret", true),
            TokenResult::Ok
        );
        assert_eq!(
            validate_token(token, "/CN=bob", &url.path, "secret", true),
            TokenResult::Invalid
        );
        Ok(())
    }

    #[test]
    fn placement_overrides_are_admin_only() -> TestResult {
        let (driver, backend, _) = setup();
        let admin = request("root", 0);
        track!(driver.to_be_created(
            &admin,
            &pool("p", &[("disk01", "/srv/fs1", FsStatus::Enabled), ("disk02", "/srv/fs2", FsStatus::Enabled)])
        ))?;
        let handler = track!(driver.create_pool_handler("p"))?;

        let mut user = request("/CN=alice", 100);
        user.params.filesystem = Some("bogus".to_owned());
        user.params.replicate = true;
        track!(handler.where_to_write(&user, "/a"))?;
        let last = track_assert_some!(backend.last_put(), ErrorKind::Other);
        assert_eq!(last.filesystem, None);
        assert!(!last.replicate);

        let mut admin = admin;
        admin.params.filesystem = Some("bogus".to_owned());
        let e = handler.where_to_write(&admin, "/a").err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::NoSpace));

        admin.params.filesystem = Some("disk02:/srv/fs2".to_owned());
        admin.params.replicate = true;
        let location = track!(handler.where_to_write(&admin, "/b"))?;
        let url = &location.0[0].url;
        assert_eq!(url.domain, "disk02");
        let token = track_assert_some!(url.query_param("token"), ErrorKind::Other);
        assert_eq!(
            validate_token(token, "anyone", &url.path, "secret", true),
            TokenResult::Ok
        );
        Ok(())
    }

    #[test]
    fn space_tokens_are_resolved() -> TestResult {
        let (driver, backend, _) = setup();
        let admin = request("root", 0);
        track!(driver.to_be_created(&admin, &pool("p", &[("disk01", "/srv/fs1", FsStatus::Enabled)])))?;
        backend.add_space_token("dteam-disk", "91b7c3e2");
        let handler = track!(driver.create_pool_handler("p"))?;

        let mut user = request("/CN=alice", 100);
        user.params.user_space_token_description = Some("dteam-disk".to_owned());
        track!(handler.where_to_write(&user, "/a"))?;
        let last = track_assert_some!(backend.last_put(), ErrorKind::Other);
        assert_eq!(last.space_token.as_ref().map(|s| s.as_str()), Some("91b7c3e2"));
        assert_eq!(last.f_type, 'P');

        user.params.user_space_token_description = Some("unknown".to_owned());
        let e = handler.where_to_write(&user, "/a").err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InvalidInput));
        Ok(())
    }

    #[test]
    fn empty_pools_have_no_space() -> TestResult {
        let (driver, _, _) = setup();
        let admin = request("root", 0);
        track!(driver.to_be_created(&admin, &pool("p", &[])))?;
        let handler = track!(driver.create_pool_handler("p"))?;
        let e = handler.where_to_write(&admin, "/a").err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::NoSpace));
        Ok(())
    }

    #[test]
    fn transient_failures_are_retried() -> TestResult {
        let (driver, backend, _) = setup();
        let admin = request("root", 0);
        track!(driver.to_be_created(&admin, &pool("p", &[("disk01", "/srv/fs1", FsStatus::Enabled)])))?;
        let handler = track!(driver.create_pool_handler("p"))?;

        backend.fail_next("put", 2);
        track!(handler.where_to_write(&admin, "/a"))?;
        assert_eq!(backend.calls("put"), 3);

        backend.fail_next("put", 10);
        let e = handler.where_to_write(&admin, "/b").err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::Other));
        assert_eq!(backend.calls("put"), 3 + 4);
        Ok(())
    }

    #[test]
    fn read_locations_and_removal() -> TestResult {
        let (driver, backend, catalog) = setup();
        let admin = request("root", 0);
        track!(driver.to_be_created(&admin, &pool("p", &[("disk01", "/srv/fs1", FsStatus::Enabled)])))?;
        let handler = track!(driver.create_pool_handler("p"))?;

        for dir in &["/a", "/a/b", "/a/b/c"] {
            track!(catalog.create_entry(dir, S_IFDIR | 0o755, 0, 0))?;
        }
        let dir = track!(catalog.stat_by_path("/a/b"))?;
        track!(catalog.set_size(dir.ino, 100))?;
        let file = track!(catalog.create_entry("/a/b/c/f", S_IFREG | 0o644, 0, 0))?;
        track!(catalog.set_size(file.ino, 40))?;

        let location = track!(handler.where_to_write(&admin, "/a/b/c/f"))?;
        let url = location.0[0].url.clone();
        let mut replica = Replica::new(file.ino, &url.domain, &format!("{}:{}", url.domain, url.path));
        replica.pool = "p".to_owned();
        replica.filesystem = "/srv/fs1".to_owned();
        replica.status = ReplicaStatus::Available;
        let replica = track!(catalog.add_replica(&replica))?;
        let token = track_assert_some!(url.query_param("dpmtoken"), ErrorKind::Other);
        track!(backend.put_done(token, "/a/b/c/f"))?;

        let user = request("/CN=alice", 100);
        let read = track!(handler.where_to_read(&user, &replica))?;
        let chunk = &read.0[0];
        assert_eq!(chunk.size, 40);
        assert_eq!(chunk.url.domain, url.domain);
        assert_eq!(chunk.url.path, url.path);
        let token = track_assert_some!(chunk.url.query_param("token"), ErrorKind::Other);
        assert_eq!(
            validate_token(token, "/CN=alice", &url.path, "secret", true),
            TokenResult::InvalidMode
        );

        track!(handler.remove_replica(&user, &replica))?;
        assert!(track!(catalog.get_replicas(file.ino))?.is_empty());
        assert_eq!(track!(catalog.stat_by_path("/a/b"))?.size, 60);
        assert_eq!(catalog.transaction_depth(), 0);

        let e = handler.remove_replica(&user, &replica).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::NoSuchFile));
        Ok(())
    }

    #[test]
    fn directory_size_is_released_with_the_last_replica() -> TestResult {
        let (driver, backend, catalog) = setup();
        let admin = request("root", 0);
        track!(driver.to_be_created(&admin, &pool("p", &[("disk01", "/srv/fs1", FsStatus::Enabled)])))?;
        let handler = track!(driver.create_pool_handler("p"))?;

        for dir in &["/d", "/d/e"] {
            track!(catalog.create_entry(dir, S_IFDIR | 0o755, 0, 0))?;
        }
        let dir = track!(catalog.stat_by_path("/d/e"))?;
        track!(catalog.set_size(dir.ino, 84))?;
        let file = track!(catalog.create_entry("/d/e/x", S_IFREG | 0o644, 0, 0))?;
        track!(catalog.set_size(file.ino, 42))?;

        let mut replicas = Vec::new();
        for _ in 0..2 {
            let location = track!(handler.where_to_write(&admin, "/d/e/x"))?;
            let url = location.0[0].url.clone();
            let token = track_assert_some!(url.query_param("dpmtoken"), ErrorKind::Other);
            track!(backend.put_done(token, "/d/e/x"))?;
            let mut replica =
                Replica::new(file.ino, &url.domain, &format!("{}:{}", url.domain, url.path));
            replica.pool = "p".to_owned();
            replica.filesystem = "/srv/fs1".to_owned();
            replica.status = ReplicaStatus::Available;
            replicas.push(track!(catalog.add_replica(&replica))?);
        }

        track!(handler.remove_replica(&admin, &replicas[0]))?;
        assert_eq!(track!(catalog.stat_by_path("/d/e"))?.size, 84);
        track!(handler.remove_replica(&admin, &replicas[1]))?;
        assert_eq!(track!(catalog.stat_by_path("/d/e"))?.size, 42);
        assert_eq!(catalog.transaction_depth(), 0);
        Ok(())
    }

    #[test]
    fn read_location_fails_without_catalog_entry() -> TestResult {
        let (driver, _, catalog) = setup();
        let admin = request("root", 0);
        track!(driver.to_be_created(&admin, &pool("p", &[("disk01", "/srv/fs1", FsStatus::Enabled)])))?;
        let handler = track!(driver.create_pool_handler("p"))?;
        let file = track!(catalog.create_entry("/f", S_IFREG | 0o644, 0, 0))?;
        let mut replica = Replica::new(file.ino, "disk01", "disk01:/srv/fs1/f.1");
        replica.pool = "p".to_owned();
        replica.filesystem = "/srv/fs1".to_owned();

        catalog.inject_failure("stat_by_inode");
        let e = handler.where_to_read(&admin, &replica).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::Other));
        Ok(())
    }

    #[test]
    fn cancel_requires_backend_token() -> TestResult {
        let (driver, backend, _) = setup();
        let admin = request("root", 0);
        track!(driver.to_be_created(&admin, &pool("p", &[("disk01", "/srv/fs1", FsStatus::Enabled)])))?;
        let handler = track!(driver.create_pool_handler("p"))?;

        let e = handler.cancel_write(&admin, &Location::default()).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InvalidInput));

        let bare = Location::single(Chunk::new(track!(Url::parse("disk01:/srv/fs1/x"))?, 0, 0));
        let e = handler.cancel_write(&admin, &bare).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InvalidInput));

        let location = track!(handler.where_to_write(&admin, "/a"))?;
        track!(handler.cancel_write(&admin, &location))?;
        assert_eq!(backend.calls("abort"), 1);
        Ok(())
    }

    #[test]
    fn pool_lifecycle_hooks() -> TestResult {
        let (driver, backend, _) = setup();
        let admin = request("root", 0);
        let mut p = pool("p", &[("disk01", "/srv/fs1", FsStatus::Enabled)]);
        track!(driver.to_be_created(&admin, &p))?;
        let handler = track!(driver.create_pool_handler("p"))?;
        assert!(track!(handler.pool_is_available(true))?);

        p.filesystems[0].status = FsStatus::Disabled;
        track!(driver.update(&admin, &p))?;
        assert!(!track!(handler.pool_is_available(false))?);

        track!(driver.to_be_deleted(&admin, &p))?;
        assert_eq!(backend.calls("remove_filesystem"), 1);
        let e = driver.to_be_deleted(&admin, &p).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::NoSuchPool));
        Ok(())
    }
}
