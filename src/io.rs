//! ディスクサーバ側のI/Oの開始と完了の処理.
use slog::Logger;
use std::sync::Arc;

use crate::catalog::{self, Catalog, Replica, ReplicaStatus, Transaction};
use crate::config::TokenId;
use crate::context::{Context, RequestContext};
use crate::location::{Location, Url};
use crate::pool::DiskBackend;
use crate::token;
use crate::{ErrorKind, Result};

/// adler32チェックサムを保持する拡張属性のキー.
pub const ADLER32_XATTR: &str = "checksum.adler32";

/// ディスクサーバ側のI/Oを扱うドライバ.
///
/// `PoolManager::where_to_write`が返した`Location`への書き込みが終わった後に、
/// [done_writing]を呼び出して書き込みを確定させる.
///
/// [done_writing]: #method.done_writing
pub struct IoDriver<B, C> {
    backend: Arc<B>,
    catalog: Arc<C>,
    token_password: String,
    token_id: TokenId,
    dir_space_report_depth: usize,
    logger: Logger,
}
impl<B: DiskBackend, C: Catalog> IoDriver<B, C> {
    /// 新しい`IoDriver`インスタンスを生成する.
    pub fn new(ctx: &Context, backend: Arc<B>, catalog: Arc<C>) -> Self {
        let config = ctx.config();
        IoDriver {
            backend,
            catalog,
            token_password: config.token_password().to_owned(),
            token_id: config.token_id(),
            dir_space_report_depth: config.dir_space_report_depth(),
            logger: ctx.root_logger().new(o!("component" => "io_driver")),
        }
    }

    /// `url`に埋め込まれたトークンが、要求元による指定モードでのアクセスを許可しているかを検証する.
    ///
    /// トークンが欠けている、あるいは解釈できない場合には`ErrorKind::InvalidInput`が、
    /// 検証に失敗した場合には`ErrorKind::PermissionDenied`が返される.
    pub fn authorize(&self, ctx: &RequestContext, url: &Url, write: bool) -> Result<()> {
        let token = track_assert_some!(
            url.query_param("token"),
            ErrorKind::InvalidInput,
            "Missing token: {}",
            url
        );
        let id = ctx.security.token_identity(self.token_id);
        let result = token::validate_token(token, id, &url.path, &self.token_password, write);
        track!(result.into_result(); url.path, write)
    }

    /// 書き込みの完了を確定させる.
    ///
    /// バックエンドへの完了通知の後、単一のトランザクション内で以下を行う:
    /// - ファイルサイズの設定
    /// - レプリカを利用可能状態にする (未登録なら登録する)
    /// - 祖先ディレクトリへのサイズの反映
    ///
    /// バックエンドがチェックサムを報告した場合には、その保存も試みる(失敗は無視される).
    pub fn done_writing(&self, _ctx: &RequestContext, location: &Location) -> Result<Replica> {
        let chunk = track_assert_some!(location.first(), ErrorKind::InvalidInput, "Empty location");
        let url = &chunk.url;
        let sfn = track_assert_some!(
            url.query_param("sfn"),
            ErrorKind::InvalidInput,
            "Missing sfn: {}",
            location
        );
        let backend_token = track_assert_some!(
            url.query_param("dpmtoken"),
            ErrorKind::InvalidInput,
            "Missing dpmtoken: {}",
            location
        );

        let done = track!(self.backend.put_done(backend_token, sfn); sfn)?;
        let rfn = format!("{}:{}", done.server, done.pfn);

        let tx = track!(Transaction::begin(&*self.catalog))?;
        let stat = track!(self.catalog.stat_by_path(sfn))?;
        track!(self.catalog.set_size(stat.ino, done.size))?;
        let replica = match self.catalog.get_replica_by_rfn(&rfn) {
            Ok(mut replica) => {
                replica.status = ReplicaStatus::Available;
                track!(self.catalog.update_replica(&replica))?;
                replica
            }
            Err(ref e) if *e.kind() == ErrorKind::NoSuchReplica => {
                let mut replica = Replica::new(stat.ino, &done.server, &rfn);
                replica.status = ReplicaStatus::Available;
                replica.pool = done.pool.clone();
                replica.filesystem = done.filesystem.clone();
                track!(self.catalog.add_replica(&replica))?
            }
            Err(e) => return Err(track!(e)),
        };
        let delta = done.size as i64 - stat.size as i64;
        track!(catalog::propagate_size(
            &*self.catalog,
            &stat,
            delta,
            self.dir_space_report_depth
        ))?;
        track!(tx.commit())?;

        if let Some(ref checksum) = done.checksum {
            if let Err(e) = self.catalog.set_xattr(stat.ino, ADLER32_XATTR, checksum) {
                warn!(self.logger, "Cannot save the checksum";
                      "sfn" => sfn, "error" => e.to_string());
            }
        }
        info!(self.logger, "Write completed";
              "sfn" => sfn, "rfn" => &rfn, "size" => done.size);
        Ok(replica)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use trackable::result::TestResult;

    use super::*;
    use crate::catalog::{MemoryCatalog, S_IFDIR, S_IFREG};
    use crate::config::ConfigBuilder;
    use crate::location::Chunk;
    use crate::pool::{
        Filesystem, FsStatus, MemoryDiskBackend, Pool, PutRequest, FILESYSTEM_POOL_TYPE,
    };
    use crate::security::{SecurityContext, SecurityCredentials, UserInfo};
    use crate::ErrorKind;

    struct Fixture {
        driver: IoDriver<MemoryDiskBackend, MemoryCatalog>,
        backend: Arc<MemoryDiskBackend>,
        catalog: Arc<MemoryCatalog>,
        ctx: RequestContext,
    }

    fn fixture() -> Result<Fixture> {
        let ctx = Context::new(ConfigBuilder::new().token_password("secret").finish());
        let backend = Arc::new(MemoryDiskBackend::new());
        let catalog = Arc::new(MemoryCatalog::new());
        track!(backend.add_pool(&Pool::new("p", FILESYSTEM_POOL_TYPE)))?;
        track!(backend.add_filesystem(&Filesystem::new(
            "p",
            "disk01",
            "/srv/fs1",
            FsStatus::Enabled
        )))?;
        for dir in &["/a", "/a/b", "/a/b/c"] {
            track!(catalog.create_entry(dir, S_IFDIR | 0o755, 0, 0))?;
        }
        track!(catalog.create_entry("/a/b/c/f", S_IFREG | 0o664, 100, 200))?;

        let driver = IoDriver::new(&ctx, Arc::clone(&backend), Arc::clone(&catalog));
        let request = RequestContext::new(SecurityContext::new(
            SecurityCredentials {
                client_name: "/CN=alice".to_owned(),
                ..SecurityCredentials::default()
            },
            UserInfo {
                name: "/CN=alice".to_owned(),
                uid: 100,
                banned: false,
            },
            Vec::new(),
        ));
        Ok(Fixture {
            driver,
            backend,
            catalog,
            ctx: request,
        })
    }

    fn start_write(backend: &MemoryDiskBackend, sfn: &str) -> Result<Location> {
        let reply = track!(backend.put(&PutRequest {
            sfn: sfn.to_owned(),
            pool: "p".to_owned(),
            filesystem: None,
            space_token: None,
            f_type: 'P',
            lifetime: 0,
            requested_size: 0,
            replicate: false,
        }))?;
        let mut url = Url::with_domain_and_path(&reply.server, &reply.pfn);
        url.query.insert("sfn".to_owned(), sfn.to_owned());
        url.query.insert("dpmtoken".to_owned(), reply.backend_token);
        Ok(Location::single(Chunk::new(url, 0, 0)))
    }

    #[test]
    fn done_writing_registers_the_replica() -> TestResult {
        let f = track!(fixture())?;
        let location = track!(start_write(&f.backend, "/a/b/c/f"))?;
        let token = track_assert_some!(location.0[0].url.query_param("dpmtoken"), ErrorKind::Other);
        track!(f.backend.set_written(token, 25, Some("0badcafe")))?;

        let replica = track!(f.driver.done_writing(&f.ctx, &location))?;
        assert_eq!(replica.status, ReplicaStatus::Available);
        assert_eq!(replica.pool, "p");
        assert_eq!(replica.filesystem, "/srv/fs1");
        assert!(replica.rfn.starts_with("disk01:/srv/fs1/"));

        let stat = track!(f.catalog.stat_by_path("/a/b/c/f"))?;
        assert_eq!(stat.size, 25);
        assert_eq!(stat.xattrs.get(ADLER32_XATTR).map(|s| s.as_str()), Some("0badcafe"));
        assert_eq!(track!(f.catalog.stat_by_path("/a/b"))?.size, 25);
        assert_eq!(track!(f.catalog.stat_by_path("/a"))?.size, 0);
        assert_eq!(track!(f.catalog.get_replicas(stat.ino))?.len(), 1);
        Ok(())
    }

    #[test]
    fn done_writing_marks_existing_replicas() -> TestResult {
        let f = track!(fixture())?;
        let location = track!(start_write(&f.backend, "/a/b/c/f"))?;
        let url = &location.0[0].url;
        let stat = track!(f.catalog.stat_by_path("/a/b/c/f"))?;
        let registered = track!(f.catalog.add_replica(&Replica::new(
            stat.ino,
            &url.domain,
            &format!("{}:{}", url.domain, url.path)
        )))?;

        let replica = track!(f.driver.done_writing(&f.ctx, &location))?;
        assert_eq!(replica.replica_id, registered.replica_id);
        assert_eq!(replica.status, ReplicaStatus::Available);
        assert_eq!(track!(f.catalog.get_replicas(stat.ino))?.len(), 1);
        Ok(())
    }

    #[test]
    fn checksum_failures_do_not_fail_the_write() -> TestResult {
        let f = track!(fixture())?;
        let location = track!(start_write(&f.backend, "/a/b/c/f"))?;
        let token = track_assert_some!(location.0[0].url.query_param("dpmtoken"), ErrorKind::Other);
        track!(f.backend.set_written(token, 1, Some("00000001")))?;
        f.catalog.inject_failure("set_xattr");

        track!(f.driver.done_writing(&f.ctx, &location))?;
        assert_eq!(track!(f.catalog.stat_by_path("/a/b/c/f"))?.size, 1);
        Ok(())
    }

    #[test]
    fn catalog_failures_roll_back() -> TestResult {
        let f = track!(fixture())?;
        let location = track!(start_write(&f.backend, "/a/b/c/f"))?;
        f.catalog.inject_failure("add_replica");

        let e = f.driver.done_writing(&f.ctx, &location).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::Other));
        let stat = track!(f.catalog.stat_by_path("/a/b/c/f"))?;
        assert!(track!(f.catalog.get_replicas(stat.ino))?.is_empty());
        assert_eq!(f.catalog.transaction_depth(), 0);
        Ok(())
    }

    #[test]
    fn malformed_locations_are_rejected() -> TestResult {
        let f = track!(fixture())?;
        let e = f.driver.done_writing(&f.ctx, &Location::default()).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InvalidInput));

        let mut location = track!(start_write(&f.backend, "/a/b/c/f"))?;
        location.0[0].url.query.remove("dpmtoken");
        let e = f.driver.done_writing(&f.ctx, &location).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InvalidInput));

        location.0[0].url.query.remove("sfn");
        let e = f.driver.done_writing(&f.ctx, &location).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InvalidInput));
        assert_eq!(f.backend.calls("put_done"), 0);
        Ok(())
    }

    #[test]
    fn tokens_authorize_access() -> TestResult {
        let f = track!(fixture())?;
        let mut url = Url::with_domain_and_path("disk01", "/srv/fs1/f.1");
        let e = f.driver.authorize(&f.ctx, &url, false).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InvalidInput));

        let token = token::generate_token(
            "/CN=alice",
            "/srv/fs1/f.1",
            "secret",
            std::time::Duration::from_secs(60),
            false,
        );
        url.query.insert("token".to_owned(), token);
        track!(f.driver.authorize(&f.ctx, &url, false))?;

        let e = f.driver.authorize(&f.ctx, &url, true).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::PermissionDenied));
        Ok(())
    }
}
