//! 優先度付きキューを使った、チェックサムの非同期計算.
//!
//! 利用者は[ChecksumService::get_checksum]で値を問い合わせ、
//! 未計算なら`ErrorKind::InProgress`を受け取って後で再度問い合わせる.
//! 実際の計算は、保守スレッドが定期的に呼び出す[ChecksumService::tick]の中で、
//! 同時実行数の上限((全体, ディスクサーバ毎))を守りつつ行われる.
//!
//! レプリカの読み出しに使うハンドル(e.g., ディスクサーバへのHTTPクライアント文脈)は、
//! [Context]が保持するリソースプール`"checksum_readers"`から借りられる.
//!
//! [ChecksumService::get_checksum]: struct.ChecksumService.html#method.get_checksum
//! [ChecksumService::tick]: struct.ChecksumService.html#method.tick
//! [Context]: ../context/struct.Context.html
use slog::Logger;
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::catalog::{Catalog, Replica, ReplicaStatus};
use crate::context::{Context, RequestContext};
use crate::io::ADLER32_XATTR;
use crate::queue::{PrioQueue, PrioQueueBuilder, QueueStatus};
use crate::resource::{PoolContainer, PoolElementFactory};
use crate::{Error, ErrorKind, Result};

/// レプリカの内容を読み出すためのコンポーネント.
pub trait ReplicaReader {
    /// レプリカの内容を読み出すリーダーを返す.
    fn open(&self, replica: &Replica) -> Result<Box<dyn Read>>;
}

/// チェックサムの種別名を、値を保持する拡張属性のキーに変換する.
///
/// 旧来の短縮名(e.g., `"AD"`)にも対応している.
pub fn checksum_xattr_key(kind: &str) -> Result<&'static str> {
    match kind.to_ascii_lowercase().as_str() {
        "ad" | "adler32" | "checksum.adler32" => Ok(ADLER32_XATTR),
        _ => track_panic!(ErrorKind::InvalidInput, "Unsupported checksum type: {:?}", kind),
    }
}

/// チェックサムの計算サービス.
///
/// `F`はレプリカの読み出しハンドルを生成するファクトリ.
pub struct ChecksumService<C, F: PoolElementFactory> {
    catalog: Arc<C>,
    readers: Arc<PoolContainer<F>>,
    queue: PrioQueue,

    // キーの集合はキューの要素の集合と常に一致する (どちらもこのロックの下で更新される)
    tasks: Mutex<HashMap<String, Task>>,
    logger: Logger,
}
impl<C, F> ChecksumService<C, F>
where
    C: Catalog,
    F: PoolElementFactory + Send + Sync + 'static,
    F::Element: ReplicaReader + Send + 'static,
{
    /// 新しい`ChecksumService`インスタンスを生成する.
    pub fn new(ctx: &Context, catalog: Arc<C>, readers: F) -> Result<Self> {
        let config = ctx.config();
        let logger = ctx.root_logger().new(o!("component" => "checksum"));
        let readers = track!(ctx.resource_pool("checksum_readers", readers))?;
        let queue = PrioQueueBuilder::new("checksum")
            .timeout(config.checksum_queue_timeout())
            .limits(vec![config.checksum_max_total(), config.checksum_max_per_node()])
            .metrics(ctx.metric_builder().clone())
            .logger(logger.clone())
            .finish();
        Ok(ChecksumService {
            catalog,
            readers,
            queue,
            tasks: Mutex::new(HashMap::new()),
            logger,
        })
    }

    /// 内部のキューへの参照を返す.
    pub fn queue(&self) -> &PrioQueue {
        &self.queue
    }

    /// 読み出しハンドルのプールへの参照を返す.
    pub fn readers(&self) -> &PoolContainer<F> {
        &self.readers
    }

    /// ファイルのチェックサムを返す.
    ///
    /// 計算済みの値があり`force`が`false`なら、それを即座に返す.
    /// それ以外の場合には、利用可能なレプリカの一つを対象とする計算タスクを登録し、
    /// `ErrorKind::InProgress`を返す.
    pub fn get_checksum(
        &self,
        _ctx: &RequestContext,
        lfn: &str,
        kind: &str,
        force: bool,
    ) -> Result<String> {
        let key = track!(checksum_xattr_key(kind))?;
        let stat = track!(self.catalog.stat_by_path(lfn))?;
        if !force {
            if let Some(value) = stat.xattrs.get(key) {
                return Ok(value.clone());
            }
        }

        let replicas = track!(self.catalog.get_replicas(stat.ino))?;
        track_assert!(!replicas.is_empty(), ErrorKind::NoReplicasExist; lfn);
        let replica = track_assert_some!(
            replicas
                .into_iter()
                .find(|r| r.status == ReplicaStatus::Available),
            ErrorKind::NoReplicasAvailable,
            "No replica of {:?} is available for checksumming",
            lfn
        );

        let namekey = format!("{}#{}#{}", lfn, replica.rfn, key);
        let qualifiers = vec![String::new(), replica.server.clone()];
        {
            let mut tasks = self.lock_tasks();
            tasks
                .entry(namekey.clone())
                .or_insert(Task { replica, key });
            self.queue
                .touch_item_or_create_new(&namekey, QueueStatus::Waiting, 0, &qualifiers);
        }
        track_panic!(
            ErrorKind::InProgress,
            "Checksum calculation is in progress: {}",
            namekey
        );
    }

    /// 期限切れのタスクを取り除いた上で、実行可能なタスクを全て実行する.
    ///
    /// 計算自体はロックの外で行われるので、実行中も`get_checksum`はブロックしない.
    /// 結果は(ベストエフォートで)カタログに保存される.
    /// 実行したタスクの数を返す.
    pub fn tick(&self, now: Instant) -> usize {
        let runnable = {
            let mut tasks = self.lock_tasks();
            for expired in self.queue.tick(now) {
                debug!(self.logger, "Checksum task expired"; "namekey" => &expired.namekey);
                tasks.remove(&expired.namekey);
            }

            let mut runnable = Vec::new();
            while let Some(item) = self.queue.get_next_to_run() {
                if let Some(task) = tasks.get(&item.namekey) {
                    runnable.push((item.namekey, task.clone()));
                } else {
                    warn!(self.logger, "Dropping an orphaned queue item"; "namekey" => &item.namekey);
                    self.queue.remove_item(&item.namekey);
                }
            }
            runnable
        };

        for (namekey, task) in &runnable {
            match track!(self.compute(task)) {
                Ok(value) => {
                    if let Err(e) = self.catalog.set_xattr(task.replica.file_id, task.key, &value) {
                        warn!(self.logger, "Cannot save the checksum";
                              "rfn" => &task.replica.rfn, "error" => e.to_string());
                    } else {
                        info!(self.logger, "Checksum calculated";
                              "rfn" => &task.replica.rfn, "value" => &value);
                    }
                }
                Err(e) => {
                    warn!(self.logger, "Checksum calculation failed";
                          "rfn" => &task.replica.rfn, "error" => e.to_string());
                }
            }
            let mut tasks = self.lock_tasks();
            tasks.remove(namekey);
            self.queue.remove_item(namekey);
        }
        runnable.len()
    }

    fn compute(&self, task: &Task) -> Result<String> {
        let reader = track!(self.readers.acquire())?;
        let input = track!(reader.open(&task.replica))?;
        let value = track!(adler32::adler32(input).map_err(Error::from))?;
        Ok(format!("{:08x}", value))
    }

    fn lock_tasks(&self) -> MutexGuard<HashMap<String, Task>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
struct Task {
    replica: Replica,
    key: &'static str,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::{Cursor, Read};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};
    use trackable::result::TestResult;

    use super::*;
    use crate::catalog::{MemoryCatalog, S_IFREG};
    use crate::config::ConfigBuilder;
    use crate::security::{SecurityContext, SecurityCredentials, UserInfo};
    use crate::ErrorKind;

    #[derive(Clone, Default)]
    struct Contents(Arc<HashMap<String, Vec<u8>>>);
    impl ReplicaReader for Contents {
        fn open(&self, replica: &Replica) -> Result<Box<dyn Read>> {
            let data = track_assert_some!(
                self.0.get(&replica.rfn).cloned(),
                ErrorKind::NoSuchFile;
                replica.rfn
            );
            Ok(Box::new(Cursor::new(data)))
        }
    }
    impl PoolElementFactory for Contents {
        type Element = Contents;
        fn create(&self) -> Result<Contents> {
            Ok(self.clone())
        }
        fn destroy(&self, _element: Contents) {}
        fn is_valid(&self, _element: &Contents) -> bool {
            true
        }
    }

    type Service = ChecksumService<MemoryCatalog, Contents>;

    fn request() -> RequestContext {
        RequestContext::new(SecurityContext::new(
            SecurityCredentials::default(),
            UserInfo {
                name: "/CN=alice".to_owned(),
                uid: 100,
                banned: false,
            },
            Vec::new(),
        ))
    }

    fn setup(files: &[(&str, &str)]) -> Result<(Service, Arc<MemoryCatalog>)> {
        let ctx = Context::new(
            ConfigBuilder::new()
                .checksum_limits(10, 1)
                .checksum_queue_timeout(Duration::from_secs(30))
                .pool_size(2)
                .finish(),
        );
        let catalog = Arc::new(MemoryCatalog::new());
        let mut contents = HashMap::new();
        for &(path, server) in files {
            let stat = track!(catalog.create_entry(path, S_IFREG | 0o644, 0, 0))?;
            let rfn = format!("{}:/srv/fs1{}", server, path);
            let mut replica = Replica::new(stat.ino, server, &rfn);
            replica.status = ReplicaStatus::Available;
            track!(catalog.add_replica(&replica))?;
            contents.insert(rfn, b"Wikipedia".to_vec());
        }
        let readers = Contents(Arc::new(contents));
        let service = track!(ChecksumService::new(&ctx, Arc::clone(&catalog), readers))?;
        Ok((service, catalog))
    }

    #[test]
    fn checksums_are_computed_in_background() -> TestResult {
        let (service, _catalog) = track!(setup(&[("/f", "disk01")]))?;
        let ctx = request();

        let e = service.get_checksum(&ctx, "/f", "AD", false).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InProgress));
        let e = service.get_checksum(&ctx, "/f", "adler32", false).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InProgress));
        assert_eq!(service.queue().n_total(), 1);

        assert_eq!(service.tick(Instant::now()), 1);
        assert_eq!(service.queue().n_total(), 0);
        assert_eq!(track!(service.get_checksum(&ctx, "/f", "AD", false))?, "11e60398");
        assert_eq!(service.readers().capacity(), 2);
        assert_eq!(service.readers().in_use(), 0);

        let e = service.get_checksum(&ctx, "/f", "AD", true).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InProgress));
        Ok(())
    }

    #[test]
    fn per_server_limits_are_honored() -> TestResult {
        let (service, _catalog) =
            track!(setup(&[("/a", "disk01"), ("/b", "disk01"), ("/c", "disk02")]))?;
        let ctx = request();
        for path in &["/a", "/b", "/c"] {
            let _ = service.get_checksum(&ctx, path, "AD", false);
        }
        assert_eq!(service.queue().n_waiting(), 3);

        // disk01の2件目は次回に持ち越される
        assert_eq!(service.tick(Instant::now()), 2);
        assert_eq!(service.queue().n_waiting(), 1);
        assert_eq!(service.tick(Instant::now()), 1);
        Ok(())
    }

    #[test]
    fn abandoned_tasks_expire() -> TestResult {
        let (service, catalog) = track!(setup(&[("/f", "disk01")]))?;
        let ctx = request();
        let _ = service.get_checksum(&ctx, "/f", "AD", false);

        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(service.tick(later), 0);
        assert_eq!(service.queue().n_total(), 0);
        assert!(service.lock_tasks().is_empty());
        assert_eq!(catalog.calls("set_xattr"), 0);
        Ok(())
    }

    #[test]
    fn unknown_types_and_missing_replicas() -> TestResult {
        let (service, catalog) = track!(setup(&[]))?;
        let ctx = request();
        track!(catalog.create_entry("/empty", S_IFREG | 0o644, 0, 0))?;

        let e = service.get_checksum(&ctx, "/empty", "md5", false).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InvalidInput));
        let e = service.get_checksum(&ctx, "/empty", "AD", false).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::NoReplicasExist));
        Ok(())
    }

    #[test]
    fn requests_and_ticks_can_run_concurrently() -> TestResult {
        let files = [
            ("/a", "disk01"),
            ("/b", "disk01"),
            ("/c", "disk02"),
            ("/d", "disk02"),
            ("/e", "disk03"),
        ];
        let (service, _catalog) = track!(setup(&files))?;
        let service = Arc::new(service);
        let done = Arc::new(AtomicBool::new(false));

        let ticker = {
            let service = service.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    service.tick(Instant::now());
                }
            })
        };
        let requesters = (0..4)
            .map(|t| {
                let service = service.clone();
                thread::spawn(move || {
                    let ctx = request();
                    for i in 0..200 {
                        let (path, _) = files[(t + i) % files.len()];
                        let result = service.get_checksum(&ctx, path, "AD", i % 3 == 0);
                        if let Ok(value) = result {
                            assert_eq!(value, "11e60398");
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in requesters {
            h.join().expect("join");
        }
        done.store(true, Ordering::SeqCst);
        ticker.join().expect("join");

        // 登録済みのタスクとキューの要素は常に一対一に対応する
        assert_eq!(service.lock_tasks().len(), service.queue().n_total());
        while service.queue().n_total() > 0 {
            service.tick(Instant::now());
        }
        assert!(service.lock_tasks().is_empty());
        assert_eq!(service.readers().in_use(), 0);

        let ctx = request();
        for (path, _) in &files {
            assert_eq!(track!(service.get_checksum(&ctx, path, "AD", false))?, "11e60398");
        }
        Ok(())
    }
}
