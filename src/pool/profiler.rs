use slog::Logger;
use std::time::Instant;

use crate::catalog::Ino;
use crate::context::{Context, RequestContext};
use crate::location::Location;
use crate::metrics::ProfilerMetrics;
use crate::pool::{Pool, PoolAvailability, PoolManager};
use crate::Result;

/// 呼び出しを内側の`PoolManager`に転送し、その回数と所要時間を計測するデコレータ.
#[derive(Debug)]
pub struct ProfilingPoolManager<P> {
    inner: P,
    metrics: ProfilerMetrics,
    logger: Logger,
}
impl<P: PoolManager> ProfilingPoolManager<P> {
    /// 新しい`ProfilingPoolManager`インスタンスを生成する.
    pub fn new(ctx: &Context, inner: P) -> Self {
        ProfilingPoolManager {
            inner,
            metrics: ProfilerMetrics::new(ctx.metric_builder(), "pool_manager"),
            logger: ctx.root_logger().new(o!("component" => "pool_manager_profiler")),
        }
    }

    /// 内側の`PoolManager`への参照を返す.
    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// メトリクスを返す.
    pub fn metrics(&self) -> &ProfilerMetrics {
        &self.metrics
    }

    fn profile<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(&P) -> Result<T>,
    {
        let start = Instant::now();
        let result = f(&self.inner);
        let elapsed = start.elapsed();

        self.metrics.calls.increment();
        let _ = self.metrics.elapsed_seconds.add(elapsed.as_secs_f64());
        if result.is_err() {
            self.metrics.failures.increment();
        }
        debug!(self.logger, "Profiled a call";
               "operation" => operation,
               "elapsed_us" => elapsed.as_micros() as u64,
               "ok" => result.is_ok());
        result
    }
}
impl<P: PoolManager> PoolManager for ProfilingPoolManager<P> {
    fn get_pools(&self, availability: PoolAvailability) -> Result<Vec<Pool>> {
        self.profile("get_pools", |m| track!(m.get_pools(availability)))
    }

    fn get_pool(&self, name: &str) -> Result<Pool> {
        self.profile("get_pool", |m| track!(m.get_pool(name)))
    }

    fn new_pool(&self, ctx: &RequestContext, pool: &Pool) -> Result<()> {
        self.profile("new_pool", |m| track!(m.new_pool(ctx, pool)))
    }

    fn update_pool(&self, ctx: &RequestContext, pool: &Pool) -> Result<()> {
        self.profile("update_pool", |m| track!(m.update_pool(ctx, pool)))
    }

    fn delete_pool(&self, ctx: &RequestContext, pool: &Pool) -> Result<()> {
        self.profile("delete_pool", |m| track!(m.delete_pool(ctx, pool)))
    }

    fn where_to_read(&self, ctx: &RequestContext, path: &str) -> Result<Location> {
        self.profile("where_to_read", |m| track!(m.where_to_read(ctx, path)))
    }

    fn where_to_read_inode(&self, ctx: &RequestContext, ino: Ino) -> Result<Location> {
        self.profile("where_to_read_inode", |m| track!(m.where_to_read_inode(ctx, ino)))
    }

    fn where_to_write(&self, ctx: &RequestContext, path: &str) -> Result<Location> {
        self.profile("where_to_write", |m| track!(m.where_to_write(ctx, path)))
    }

    fn cancel_write(&self, ctx: &RequestContext, location: &Location) -> Result<()> {
        self.profile("cancel_write", |m| track!(m.cancel_write(ctx, location)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use trackable::result::TestResult;

    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::config::Config;
    use crate::pool::{MemoryPoolStore, PoolStore, StandardPoolManager};
    use crate::ErrorKind;

    #[test]
    fn calls_are_forwarded_and_counted() -> TestResult {
        let ctx = Context::new(Config::default());
        let inner = StandardPoolManager::new(MemoryPoolStore::new(), Arc::new(MemoryCatalog::new()));
        track!(inner.store().add_pool(&Pool::new("a", "filesystem")))?;
        let manager = ProfilingPoolManager::new(&ctx, inner);

        assert_eq!(track!(manager.get_pools(PoolAvailability::Any))?.len(), 1);
        let e = manager.get_pool("b").err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::NoSuchPool));

        assert_eq!(manager.metrics().calls(), 2);
        assert_eq!(manager.metrics().failures(), 1);
        assert!(manager.metrics().elapsed_seconds() >= 0.0);
        assert_eq!(manager.inner().store().calls("list_pools"), 1);
        Ok(())
    }
}
