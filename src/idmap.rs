//! 利用者識別子から`{ユーザ, グループ群}`へのマッピングの短期キャッシュ.
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::security::{GroupInfo, UserInfo};

/// キャッシュのキー.
///
/// グループ名の並びは順序も含めて比較される.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdMapKey {
    /// ユーザ名.
    pub username: String,

    /// 要求されたグループ名の列.
    pub groupnames: Vec<String>,
}
impl IdMapKey {
    /// 新しい`IdMapKey`インスタンスを生成する.
    pub fn new(username: &str, groupnames: &[String]) -> Self {
        IdMapKey {
            username: username.to_owned(),
            groupnames: groupnames.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
struct IdMapEntry {
    user: UserInfo,
    groups: Vec<GroupInfo>,
    updated_at: Instant,
}

/// IDマッピングのキャッシュ.
///
/// 期限切れのエントリは参照時に「存在しない」ものとして扱われるだけで、能動的には削除されない.
#[derive(Debug)]
pub struct IdMapCache {
    ttl: Duration,
    entries: Mutex<HashMap<IdMapKey, IdMapEntry>>,
}
impl IdMapCache {
    /// 新しい`IdMapCache`インスタンスを生成する.
    pub fn new(ttl: Duration) -> Self {
        IdMapCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// エントリの有効期間を返す.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// キャッシュを参照する.
    pub fn lookup(&self, key: &IdMapKey) -> Option<(UserInfo, Vec<GroupInfo>)> {
        self.lookup_at(Instant::now(), key)
    }

    /// 現在時刻を明示してキャッシュを参照する.
    pub fn lookup_at(&self, now: Instant, key: &IdMapKey) -> Option<(UserInfo, Vec<GroupInfo>)> {
        let entries = self.lock_entries();
        let entry = entries.get(key)?;
        if now.saturating_duration_since(entry.updated_at) > self.ttl {
            return None;
        }
        Some((entry.user.clone(), entry.groups.clone()))
    }

    /// エントリを(無条件に)上書きする.
    pub fn update(&self, key: IdMapKey, user: UserInfo, groups: Vec<GroupInfo>) {
        self.update_at(Instant::now(), key, user, groups)
    }

    /// 現在時刻を明示してエントリを上書きする.
    pub fn update_at(&self, now: Instant, key: IdMapKey, user: UserInfo, groups: Vec<GroupInfo>) {
        let entry = IdMapEntry {
            user,
            groups,
            updated_at: now,
        };
        self.lock_entries().insert(key, entry);
    }

    /// 格納されているエントリ数を返す (期限切れのものも含む).
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// エントリが一つも無い場合には`true`を返す.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> MutexGuard<HashMap<IdMapKey, IdMapEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
impl Default for IdMapCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
