//! 利用者の識別情報とセキュリティコンテキスト.
use crate::config::TokenId;
use crate::idmap::{IdMapCache, IdMapKey};
use crate::{ErrorKind, Result};

/// ユーザ情報.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    /// ユーザ名 (e.g., 証明書のDN).
    pub name: String,

    /// ユーザID.
    pub uid: u32,

    /// 利用禁止かどうか.
    pub banned: bool,
}

/// グループ情報.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    /// グループ名 (e.g., VO名).
    pub name: String,

    /// グループID.
    pub gid: u32,

    /// 利用禁止かどうか.
    pub banned: bool,
}

/// 認証層から渡される、利用者の資格情報.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityCredentials {
    /// クライアント名 (証明書のDN).
    pub client_name: String,

    /// クライアントのアドレス.
    pub remote_address: String,

    /// VOMSのFQAN群.
    pub fqans: Vec<String>,
}

/// 要求元の利用者を表すセキュリティコンテキスト.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    /// 資格情報.
    pub credentials: SecurityCredentials,

    /// 解決済みのユーザ情報.
    pub user: UserInfo,

    /// 解決済みのグループ群 (先頭がプライマリグループ).
    pub groups: Vec<GroupInfo>,
}
impl SecurityContext {
    /// 新しい`SecurityContext`インスタンスを生成する.
    pub fn new(credentials: SecurityCredentials, user: UserInfo, groups: Vec<GroupInfo>) -> Self {
        SecurityContext {
            credentials,
            user,
            groups,
        }
    }

    /// 管理者(uidが`0`、あるいはgidが`0`のグループに所属)かどうかを判定する.
    pub fn is_root(&self) -> bool {
        self.user.uid == 0 || has_group(&self.groups, 0)
    }

    /// トークンに埋め込む利用者識別子を返す.
    pub fn token_identity(&self, kind: TokenId) -> &str {
        match kind {
            TokenId::Ip => &self.credentials.remote_address,
            TokenId::Dn => &self.credentials.client_name,
        }
    }
}

/// `groups`の中に`gid`を持つグループが含まれているかどうかを判定する.
pub fn has_group(groups: &[GroupInfo], gid: u32) -> bool {
    groups.iter().any(|g| g.gid == gid)
}

/// FQAN(e.g., `/dteam/Role=NULL/Capability=NULL`)からVO名を取り出す.
pub fn vo_from_role(role: &str) -> &str {
    let vo = role.strip_prefix('/').unwrap_or(role);
    if let Some(i) = vo.find("/Role=NULL") {
        &vo[..i]
    } else if let Some(i) = vo.find("/Capability=NULL") {
        &vo[..i]
    } else {
        vo
    }
}

/// ユーザ・グループ情報を保持するバックエンド.
pub trait IdentityBackend {
    /// ユーザ情報を取得する.
    ///
    /// 存在しない場合には`ErrorKind::NoSuchUser`を返す.
    fn get_user(&self, name: &str) -> Result<UserInfo>;

    /// グループ情報を取得する.
    ///
    /// 存在しない場合には`ErrorKind::NoSuchGroup`を返す.
    fn get_group(&self, name: &str) -> Result<GroupInfo>;

    /// ユーザを新規に登録する.
    fn new_user(&self, name: &str) -> Result<UserInfo>;

    /// グループを新規に登録する.
    fn new_group(&self, name: &str) -> Result<GroupInfo>;

    /// グループ名が指定されなかった場合に使う、ユーザの既定のグループ名を返す.
    fn default_group_name(&self, username: &str) -> Result<String>;
}

/// ユーザ名とグループ名の列を、ユーザ情報とグループ情報の列に解決する.
///
/// 結果は`cache`に保持され、有効期間内であればバックエンドには問い合わせない.
///
/// 未登録のユーザおよびグループは自動的に登録される.
/// プライマリグループが利用禁止の場合には、ユーザも利用禁止として扱われる.
pub fn resolve_id_map<B: IdentityBackend + ?Sized>(
    backend: &B,
    cache: &IdMapCache,
    username: &str,
    groupnames: &[String],
) -> Result<(UserInfo, Vec<GroupInfo>)> {
    let key = IdMapKey::new(username, groupnames);
    if let Some(hit) = cache.lookup(&key) {
        return Ok(hit);
    }

    let mut user = match backend.get_user(username) {
        Ok(user) => user,
        Err(ref e) if *e.kind() == ErrorKind::NoSuchUser => track!(backend.new_user(username))?,
        Err(e) => return Err(track!(e)),
    };

    let mut groups = Vec::with_capacity(groupnames.len().max(1));
    if groupnames.is_empty() {
        let vo = track!(backend.default_group_name(username))?;
        groups.push(track!(get_or_create_group(backend, &vo))?);
    } else {
        for name in groupnames {
            groups.push(track!(get_or_create_group(backend, vo_from_role(name)))?);
        }
    }

    if groups.first().map_or(false, |g| g.banned) {
        user.banned = true;
    }
    cache.update(key, user.clone(), groups.clone());
    Ok((user, groups))
}

/// 資格情報から`SecurityContext`を生成する.
///
/// ユーザ名にはクライアント名が、グループ名の列にはFQAN群が使われる.
pub fn create_security_context<B: IdentityBackend + ?Sized>(
    backend: &B,
    cache: &IdMapCache,
    credentials: SecurityCredentials,
) -> Result<SecurityContext> {
    let (user, groups) = track!(resolve_id_map(
        backend,
        cache,
        &credentials.client_name,
        &credentials.fqans
    ))?;
    Ok(SecurityContext::new(credentials, user, groups))
}

fn get_or_create_group<B: IdentityBackend + ?Sized>(backend: &B, name: &str) -> Result<GroupInfo> {
    match backend.get_group(name) {
        Ok(group) => Ok(group),
        Err(ref e) if *e.kind() == ErrorKind::NoSuchGroup => track!(backend.new_group(name)),
        Err(e) => Err(track!(e)),
    }
}
