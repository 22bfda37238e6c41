//! I/Oエンドポイント向けのアクセストークン.
//!
//! トークンの形式は以下の通り:
//!
//! ```text
//! BASE64(HMAC-SHA1(secret, "{pfn}\x1D{id}\x1D{expires}\x1D{write}")) "@" {expires} "@" {write}
//! ```
//!
//! - `expires`はUNIXエポックからの秒数で表した有効期限
//! - `write`は書き込み可能なら`1`、読み込み専用なら`0`
//!
//! 末尾の平文部分は検証前の解析用であり、値自体は署名対象にも含まれている.
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::{ErrorKind, Result};

/// 元の利用者の識別子を伝搬できないサーバ間転送用の、汎用利用者の識別子.
///
/// この識別子に対して発行されたトークンは、任意の識別子での検証に成功する.
pub const GENERIC_USER: &str = "nouser";

const FIELD_SEPARATOR: char = '\x1D';

/// トークンの検証結果.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenResult {
    /// 有効.
    Ok,

    /// 構造的に解析できない.
    Malformed,

    /// 署名が一致しない.
    Invalid,

    /// 有効期限切れ.
    Expired,

    /// 読み込み専用トークンで書き込みを要求した.
    InvalidMode,
}
impl TokenResult {
    /// 検証結果を`Result`に変換する.
    ///
    /// `Malformed`は`ErrorKind::InvalidInput`に、それ以外の失敗は`ErrorKind::PermissionDenied`になる.
    pub fn into_result(self) -> Result<()> {
        match self {
            TokenResult::Ok => Ok(()),
            TokenResult::Malformed => {
                track_panic!(ErrorKind::InvalidInput, "Malformed token")
            }
            TokenResult::Invalid => {
                track_panic!(ErrorKind::PermissionDenied, "Token does not validate")
            }
            TokenResult::Expired => track_panic!(ErrorKind::PermissionDenied, "Token expired"),
            TokenResult::InvalidMode => {
                track_panic!(ErrorKind::PermissionDenied, "Token not valid for writing")
            }
        }
    }
}

/// `lifetime`の間有効なトークンを発行する.
pub fn generate_token(id: &str, pfn: &str, secret: &str, lifetime: Duration, write: bool) -> String {
    generate_token_until(id, pfn, secret, unix_now() + lifetime.as_secs(), write)
}

/// 有効期限(UNIXエポックからの秒数)を明示してトークンを発行する.
pub fn generate_token_until(id: &str, pfn: &str, secret: &str, expires: u64, write: bool) -> String {
    let signature = sign(id, pfn, secret, expires, write);
    format!(
        "{}@{}@{}",
        BASE64.encode(signature),
        expires,
        write as u8
    )
}

/// トークンを検証する.
///
/// 署名は、指定の識別子と`GENERIC_USER`のそれぞれについて検証され、いずれかが一致すれば良い.
pub fn validate_token(token: &str, id: &str, pfn: &str, secret: &str, write: bool) -> TokenResult {
    validate_token_at(unix_now(), token, id, pfn, secret, write)
}

/// 現在時刻(UNIXエポックからの秒数)を明示してトークンを検証する.
pub fn validate_token_at(
    now: u64,
    token: &str,
    id: &str,
    pfn: &str,
    secret: &str,
    write: bool,
) -> TokenResult {
    let mut fields = token.splitn(3, '@');
    let (signature, expires, token_for_write) = match (fields.next(), fields.next(), fields.next())
    {
        (Some(s), Some(e), Some(w)) => match (e.parse::<u64>(), w.parse::<u8>()) {
            (Ok(e), Ok(w)) => (s, e, w != 0),
            _ => return TokenResult::Malformed,
        },
        _ => return TokenResult::Malformed,
    };
    let signature = match BASE64.decode(signature) {
        Ok(s) => s,
        Err(_) => return TokenResult::Invalid,
    };

    let verified = [id, GENERIC_USER].iter().any(|id| {
        mac(id, pfn, secret, expires, token_for_write)
            .verify_slice(&signature)
            .is_ok()
    });
    if !verified {
        return TokenResult::Invalid;
    }
    if now >= expires {
        return TokenResult::Expired;
    }
    if write && !token_for_write {
        return TokenResult::InvalidMode;
    }
    TokenResult::Ok
}

fn sign(id: &str, pfn: &str, secret: &str, expires: u64, write: bool) -> Vec<u8> {
    mac(id, pfn, secret, expires, write)
        .finalize()
        .into_bytes()
        .to_vec()
}

fn mac(id: &str, pfn: &str, secret: &str, expires: u64, write: bool) -> Hmac<Sha1> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes()).expect("Never fails");
    let message = format!(
        "{pfn}{sep}{id}{sep}{expires}{sep}{write}",
        pfn = pfn,
        id = id,
        expires = expires,
        write = write as u8,
        sep = FIELD_SEPARATOR
    );
    mac.update(message.as_bytes());
    mac
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
