//! I/Oの対象を表すURLと`Location`.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, ErrorKind, Result};

/// URL.
///
/// `scheme://domain[:port]/path?key=value&...`形式に加えて、
/// レプリカ名で使われる`domain:/path`形式と、パスのみの形式に対応している.
///
/// クエリパラメータの値はエスケープされない.
/// そのため`&`や`?`を含む値は、文字列化した後にパースし直しても元には戻らない.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Url {
    /// スキーム (空の場合もある).
    pub scheme: String,

    /// ホスト名.
    pub domain: String,

    /// ポート番号 (`0`なら未指定).
    pub port: u16,

    /// パス.
    pub path: String,

    /// クエリパラメータ.
    pub query: BTreeMap<String, String>,
}
impl Url {
    /// 文字列をパースして`Url`インスタンスを生成する.
    pub fn parse(s: &str) -> Result<Self> {
        let mut url = Url::default();
        let rest = if let Some(i) = s.find("://") {
            url.scheme = s[..i].to_owned();
            track_assert!(!url.scheme.is_empty(), ErrorKind::InvalidInput; s);
            let rest = &s[i + 3..];
            let end = rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len());
            track!(url.set_authority(&rest[..end], s))?;
            &rest[end..]
        } else if let Some(i) = s.find(":/").filter(|_| !s.starts_with('/')) {
            // `domain:/path`
            track!(url.set_authority(&s[..i], s))?;
            &s[i + 1..]
        } else {
            s
        };

        let (path, query) = match rest.find('?') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };
        url.path = path.to_owned();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = match pair.find('=') {
                Some(i) => (&pair[..i], &pair[i + 1..]),
                None => (pair, ""),
            };
            url.query.insert(k.to_owned(), v.to_owned());
        }
        Ok(url)
    }

    /// ホスト名とパスから`Url`インスタンスを生成する.
    pub fn with_domain_and_path(domain: &str, path: &str) -> Self {
        Url {
            domain: domain.to_owned(),
            path: path.to_owned(),
            ..Url::default()
        }
    }

    /// クエリパラメータの値を返す.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(|v| v.as_str())
    }

    fn set_authority(&mut self, authority: &str, whole: &str) -> Result<()> {
        match authority.rfind(':') {
            Some(i) => {
                self.domain = authority[..i].to_owned();
                self.port = track_assert_some!(
                    authority[i + 1..].parse().ok(),
                    ErrorKind::InvalidInput,
                    "Invalid port: {:?}",
                    whole
                );
            }
            None => self.domain = authority.to_owned(),
        }
        Ok(())
    }
}
impl FromStr for Url {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        track!(Url::parse(s))
    }
}
impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.scheme.is_empty() {
            write!(f, "{}://{}", self.scheme, self.domain)?;
            if self.port != 0 {
                write!(f, ":{}", self.port)?;
            }
        } else if !self.domain.is_empty() {
            write!(f, "{}:", self.domain)?;
        }
        write!(f, "{}", self.path)?;
        for (i, (k, v)) in self.query.iter().enumerate() {
            write!(f, "{}{}={}", if i == 0 { '?' } else { '&' }, k, v)?;
        }
        Ok(())
    }
}

/// パスを構成要素に分割する (空の要素は取り除かれる).
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// 構成要素を結合して絶対パスにする.
pub fn join_path<S: AsRef<str>>(components: &[S]) -> String {
    let mut path = String::new();
    for c in components {
        path.push('/');
        path.push_str(c.as_ref());
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// 連続するスラッシュと末尾のスラッシュを取り除く.
///
/// 相対パスは相対パスのまま返される.
pub fn normalize_path(path: &str) -> String {
    let joined = join_path(&split_path(path));
    if path.starts_with('/') {
        joined
    } else {
        joined.trim_start_matches('/').to_owned()
    }
}

/// I/O対象の断片.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 対象のURL.
    pub url: Url,

    /// 対象範囲の開始位置.
    pub offset: u64,

    /// 対象範囲のサイズ.
    pub size: u64,
}
impl Chunk {
    /// 新しい`Chunk`インスタンスを生成する.
    pub fn new(url: Url, offset: u64, size: u64) -> Self {
        Chunk { url, offset, size }
    }
}

/// 読み書きの対象を表す`Chunk`の列.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location(pub Vec<Chunk>);
impl Location {
    /// 単一の`Chunk`からなる`Location`を生成する.
    pub fn single(chunk: Chunk) -> Self {
        Location(vec![chunk])
    }

    /// 最初の`Chunk`を返す.
    pub fn first(&self) -> Option<&Chunk> {
        self.0.first()
    }

    /// `Chunk`が一つも含まれない場合には`true`を返す.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Chunk`の数を返す.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}
impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, c) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, "{} ({}-{})", c.url, c.offset, c.offset + c.size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;
    use crate::ErrorKind;

    #[test]
    fn parse_full_url() -> TestResult {
        let url = track!(Url::parse("https://disk01.example.org:1094/srv/fs1/f?sfn=/a/b&token=x@1@0"))?;
        assert_eq!(url.scheme, "https");
        assert_eq!(url.domain, "disk01.example.org");
        assert_eq!(url.port, 1094);
        assert_eq!(url.path, "/srv/fs1/f");
        assert_eq!(url.query_param("sfn"), Some("/a/b"));
        assert_eq!(url.query_param("token"), Some("x@1@0"));
        assert_eq!(
            url.to_string(),
            "https://disk01.example.org:1094/srv/fs1/f?sfn=/a/b&token=x@1@0"
        );
        Ok(())
    }

    #[test]
    fn parse_replica_names() -> TestResult {
        let url = track!(Url::parse("disk01:/srv/fs1/f"))?;
        assert_eq!(url.scheme, "");
        assert_eq!(url.domain, "disk01");
        assert_eq!(url.path, "/srv/fs1/f");
        assert_eq!(url.to_string(), "disk01:/srv/fs1/f");

        let url = track!(Url::parse("/just/a/path"))?;
        assert_eq!(url.domain, "");
        assert_eq!(url.path, "/just/a/path");

        let e = Url::parse("http://host:port/x").err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InvalidInput));
        Ok(())
    }

    #[test]
    fn query_values_are_not_escaped() -> TestResult {
        let mut url = Url::with_domain_and_path("disk01", "/srv/fs1/f");
        url.query.insert("sfn".to_owned(), "/a=b&c".to_owned());
        assert_eq!(url.to_string(), "disk01:/srv/fs1/f?sfn=/a=b&c");

        let parsed = track!(Url::parse(&url.to_string()))?;
        assert_eq!(parsed.query_param("sfn"), Some("/a=b"));
        assert_eq!(parsed.query_param("c"), Some(""));
        Ok(())
    }

    #[test]
    fn path_helpers() {
        assert_eq!(normalize_path("//srv//fs1///a/"), "/srv/fs1/a");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("a//b"), "a/b");
        assert_eq!(split_path("/a/b/"), ["a", "b"]);
        assert_eq!(join_path::<&str>(&[]), "/");
    }
}
