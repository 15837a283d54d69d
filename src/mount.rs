//! 挂载点：URL 前缀与文件系统目录的绑定，以及请求路径到文件的安全映射。

use std::path::{Component, Path, PathBuf};

use log::{debug, error, warn};

use crate::{
    exception::Exception,
    param::{INDEX_FILE, PASSTHROUGH_PATHS, RESERVED_MARKERS},
};

#[derive(Debug, Clone)]
pub struct Mount {
    prefix: String,
    root: PathBuf,
}

impl Mount {
    /// 创建挂载点。目录会被规范化为绝对路径，必须存在且是目录。
    pub fn new(prefix: &str, dir: impl AsRef<Path>) -> Result<Self, Exception> {
        let dir = dir.as_ref();
        let root = match dir.canonicalize() {
            Ok(r) => r,
            Err(e) => {
                error!("无法解析挂载目录{}：{}", dir.display(), e);
                return Err(Exception::InvalidConfig);
            }
        };
        if !root.is_dir() {
            error!("挂载路径{}不是目录", root.display());
            return Err(Exception::InvalidConfig);
        }
        Ok(Self {
            prefix: normalize_prefix(prefix),
            root,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 拼接前缀与相对名得到公开 URL（不含查询串）
    pub fn url_for(&self, name: &str) -> String {
        join_url(&self.prefix, name)
    }

    /// 挂载根目录下文件的相对名（以 `/` 分隔）。不在根目录下或就是根目录本身时返回 `None`。
    pub fn relative_name(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(s) => segments.push(s.to_str()?.to_string()),
                _ => return None,
            }
        }
        if segments.is_empty() {
            return None;
        }
        Some(segments.join("/"))
    }

    /// 请求路径是否属于该挂载点（直通路径总是属于）
    pub fn matches(&self, request_path: &str) -> bool {
        self.strip(request_path).is_some()
    }

    /// 剥离挂载前缀，返回挂载目录内的相对请求路径
    fn strip<'a>(&self, request_path: &'a str) -> Option<&'a str> {
        if is_passthrough(request_path) {
            return Some(request_path);
        }
        if self.prefix == "/" {
            return Some(request_path);
        }
        let rest = request_path.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() || rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    /// 将请求路径映射为挂载目录内存在的文件。
    ///
    /// 解码后的路径经过词法清理，`..` 在根目录处截断；规范化后仍需位于根目录内，
    /// 防止符号链接逃逸。目录映射到其中的 `index.html`。
    pub fn resolve(&self, request_path: &str) -> Result<PathBuf, Exception> {
        let stripped = self.strip(request_path).ok_or(Exception::FileNotFound)?;
        let decoded = match urlencoding::decode(stripped) {
            Ok(d) => d,
            Err(_) => {
                warn!("请求路径{}解码后不是合法的UTF-8", request_path);
                return Err(Exception::InvalidPath);
            }
        };
        let relative = clean_path(&decoded)?;
        let mut full_path = self.root.join(relative);
        debug!("映射物理路径：{}", full_path.display());

        if full_path.is_dir() {
            full_path = full_path.join(INDEX_FILE);
        }
        if !full_path.is_file() {
            return Err(Exception::FileNotFound);
        }

        let canonical = full_path.canonicalize()?;
        if !canonical.starts_with(&self.root) {
            warn!(
                "符号链接逃逸尝试：{}解析到挂载目录{}之外",
                full_path.display(),
                self.root.display()
            );
            return Err(Exception::InvalidPath);
        }
        Ok(canonical)
    }
}

/// 前缀总以 `/` 开头，除根前缀外不以 `/` 结尾
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

pub fn join_url(prefix: &str, name: &str) -> String {
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        name.trim_start_matches('/')
    )
}

/// favicon、robots.txt 以及首段以保留字符开头的路径不剥离前缀
pub fn is_passthrough(request_path: &str) -> bool {
    if PASSTHROUGH_PATHS.contains(&request_path) {
        return true;
    }
    request_path
        .strip_prefix('/')
        .and_then(|rest| rest.chars().next())
        .map_or(false, |c| RESERVED_MARKERS.contains(&c))
}

/// 词法清理：丢弃空段和 `.`，`..` 回退一级但不会越过根目录
pub fn clean_segments(path: &str) -> Result<Vec<&str>, Exception> {
    if path.contains('\0') {
        return Err(Exception::InvalidPath);
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(|c| c == '/' || c == '\\') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    Ok(segments)
}

pub fn clean_path(path: &str) -> Result<PathBuf, Exception> {
    Ok(clean_segments(path)?.iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Mount) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("css")).unwrap();
        fs::write(dir.path().join("css/app.css"), "body{}").unwrap();
        fs::write(dir.path().join("favicon.ico"), "icon").unwrap();
        fs::write(dir.path().join("robots.txt"), "User-agent: *").unwrap();
        fs::write(dir.path().join("_legacy.js"), "old").unwrap();
        let mount = Mount::new("/static/", dir.path()).unwrap();
        (dir, mount)
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("static"), "/static");
        assert_eq!(normalize_prefix("/static/"), "/static");
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix(""), "/");
    }

    #[test]
    fn test_url_for() {
        let (_dir, mount) = fixture();
        assert_eq!(mount.url_for("css/app.css"), "/static/css/app.css");
        assert_eq!(mount.url_for("/css/app.css"), "/static/css/app.css");
        assert_eq!(join_url("/", "a.css"), "/a.css");
    }

    #[test]
    fn test_relative_name() {
        let (_dir, mount) = fixture();
        let file = mount.root().join("css/app.css");
        assert_eq!(mount.relative_name(&file), Some("css/app.css".to_string()));
        assert_eq!(mount.relative_name(mount.root()), None);
        assert_eq!(mount.relative_name(Path::new("/etc/passwd")), None);
    }

    #[test]
    fn test_resolve_strips_prefix() {
        let (_dir, mount) = fixture();
        let path = mount.resolve("/static/css/app.css").unwrap();
        assert_eq!(path, mount.root().join("css/app.css"));
    }

    #[test]
    fn test_prefix_matches_on_segment_boundary() {
        let (_dir, mount) = fixture();
        assert!(mount.matches("/static/css/app.css"));
        assert!(!mount.matches("/staticfiles/css/app.css"));
        assert!(!mount.matches("/other/app.css"));
    }

    #[test]
    fn test_passthrough_paths() {
        let (_dir, mount) = fixture();
        assert_eq!(
            mount.resolve("/favicon.ico").unwrap(),
            mount.root().join("favicon.ico")
        );
        assert_eq!(
            mount.resolve("/robots.txt").unwrap(),
            mount.root().join("robots.txt")
        );
        assert_eq!(
            mount.resolve("/_legacy.js").unwrap(),
            mount.root().join("_legacy.js")
        );
        assert!(is_passthrough("/~user"));
        assert!(!is_passthrough("/static/_x.js"));
    }

    #[test]
    fn test_traversal_is_clamped() {
        let (_dir, mount) = fixture();
        assert_eq!(
            mount.resolve("/static/../../css/app.css").unwrap(),
            mount.root().join("css/app.css")
        );
        assert_eq!(
            mount.resolve("/static/%2e%2e/%2e%2e/etc/passwd").unwrap_err(),
            Exception::FileNotFound
        );
        assert_eq!(
            mount.resolve("/static/..%2f..%2fetc%2fpasswd").unwrap_err(),
            Exception::FileNotFound
        );
    }

    #[test]
    fn test_null_byte_rejected() {
        let (_dir, mount) = fixture();
        assert_eq!(
            mount.resolve("/static/css/app.css%00.png").unwrap_err(),
            Exception::InvalidPath
        );
    }

    #[test]
    fn test_directory_without_index() {
        let (_dir, mount) = fixture();
        assert_eq!(mount.resolve("/static/css").unwrap_err(), Exception::FileNotFound);
    }

    #[test]
    fn test_directory_with_index() {
        let (_dir, mount) = fixture();
        fs::write(mount.root().join("css/index.html"), "<p>").unwrap();
        assert_eq!(
            mount.resolve("/static/css/").unwrap(),
            mount.root().join("css/index.html")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let (_dir, mount) = fixture();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path(), mount.root().join("link")).unwrap();

        assert_eq!(
            mount.resolve("/static/link/secret.txt").unwrap_err(),
            Exception::InvalidPath
        );
    }

    #[test]
    fn test_missing_mount_dir() {
        let dir = TempDir::new().unwrap();
        let result = Mount::new("/static", dir.path().join("nope"));
        assert_eq!(result.unwrap_err(), Exception::InvalidConfig);
    }

    proptest! {
        #[test]
        fn prop_clean_path_never_escapes(segments in proptest::collection::vec(
            prop_oneof![Just("..".to_string()), Just(".".to_string()), "[a-z]{1,6}"],
            0..12,
        )) {
            let raw = segments.join("/");
            let cleaned = clean_path(&raw).unwrap();
            for component in cleaned.components() {
                prop_assert!(matches!(component, Component::Normal(_)));
            }
        }
    }
}
