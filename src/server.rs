// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 资源服务器
//!
//! `AssetServer` 持有挂载表与指纹缓存，负责：
//! - 挂载目录并为其启动文件监听任务（监听回调刷新指纹缓存）；
//! - 为模板层生成带 `?v=<指纹>` 的资源 URL；
//! - 将请求路由到对应挂载点并构建响应，所有错误都映射为明确的状态码。
//!
//! 所有监听任务共享服务器的 `CancellationToken`，调用 [`AssetServer::shutdown`]
//! 或丢弃服务器对象即可停止它们。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{hash_of, HashCache},
    config::Config,
    exception::Exception,
    mount::{clean_segments, is_passthrough, join_url, normalize_prefix, Mount},
    param::{HttpRequestMethod, CACHE_BUST_PARAM, DEFAULT_MAX_AGE},
    request::Request,
    response::Response,
    watcher::{ChangeCallback, WatchSubscription},
};

/// 文件响应的可调参数
#[derive(Debug, Clone)]
pub struct ServeOptions {
    max_age: u64,
    enable_range_requests: bool,
    enable_compression: bool,
}

impl ServeOptions {
    pub fn max_age(&self) -> u64 {
        self.max_age
    }

    pub fn enable_range_requests(&self) -> bool {
        self.enable_range_requests
    }

    pub fn enable_compression(&self) -> bool {
        self.enable_compression
    }
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            enable_range_requests: true,
            enable_compression: true,
        }
    }
}

impl From<&Config> for ServeOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_age: config.max_age(),
            enable_range_requests: config.enable_range_requests(),
            enable_compression: config.enable_compression(),
        }
    }
}

/// 单个挂载点的请求处理器，由 [`AssetServer::mount`] 返回。
#[derive(Clone)]
pub struct MountHandler {
    mount: Arc<Mount>,
    registry: Arc<Registry>,
    options: Arc<ServeOptions>,
}

impl MountHandler {
    pub fn mount(&self) -> &Mount {
        &self.mount
    }

    /// 处理一个请求。文件缺失、路径非法、读取失败都以 `Err` 返回，由调用者映射状态码。
    pub fn serve(&self, request: &Request, id: u128) -> Result<Response, Exception> {
        match request.method() {
            HttpRequestMethod::Options => return Ok(Response::options()),
            HttpRequestMethod::Post => return Err(Exception::MethodNotAllowed),
            HttpRequestMethod::Get | HttpRequestMethod::Head => {}
        }
        let path = self.mount.resolve(request.path())?;
        debug!("[ID{}]{} -> {}", id, request.path(), path.display());
        Response::from_file(&path, request, id, &self.options)
    }

    /// 生成带指纹的公开 URL。
    ///
    /// 指纹取自该 URL 实际路由到的文件：URL 被更长的前缀遮蔽，
    /// 或本挂载已被替换时，使用当前负责该 URL 的挂载点。
    pub fn asset_url(&self, name: &str) -> String {
        match asset_path(self.mount.prefix(), name) {
            Ok(url) => self.registry.asset_url(url),
            Err(_) => {
                warn!("资源名{:?}非法，不附加指纹", name);
                self.mount.url_for(name)
            }
        }
    }
}

/// 拼接前缀与清理后的资源名
fn asset_path(prefix: &str, name: &str) -> Result<String, Exception> {
    let segments = clean_segments(name)?;
    Ok(join_url(&normalize_prefix(prefix), &segments.join("/")))
}

struct MountEntry {
    mount: Arc<Mount>,
    subscription: WatchSubscription,
}

/// 挂载表与指纹缓存。
///
/// 指纹条目只由 URL 当前路由到的挂载点写入：写入前在挂载表读锁下确认归属，
/// 挂载变更在写锁下完成并清除被接管的条目。加锁顺序总是先挂载表后指纹缓存。
struct Registry {
    mounts: RwLock<HashMap<String, MountEntry>>,
    hashes: HashCache,
}

/// 为请求路径选择挂载点：直通路径交给前缀最短的挂载点，其余取匹配的最长前缀。
fn route_in<'a>(mounts: &'a HashMap<String, MountEntry>, path: &str) -> Option<&'a Arc<Mount>> {
    let candidates = mounts.values().map(|entry| &entry.mount);
    if is_passthrough(path) {
        candidates.min_by_key(|m| m.prefix().len())
    } else {
        candidates
            .filter(|m| m.matches(path))
            .max_by_key(|m| m.prefix().len())
    }
}

fn owns(mounts: &HashMap<String, MountEntry>, mount: &Arc<Mount>, url: &str) -> bool {
    route_in(mounts, url).map_or(false, |m| Arc::ptr_eq(m, mount))
}

impl Registry {
    fn new() -> Self {
        Self {
            mounts: RwLock::new(HashMap::new()),
            hashes: HashCache::new(),
        }
    }

    fn mounts_read(&self) -> RwLockReadGuard<'_, HashMap<String, MountEntry>> {
        match self.mounts.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("挂载表读锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        }
    }

    fn mounts_write(&self) -> RwLockWriteGuard<'_, HashMap<String, MountEntry>> {
        match self.mounts.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("挂载表写锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        }
    }

    fn route(&self, path: &str) -> Option<Arc<Mount>> {
        route_in(&self.mounts_read(), path).cloned()
    }

    /// 查询或计算 URL 的指纹。文件读取在锁外进行；无法计算时返回不带指纹的 URL。
    fn asset_url(&self, url: String) -> String {
        if let Some(hash) = self.hashes.resolve(&url) {
            return format!("{}?{}={}", url, CACHE_BUST_PARAM, hash);
        }
        let Some(owner) = self.route(&url) else {
            warn!("{}没有对应的挂载点，生成的URL不带指纹", url);
            return url;
        };
        let hash = match owner.resolve(&url).and_then(|path| hash_of(&path)) {
            Ok(h) => h,
            Err(e) => {
                debug!("无法计算{}的指纹（{}），不附加指纹", url, e);
                return url;
            }
        };

        let mounts = self.mounts_read();
        if owns(&mounts, &owner, &url) {
            // 并发的首次查询不去重，最后写入者生效
            debug!("指纹计算完成：{} -> {}", url, hash);
            self.hashes.publish(&url, hash.clone());
        } else {
            // 计算期间挂载表发生变化，结果不写入缓存
            debug!("{}的挂载点已变更，指纹不写入缓存", url);
        }
        format!("{}?{}={}", url, CACHE_BUST_PARAM, hash)
    }

    /// 响应文件变更：重新计算对应 URL 的指纹，失败（文件已删除、读取出错）时移除条目及其下级条目。
    ///
    /// 挂载根目录之外的路径、目录本身，以及 URL 已归属其他挂载点的变更被忽略。
    fn invalidate(&self, mount: &Arc<Mount>, changed: &Path) {
        let Some(relative) = mount.relative_name(changed) else {
            debug!("变更路径{}不在挂载目录内，忽略", changed.display());
            return;
        };
        if changed.is_dir() {
            return;
        }
        let url = mount.url_for(&relative);
        let result = hash_of(changed);

        let mounts = self.mounts_read();
        if !owns(&mounts, mount, &url) {
            debug!("{}不由挂载点{}提供，忽略变更", url, mount.prefix());
            return;
        }
        match result {
            Ok(hash) => {
                debug!("文件变更，刷新指纹：{} -> {}", url, hash);
                self.hashes.publish(&url, hash);
            }
            Err(e) => {
                debug!("无法计算{}的指纹（{}），移除缓存条目", url, e);
                self.hashes.remove(&url);
                let scope = format!("{}/", url);
                self.hashes.retain(|u| !u.starts_with(&scope));
            }
        }
    }
}

pub struct AssetServer {
    options: Arc<ServeOptions>,
    registry: Arc<Registry>,
    token: CancellationToken,
}

impl AssetServer {
    pub fn new(options: ServeOptions) -> Self {
        Self {
            options: Arc::new(options),
            registry: Arc::new(Registry::new()),
            token: CancellationToken::new(),
        }
    }

    /// 按配置创建服务器并挂载所有目录，任一挂载失败即返回错误。
    pub fn from_config(config: &Config) -> Result<Self, Exception> {
        let server = Self::new(ServeOptions::from(config));
        for mount in config.mounts() {
            server.mount(&mount.prefix, &mount.dir)?;
        }
        Ok(server)
    }

    fn handler_for(&self, mount: Arc<Mount>) -> MountHandler {
        MountHandler {
            mount,
            registry: Arc::clone(&self.registry),
            options: Arc::clone(&self.options),
        }
    }

    /// 挂载目录并开始监听。
    ///
    /// 同一前缀重复挂载时新挂载生效，旧挂载的监听任务被取消。
    /// 新挂载接管的 URL（包括被它遮蔽的外层挂载的 URL）的指纹条目被清除。
    /// 必须在 tokio 运行时内调用。
    pub fn mount(&self, prefix: &str, dir: impl AsRef<Path>) -> Result<MountHandler, Exception> {
        let mount = Arc::new(Mount::new(prefix, dir)?);

        let registry = Arc::downgrade(&self.registry);
        let watched = Arc::clone(&mount);
        let callback: ChangeCallback = Arc::new(move |_root: &Path, changed: &Path| {
            if let Some(registry) = registry.upgrade() {
                registry.invalidate(&watched, changed);
            }
        });
        let subscription =
            WatchSubscription::spawn(mount.root(), callback, self.token.child_token())?;

        let previous = {
            let mut mounts = self.registry.mounts_write();
            let previous = mounts.insert(
                mount.prefix().to_string(),
                MountEntry {
                    mount: Arc::clone(&mount),
                    subscription,
                },
            );
            self.registry
                .hashes
                .retain(|url| !owns(&mounts, &mount, url));
            previous
        };
        if let Some(old) = previous {
            info!(
                "前缀{}被重新挂载，停止监听旧目录{}",
                mount.prefix(),
                old.subscription.root().display()
            );
            old.subscription.cancel();
        }
        info!("已挂载：{} -> {}", mount.prefix(), mount.root().display());
        Ok(self.handler_for(mount))
    }

    pub fn handler(&self, prefix: &str) -> Option<MountHandler> {
        let mount = self
            .registry
            .mounts_read()
            .get(&normalize_prefix(prefix))
            .map(|entry| Arc::clone(&entry.mount))?;
        Some(self.handler_for(mount))
    }

    /// 为模板层生成带指纹的资源 URL。URL 没有对应的挂载点时不带指纹。
    pub fn asset_url(&self, prefix: &str, name: &str) -> String {
        match asset_path(prefix, name) {
            Ok(url) => self.registry.asset_url(url),
            Err(_) => {
                warn!("资源名{:?}非法，不附加指纹", name);
                join_url(&normalize_prefix(prefix), name)
            }
        }
    }

    /// 为请求路径选择挂载点：直通路径交给前缀最短的挂载点，其余取匹配的最长前缀。
    pub fn route(&self, request_path: &str) -> Option<MountHandler> {
        let mount = self.registry.route(request_path)?;
        Some(self.handler_for(mount))
    }

    /// 处理请求并总是返回一个响应
    pub fn handle(&self, request: &Request, id: u128) -> Response {
        let result = match self.route(request.path()) {
            Some(handler) => handler.serve(request, id),
            None => Err(Exception::UnknownMount),
        };
        match result {
            Ok(response) => response,
            Err(e) => {
                match e {
                    Exception::IoFailure => error!("[ID{}]读取{}失败", id, request.path()),
                    _ => warn!("[ID{}]请求{}失败：{}", id, request.path(), e),
                }
                Response::from_exception(e, Some(request), id)
            }
        }
    }

    /// 当前挂载表：(前缀, 目录, 监听任务是否仍在运行)
    pub fn mounts(&self) -> Vec<(String, PathBuf, bool)> {
        let mut list: Vec<_> = self
            .registry
            .mounts_read()
            .iter()
            .map(|(prefix, entry)| {
                (
                    prefix.clone(),
                    entry.mount.root().to_path_buf(),
                    !entry.subscription.is_finished(),
                )
            })
            .collect();
        list.sort();
        list
    }

    pub fn hashes(&self) -> &HashCache {
        &self.registry.hashes
    }

    /// 停止所有监听任务。挂载表保留，仍可继续服务请求。
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("停止全部文件监听任务");
            self.token.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for AssetServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
