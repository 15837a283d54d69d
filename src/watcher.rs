//! 目录树变更监听。
//!
//! 每个挂载目录对应一个后台任务：启动时递归发现所有子目录并逐个订阅，
//! 之后把每个创建/修改/删除事件转交给回调 `(挂载根目录, 变更路径)`。
//! 任务绑定一个 `CancellationToken`，取消后立即退出。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use notify::{
    event::{AccessKind, AccessMode, ModifyKind},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::exception::Exception;

/// 通知线程与监听任务之间的通道容量
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// 变更回调：`(挂载根目录, 变更的绝对路径)`
pub type ChangeCallback = Arc<dyn Fn(&Path, &Path) + Send + Sync>;

pub struct WatchSubscription {
    root: PathBuf,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl WatchSubscription {
    /// 订阅 `root` 下的全部目录并启动后台监听任务。
    ///
    /// 任一目录订阅失败都会返回错误，挂载随之失败。必须在 tokio 运行时内调用。
    pub fn spawn(
        root: &Path,
        callback: ChangeCallback,
        token: CancellationToken,
    ) -> Result<Self, Exception> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<Event>| {
            if tx.blocking_send(res).is_err() {
                debug!("监听通道已关闭");
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                error!("无法初始化文件监听器：{}", e);
                return Err(Exception::WatchSetupFailed);
            }
        };

        let count = watch_tree(&mut watcher, root)?;
        info!("开始监听{}，共{}个目录", root.display(), count);

        let root = root.to_path_buf();
        let handle = tokio::spawn(watch_loop(
            watcher,
            rx,
            root.clone(),
            callback,
            token.clone(),
        ));
        Ok(Self {
            root,
            token,
            handle,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 请求后台任务退出
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 取消并等待后台任务结束
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("监听任务{}异常结束：{}", self.root.display(), e);
        }
    }
}

/// 递归订阅目录树中的每个目录，返回订阅的目录数
fn watch_tree(watcher: &mut RecommendedWatcher, dir: &Path) -> Result<usize, Exception> {
    let mut count = 0;
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                error!("遍历目录{}失败：{}", dir.display(), e);
                return Err(Exception::WatchSetupFailed);
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Err(e) = watcher.watch(entry.path(), RecursiveMode::NonRecursive) {
            error!("无法监听目录{}：{}", entry.path().display(), e);
            return Err(Exception::WatchSetupFailed);
        }
        count += 1;
    }
    Ok(count)
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Remove(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

/// 目录移入树内时报告为重命名而不是创建
fn adds_directory(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
    )
}

async fn watch_loop(
    mut watcher: RecommendedWatcher,
    mut rx: mpsc::Receiver<notify::Result<Event>>,
    root: PathBuf,
    callback: ChangeCallback,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("停止监听{}", root.display());
                break;
            }
            incoming = rx.recv() => {
                match incoming {
                    Some(Ok(event)) => {
                        if !is_relevant(&event.kind) {
                            continue;
                        }
                        for path in &event.paths {
                            // 新建或移入的子目录需要补充订阅
                            if adds_directory(&event.kind) && path.is_dir() {
                                if let Err(e) = watch_tree(&mut watcher, path) {
                                    warn!("无法监听新目录{}：{}", path.display(), e);
                                }
                                continue;
                            }
                            debug!("文件变更：{:?} {}", event.kind, path.display());
                            callback(&root, path);
                        }
                    }
                    Some(Err(e)) => {
                        // 不重试，后续事件可能丢失
                        error!("文件监听出错：{}", e);
                    }
                    None => {
                        warn!("监听通道关闭，停止监听{}", root.display());
                        break;
                    }
                }
            }
        }
    }
}
