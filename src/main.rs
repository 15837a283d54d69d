// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 静态资源服务器
//!
//! 基于 Tokio 运行时的静态资源服务器：
//! - 按配置挂载多个目录，后台监听目录变更并维护内容指纹
//! - 带 `?v=<指纹>` 的请求返回长期缓存头
//! - 支持条件请求、范围请求与压缩
//! - 后台管理控制台（stop / status / mounts / help）

use assetserver::{config::Config, exception::Exception, request::Request, response::Response, AssetServer};

use log::{debug, error, info, warn, LevelFilter};
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    runtime::Builder,
};
use tokio_util::sync::CancellationToken;

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

const LOG_CONFIG: &str = "config/log4rs.yaml";
const SERVER_CONFIG: &str = "config/development.toml";

/// 请求报文上限，资源请求不需要请求体
const REQUEST_BUFFER_SIZE: usize = 8192;

/// 等待客户端发送请求的最长时间
const READ_TIMEOUT: Duration = Duration::from_secs(10);

fn main() {
    init_logging();

    let config = match Config::from_toml(SERVER_CONFIG) {
        Ok(c) => c,
        Err(e) => {
            error!("无法载入配置文件{}：{}", SERVER_CONFIG, e);
            std::process::exit(1);
        }
    };
    info!("配置文件已载入");

    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
    {
        Ok(r) => r,
        Err(e) => {
            error!("无法创建异步运行时：{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        error!("服务器启动失败：{}", e);
        std::process::exit(1);
    }
}

/// 优先使用 YAML 日志配置，缺失时退回到控制台输出
fn init_logging() {
    let Err(e) = log4rs::init_file(LOG_CONFIG, Default::default()) else {
        return;
    };
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {m}{n}",
        )))
        .build();
    let fallback = log4rs::config::Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info));
    match fallback.map(log4rs::init_config) {
        Ok(Ok(_)) => warn!("无法载入{}（{}），使用默认控制台日志", LOG_CONFIG, e),
        Ok(Err(e)) => eprintln!("日志系统初始化失败：{}", e),
        Err(e) => eprintln!("日志配置构建失败：{}", e),
    }
}

async fn serve(config: Config) -> Result<(), Exception> {
    let server = Arc::new(AssetServer::from_config(&config)?);
    for (prefix, dir, _) in server.mounts() {
        info!("挂载点 {} -> {}", prefix, dir.display());
    }

    let address = match config.local() {
        true => Ipv4Addr::new(127, 0, 0, 1),
        false => Ipv4Addr::new(0, 0, 0, 0),
    };
    let socket = SocketAddrV4::new(address, config.port());
    let listener = match TcpListener::bind(socket).await {
        Ok(l) => l,
        Err(e) => {
            error!("无法绑定{}：{}", socket, e);
            return Err(Exception::IoFailure);
        }
    };
    info!("服务端在{}上监听Socket连接", socket);

    let shutdown = CancellationToken::new();
    let active_connection = Arc::new(AtomicU32::new(0));

    tokio::spawn(console(
        Arc::clone(&server),
        shutdown.clone(),
        Arc::clone(&active_connection),
    ));

    let mut id: u128 = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("主循环接收到停机指令，正在退出...");
                break;
            }
            accepted = listener.accept() => {
                let (mut stream, addr) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("接受连接失败：{}", e);
                        continue;
                    }
                };
                debug!("[ID{}]新的连接：{}", id, addr);

                let server = Arc::clone(&server);
                let active_connection = Arc::clone(&active_connection);
                tokio::spawn(async move {
                    active_connection.fetch_add(1, Ordering::SeqCst);
                    handle_connection(&mut stream, id, server).await;
                    active_connection.fetch_sub(1, Ordering::SeqCst);
                });
                id += 1;
            }
        }
    }

    server.shutdown();
    Ok(())
}

/// 后台管理控制台，从标准输入读取指令
async fn console(
    server: Arc<AssetServer>,
    shutdown: CancellationToken,
    active_connection: Arc<AtomicU32>,
) {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    loop {
        input.clear();
        match reader.read_line(&mut input).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        match input.trim() {
            "stop" => {
                println!("停机指令已激活，服务器即将关闭...");
                shutdown.cancel();
                break;
            }
            "status" => {
                println!("== Assetserver 状态 ===");
                println!("当前活跃连接数: {}", active_connection.load(Ordering::SeqCst));
                println!("已缓存指纹数: {}", server.hashes().len());
                println!("======================");
            }
            "mounts" => {
                println!("== 挂载点 ==");
                for (prefix, dir, running) in server.mounts() {
                    let state = if running { "监听中" } else { "已停止" };
                    println!("{} -> {} ({})", prefix, dir.display(), state);
                }
                println!("============");
            }
            "help" => {
                println!("== Assetserver Help ==");
                println!("stop   - 发出停机信号");
                println!("status - 查看当前服务器运行状态");
                println!("mounts - 列出挂载点及监听状态");
                println!("help   - 显示此帮助信息");
                println!("======================");
            }
            "" => {}
            cmd => println!("无效的命令：{}", cmd),
        }
    }
}

async fn handle_connection(stream: &mut TcpStream, id: u128, server: Arc<AssetServer>) {
    let mut buffer = vec![0u8; REQUEST_BUFFER_SIZE];
    let n = match tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buffer)).await {
        Ok(Ok(0)) => return,
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            error!("[ID{}]读取TCPStream时遇到错误: {}", id, e);
            return;
        }
        Err(_) => {
            warn!("[ID{}]等待请求超时，关闭连接", id);
            return;
        }
    };
    let start_time = Instant::now();

    let request = match Request::try_from(&buffer[..n], id) {
        Ok(r) => r,
        Err(e) => {
            warn!("[ID{}]解析HTTP请求失败: {}", id, e);
            let response = Response::from_exception(e, None, id);
            send_response(stream, &response.as_bytes(), id).await;
            return;
        }
    };

    // 文件读取与哈希计算是阻塞操作
    let response = {
        let owned = request.clone();
        match tokio::task::spawn_blocking(move || server.handle(&owned, id)).await {
            Ok(r) => r,
            Err(e) => {
                error!("[ID{}]请求处理任务异常：{}", id, e);
                Response::from_exception(Exception::IoFailure, Some(&request), id)
            }
        }
    };

    info!(
        "[ID{}] {}, {}, {}, {}, {}, {}ms",
        id,
        request.version(),
        request.path(),
        request.method(),
        response.status_code(),
        request.user_agent(),
        start_time.elapsed().as_millis(),
    );

    send_response(stream, &response.as_bytes(), id).await;
}

/// 写出响应并刷新，失败时记录日志并返回 `false`
async fn send_response<W: AsyncWrite + Unpin>(stream: &mut W, bytes: &[u8], id: u128) -> bool {
    if let Err(e) = stream.write_all(bytes).await {
        error!("[ID{}]发送响应失败: {}", id, e);
        return false;
    }
    if let Err(e) = stream.flush().await {
        debug!("[ID{}]刷新TCPStream失败: {}", id, e);
        return false;
    }
    true
}
