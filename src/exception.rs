// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了资源服务器在挂载、监听和请求处理过程中可能出现的各类异常情况。
//!
//! - **启动期错误**（监听建立失败、配置非法）直接返回给调用者，由调用者决定是否中止启动。
//! - **请求期错误**（文件缺失、路径非法、读取失败）通过 [`Exception::status_code`]
//!   映射为明确的 HTTP 状态码，保证每个请求都会得到响应。

use std::fmt;
use std::io;

/// 资源服务器处理过程中发生的异常类型。
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Exception {
    /// 客户端发送的请求字节流无法解析为合法的 UTF-8 字符串。
    RequestIsNotUtf8,
    /// 请求行格式错误，或使用了服务器无法识别的 HTTP 方法。
    UnSupportedRequestMethod,
    /// 客户端使用了服务器不支持的 HTTP 协议版本。
    UnsupportedHttpVersion,
    /// 方法可以识别，但静态资源不接受（例如 POST）。对应 `405`。
    MethodNotAllowed,
    /// 挂载目录下不存在所请求的文件。对应 `404 Not Found`。
    FileNotFound,
    /// 请求路径非法（空字节、符号链接逃逸等）。对应 `400 Bad Request`。
    InvalidPath,
    /// 文件存在但读取失败。对应 `500 Internal Server Error`。
    IoFailure,
    /// 无法为目录建立文件系统监听（权限不足、inotify 句柄耗尽等）。
    WatchSetupFailed,
    /// 配置文件缺失或无法解析。
    InvalidConfig,
    /// 生成 URL 时使用了未挂载的前缀。
    UnknownMount,
}

use Exception::*;

impl Exception {
    /// 将异常映射为响应状态码。
    pub fn status_code(&self) -> u16 {
        match self {
            RequestIsNotUtf8 | UnSupportedRequestMethod | UnsupportedHttpVersion | InvalidPath => {
                400
            }
            MethodNotAllowed => 405,
            FileNotFound | UnknownMount => 404,
            IoFailure | WatchSetupFailed | InvalidConfig => 500,
        }
    }
}

impl From<io::Error> for Exception {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => FileNotFound,
            _ => IoFailure,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestIsNotUtf8 => write!(f, "Request bytes can't be parsed in UTF-8"),
            UnSupportedRequestMethod => write!(f, "Unsupported request method"),
            UnsupportedHttpVersion => write!(f, "Unsupported HTTP version"),
            MethodNotAllowed => write!(f, "Method not allowed (405)"),
            FileNotFound => write!(f, "File not found (404)"),
            InvalidPath => write!(f, "Invalid path (400)"),
            IoFailure => write!(f, "I/O failure while reading file (500)"),
            WatchSetupFailed => write!(f, "Couldn't establish filesystem watch"),
            InvalidConfig => write!(f, "Invalid configuration"),
            UnknownMount => write!(f, "No mount registered for prefix"),
        }
    }
}
