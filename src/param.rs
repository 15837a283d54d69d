// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 协议参数与常量模块
//!
//! 定义资源服务器使用的 HTTP 常量、MIME 映射表，以及指纹 URL 约定相关的常量。

use lazy_static::lazy_static;
use std::collections::HashMap;

/// 服务器名称标识，用于 HTTP 响应头的 `Server` 字段
pub const SERVER_NAME: &str = "shaneyale-assetserver";

/// HTTP 协议规定的换行符
pub const CRLF: &str = "\r\n";

/// 缓存破坏查询参数名，生成的 URL 形如 `/static/app.css?v=1a2b`
pub const CACHE_BUST_PARAM: &str = "v";

/// 内容指纹的固定宽度（十六进制字符数）
pub const HASH_TOKEN_LEN: usize = 4;

/// 带指纹请求的默认缓存时长：一年
pub const DEFAULT_MAX_AGE: u64 = 31_536_000;

/// `max-age` 上限（2^31 - 1 秒），超出的配置值被截断
pub const MAX_AGE_LIMIT: u64 = 2_147_483_647;

/// 请求目录时尝试返回的默认文件
pub const INDEX_FILE: &str = "index.html";

/// 不剥离挂载前缀、直接在挂载根目录下查找的路径
pub const PASSTHROUGH_PATHS: [&str; 2] = ["/favicon.ico", "/robots.txt"];

/// 首段以这些字符开头的路径同样直接在挂载根目录下查找，兼容旧有 URL 约定
pub const RESERVED_MARKERS: [char; 2] = ['_', '~'];

lazy_static! {
    /// 静态资源允许的 HTTP 方法，用于 `Allow` 响应头。
    pub static ref ALLOWED_METHODS: Vec<HttpRequestMethod> = {
        vec![
            HttpRequestMethod::Get,
            HttpRequestMethod::Head,
            HttpRequestMethod::Options,
        ]
    };
}

lazy_static! {
    /// 本服务器会产生的状态码及其原因短语。
    pub static ref STATUS_CODES: HashMap<u16, &'static str> = {
        let mut map = HashMap::new();
        map.insert(200, "OK");
        map.insert(204, "No Content");
        map.insert(206, "Partial Content");
        map.insert(304, "Not Modified");
        map.insert(400, "Bad Request");
        map.insert(403, "Forbidden");
        map.insert(404, "Not Found");
        map.insert(405, "Method Not Allowed");
        map.insert(416, "Range Not Satisfiable");
        map.insert(500, "Internal Server Error");
        map.insert(505, "HTTP Version Not Supported");
        map
    };
}

lazy_static! {
    /// 常见前端资源后缀到 MIME 类型的映射表。
    pub static ref MIME_TYPES: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        map.insert("avif", "image/avif");
        map.insert("bmp", "image/bmp");
        map.insert("css", "text/css;charset=utf-8");
        map.insert("csv", "text/csv");
        map.insert("eot", "application/vnd.ms-fontobject");
        map.insert("gif", "image/gif");
        map.insert("htm", "text/html;charset=utf-8");
        map.insert("html", "text/html;charset=utf-8");
        map.insert("ico", "image/x-icon");
        map.insert("jpeg", "image/jpeg");
        map.insert("jpg", "image/jpeg");
        map.insert("js", "text/javascript;charset=utf-8");
        map.insert("json", "application/json");
        map.insert("map", "application/json");
        map.insert("mjs", "text/javascript;charset=utf-8");
        map.insert("mp3", "audio/mpeg");
        map.insert("mp4", "video/mp4");
        map.insert("otf", "font/otf");
        map.insert("pdf", "application/pdf");
        map.insert("png", "image/png");
        map.insert("svg", "image/svg+xml");
        map.insert("ttf", "font/ttf");
        map.insert("txt", "text/plain;charset=utf-8");
        map.insert("wasm", "application/wasm");
        map.insert("webm", "video/webm");
        map.insert("webmanifest", "application/manifest+json");
        map.insert("webp", "image/webp");
        map.insert("woff", "font/woff");
        map.insert("woff2", "font/woff2");
        map.insert("xml", "text/xml");
        map.insert("zip", "application/zip");
        map
    };
}

/// 支持的 HTTP 协议版本
#[derive(Debug, Clone, Copy)]
pub enum HttpVersion {
    V1_0,
    V1_1,
}

/// 可以识别的 HTTP 请求方法
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HttpRequestMethod {
    Get,
    Head,
    Options,
    /// 可以解析，但静态资源会以 405 拒绝
    Post,
}

/// 支持的内容编码（压缩）格式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HttpEncoding {
    Gzip,
    Deflate,
    Br,
}

use std::fmt;

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HttpVersion::V1_0 => write!(f, "HTTP/1.0"),
            HttpVersion::V1_1 => write!(f, "HTTP/1.1"),
        }
    }
}

impl fmt::Display for HttpRequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HttpRequestMethod::Get => write!(f, "GET"),
            HttpRequestMethod::Head => write!(f, "HEAD"),
            HttpRequestMethod::Options => write!(f, "OPTIONS"),
            HttpRequestMethod::Post => write!(f, "POST"),
        }
    }
}

impl fmt::Display for HttpEncoding {
    /// `Content-Encoding` 头使用的标识符
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HttpEncoding::Gzip => write!(f, "gzip"),
            HttpEncoding::Deflate => write!(f, "deflate"),
            HttpEncoding::Br => write!(f, "br"),
        }
    }
}
