// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求解析模块
//!
//! 将 TCP 流中读取的原始字节解析为强类型的 `Request`：
//! 1. 请求行（方法、目标、版本），目标进一步拆分为路径与查询串。
//! 2. 资源服务需要的标头：`User-Agent`、`Accept-Encoding`、`Range`、`If-Modified-Since`。

use crate::{exception::Exception, param::*};
use chrono::{DateTime, Utc};
use log::error;

/// 一个 HTTP 请求的元数据（不含请求体）。
#[derive(Debug, Clone)]
pub struct Request {
    method: HttpRequestMethod,
    /// 去掉查询串之后的路径，保持原始（未解码）形式
    path: String,
    /// `?` 之后的部分
    query: Option<String>,
    version: HttpVersion,
    user_agent: String,
    accept_encoding: Vec<HttpEncoding>,
    /// 范围请求参数：(起始字节, 结束字节)，结束为 `None` 表示直到文件末尾
    range: Option<(u64, Option<u64>)>,
    if_modified_since: Option<DateTime<Utc>>,
}

impl Request {
    /// 从原始字节缓冲区构建 `Request`。
    ///
    /// `id` 是连接序号，仅用于日志追踪。
    pub fn try_from(buffer: &[u8], id: u128) -> Result<Self, Exception> {
        let request_string = match std::str::from_utf8(buffer) {
            Ok(s) => s,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };

        let mut lines = request_string.split(CRLF);
        let request_line = lines.next().unwrap_or_default();
        let parts: Vec<&str> = request_line.split(' ').collect();
        if parts.len() != 3 {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, request_line);
            return Err(Exception::UnSupportedRequestMethod);
        }

        let method = match parts[0].to_uppercase().as_str() {
            "GET" => HttpRequestMethod::Get,
            "HEAD" => HttpRequestMethod::Head,
            "OPTIONS" => HttpRequestMethod::Options,
            "POST" => HttpRequestMethod::Post,
            other => {
                error!("[ID{}]不支持的HTTP请求方法：{}", id, other);
                return Err(Exception::UnSupportedRequestMethod);
            }
        };

        let version = match parts[2].to_uppercase().as_str() {
            "HTTP/1.1" => HttpVersion::V1_1,
            "HTTP/1.0" => HttpVersion::V1_0,
            other => {
                error!("[ID{}]不支持的HTTP协议版本：{}", id, other);
                return Err(Exception::UnsupportedHttpVersion);
            }
        };

        let (path, query) = match parts[1].split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (parts[1].to_string(), None),
        };

        let mut user_agent = String::new();
        let mut accept_encoding = vec![];
        let mut range = None;
        let mut if_modified_since = None;
        for line in lines {
            // 空行之后是请求体
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.trim().to_lowercase().as_str() {
                "user-agent" => user_agent = value.to_string(),
                "accept-encoding" => accept_encoding = parse_encodings(value),
                "range" => range = parse_range(value),
                "if-modified-since" => {
                    if_modified_since = DateTime::parse_from_rfc2822(value)
                        .ok()
                        .map(|d| d.with_timezone(&Utc));
                }
                _ => {}
            }
        }

        Ok(Self {
            method,
            path,
            query,
            version,
            user_agent,
            accept_encoding,
            range,
            if_modified_since,
        })
    }
}

fn parse_encodings(value: &str) -> Vec<HttpEncoding> {
    let mut encodings = vec![];
    for token in value.split(',') {
        // 忽略 q 值，只关心是否声明
        let name = token.split(';').next().unwrap_or_default().trim();
        let encoding = match name {
            "gzip" => HttpEncoding::Gzip,
            "deflate" => HttpEncoding::Deflate,
            "br" => HttpEncoding::Br,
            _ => continue,
        };
        if !encodings.contains(&encoding) {
            encodings.push(encoding);
        }
    }
    encodings
}

/// 只支持单一区间 `bytes=start-end` / `bytes=start-`
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = match end.trim() {
        "" => None,
        e => Some(e.parse::<u64>().ok()?),
    };
    Some((start, end))
}

impl Request {
    pub fn version(&self) -> &HttpVersion {
        &self.version
    }

    /// 请求路径（不含查询串）
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// 查找查询串中的参数值。参数存在但无值时返回空串。
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
    }

    /// 请求是否携带缓存破坏参数
    pub fn is_cache_busted(&self) -> bool {
        self.query_param(CACHE_BUST_PARAM).is_some()
    }

    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn accept_encoding(&self) -> &[HttpEncoding] {
        &self.accept_encoding
    }

    pub fn range(&self) -> Option<(u64, Option<u64>)> {
        self.range
    }

    pub fn if_modified_since(&self) -> Option<DateTime<Utc>> {
        self.if_modified_since
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Request, Exception> {
        Request::try_from(raw.as_bytes(), 0)
    }

    #[test]
    fn test_parse_get_request() {
        let request = parse(
            "GET /static/app.css HTTP/1.1\r\nHost: localhost:7878\r\nUser-Agent: Test-Browser\r\nAccept-Encoding: gzip, deflate, br\r\n\r\n",
        )
        .unwrap();

        assert_eq!(request.method(), HttpRequestMethod::Get);
        assert_eq!(request.path(), "/static/app.css");
        assert_eq!(request.query(), None);
        assert_eq!(request.user_agent(), "Test-Browser");
        assert_eq!(
            request.accept_encoding(),
            &[HttpEncoding::Gzip, HttpEncoding::Deflate, HttpEncoding::Br]
        );
    }

    #[test]
    fn test_cache_bust_query() {
        let request = parse("GET /static/app.css?v=1a2b HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        assert_eq!(request.path(), "/static/app.css");
        assert_eq!(request.query_param("v"), Some("1a2b"));
        assert!(request.is_cache_busted());
    }

    #[test]
    fn test_query_without_cache_bust() {
        let request = parse("GET /a.js?x=1&vv=2 HTTP/1.1\r\n\r\n").unwrap();

        assert!(!request.is_cache_busted());
        assert_eq!(request.query_param("x"), Some("1"));
    }

    #[test]
    fn test_bare_cache_bust_flag() {
        let request = parse("GET /a.js?v HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.query_param("v"), Some(""));
        assert!(request.is_cache_busted());
    }

    #[test]
    fn test_parse_range() {
        let request = parse("GET /a.bin HTTP/1.1\r\nRange: bytes=10-19\r\n\r\n").unwrap();
        assert_eq!(request.range(), Some((10, Some(19))));

        let request = parse("GET /a.bin HTTP/1.1\r\nrange: bytes=5-\r\n\r\n").unwrap();
        assert_eq!(request.range(), Some((5, None)));

        let request = parse("GET /a.bin HTTP/1.1\r\nRange: items=1-2\r\n\r\n").unwrap();
        assert_eq!(request.range(), None);
    }

    #[test]
    fn test_parse_if_modified_since() {
        let request = parse(
            "GET /a.css HTTP/1.1\r\nIf-Modified-Since: Wed, 21 Oct 2015 07:28:00 GMT\r\n\r\n",
        )
        .unwrap();
        let since = request.if_modified_since().unwrap();
        assert_eq!(since.timestamp(), 1445412480);
    }

    #[test]
    fn test_unsupported_method() {
        let result = parse("DELETE /resource HTTP/1.1\r\n\r\n");
        assert_eq!(result.unwrap_err(), Exception::UnSupportedRequestMethod);
    }

    #[test]
    fn test_unsupported_http_version() {
        let result = parse("GET / HTTP/2.0\r\n\r\n");
        assert_eq!(result.unwrap_err(), Exception::UnsupportedHttpVersion);
    }

    #[test]
    fn test_http_1_0_accepted() {
        let request = parse("GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(matches!(request.version(), HttpVersion::V1_0));
    }

    #[test]
    fn test_invalid_utf8() {
        let result = Request::try_from(&[0xFF, 0xFE, 0xFD], 0);
        assert_eq!(result.unwrap_err(), Exception::RequestIsNotUtf8);
    }

    #[test]
    fn test_malformed_request_line() {
        assert!(parse("GET /with space HTTP/1.1\r\n\r\n").is_err());
        assert!(parse("\r\n\r\n").is_err());
    }

    #[test]
    fn test_headers_after_body_ignored() {
        let request = parse("POST /x HTTP/1.1\r\n\r\nUser-Agent: body").unwrap();
        assert_eq!(request.method(), HttpRequestMethod::Post);
        assert_eq!(request.user_agent(), "");
    }

    #[test]
    fn test_lowercase_method() {
        let request = parse("get / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.method(), HttpRequestMethod::Get);
    }
}
