use crate::{
    exception::Exception,
    param::*,
    request::Request,
    server::ServeOptions,
    util::{format_file_size, http_date, HtmlBuilder},
};

use brotli::enc::{self, backward_references::BrotliEncoderParams};
use bytes::Bytes;
use chrono::prelude::*;
use flate2::{
    write::{DeflateEncoder, GzEncoder},
    Compression,
};
use log::{debug, error};

use std::{
    ffi::OsStr,
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

#[derive(Debug, Clone)]
pub struct Response {
    version: HttpVersion,
    status_code: u16,
    information: String,
    content_type: Option<String>,
    content_length: u64,
    date: DateTime<Utc>,
    content_encoding: Option<HttpEncoding>,
    server_name: String,
    allow: Option<Vec<HttpRequestMethod>>,
    content: Option<Bytes>,
    content_range: Option<String>,
    accept_ranges: Option<String>,
    last_modified: Option<DateTime<Utc>>,
    cache_control: Option<String>,
    expires: Option<DateTime<Utc>>,
    vary: Option<String>,
}

impl Response {
    pub fn new() -> Self {
        Self {
            version: HttpVersion::V1_1,
            status_code: 200,
            information: "OK".to_string(),
            content_type: None,
            content_length: 0,
            date: Utc::now(),
            content_encoding: None,
            server_name: SERVER_NAME.to_string(),
            allow: None,
            content: None,
            content_range: None,
            accept_ranges: None,
            last_modified: None,
            cache_control: None,
            expires: None,
            vary: None,
        }
    }

    /// 构建文件响应：条件请求（`If-Modified-Since`）、范围请求、压缩，
    /// 以及带指纹请求的长期缓存头。
    pub fn from_file(
        path: &Path,
        request: &Request,
        id: u128,
        options: &ServeOptions,
    ) -> Result<Self, Exception> {
        let metadata = fs::metadata(path)?;
        let file_size = metadata.len();
        let modified: DateTime<Utc> = metadata.modified()?.into();
        let mime = get_mime(path.extension());
        let headonly = request.method() == HttpRequestMethod::Head;

        let mut response = Self::new();
        response.content_type = Some(mime.to_string());
        response.last_modified = Some(modified);
        if options.enable_range_requests() {
            response.accept_ranges = Some("bytes".to_string());
        }
        // 可压缩的类型按 Accept-Encoding 返回不同表示，共享缓存需要区分
        let compressible = options.enable_compression() && !should_skip_compression(mime);
        if compressible {
            response.vary = Some("Accept-Encoding".to_string());
        }
        if request.is_cache_busted() {
            debug!("[ID{}]请求携带指纹参数，设置长期缓存", id);
            response.set_long_lived_cache(options.max_age());
        }

        // HTTP-date 只精确到秒
        if let Some(since) = request.if_modified_since() {
            if modified.timestamp() <= since.timestamp() {
                debug!("[ID{}]文件未修改，返回304", id);
                response.set_code(304);
                response.content_type = None;
                response.content_length = 0;
                return Ok(response);
            }
        }

        if let (true, Some((start, end))) = (options.enable_range_requests(), request.range()) {
            let end = end.unwrap_or(file_size.saturating_sub(1));
            if file_size == 0 || start >= file_size || end >= file_size || start > end {
                error!(
                    "[ID{}]无效的Range请求: start={}, end={}, file_size={}",
                    id, start, end, file_size
                );
                response.set_code(416);
                response.content_type = None;
                response.content_range = Some(format!("bytes */{}", file_size));
                response.content_length = 0;
                return Ok(response);
            }

            let content_length = end - start + 1;
            debug!(
                "[ID{}]处理Range请求: bytes {}-{}/{} ({}字节)",
                id, start, end, file_size, content_length
            );
            response.set_code(206);
            response.content_range = Some(format!("bytes {}-{}/{}", start, end, file_size));
            response.content_length = content_length;
            if !headonly {
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(start))?;
                let mut buffer = vec![0u8; content_length as usize];
                file.read_exact(&mut buffer)?;
                response.content = Some(Bytes::from(buffer));
            }
            return Ok(response);
        }

        if headonly {
            response.content_length = file_size;
            return Ok(response);
        }

        let contents = fs::read(path)?;
        debug!(
            "[ID{}]读取文件{}，大小{}",
            id,
            path.display(),
            format_file_size(contents.len() as u64)
        );

        if compressible {
            response.content_encoding = decide_encoding(request.accept_encoding());
        }
        let body = match response.content_encoding {
            None => contents,
            Some(_) => match compress(&contents, response.content_encoding) {
                Ok(c) => c,
                Err(e) => {
                    error!("[ID{}]压缩文件{}失败: {}，返回未压缩内容", id, path.display(), e);
                    response.content_encoding = None;
                    contents
                }
            },
        };
        response.content_length = body.len() as u64;
        response.content = Some(Bytes::from(body));
        Ok(response)
    }

    pub fn from_status_code(code: u16, request: Option<&Request>, id: u128) -> Self {
        let mut response = Self::new();
        response.set_code(code);
        if code == 204 {
            response.allow = Some(ALLOWED_METHODS.to_vec());
            return response;
        }
        if code == 405 {
            response.allow = Some(ALLOWED_METHODS.to_vec());
        }
        let content = match code {
            404 => HtmlBuilder::from_status_code(404, Some(r"<h2>噢！</h2><p>你请求的资源不存在。</p>")),
            405 => HtmlBuilder::from_status_code(
                405,
                Some(r"<h2>噢！</h2><p>静态资源仅支持GET、HEAD与OPTIONS方法。</p>"),
            ),
            500 => HtmlBuilder::from_status_code(500, Some(r"<h2>噢！</h2><p>服务器出现了一个内部错误。</p>")),
            _ => HtmlBuilder::from_status_code(code, None),
        }
        .build()
        .into_bytes();

        let headonly = request.map_or(false, |r| r.method() == HttpRequestMethod::Head);
        response.content_type = Some("text/html;charset=utf-8".to_string());
        response.content_length = content.len() as u64;
        if headonly {
            return response;
        }

        let encoding = request.and_then(|r| decide_encoding(r.accept_encoding()));
        let body = match compress(&content, encoding) {
            Ok(c) => {
                response.content_encoding = encoding;
                c
            }
            Err(e) => {
                error!("[ID{}]压缩错误页面失败: {}", id, e);
                content
            }
        };
        response.content_length = body.len() as u64;
        response.content = Some(Bytes::from(body));
        response
    }

    pub fn from_exception(e: Exception, request: Option<&Request>, id: u128) -> Self {
        Self::from_status_code(e.status_code(), request, id)
    }

    pub fn options() -> Self {
        Self::from_status_code(204, None, 0)
    }

    fn set_long_lived_cache(&mut self, max_age: u64) -> &mut Self {
        let max_age = max_age.min(MAX_AGE_LIMIT);
        self.cache_control = Some(format!("public, max-age={}", max_age));
        self.expires = Some(self.date + chrono::Duration::seconds(max_age as i64));
        self
    }

    fn set_code(&mut self, code: u16) -> &mut Self {
        self.status_code = code;
        self.information = STATUS_CODES
            .get(&code)
            .copied()
            .unwrap_or("Unknown Status")
            .to_string();
        self
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut header = format!(
            "{} {} {}{}",
            self.version, self.status_code, self.information, CRLF
        );
        let mut push = |name: &str, value: &str| {
            header.push_str(name);
            header.push_str(": ");
            header.push_str(value);
            header.push_str(CRLF);
        };
        if let Some(t) = &self.content_type {
            push("Content-Type", t);
        }
        if let Some(e) = self.content_encoding {
            push("Content-Encoding", &e.to_string());
        }
        push("Content-Length", &self.content_length.to_string());
        push("Date", &http_date(&self.date));
        push("Server", &self.server_name);
        if let Some(m) = &self.last_modified {
            push("Last-Modified", &http_date(m));
        }
        if let Some(c) = &self.cache_control {
            push("Cache-Control", c);
        }
        if let Some(v) = &self.vary {
            push("Vary", v);
        }
        if let Some(e) = &self.expires {
            push("Expires", &http_date(e));
        }
        if let Some(a) = &self.allow {
            let methods: Vec<String> = a.iter().map(|m| m.to_string()).collect();
            push("Allow", &methods.join(", "));
        }
        if let Some(r) = &self.accept_ranges {
            push("Accept-Ranges", r);
        }
        if let Some(r) = &self.content_range {
            push("Content-Range", r);
        }
        push("Connection", "close");
        header.push_str(CRLF);

        [
            header.as_bytes(),
            match &self.content {
                Some(c) => &c[..],
                None => b"",
            },
        ]
        .concat()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn information(&self) -> &str {
        &self.information
    }

    pub fn content(&self) -> Option<&Bytes> {
        self.content.as_ref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn content_encoding(&self) -> Option<HttpEncoding> {
        self.content_encoding
    }

    pub fn cache_control(&self) -> Option<&str> {
        self.cache_control.as_deref()
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expires
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    pub fn content_range(&self) -> Option<&str> {
        self.content_range.as_deref()
    }

    pub fn vary(&self) -> Option<&str> {
        self.vary.as_deref()
    }
}

fn compress(data: &[u8], mode: Option<HttpEncoding>) -> io::Result<Vec<u8>> {
    let result = match mode {
        Some(HttpEncoding::Gzip) => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Deflate) => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Br) => {
            let params = BrotliEncoderParams::default();
            let mut output = Vec::new();
            enc::BrotliCompress(&mut io::Cursor::new(data), &mut output, &params)?;
            Ok(output)
        }
        None => Ok(data.to_vec()),
    };

    if let Ok(ref compressed) = result {
        debug!(
            "压缩完成: {:?}, 原始大小: {} bytes, 压缩后: {} bytes",
            mode,
            data.len(),
            compressed.len()
        );
    }
    result
}

fn should_skip_compression(mime_type: &str) -> bool {
    let skip_types = [
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "image/avif",
        "image/x-icon",
        "video/",
        "audio/",
        "application/zip",
        "application/pdf",
        "font/woff",
        "font/woff2",
    ];

    skip_types
        .iter()
        .any(|&skip_type| mime_type.starts_with(skip_type))
}

/// gzip 优先，其次 deflate，仅声明 br 时才使用 brotli
fn decide_encoding(accept_encoding: &[HttpEncoding]) -> Option<HttpEncoding> {
    [HttpEncoding::Gzip, HttpEncoding::Deflate, HttpEncoding::Br]
        .into_iter()
        .find(|e| accept_encoding.contains(e))
}

fn get_mime(extension: Option<&OsStr>) -> &'static str {
    extension
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .and_then(|e| MIME_TYPES.get(e.as_str()).copied())
        .unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::fs;
    use tempfile::TempDir;

    fn request(raw: &str) -> Request {
        Request::try_from(raw.as_bytes(), 1).unwrap()
    }

    fn fixture(name: &str, content: &[u8]) -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    fn header_text(response: &Response) -> String {
        let bytes = response.as_bytes();
        let text = String::from_utf8_lossy(&bytes).to_string();
        text.split("\r\n\r\n").next().unwrap().to_string()
    }

    #[test]
    fn test_plain_get() {
        let (_dir, path) = fixture("app.css", b"body { color: red }");
        let req = request("GET /static/app.css HTTP/1.1\r\n\r\n");
        let response = Response::from_file(&path, &req, 1, &ServeOptions::default()).unwrap();

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.content_type(), Some("text/css;charset=utf-8"));
        assert_eq!(&response.content().unwrap()[..], b"body { color: red }");
        assert!(response.cache_control().is_none());
        assert!(response.last_modified().is_some());
        let headers = header_text(&response);
        assert!(headers.contains("Last-Modified: "));
        assert!(!headers.contains("Cache-Control"));
    }

    #[test]
    fn test_cache_busted_get_is_long_lived() {
        let (_dir, path) = fixture("app.js", b"let a = 1;");
        let req = request("GET /static/app.js?v=1a2b HTTP/1.1\r\n\r\n");
        let response = Response::from_file(&path, &req, 1, &ServeOptions::default()).unwrap();

        assert_eq!(
            response.cache_control(),
            Some(format!("public, max-age={}", DEFAULT_MAX_AGE).as_str())
        );
        let expires = response.expires().unwrap();
        assert!(expires > Utc::now() + chrono::Duration::days(364));
        let headers = header_text(&response);
        assert!(headers.contains("Cache-Control: public, max-age=31536000"));
        assert!(headers.contains("Expires: "));
    }

    #[test]
    fn test_not_modified() {
        let (_dir, path) = fixture("a.css", b"x");
        let future = http_date(&(Utc::now() + chrono::Duration::hours(1)));
        let req = request(&format!(
            "GET /a.css HTTP/1.1\r\nIf-Modified-Since: {}\r\n\r\n",
            future
        ));
        let response = Response::from_file(&path, &req, 1, &ServeOptions::default()).unwrap();

        assert_eq!(response.status_code(), 304);
        assert!(response.content().is_none());
    }

    #[test]
    fn test_modified_since_older_date() {
        let (_dir, path) = fixture("a.css", b"x");
        let req = request("GET /a.css HTTP/1.1\r\nIf-Modified-Since: Wed, 21 Oct 2015 07:28:00 GMT\r\n\r\n");
        let response = Response::from_file(&path, &req, 1, &ServeOptions::default()).unwrap();
        assert_eq!(response.status_code(), 200);
    }

    #[test]
    fn test_range_request() {
        let (_dir, path) = fixture("data.txt", b"0123456789");
        let req = request("GET /data.txt HTTP/1.1\r\nRange: bytes=2-5\r\n\r\n");
        let response = Response::from_file(&path, &req, 1, &ServeOptions::default()).unwrap();

        assert_eq!(response.status_code(), 206);
        assert_eq!(&response.content().unwrap()[..], b"2345");
        assert_eq!(response.content_range(), Some("bytes 2-5/10"));
    }

    #[test]
    fn test_range_not_satisfiable() {
        let (_dir, path) = fixture("data.txt", b"0123456789");
        let req = request("GET /data.txt HTTP/1.1\r\nRange: bytes=20-\r\n\r\n");
        let response = Response::from_file(&path, &req, 1, &ServeOptions::default()).unwrap();

        assert_eq!(response.status_code(), 416);
        assert_eq!(response.content_range(), Some("bytes */10"));
    }

    #[test]
    fn test_head_has_no_body() {
        let (_dir, path) = fixture("index.html", b"<html></html>");
        let req = request("HEAD /index.html HTTP/1.1\r\n\r\n");
        let response = Response::from_file(&path, &req, 1, &ServeOptions::default()).unwrap();

        assert_eq!(response.status_code(), 200);
        assert!(response.content().is_none());
        assert_eq!(response.content_length(), 13);
    }

    #[test]
    fn test_gzip_for_text() {
        let text = "a".repeat(2000);
        let (_dir, path) = fixture("big.js", text.as_bytes());
        let req = request("GET /big.js HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n");
        let response = Response::from_file(&path, &req, 1, &ServeOptions::default()).unwrap();

        assert_eq!(response.content_encoding(), Some(HttpEncoding::Gzip));
        let mut decoded = String::new();
        GzDecoder::new(&response.content().unwrap()[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, text);
        assert!(header_text(&response).contains("Content-Encoding: gzip"));
        assert_eq!(response.vary(), Some("Accept-Encoding"));
        assert!(header_text(&response).contains("Vary: Accept-Encoding"));
    }

    #[test]
    fn test_images_not_compressed() {
        let (_dir, path) = fixture("logo.png", b"\x89PNG....");
        let req = request("GET /logo.png HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n");
        let response = Response::from_file(&path, &req, 1, &ServeOptions::default()).unwrap();
        assert_eq!(response.content_encoding(), None);
        assert_eq!(response.vary(), None);
    }

    #[test]
    fn test_vary_without_accept_encoding() {
        // 不接受压缩的客户端拿到的未压缩表示同样需要 Vary
        let (_dir, path) = fixture("app.js", b"let a = 1;");
        let req = request("GET /app.js?v=1a2b HTTP/1.1\r\n\r\n");
        let response = Response::from_file(&path, &req, 1, &ServeOptions::default()).unwrap();
        assert_eq!(response.content_encoding(), None);
        assert_eq!(response.vary(), Some("Accept-Encoding"));
    }

    #[test]
    fn test_huge_max_age_is_clamped() {
        let mut response = Response::new();
        response.set_long_lived_cache(u64::MAX);
        assert_eq!(
            response.cache_control(),
            Some(format!("public, max-age={}", MAX_AGE_LIMIT).as_str())
        );
        assert!(response.expires().unwrap() > response.date);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let req = request("GET /gone.css HTTP/1.1\r\n\r\n");
        let result = Response::from_file(&dir.path().join("gone.css"), &req, 1, &ServeOptions::default());
        assert_eq!(result.unwrap_err(), Exception::FileNotFound);
    }

    #[test]
    fn test_error_page() {
        let response = Response::from_exception(Exception::FileNotFound, None, 1);
        assert_eq!(response.status_code(), 404);
        assert_eq!(response.information(), "Not Found");
        let body = String::from_utf8_lossy(response.content().unwrap()).to_string();
        assert!(body.contains("404"));
    }

    #[test]
    fn test_options_allow_header() {
        let response = Response::options();
        assert_eq!(response.status_code(), 204);
        assert!(header_text(&response).contains("Allow: GET, HEAD, OPTIONS"));
    }

    #[test]
    fn test_decide_encoding_order() {
        assert_eq!(
            decide_encoding(&[HttpEncoding::Br, HttpEncoding::Gzip]),
            Some(HttpEncoding::Gzip)
        );
        assert_eq!(decide_encoding(&[HttpEncoding::Deflate]), Some(HttpEncoding::Deflate));
        assert_eq!(decide_encoding(&[HttpEncoding::Br]), Some(HttpEncoding::Br));
        assert_eq!(decide_encoding(&[]), None);
    }

    #[test]
    fn test_get_mime() {
        assert_eq!(get_mime(Some(OsStr::new("css"))), "text/css;charset=utf-8");
        assert_eq!(get_mime(Some(OsStr::new("PNG"))), "image/png");
        assert_eq!(get_mime(Some(OsStr::new("unknown"))), "application/octet-stream");
        assert_eq!(get_mime(None), "application/octet-stream");
    }

    #[test]
    fn test_compress_round_trip_sizes() {
        let data = vec![b'A'; 10000];
        for mode in [HttpEncoding::Gzip, HttpEncoding::Deflate, HttpEncoding::Br] {
            let result = compress(&data, Some(mode)).unwrap();
            assert!(result.len() < data.len());
        }
        assert_eq!(compress(&data, None).unwrap(), data);
    }
}
