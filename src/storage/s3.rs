// S3 兼容存储客户端
//
// 基于 reqwest 直接调用 S3 REST 接口，使用 SigV4 签名：
// - 初始化:  POST   /{key}?uploads
// - 上传分片: PUT    /{key}?partNumber={n}&uploadId={id}
// - 列出分片: GET    /{key}?uploadId={id}
// - 完成上传: POST   /{key}?uploadId={id}
// - 中止上传: DELETE /{key}?uploadId={id}
//
// 端点选择：自定义端点（路径风格）> 传输加速 > 区域虚拟主机风格

use super::sigv4::{
    encode_key_path, format_amz_date, host_header, sha256_hex, uri_encode, SigV4Signer,
};
use super::{
    CompleteAck, CompletedPart, ObjectMetadata, ObjectTarget, StorageBackend, StorageError,
    StorageErrorKind,
};
use crate::config::StorageConfig;
use crate::credentials::Credentials;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Client, Method, Response, Url};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// S3 客户端
#[derive(Debug, Clone)]
pub struct S3Client {
    /// HTTP客户端
    client: Client,
    /// 签名区域
    region: String,
    /// 自定义端点（MinIO 等），使用路径风格
    endpoint: Option<Url>,
    /// 是否使用传输加速端点
    use_accelerate: bool,
}

impl S3Client {
    /// 根据存储配置创建客户端
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let endpoint = match &config.endpoint {
            Some(raw) if !raw.is_empty() => {
                Some(Url::parse(raw).with_context(|| format!("存储端点地址非法: {}", raw))?)
            }
            _ => None,
        };

        info!(
            "初始化 S3 客户端: region={}, endpoint={:?}, accelerate={}",
            config.region, endpoint, config.use_accelerate
        );

        Ok(Self {
            client,
            region: config.region.clone(),
            endpoint,
            use_accelerate: config.use_accelerate,
        })
    }

    /// 构建对象 URL（不含查询参数）
    pub fn object_url(&self, target: &ObjectTarget) -> Result<Url, StorageError> {
        let key = encode_key_path(&target.key);
        let raw = match &self.endpoint {
            Some(endpoint) => format!(
                "{}/{}/{}",
                endpoint.as_str().trim_end_matches('/'),
                uri_encode(&target.bucket),
                key
            ),
            None if self.use_accelerate => {
                format!("https://{}.s3-accelerate.amazonaws.com/{}", target.bucket, key)
            }
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                target.bucket, self.region, key
            ),
        };

        Url::parse(&raw).map_err(|e| {
            StorageError::new(
                StorageErrorKind::BadRequest,
                format!("对象地址非法: {} ({})", raw, e),
            )
        })
    }

    fn url_with_query(&self, target: &ObjectTarget, query: &str) -> Result<Url, StorageError> {
        let mut url = self.object_url(target)?;
        url.set_query(Some(query));
        Ok(url)
    }

    /// 签名并发送请求
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Bytes,
        credentials: &Credentials,
        content_type: Option<&str>,
    ) -> Result<Response, StorageError> {
        let payload_hash = sha256_hex(&body);
        let now = Utc::now();

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host_header(&url));
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        headers.insert("x-amz-date".to_string(), format_amz_date(now));
        if let Some(token) = &credentials.session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }

        let signature = SigV4Signer::new(credentials, &self.region, "s3").sign(
            method.as_str(),
            &url,
            &headers,
            &payload_hash,
            now,
        )
        .map_err(|e| StorageError::new(StorageErrorKind::Unknown, format!("请求签名失败: {}", e)))?;

        let mut request = self.client.request(method, url);
        for (name, value) in &headers {
            // host 由 reqwest 根据 URL 自动设置
            if name != "host" {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        request = request.header("authorization", signature.authorization);
        if let Some(content_type) = content_type {
            request = request.header("content-type", content_type);
        }

        request.body(body).send().await.map_err(StorageError::from)
    }

    /// 查询服务端已记录的分片（分页）
    pub async fn list_parts(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        credentials: &Credentials,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let mut parts = Vec::new();
        let mut marker: Option<u32> = None;

        loop {
            let mut query = format!("uploadId={}", uri_encode(upload_id));
            if let Some(marker) = marker {
                query.push_str(&format!("&part-number-marker={}", marker));
            }
            let url = self.url_with_query(target, &query)?;

            let response = self
                .send(Method::GET, url, Bytes::new(), credentials, None)
                .await?;
            if !response.status().is_success() {
                return Err(error_from_response("列出分片", response).await);
            }
            let body = response.text().await.map_err(StorageError::from)?;

            let (page, next_marker) = parse_list_parts(&body)?;
            parts.extend(page);

            match next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        parts.sort_by_key(|p| p.index);
        Ok(parts)
    }
}

#[async_trait]
impl StorageBackend for S3Client {
    async fn initiate_upload(
        &self,
        target: &ObjectTarget,
        credentials: &Credentials,
    ) -> Result<String, StorageError> {
        let url = self.url_with_query(target, "uploads")?;
        let response = self
            .send(Method::POST, url, Bytes::new(), credentials, None)
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response("初始化分片上传", response).await);
        }

        let body = response.text().await.map_err(StorageError::from)?;
        let upload_id = extract_tag(&body, "UploadId").ok_or_else(|| {
            StorageError::new(StorageErrorKind::Unknown, "初始化响应缺少 UploadId")
        })?;

        debug!("初始化分片上传成功: target={}, uploadId={}", target, upload_id);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        credentials: &Credentials,
    ) -> Result<String, StorageError> {
        let query = format!(
            "partNumber={}&uploadId={}",
            part_number,
            uri_encode(upload_id)
        );
        let url = self.url_with_query(target, &query)?;
        let size = body.len();

        let response = self
            .send(Method::PUT, url, body, credentials, None)
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response("上传分片", response).await);
        }

        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| StorageError::new(StorageErrorKind::Unknown, "分片响应缺少 ETag"))?;

        debug!("上传分片成功: part={}, size={}, etag={}", part_number, size, etag);
        Ok(etag)
    }

    async fn complete_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        parts: &[CompletedPart],
        credentials: &Credentials,
    ) -> Result<CompleteAck, StorageError> {
        // 合并前读取服务端记录的分片，作为完成确认的一部分
        let listed = self.list_parts(target, upload_id, credentials).await?;

        let url = self.url_with_query(target, &format!("uploadId={}", uri_encode(upload_id)))?;
        let payload = Bytes::from(build_complete_body(parts));
        let response = self
            .send(Method::POST, url, payload, credentials, Some("application/xml"))
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(StorageError::from)?;
        let etag = complete_result(status, &body)?;

        Ok(CompleteAck {
            parts: listed,
            etag,
        })
    }

    async fn abort_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        credentials: &Credentials,
    ) -> Result<(), StorageError> {
        let url = self.url_with_query(target, &format!("uploadId={}", uri_encode(upload_id)))?;
        let response = self
            .send(Method::DELETE, url, Bytes::new(), credentials, None)
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        abort_result(upload_id, status, &body)
    }

    async fn head_object(
        &self,
        target: &ObjectTarget,
        credentials: &Credentials,
    ) -> Result<Option<ObjectMetadata>, StorageError> {
        let url = self.object_url(target)?;
        let response = self
            .send(Method::HEAD, url, Bytes::new(), credentials, None)
            .await?;

        // HEAD 响应没有响应体，404 由状态码分类为 NotFound
        if !response.status().is_success() {
            return Err(error_from_response("查询对象", response).await);
        }

        let headers = response.headers();
        let content_length = headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                StorageError::new(StorageErrorKind::Unknown, "对象响应缺少 Content-Length")
            })?;
        let etag = headers
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Ok(Some(ObjectMetadata {
            etag,
            content_length,
        }))
    }
}

/// 从错误响应构造存储错误
async fn error_from_response(operation: &str, response: Response) -> StorageError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    error_from_body(operation, status, &body)
}

/// 根据状态码和 S3 错误响应体生成错误
fn error_from_body(operation: &str, status: u16, body: &str) -> StorageError {
    let code = extract_tag(body, "Code");
    let message = extract_tag(body, "Message")
        .unwrap_or_else(|| body.chars().take(200).collect::<String>());

    StorageError::new(
        StorageErrorKind::classify(status, code.as_deref()),
        format!(
            "{}失败: status={}, code={}, {}",
            operation,
            status,
            code.as_deref().unwrap_or("-"),
            message
        ),
    )
}

/// 解析 CompleteMultipartUpload 响应，返回合并后对象的 ETag
///
/// S3 可能在 200 响应体中返回 `<Error>`，按错误码分类。
fn complete_result(status: u16, body: &str) -> Result<Option<String>, StorageError> {
    if !(200..300).contains(&status) {
        return Err(error_from_body("完成分片上传", status, body));
    }
    if body.contains("<Error>") {
        let code = extract_tag(body, "Code");
        let message = extract_tag(body, "Message").unwrap_or_default();
        return Err(StorageError::new(
            StorageErrorKind::classify(500, code.as_deref()),
            format!(
                "完成分片上传失败: status={}, code={}, {}",
                status,
                code.as_deref().unwrap_or("-"),
                message
            ),
        ));
    }
    Ok(extract_tag(body, "ETag"))
}

/// 解析 AbortMultipartUpload 响应，上传已不存在视为已中止
fn abort_result(upload_id: &str, status: u16, body: &str) -> Result<(), StorageError> {
    if (200..300).contains(&status) {
        return Ok(());
    }
    let error = error_from_body("中止分片上传", status, body);
    if error.kind == StorageErrorKind::NotFound {
        warn!("中止时上传已不存在: uploadId={}", upload_id);
        return Ok(());
    }
    Err(error)
}

/// 生成 CompleteMultipartUpload 请求体
fn build_complete_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.index,
            xml_escape(&part.fingerprint)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// 解析 ListParts 响应，返回本页分片和下一页起点
fn parse_list_parts(body: &str) -> Result<(Vec<CompletedPart>, Option<u32>), StorageError> {
    let mut parts = Vec::new();
    for block in extract_blocks(body, "Part") {
        let index = extract_tag(block, "PartNumber")
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| {
                StorageError::new(StorageErrorKind::Unknown, "ListParts 响应缺少 PartNumber")
            })?;
        let fingerprint = extract_tag(block, "ETag").ok_or_else(|| {
            StorageError::new(StorageErrorKind::Unknown, "ListParts 响应缺少 ETag")
        })?;
        parts.push(CompletedPart { index, fingerprint });
    }

    let truncated = extract_tag(body, "IsTruncated").as_deref() == Some("true");
    let next_marker = if truncated {
        extract_tag(body, "NextPartNumberMarker").and_then(|v| v.parse::<u32>().ok())
    } else {
        None
    };

    Ok((parts, next_marker))
}

/// 提取第一个 `<tag>...</tag>` 的文本内容
fn extract_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(xml_unescape(&body[start..end]))
}

/// 提取所有 `<tag>...</tag>` 块的内部文本
fn extract_blocks<'a>(body: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut blocks = Vec::new();
    let mut rest = body;

    while let Some(pos) = rest.find(&open) {
        let inner_start = pos + open.len();
        let Some(len) = rest[inner_start..].find(&close) else {
            break;
        };
        blocks.push(&rest[inner_start..inner_start + len]);
        rest = &rest[inner_start + len + close.len()..];
    }

    blocks
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StorageConfig {
        StorageConfig {
            region: "eu-west-1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_object_url_virtual_hosted() {
        let client = S3Client::new(&config()).unwrap();
        let url = client
            .object_url(&ObjectTarget::new("my-bucket", "uploads/a b.bin"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://my-bucket.s3.eu-west-1.amazonaws.com/uploads/a%20b.bin"
        );
    }

    #[test]
    fn test_object_url_accelerate() {
        let client = S3Client::new(&StorageConfig {
            use_accelerate: true,
            ..config()
        })
        .unwrap();
        let url = client
            .object_url(&ObjectTarget::new("my-bucket", "file.bin"))
            .unwrap();
        assert_eq!(url.as_str(), "https://my-bucket.s3-accelerate.amazonaws.com/file.bin");
    }

    #[test]
    fn test_object_url_custom_endpoint() {
        let client = S3Client::new(&StorageConfig {
            endpoint: Some("http://localhost:9000/".to_string()),
            ..config()
        })
        .unwrap();
        let mut url = client
            .object_url(&ObjectTarget::new("my-bucket", "dir/file.bin"))
            .unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/my-bucket/dir/file.bin");

        url.set_query(Some("partNumber=1&uploadId=abc"));
        assert_eq!(
            url.as_str(),
            "http://localhost:9000/my-bucket/dir/file.bin?partNumber=1&uploadId=abc"
        );
    }

    #[test]
    fn test_extract_tag() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult>
  <Bucket>my-bucket</Bucket>
  <Key>file.bin</Key>
  <UploadId>VXBsb2FkIElE</UploadId>
</InitiateMultipartUploadResult>"#;
        assert_eq!(extract_tag(body, "UploadId").as_deref(), Some("VXBsb2FkIElE"));
        assert_eq!(extract_tag(body, "Missing"), None);
    }

    #[test]
    fn test_parse_list_parts() {
        let body = r#"<ListPartsResult>
  <IsTruncated>true</IsTruncated>
  <NextPartNumberMarker>2</NextPartNumberMarker>
  <Part><PartNumber>1</PartNumber><ETag>&quot;aaa&quot;</ETag><Size>5242880</Size></Part>
  <Part><PartNumber>2</PartNumber><ETag>&quot;bbb&quot;</ETag><Size>5242880</Size></Part>
</ListPartsResult>"#;

        let (parts, next) = parse_list_parts(body).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].index, 1);
        assert_eq!(parts[0].fingerprint, "\"aaa\"");
        assert_eq!(parts[1].fingerprint, "\"bbb\"");
        assert_eq!(next, Some(2));

        let last_page = r#"<ListPartsResult><IsTruncated>false</IsTruncated>
  <Part><PartNumber>3</PartNumber><ETag>"ccc"</ETag></Part></ListPartsResult>"#;
        let (parts, next) = parse_list_parts(last_page).unwrap();
        assert_eq!(parts[0].index, 3);
        assert_eq!(next, None);
    }

    #[test]
    fn test_build_complete_body() {
        let body = build_complete_body(&[
            CompletedPart {
                index: 1,
                fingerprint: "\"aaa\"".to_string(),
            },
            CompletedPart {
                index: 2,
                fingerprint: "\"bbb\"".to_string(),
            },
        ]);
        assert_eq!(
            body,
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>\"aaa\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"bbb\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn test_complete_result_success_returns_etag() {
        let body = "<CompleteMultipartUploadResult>\
                    <Bucket>b</Bucket><Key>k</Key>\
                    <ETag>&quot;3858f62230ac3c915f300c664312c11f-9&quot;</ETag>\
                    </CompleteMultipartUploadResult>";
        let etag = complete_result(200, body).unwrap();
        assert_eq!(
            etag.as_deref(),
            Some("\"3858f62230ac3c915f300c664312c11f-9\"")
        );
    }

    #[test]
    fn test_complete_result_error_inside_200() {
        let body = "<Error><Code>InternalError</Code>\
                    <Message>We encountered an internal error.</Message></Error>";
        let err = complete_result(200, body).unwrap_err();
        assert_eq!(err.kind, StorageErrorKind::ServerError);
        assert!(err.message.contains("InternalError"));

        let body = "<Error><Code>SlowDown</Code><Message>Reduce your request rate.</Message></Error>";
        let err = complete_result(200, body).unwrap_err();
        assert_eq!(err.kind, StorageErrorKind::Throttled);
    }

    #[test]
    fn test_complete_result_error_status() {
        let body = "<Error><Code>InvalidPart</Code><Message>One or more parts not found</Message></Error>";
        let err = complete_result(400, body).unwrap_err();
        assert_eq!(err.kind, StorageErrorKind::BadRequest);
        assert!(err.message.contains("status=400"));
    }

    #[test]
    fn test_abort_result_no_such_upload_is_success() {
        let body = "<Error><Code>NoSuchUpload</Code>\
                    <Message>The specified upload does not exist.</Message></Error>";
        assert!(abort_result("upload-1", 404, body).is_ok());
        assert!(abort_result("upload-1", 204, "").is_ok());
    }

    #[test]
    fn test_abort_result_other_errors_propagate() {
        let body = "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>";
        let err = abort_result("upload-1", 403, body).unwrap_err();
        assert_eq!(err.kind, StorageErrorKind::Forbidden);

        let err = abort_result("upload-1", 503, "").unwrap_err();
        assert!(err.is_retriable());
    }

    #[test]
    fn test_error_from_body_classifies_expired_token() {
        let body = "<Error><Code>ExpiredToken</Code>\
                    <Message>The provided token has expired.</Message></Error>";
        let err = error_from_body("上传分片", 400, body);
        assert_eq!(err.kind, StorageErrorKind::CredentialsExpired);
        assert!(err.is_credentials_expired());
        assert!(err.message.contains("The provided token has expired."));
    }

    #[test]
    fn test_error_from_body_without_xml() {
        // HEAD 404 没有响应体
        let err = error_from_body("查询对象", 404, "");
        assert_eq!(err.kind, StorageErrorKind::NotFound);

        let err = error_from_body("上传分片", 502, "Bad Gateway");
        assert_eq!(err.kind, StorageErrorKind::ServerError);
        assert!(err.message.contains("Bad Gateway"));
    }

    #[test]
    fn test_xml_unescape_roundtrip_entities() {
        assert_eq!(xml_unescape("&amp;lt;"), "&lt;");
        assert_eq!(xml_escape("a&b<c>"), "a&amp;b&lt;c&gt;");
    }
}
