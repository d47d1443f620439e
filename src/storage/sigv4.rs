//! AWS SigV4 请求签名
//!
//! 只实现 S3 需要的部分：规范请求、待签字符串、派生签名密钥。
//! 头部名需为小写，由调用方保证。

use crate::credentials::Credentials;
use chrono::{DateTime, Utc};
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// 签名算法标识
pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// 空请求体的 SHA256
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// 签名结果
#[derive(Debug, Clone)]
pub struct SignatureOutput {
    /// Authorization 头的值
    pub authorization: String,
    /// 十六进制签名
    pub signature: String,
}

/// SigV4 签名器
pub struct SigV4Signer<'a> {
    credentials: &'a Credentials,
    region: &'a str,
    service: &'a str,
}

impl<'a> SigV4Signer<'a> {
    pub fn new(credentials: &'a Credentials, region: &'a str, service: &'a str) -> Self {
        Self {
            credentials,
            region,
            service,
        }
    }

    /// 对请求签名
    ///
    /// `headers` 必须包含 host 和 x-amz-date，以及所有需要签名的头。
    pub fn sign(
        &self,
        method: &str,
        url: &Url,
        headers: &BTreeMap<String, String>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<SignatureOutput, InvalidLength> {
        let amz_date = format_amz_date(now);
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/{}/aws4_request", date, self.region, self.service);

        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
        let canonical = canonical_request(method, url, headers, &signed_headers, payload_hash);

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            sha256_hex(canonical.as_bytes())
        );

        let key = signing_key(
            &self.credentials.secret_access_key,
            &date,
            self.region,
            self.service,
        )?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "{} Credential={}/{},SignedHeaders={},Signature={}",
            ALGORITHM, self.credentials.access_key_id, scope, signed_headers, signature
        );

        Ok(SignatureOutput {
            authorization,
            signature,
        })
    }
}

/// x-amz-date 格式
pub fn format_amz_date(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}

/// 十六进制 SHA256
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// host 头的值（非默认端口时带端口）
pub fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// 按 SigV4 规则编码 URI 组件（仅保留非保留字符）
pub fn uri_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// 编码对象键，保留路径分隔符
pub fn encode_key_path(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

fn canonical_request(
    method: &str,
    url: &Url,
    headers: &BTreeMap<String, String>,
    signed_headers: &str,
    payload_hash: &str,
) -> String {
    let canonical_uri = if url.path().is_empty() { "/" } else { url.path() };

    let mut query: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    query.sort();
    let canonical_query = query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
    )
}

fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, InvalidLength> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
