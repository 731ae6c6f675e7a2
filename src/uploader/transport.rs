// 断点续传传输层
//
// 服务端是偏移量的唯一权威：任何偏移量冲突都要重新查询服务端偏移量后再继续

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{header::HeaderMap, Client, Response, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::protocol::{
    ApiResponse, DecisionOutcome, DecisionRequest, DuplicateDecision, ExistsResponse,
    FinalizeOutcome, HEADER_TUS_RESUMABLE, HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA,
    HEADER_UPLOAD_OFFSET, OFFSET_OCTET_STREAM, TUS_VERSION,
};
use crate::uploader::retry::UploadErrorKind;
use crate::uploader::task::UploadMetadata;

/// 传输错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("网络错误: {0}")]
    Network(String),
    #[error("请求超时")]
    Timeout,
    #[error("偏移量冲突 (服务端偏移量: {server_offset:?})")]
    OffsetConflict { server_offset: Option<u64> },
    #[error("上传会话不存在或已过期")]
    SessionExpired,
    #[error("超出大小限制")]
    PayloadTooLarge,
    #[error("服务端存储空间不足")]
    QuotaExceeded,
    #[error("服务器错误: HTTP {status}: {message}")]
    Server { status: u16, message: String },
    #[error("请求被拒绝: HTTP {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("协议错误: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            TransportError::Network(_) => UploadErrorKind::Network,
            TransportError::Timeout => UploadErrorKind::Timeout,
            TransportError::OffsetConflict { .. } => UploadErrorKind::OffsetConflict,
            TransportError::SessionExpired => UploadErrorKind::SessionExpired,
            TransportError::PayloadTooLarge => UploadErrorKind::PayloadTooLarge,
            TransportError::QuotaExceeded => UploadErrorKind::QuotaExceeded,
            TransportError::Server { .. } => UploadErrorKind::Server,
            TransportError::Rejected { .. } | TransportError::Protocol(_) => {
                UploadErrorKind::Rejected
            }
        }
    }

    /// 按 HTTP 状态码分类
    pub fn from_status(status: StatusCode, headers: &HeaderMap, message: String) -> Self {
        match status.as_u16() {
            409 => TransportError::OffsetConflict {
                server_offset: header_u64(headers, HEADER_UPLOAD_OFFSET),
            },
            413 => TransportError::PayloadTooLarge,
            404 | 410 => TransportError::SessionExpired,
            507 => TransportError::QuotaExceeded,
            code if status.is_server_error() => TransportError::Server {
                status: code,
                message,
            },
            code => TransportError::Rejected {
                status: code,
                message,
            },
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

/// 断点续传传输接口
#[async_trait]
pub trait ResumableTransport: Send + Sync + 'static {
    /// 创建上传会话，返回会话句柄
    async fn open(&self, meta: &UploadMetadata) -> Result<String, TransportError>;

    /// 在 `offset` 处追加一片数据，返回服务端的新偏移量
    async fn append_chunk(
        &self,
        session: &str,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<u64, TransportError>;

    /// 查询服务端已确认的偏移量
    async fn query_offset(&self, session: &str) -> Result<u64, TransportError>;

    /// 字节传输完成后请求服务端建立视频记录
    async fn finalize(&self, session: &str) -> Result<FinalizeOutcome, TransportError>;

    /// 提交重复内容的处理决定
    async fn resolve_duplicate(
        &self,
        session: &str,
        decision: DuplicateDecision,
    ) -> Result<DecisionOutcome, TransportError>;

    /// 终止会话并丢弃已上传数据
    async fn terminate(&self, _session: &str) -> Result<(), TransportError> {
        Ok(())
    }

    /// 按相对路径查询服务端是否已有视频（上传前提示）
    async fn exists_by_path(&self, _relative_path: &str) -> Result<bool, TransportError> {
        Ok(false)
    }
}

/// 基于 HTTP 的断点续传实现
#[derive(Debug, Clone)]
pub struct HttpResumableTransport {
    client: Client,
    /// 形如 http://host:port/api/v1
    api_base: String,
}

impl HttpResumableTransport {
    pub fn new(endpoint: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("创建 HTTP 客户端失败: {}", e))?;
        Ok(Self {
            client,
            api_base: format!("{}/api/v1", endpoint.trim_end_matches('/')),
        })
    }

    fn session_url(&self, session: &str) -> String {
        format!("{}/uploads/{}", self.api_base, session)
    }

    /// 非 2xx 响应转换为错误
    async fn check(resp: Response) -> Result<Response, TransportError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiResponse<serde_json::Value>>(&body)
            .map(|r| r.message)
            .unwrap_or(body);
        Err(TransportError::from_status(status, &headers, message))
    }

    async fn data<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, TransportError> {
        let body: ApiResponse<T> = resp
            .json()
            .await
            .map_err(|e| TransportError::Protocol(format!("响应解析失败: {}", e)))?;
        body.data
            .ok_or_else(|| TransportError::Protocol(format!("响应缺少 data: {}", body.message)))
    }
}

/// TUS Upload-Metadata: `key base64(value),key base64(value)`
pub fn encode_upload_metadata(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{} {}", k, BASE64.encode(v.as_bytes())))
        .collect::<Vec<_>>()
        .join(",")
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[async_trait]
impl ResumableTransport for HttpResumableTransport {
    async fn open(&self, meta: &UploadMetadata) -> Result<String, TransportError> {
        let metadata = encode_upload_metadata(&[
            ("filename", meta.file_name.as_str()),
            ("relative_path", meta.relative_path.as_str()),
        ]);

        let resp = self
            .client
            .post(format!("{}/uploads", self.api_base))
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION)
            .header(HEADER_UPLOAD_LENGTH, meta.file_size.to_string())
            .header(HEADER_UPLOAD_METADATA, metadata)
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TransportError::Protocol("创建会话响应缺少 Location".to_string()))?;
        let session = location
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TransportError::Protocol(format!("无效的 Location: {}", location)))?;

        debug!("创建上传会话: file={}, session={}", meta.file_name, session);
        Ok(session.to_string())
    }

    async fn append_chunk(
        &self,
        session: &str,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<u64, TransportError> {
        let len = data.len() as u64;
        let resp = self
            .client
            .patch(self.session_url(session))
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION)
            .header(HEADER_UPLOAD_OFFSET, offset.to_string())
            .header(reqwest::header::CONTENT_TYPE, OFFSET_OCTET_STREAM)
            .body(data)
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        header_u64(resp.headers(), HEADER_UPLOAD_OFFSET)
            .ok_or_else(|| TransportError::Protocol("PATCH 响应缺少 Upload-Offset".to_string()))
            .map(|new_offset| {
                debug!(
                    "分片已确认: session={}, offset={} -> {}, len={}",
                    session, offset, new_offset, len
                );
                new_offset
            })
    }

    async fn query_offset(&self, session: &str) -> Result<u64, TransportError> {
        let resp = self
            .client
            .head(self.session_url(session))
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        header_u64(resp.headers(), HEADER_UPLOAD_OFFSET)
            .ok_or_else(|| TransportError::Protocol("HEAD 响应缺少 Upload-Offset".to_string()))
    }

    async fn finalize(&self, session: &str) -> Result<FinalizeOutcome, TransportError> {
        let resp = self
            .client
            .post(format!("{}/finalize", self.session_url(session)))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Self::data(resp).await
    }

    async fn resolve_duplicate(
        &self,
        session: &str,
        decision: DuplicateDecision,
    ) -> Result<DecisionOutcome, TransportError> {
        let resp = self
            .client
            .post(format!("{}/duplicate-decision", self.session_url(session)))
            .json(&DecisionRequest { decision })
            .send()
            .await?;
        match Self::check(resp).await {
            Ok(resp) => Self::data(resp).await,
            // 此处的 409 表示已做出过决定，与偏移量无关
            Err(TransportError::OffsetConflict { .. }) => Err(TransportError::Rejected {
                status: 409,
                message: "重复内容已做出决定".to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn terminate(&self, session: &str) -> Result<(), TransportError> {
        let resp = self
            .client
            .delete(self.session_url(session))
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION)
            .send()
            .await?;
        match Self::check(resp).await {
            Ok(_) | Err(TransportError::SessionExpired) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exists_by_path(&self, relative_path: &str) -> Result<bool, TransportError> {
        let resp = self
            .client
            .get(format!("{}/videos/exists", self.api_base))
            .query(&[("path", relative_path)])
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let body: ExistsResponse = Self::data(resp).await?;
        Ok(body.exists)
    }
}
