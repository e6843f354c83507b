use crate::object::ObjectInfo;
use crate::range::ByteRange;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::io::AsyncRead;

/// Errors surfaced by the remote object layer.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("object {bucket}/{object} not found")]
    NotFound { bucket: String, object: String },

    #[error("upload {upload_id} not found")]
    UploadNotFound { upload_id: String },

    #[error("backend unreachable: {message}")]
    Unreachable { message: String },

    #[error("{message}")]
    Other { message: String },
}

impl BackendError {
    pub fn not_found(bucket: &str, object: &str) -> Self {
        Self::NotFound {
            bucket: bucket.to_string(),
            object: object.to_string(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::UploadNotFound { .. })
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// A streaming object body with a known length.
pub struct ObjectBody {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub size: u64,
}

impl ObjectBody {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, size: u64) -> Self {
        Self {
            reader: Box::new(reader),
            size,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self::new(std::io::Cursor::new(bytes), size)
    }
}

/// A backend read: the object descriptor plus the byte stream for the
/// requested (possibly ranged) content.
pub struct ObjectReader {
    pub info: ObjectInfo,
    pub stream: Box<dyn AsyncRead + Send + Unpin>,
}

#[derive(Clone, Debug, Default)]
pub struct PutObjectOptions {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub user_defined: BTreeMap<String, String>,
}

/// Descriptor for one uploaded multipart part.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PartInfo {
    pub part_number: u16,
    pub etag: String,
    pub size: u64,
    pub mod_time_millis: u64,
}

/// Reference to a previously uploaded part in a complete-multipart request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u16,
    pub etag: String,
}

/// The remote object layer the cache accelerates.
///
/// The cache only ever talks to the backend through this trait; concrete
/// implementations (S3 gateway, another node, a test double) are injected at
/// construction time.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn get_object_info(&self, bucket: &str, object: &str)
        -> Result<ObjectInfo, BackendError>;

    async fn get_object(
        &self,
        bucket: &str,
        object: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectReader, BackendError>;

    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        body: ObjectBody,
        opts: PutObjectOptions,
    ) -> Result<ObjectInfo, BackendError>;

    async fn delete_object(&self, bucket: &str, object: &str) -> Result<(), BackendError>;

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        opts: PutObjectOptions,
    ) -> Result<ObjectInfo, BackendError>;

    async fn new_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        opts: PutObjectOptions,
    ) -> Result<String, BackendError>;

    async fn put_object_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: u16,
        body: ObjectBody,
    ) -> Result<PartInfo, BackendError>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo, BackendError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> Result<(), BackendError>;
}
