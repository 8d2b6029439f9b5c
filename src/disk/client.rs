//! The metainfo descriptor client.
//!
//! Torrent metadata originates outside the swarm: a descriptor service maps
//! `(namespace, digest)` to the serialized metainfo. The archive fetches
//! through this trait so tests and embedders can substitute their own
//! source.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::StatusCode;
use url::Url;

use crate::error::archive::DownloadError;
use crate::metainfo::MetaInfo;
use crate::Digest;

/// Escaped when the namespace is embedded as a single path segment;
/// namespaces routinely contain slashes (`library/busybox`).
const NAMESPACE_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?');

#[async_trait]
pub trait MetainfoClient: Send + Sync + 'static {
    async fn download(
        &self,
        namespace: &str,
        digest: &Digest,
    ) -> Result<MetaInfo, DownloadError>;
}

/// Fetches descriptors over HTTP.
pub struct HttpMetainfoClient {
    client: reqwest::Client,
    base: Url,
}

impl HttpMetainfoClient {
    pub fn new(base: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base,
        }
    }

    fn url(&self, namespace: &str, digest: &Digest) -> String {
        format!(
            "{}/namespace/{}/blobs/{}/metainfo",
            self.base.as_str().trim_end_matches('/'),
            utf8_percent_encode(namespace, NAMESPACE_ESCAPE),
            digest,
        )
    }
}

#[async_trait]
impl MetainfoClient for HttpMetainfoClient {
    async fn download(
        &self,
        namespace: &str,
        digest: &Digest,
    ) -> Result<MetaInfo, DownloadError> {
        let url = self.url(namespace, digest);
        log::debug!("Fetching metainfo from {}", url);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(DownloadError::NotFound);
        }
        if !resp.status().is_success() {
            return Err(DownloadError::Status(resp.status()));
        }
        let body = resp.bytes().await?;
        Ok(MetaInfo::from_bytes(&body)?)
    }
}
