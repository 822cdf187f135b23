use crate::error::{OverlayError, Result};
use async_trait::async_trait;
use base64::Engine;
use std::path::PathBuf;

/// Resolves a document's `source_url` to raw bytes.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Local paths, `file://` URLs and `data:` URIs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFetcher;

#[async_trait]
impl SourceFetcher for LocalFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let url = url.trim();
        if url.starts_with("data:") {
            return parse_data_uri(url);
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Err(OverlayError::fetch(format!(
                "{url}: remote sources need the `http` feature"
            )));
        }
        let path = local_path(url)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| OverlayError::fetch(format!("{}: {e}", path.display())))
    }
}

fn local_path(url: &str) -> Result<PathBuf> {
    let raw = url.strip_prefix("file://").unwrap_or(url);
    let decoded = urlencoding::decode(raw)
        .map_err(|e| OverlayError::fetch(format!("{url}: path is not valid utf-8: {e}")))?;
    Ok(PathBuf::from(decoded.into_owned()))
}

pub(crate) fn parse_data_uri(uri: &str) -> Result<Vec<u8>> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| OverlayError::fetch("not a data uri"))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| OverlayError::fetch("data uri has no payload"))?;
    if meta.split(';').any(|part| part.eq_ignore_ascii_case("base64")) {
        let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        base64::engine::general_purpose::STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| OverlayError::fetch(format!("invalid base64 data uri: {e}")))
    } else {
        Ok(urlencoding::decode_binary(payload.as_bytes()).into_owned())
    }
}

/// HTTP(S) sources through `reqwest`, everything else through [`LocalFetcher`].
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return LocalFetcher.fetch(url).await;
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| OverlayError::fetch(format!("{url}: {e}")))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| OverlayError::fetch(format!("{url}: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn data_uris_decode_base64_and_plain_payloads() {
        let bytes = LocalFetcher.fetch("data:text/plain;base64,aGVsbG8=").await.unwrap();
        assert_eq!(bytes, b"hello");
        let plain = LocalFetcher.fetch("data:,a%20b").await.unwrap();
        assert_eq!(plain, b"a b");
        let binary = LocalFetcher.fetch("data:application/octet-stream,%FF%00%zz").await.unwrap();
        assert_eq!(binary, b"\xff\x00%zz");
    }

    #[test]
    fn file_url_paths_are_percent_decoded() {
        assert_eq!(
            local_path("file:///sets/Sunday%20AM/caf%C3%A9.pdf").unwrap(),
            PathBuf::from("/sets/Sunday AM/café.pdf")
        );
        assert_eq!(local_path("/plain/100%.png").unwrap(), PathBuf::from("/plain/100%.png"));
        let err = local_path("file:///bad/%FF.pdf").unwrap_err();
        assert!(matches!(err, OverlayError::Fetch(_)));
    }

    #[tokio::test]
    async fn file_urls_and_plain_paths_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sheet one.png");
        std::fs::write(&path, b"pixels").unwrap();
        let plain = LocalFetcher.fetch(path.to_str().unwrap()).await.unwrap();
        assert_eq!(plain, b"pixels");
        let encoded = format!("file://{}", path.to_str().unwrap().replace(' ', "%20"));
        assert_eq!(LocalFetcher.fetch(&encoded).await.unwrap(), b"pixels");
    }

    #[tokio::test]
    async fn missing_files_and_remote_urls_are_fetch_errors() {
        let err = LocalFetcher.fetch("/definitely/not/here.pdf").await.unwrap_err();
        assert!(matches!(err, OverlayError::Fetch(_)));
        let err = LocalFetcher.fetch("https://example.com/a.pdf").await.unwrap_err();
        assert!(err.to_string().contains("http"));
    }
}
