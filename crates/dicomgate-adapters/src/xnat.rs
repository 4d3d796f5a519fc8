use async_trait::async_trait;
use dicomgate_types::{SendReport, TransportError};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{DestinationAdapter, SendContext};

/// XNAT instance configuration.
#[derive(Debug, Clone)]
pub struct XnatConfig {
    pub name: String,
    pub url: String,
    pub username: String,
    pub password: String,
    pub import_path: String,
    pub auto_archive: bool,
    pub timeout: Duration,
    /// Internal retries for transient HTTP failures (5xx, connection
    /// reset), distinct from the pipeline retry queue
    pub max_retries: u32,
    pub pool_size: usize,
    /// Scratch directory for the temporary session zip
    pub cache_dir: PathBuf,
}

/// XNAT adapter: zip the study, POST it to the import service, then
/// trigger the archive action when the import lands in the prearchive.
pub struct XnatAdapter {
    config: XnatConfig,
    client: reqwest::Client,
}

impl XnatAdapter {
    pub fn new(config: XnatConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_size)
            .build()
            .map_err(|e| TransportError::permanent(format!("http client init failed: {}", e)))?;
        Ok(Self { config, client })
    }

    fn import_url(&self) -> String {
        format!(
            "{}{}",
            self.config.url.trim_end_matches('/'),
            self.config.import_path
        )
    }

    /// Zip the instance files into a temp archive in the cache dir.
    fn build_zip(files: &[PathBuf], cache_dir: &Path) -> Result<tempfile::NamedTempFile, TransportError> {
        std::fs::create_dir_all(cache_dir)
            .map_err(|e| TransportError::transient(format!("cache dir unavailable: {}", e)))?;
        let tmp = tempfile::Builder::new()
            .prefix("xnat-session-")
            .suffix(".zip")
            .tempfile_in(cache_dir)
            .map_err(|e| TransportError::transient(format!("cannot create temp zip: {}", e)))?;

        let mut zip = zip::ZipWriter::new(tmp.reopen().map_err(|e| {
            TransportError::transient(format!("cannot open temp zip: {}", e))
        })?);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for file in files {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| TransportError::permanent(format!("bad file name {}", file.display())))?;
            zip.start_file(name, options)
                .map_err(|e| TransportError::transient(format!("zip write failed: {}", e)))?;
            let bytes = std::fs::read(file)
                .map_err(|e| TransportError::transient(format!("cannot read {}: {}", file.display(), e)))?;
            std::io::Write::write_all(&mut zip, &bytes)
                .map_err(|e| TransportError::transient(format!("zip write failed: {}", e)))?;
        }
        zip.finish()
            .map_err(|e| TransportError::transient(format!("zip finalize failed: {}", e)))?;
        Ok(tmp)
    }

    async fn upload_once(
        &self,
        zip_path: &Path,
        ctx: &SendContext,
    ) -> Result<String, TransportError> {
        let bytes = tokio::fs::read(zip_path)
            .await
            .map_err(|e| TransportError::transient(format!("cannot read temp zip: {}", e)))?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name("session.zip")
            .mime_str("application/zip")
            .map_err(|e| TransportError::permanent(format!("multipart build failed: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.import_url())
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(&[
                ("project", ctx.project.clone().unwrap_or_default()),
                ("subject", ctx.subject.clone().unwrap_or_default()),
                ("session", ctx.session.clone().unwrap_or_default()),
                ("autoArchive", self.config.auto_archive.to_string()),
                ("overwrite", "append".to_string()),
            ])
            .multipart(form)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(body.trim().to_string())
        } else {
            Err(classify_http_status(status, &body))
        }
    }

    /// The import service answers with the prearchive session path when the
    /// upload did not auto-archive; commit it with the archive action.
    async fn archive_action(&self, prearchive_path: &str) -> Result<(), TransportError> {
        let response = self
            .client
            .post(format!(
                "{}/data/services/archive",
                self.config.url.trim_end_matches('/')
            ))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(&[("src", prearchive_path)])
            .send()
            .await
            .map_err(classify_reqwest)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_http_status(status, &body))
        }
    }
}

/// 5xx, 408, 429 and connection-level failures are retriable; other 4xx
/// responses are permanent.
fn classify_http_status(status: reqwest::StatusCode, body: &str) -> TransportError {
    let message = format!("xnat returned {}", status);
    let detail = body.chars().take(300).collect::<String>();
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        TransportError::transient(message).with_details(detail)
    } else {
        TransportError::permanent(message).with_details(detail)
    }
}

fn classify_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        TransportError::transient(format!("xnat request failed: {}", e))
    } else {
        TransportError::permanent(format!("xnat request failed: {}", e))
    }
}

#[async_trait]
impl DestinationAdapter for XnatAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn echo(&self, _cancel: &CancellationToken) -> bool {
        let response = self
            .client
            .get(format!(
                "{}/data/JSESSION",
                self.config.url.trim_end_matches('/')
            ))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await;
        matches!(response, Ok(r) if r.status().is_success())
    }

    async fn send_study(
        &self,
        files: &[PathBuf],
        ctx: &SendContext,
        cancel: &CancellationToken,
    ) -> Result<SendReport, TransportError> {
        let started = Instant::now();
        let files_owned = files.to_vec();
        let cache_dir = self.config.cache_dir.clone();

        // Temp zip; removed on drop, including on cancellation.
        let zip_file = tokio::task::spawn_blocking(move || Self::build_zip(&files_owned, &cache_dir))
            .await
            .map_err(|e| TransportError::permanent(format!("zip task failed: {}", e)))??;

        let mut attempt = 0;
        let body = loop {
            if cancel.is_cancelled() {
                return Err(TransportError::transient("send cancelled"));
            }
            let upload = self.upload_once(zip_file.path(), ctx);
            let result = tokio::select! {
                r = upload => r,
                _ = cancel.cancelled() => Err(TransportError::transient("send cancelled")),
            };
            match result {
                Ok(body) => break body,
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(
                        500 * attempt as u64 + rand::thread_rng().gen_range(0..250),
                    );
                    warn!(
                        destination = %self.config.name,
                        attempt,
                        error = %e,
                        "transient xnat failure, retrying upload"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        };

        if !self.config.auto_archive && body.contains("/prearchive/") {
            if let Err(e) = self.archive_action(&body).await {
                debug!(destination = %self.config.name, error = %e, "archive action failed");
            }
        }

        info!(
            destination = %self.config.name,
            files = files.len(),
            "session uploaded"
        );
        Ok(SendReport::success(files.len(), started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{basic_auth, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, cache: &Path) -> XnatConfig {
        XnatConfig {
            name: "xnatA".into(),
            url: server.uri(),
            username: "admin".into(),
            password: "secret".into(),
            import_path: "/data/services/import".into(),
            auto_archive: true,
            timeout: Duration::from_secs(10),
            max_retries: 2,
            pool_size: 2,
            cache_dir: cache.to_path_buf(),
        }
    }

    fn study_files(dir: &Path) -> Vec<PathBuf> {
        let a = dir.join("a.dcm");
        let b = dir.join("b.dcm");
        std::fs::write(&a, b"DICM-a").unwrap();
        std::fs::write(&b, b"DICM-b").unwrap();
        vec![a, b]
    }

    #[tokio::test]
    async fn test_upload_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/data/services/import"))
            .and(query_param("project", "TRIAL"))
            .and(query_param("autoArchive", "true"))
            .and(basic_auth("admin", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string("/archive/sessions/1"))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::TempDir::new().unwrap();
        let adapter = XnatAdapter::new(config(&server, tmp.path())).unwrap();
        let ctx = SendContext {
            project: Some("TRIAL".into()),
            subject: Some("SUBJ_1".into()),
            session: Some("SESS_1".into()),
            ..Default::default()
        };
        let report = adapter
            .send_study(&study_files(tmp.path()), &ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.files_transferred, 2);
    }

    #[tokio::test]
    async fn test_transient_5xx_retried_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/data/services/import"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/data/services/import"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::TempDir::new().unwrap();
        let adapter = XnatAdapter::new(config(&server, tmp.path())).unwrap();
        let report = adapter
            .send_study(
                &study_files(tmp.path()),
                &SendContext::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(report.success);
    }

    #[tokio::test]
    async fn test_4xx_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/data/services/import"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::TempDir::new().unwrap();
        let adapter = XnatAdapter::new(config(&server, tmp.path())).unwrap();
        let err = adapter
            .send_study(
                &study_files(tmp.path()),
                &SendContext::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_echo_probes_jsession() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/JSESSION"))
            .and(basic_auth("admin", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string("token"))
            .mount(&server)
            .await;

        let tmp = tempfile::TempDir::new().unwrap();
        let adapter = XnatAdapter::new(config(&server, tmp.path())).unwrap();
        assert!(adapter.echo(&CancellationToken::new()).await);
    }
}
