//! HTTP/HTTPS provider client
//!
//! Listing scrapes anchor tags out of a server-generated directory index, one
//! level deep. Downloads and syncs stream the response body; their timeout
//! covers the wait for response headers only, so a large file may take as
//! long as it needs once the server starts sending.

use async_trait::async_trait;
use futures::StreamExt;
use granary_common::types::FileDescriptor;
use granary_common::{GranaryError, Result};
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use super::credentials::Credentials;
use super::{root_relative, with_timeout, Protocol, ProviderClient, ProviderConfig, ProviderContext, SyncedObject};
use crate::store::{content_type_for, parse_store_uri, BodyStream};

const USER_AGENT: &str = "granary-ingest";

static LINK_PATTERN: LazyLock<Result<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a href="([^>]*)">[^<]+</a>"#)
        .map_err(|e| GranaryError::InvalidArgument(format!("Invalid link pattern: {}", e)))
});

/// How much of a GET exchange the timeout bounds
#[derive(Debug, Clone, Copy)]
enum Deadline {
    /// Everything, body included; for index pages
    Request(Duration),
    /// Only until the response headers arrive; file bodies stream unbounded
    Headers(Duration),
}

pub struct HttpProviderClient {
    protocol: Protocol,
    host: String,
    port: Option<u16>,
    endpoint: String,
    certificate_uri: Option<String>,
    list_timeout: Option<Duration>,
    credentials: Credentials,
    ctx: ProviderContext,
    client: OnceCell<Client>,
}

impl HttpProviderClient {
    pub fn new(config: &ProviderConfig, ctx: ProviderContext) -> Result<Self> {
        if config.username.is_some() && config.password.is_none() {
            return Err(GranaryError::InvalidArgument(
                "Found provider username, but provider password is not defined".into(),
            ));
        }
        validate_host(&config.host)?;

        let protocol = match config.protocol {
            Protocol::Https => Protocol::Https,
            _ => Protocol::Http,
        };
        let endpoint = match config.port {
            Some(port) => format!("{}://{}:{}", protocol, config.host, port),
            None => format!("{}://{}", protocol, config.host),
        };

        Ok(Self {
            protocol,
            host: config.host.clone(),
            port: config.port,
            endpoint,
            certificate_uri: config.certificate_uri.clone(),
            list_timeout: config.http_list_timeout.map(Duration::from_secs),
            credentials: Credentials::new(
                config.username.clone(),
                config.password.clone(),
                config.encrypted,
                ctx.decryptors.clone(),
            ),
            ctx,
            client: OnceCell::new(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        if path.is_empty() {
            self.endpoint.clone()
        } else if path.starts_with('/') {
            format!("{}{}", self.endpoint, path)
        } else {
            format!("{}/{}", self.endpoint, path)
        }
    }

    /// HTTP client, built on first use so the CA bundle is fetched only once
    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                let mut builder = Client::builder().user_agent(USER_AGENT);

                if let Some(uri) = &self.certificate_uri {
                    let certificate = self.fetch_certificate(uri).await.map_err(|e| {
                        GranaryError::RemoteResource(format!("Failed to fetch CA certificate: {}", e))
                    })?;
                    builder = builder.add_root_certificate(certificate);
                }

                builder
                    .build()
                    .map_err(|e| GranaryError::Transport(format!("Failed to build HTTP client: {}", e)))
            })
            .await
    }

    async fn fetch_certificate(&self, uri: &str) -> Result<reqwest::Certificate> {
        let (bucket, key) = parse_store_uri(uri)?;
        debug!(%uri, "Fetching CA certificate");
        let pem = self.ctx.store.get_bytes(&bucket, &key).await?;
        reqwest::Certificate::from_pem(&pem)
            .map_err(|e| GranaryError::InvalidArgument(format!("Invalid certificate {}: {}", uri, e)))
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let resolved = self.credentials.resolve().await?;
        Ok(match &resolved.username {
            Some(username) => request.basic_auth(username, resolved.password.as_deref()),
            None => request,
        })
    }

    /// GET `url`, mapping failures through `on_status`
    async fn get(
        &self,
        url: &str,
        deadline: Deadline,
        on_status: impl FnOnce(StatusCode) -> GranaryError,
    ) -> Result<reqwest::Response> {
        let mut builder = self.client().await?.get(url);
        let headers_timeout = match deadline {
            Deadline::Request(timeout) => {
                builder = builder.timeout(timeout);
                timeout
            },
            Deadline::Headers(timeout) => timeout,
        };
        let request = self.authorized(builder).await?;
        let response = with_timeout(headers_timeout, &format!("GET {}", url), async move {
            request.send().await.map_err(request_error)
        })
        .await?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(on_status(status))
        }
    }

    /// Content type advertised by the server, if a HEAD request succeeds
    async fn head_content_type(&self, url: &str) -> Option<String> {
        let request = self
            .authorized(self.client().await.ok()?.head(url).timeout(self.ctx.timeout))
            .await
            .ok()?;

        match request.send().await {
            Ok(response) if response.status().is_success() => response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(String::from),
            Ok(response) => {
                info!(%url, status = %response.status(), "HEAD failed");
                None
            },
            Err(e) => {
                info!(%url, error = %e, "HEAD failed");
                None
            },
        }
    }
}

/// Accept an IP address or a syntactically valid hostname
pub fn validate_host(host: &str) -> Result<()> {
    if host.parse::<IpAddr>().is_ok() || is_valid_hostname(host) {
        return Ok(());
    }
    Err(GranaryError::InvalidArgument(format!(
        "provider host is not a valid hostname or IP: {}",
        host
    )))
}

fn is_valid_hostname(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

fn request_error(err: reqwest::Error) -> GranaryError {
    if err.is_timeout() {
        GranaryError::RemoteResource("Connection timed out".into())
    } else if err.is_connect() {
        GranaryError::RemoteResource(format!("Connection Error: {}", err))
    } else {
        GranaryError::Transport(format!("HTTP request failed: {}", err))
    }
}

/// File names linked from a directory index page
pub fn parse_index_links(page: &str, path: &str) -> Result<Vec<String>> {
    let pattern = LINK_PATTERN.as_ref().map_err(|e| GranaryError::InvalidArgument(e.to_string()))?;

    let mut names = Vec::new();
    for line in page.trim().lines() {
        for capture in pattern.captures_iter(line.trim()) {
            let target = &capture[1];
            let stripped = if path.is_empty() { target.to_string() } else { target.replacen(path, "", 1) };
            let name = stripped.trim_start_matches('/').trim_end();

            // Sort links and subdirectories are not files.
            if name.is_empty() || name.starts_with('?') || name.ends_with('/') {
                continue;
            }
            names.push(name.to_string());
        }
    }
    Ok(names)
}

fn body_stream(response: reqwest::Response) -> BodyStream {
    Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other)))
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn list(&self, path: &str) -> Result<Vec<FileDescriptor>> {
        let url = self.url(path);
        let timeout = self.list_timeout.unwrap_or(self.ctx.timeout);

        let response = self
            .get(&url, Deadline::Request(timeout), |status| match status {
                StatusCode::NOT_FOUND => GranaryError::RemoteResource(format!(
                    "Received a 404 error from {}. Check your endpoint!",
                    self.endpoint
                )),
                other => GranaryError::RemoteResource(format!(
                    "\"GET {}\" failed with status code {}",
                    url,
                    other.as_u16()
                )),
            })
            .await?;
        let page = response.text().await.map_err(request_error)?;

        let listing_path = root_relative(path);
        let files: Vec<FileDescriptor> = parse_index_links(&page, path)?
            .into_iter()
            .map(|name| FileDescriptor {
                name,
                path: listing_path.clone(),
                size: 0,
                time: None,
            })
            .collect();

        info!(count = files.len(), "Files found on HTTP provider");
        Ok(files)
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<PathBuf> {
        let url = self.url(remote_path);
        info!(%url, local = %local_path.display(), "Downloading");

        let basename = remote_path.rsplit('/').next().unwrap_or(remote_path).to_string();
        let response = self
            .get(&url, Deadline::Headers(self.ctx.timeout), |status| match status {
                StatusCode::FORBIDDEN => GranaryError::FileNotFound(format!(
                    "{} was not found on the server with 403 status",
                    basename
                )),
                StatusCode::NOT_FOUND => GranaryError::FileNotFound(format!("{} was not found", url)),
                other => GranaryError::RemoteResource(format!(
                    "\"GET {}\" failed with status code {}",
                    url,
                    other.as_u16()
                )),
            })
            .await?;

        let mut file = tokio::fs::File::create(local_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk.map_err(request_error)?).await?;
        }
        file.flush().await?;

        info!(%url, "Finished downloading");
        Ok(local_path.to_path_buf())
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn sync(&self, remote_path: &str, bucket: &str, key: &str) -> Result<SyncedObject> {
        let url = self.url(remote_path);
        let content_type = match self.head_content_type(&url).await {
            Some(content_type) => content_type,
            None => content_type_for(key).essence_str().to_string(),
        };

        let response = self
            .get(&url, Deadline::Headers(self.ctx.timeout), |status| match status {
                StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                    GranaryError::FileNotFound(format!("{} returned status {}", url, status.as_u16()))
                },
                other => GranaryError::RemoteResource(format!(
                    "\"GET {}\" failed with status code {}",
                    url,
                    other.as_u16()
                )),
            })
            .await?;

        self.ctx
            .upload(&url, bucket, key, body_stream(response), &content_type)
            .await
    }
}

impl std::fmt::Debug for HttpProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProviderClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .finish()
    }
}
