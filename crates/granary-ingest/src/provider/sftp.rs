//! SFTP provider client
//!
//! Built on `ssh2`, which is blocking; sessions live on the blocking pool the
//! same way the FTP client's do. Authentication uses a private key from the
//! stack's crypto folder when one is configured, otherwise the password.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use granary_common::types::{FileDescriptor, ListEntry};
use granary_common::{GranaryError, Result};
use ssh2::{ErrorCode, Session, Sftp};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument};

use super::credentials::{decrypt_with, Credentials};
use super::stream::{finish, spawn_blocking_body};
use super::{retry_list_on_timeout, with_timeout, Protocol, ProviderClient, ProviderConfig, ProviderContext, SyncedObject};
use crate::lister::{list_recursive, DirectoryLister};
use crate::store::content_type_for;

pub const DEFAULT_SFTP_PORT: u16 = 22;

/// `LIBSSH2_FX_NO_SUCH_FILE`
const SFTP_NO_SUCH_FILE: i32 = 2;
/// `LIBSSH2_ERROR_TIMEOUT`
const SESSION_TIMEOUT: i32 = -9;

struct SftpSession {
    // Keeps the channel's session alive.
    _session: Session,
    sftp: Sftp,
}

type SharedSession = Arc<Mutex<Option<SftpSession>>>;

#[derive(Clone)]
enum Auth {
    Password(String),
    PrivateKey(String),
}

#[derive(Clone)]
struct Login {
    host: String,
    port: u16,
    username: String,
    auth: Auth,
    timeout: Duration,
}

pub struct SftpProviderClient {
    host: String,
    port: u16,
    private_key: Option<String>,
    cm_key_id: Option<String>,
    credentials: Credentials,
    ctx: ProviderContext,
    /// Resolved once; the key fetch and KMS call are not repeated per operation
    login: OnceCell<Login>,
    session: SharedSession,
}

impl SftpProviderClient {
    pub fn new(config: &ProviderConfig, ctx: ProviderContext) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port.unwrap_or(DEFAULT_SFTP_PORT),
            private_key: config.private_key.clone(),
            cm_key_id: config.cm_key_id.clone(),
            credentials: Credentials::new(
                config.username.clone(),
                config.password.clone(),
                config.encrypted,
                ctx.decryptors.clone(),
            ),
            ctx,
            login: OnceCell::new(),
            session: Arc::new(Mutex::new(None)),
        }
    }

    fn remote_url(&self, remote_path: &str) -> String {
        format!("sftp://{}/{}", self.host, remote_path.trim_start_matches('/'))
    }

    /// Private key text, decrypted with KMS when the provider has a key id
    async fn load_private_key(&self, name: &str) -> Result<String> {
        let key = self.ctx.crypto_key(name);
        debug!(bucket = %self.ctx.system_bucket, %key, "Loading SFTP private key");

        let bytes = self.ctx.store.get_bytes(&self.ctx.system_bucket, &key).await?;
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|e| GranaryError::Config(format!("Private key {} is not UTF-8: {}", key, e)))?;

        if self.cm_key_id.is_none() {
            return Ok(text);
        }

        let kms: Vec<_> = self
            .ctx
            .decryptors
            .iter()
            .filter(|d| d.name() == "kms")
            .cloned()
            .collect();
        decrypt_with(&kms, &text).await
    }

    async fn login(&self) -> Result<Login> {
        self.login.get_or_try_init(|| self.resolve_login()).await.cloned()
    }

    async fn resolve_login(&self) -> Result<Login> {
        let resolved = self.credentials.resolve().await?;
        let username = resolved
            .username
            .clone()
            .ok_or_else(|| GranaryError::Config("SFTP username not set".into()))?;

        let auth = match &self.private_key {
            Some(name) => Auth::PrivateKey(self.load_private_key(name).await?),
            None => Auth::Password(resolved.password.clone().ok_or_else(|| {
                GranaryError::Config("SFTP provider needs a password or a private key".into())
            })?),
        };

        Ok(Login {
            host: self.host.clone(),
            port: self.port,
            username,
            auth,
            timeout: self.ctx.timeout,
        })
    }

    async fn with_session<T, F>(&self, operation: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        let login = self.login().await?;

        // Waiting behind a sibling's transfer is not counted against the timeout.
        let mut session = self.session.clone().lock_owned().await;
        let task = tokio::task::spawn_blocking(move || run_in_session(&mut session, &login, op));
        with_timeout(self.ctx.timeout, operation, async {
            task.await
                .map_err(|e| GranaryError::Transport(format!("SFTP task panicked: {}", e)))?
        })
        .await
    }
}

fn connect(login: &Login) -> Result<SftpSession> {
    info!(host = %login.host, port = login.port, "Establishing SFTP connection");

    let addr = (login.host.as_str(), login.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            GranaryError::RemoteResource(format!("Cannot resolve SFTP host {}", login.host))
        })?;
    let tcp = TcpStream::connect_timeout(&addr, login.timeout)
        .map_err(|e| io_error(e, &login.host))?;
    tcp.set_read_timeout(Some(login.timeout))?;
    tcp.set_write_timeout(Some(login.timeout))?;

    let mut session = Session::new().map_err(|e| ssh_error(e, &login.host))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(login.timeout.as_millis()).unwrap_or(u32::MAX));
    session.handshake().map_err(|e| ssh_error(e, &login.host))?;

    match &login.auth {
        Auth::Password(password) => {
            debug!(username = %login.username, "Authenticating with password");
            session.userauth_password(&login.username, password)
        },
        Auth::PrivateKey(key) => {
            debug!(username = %login.username, "Authenticating with private key");
            session.userauth_pubkey_memory(&login.username, None, key, None)
        },
    }
    .map_err(|e| GranaryError::Transport(format!("SFTP authentication failed for {}: {}", login.username, e)))?;

    if !session.authenticated() {
        return Err(GranaryError::Transport("SFTP authentication failed".into()));
    }

    let sftp = session.sftp().map_err(|e| ssh_error(e, &login.host))?;
    Ok(SftpSession { _session: session, sftp })
}

fn run_in_session<T>(
    guard: &mut Option<SftpSession>,
    login: &Login,
    op: impl FnOnce(&Sftp) -> Result<T>,
) -> Result<T> {
    if guard.is_none() {
        *guard = Some(connect(login)?);
    }
    let open = guard
        .as_ref()
        .ok_or_else(|| GranaryError::Transport("SFTP session not open".into()))?;

    let result = op(&open.sftp);
    if matches!(&result, Err(e) if !matches!(e, GranaryError::FileNotFound(_))) {
        guard.take();
    }
    result
}

fn ssh_error(err: ssh2::Error, context: &str) -> GranaryError {
    match err.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => {
            GranaryError::FileNotFound(format!("{}: no such file", context))
        },
        ErrorCode::Session(SESSION_TIMEOUT) => {
            GranaryError::RemoteResource(format!("{}: Timed out: {}", context, err))
        },
        _ => GranaryError::Transport(format!("{}: SFTP error: {}", context, err)),
    }
}

fn io_error(err: io::Error, context: &str) -> GranaryError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            GranaryError::RemoteResource(format!("{}: Timed out: {}", context, err))
        },
        _ => GranaryError::RemoteResource(format!("{}: {}", context, err)),
    }
}

fn stat_time(mtime: Option<u64>) -> Option<DateTime<Utc>> {
    mtime.and_then(|secs| DateTime::from_timestamp(i64::try_from(secs).ok()?, 0))
}

#[async_trait]
impl DirectoryLister for SftpProviderClient {
    async fn list_directory(&self, path: &str) -> Result<Vec<ListEntry>> {
        retry_list_on_timeout(path, || async move {
            let target = PathBuf::from(path);
            let label = path.to_string();
            self.with_session(&format!("readdir {}", path), move |sftp| {
                let listing = match sftp.readdir(&target) {
                    Ok(listing) => listing,
                    Err(e) if e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => {
                        debug!(path = %label, "Directory does not exist");
                        return Ok(Vec::new());
                    },
                    Err(e) => return Err(ssh_error(e, &label)),
                };

                Ok(listing
                    .into_iter()
                    .filter_map(|(entry, stat)| {
                        let name = entry.file_name()?.to_string_lossy().into_owned();
                        if name == "." || name == ".." {
                            return None;
                        }
                        let time = stat_time(stat.mtime);
                        let mut item = if stat.is_dir() {
                            ListEntry::directory(name)
                        } else if stat.is_file() {
                            ListEntry::file(name, stat.size.unwrap_or(0))
                        } else {
                            return None;
                        };
                        item.time = time;
                        Some(item)
                    })
                    .collect())
            })
            .await
        })
        .await
    }
}

#[async_trait]
impl ProviderClient for SftpProviderClient {
    fn protocol(&self) -> Protocol {
        Protocol::Sftp
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn list(&self, path: &str) -> Result<Vec<FileDescriptor>> {
        let files = list_recursive(self, path).await?;
        info!(count = files.len(), "Files found on SFTP provider");
        Ok(files)
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<PathBuf> {
        info!(url = %self.remote_url(remote_path), local = %local_path.display(), "Downloading");

        let remote = remote_path.to_string();
        let local = local_path.to_path_buf();
        self.with_session(&format!("download {}", remote_path), move |sftp| {
            let mut source = sftp.open(Path::new(&remote)).map_err(|e| ssh_error(e, &remote))?;
            let mut file = std::fs::File::create(&local)?;
            io::copy(&mut source, &mut file).map_err(|e| io_error(e, &remote))?;
            Ok(())
        })
        .await?;

        Ok(local_path.to_path_buf())
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn sync(&self, remote_path: &str, bucket: &str, key: &str) -> Result<SyncedObject> {
        let login = self.login().await?;
        let mut session = self.session.clone().lock_owned().await;
        let remote = remote_path.to_string();

        let (body, handle) = spawn_blocking_body(move |sender| {
            run_in_session(&mut session, &login, |sftp| {
                let mut source = sftp.open(Path::new(&remote)).map_err(|e| ssh_error(e, &remote))?;
                sender.forward(&mut source).map_err(|e| io_error(e, &remote))?;
                Ok(())
            })
        });

        let content_type = content_type_for(key);
        let upload = self
            .ctx
            .upload(&self.remote_url(remote_path), bucket, key, body, content_type.essence_str())
            .await;
        finish(handle, upload).await
    }

    async fn close(&self) -> Result<()> {
        let Some(open) = self.session.lock().await.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || drop(open))
        .await
        .map_err(|e| GranaryError::Transport(format!("SFTP close task panicked: {}", e)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use super::super::CredentialDecryptor;
    use crate::store::{MemoryObjectStore, ObjectStore};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(private_key: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            id: None,
            protocol: Protocol::Sftp,
            host: "sftp.example.com".into(),
            port: None,
            username: Some("ingest".into()),
            password: None,
            encrypted: false,
            private_key: private_key.map(String::from),
            cm_key_id: None,
            certificate_uri: None,
            http_list_timeout: None,
        }
    }

    #[test]
    fn test_default_port_and_url() {
        let ctx = ProviderContext::new(Arc::new(MemoryObjectStore::new()), "system", "stack");
        let client = SftpProviderClient::new(&config(None), ctx);
        assert_eq!(client.port, DEFAULT_SFTP_PORT);
        assert_eq!(client.remote_url("data/a.hdf"), "sftp://sftp.example.com/data/a.hdf");
    }

    #[tokio::test]
    async fn test_login_reads_private_key_from_crypto_folder() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put_bytes("system", "stack/crypto/ingest.pem", Bytes::from_static(b"KEY"), None)
            .await
            .unwrap();

        let ctx = ProviderContext::new(store, "system", "stack");
        let client = SftpProviderClient::new(&config(Some("ingest.pem")), ctx);
        let login = client.login().await.unwrap();
        assert!(matches!(login.auth, Auth::PrivateKey(ref key) if key == "KEY"));
    }

    /// Counts object reads on top of an in-memory store
    struct CountingStore {
        inner: MemoryObjectStore,
        reads: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for CountingStore {
        async fn head(&self, bucket: &str, key: &str) -> Result<Option<crate::store::ObjectMeta>> {
            self.inner.head(bucket, key).await
        }

        async fn put_stream(
            &self,
            bucket: &str,
            key: &str,
            body: crate::store::BodyStream,
            content_type: Option<&str>,
        ) -> Result<u64> {
            self.inner.put_stream(bucket, key, body, content_type).await
        }

        async fn get_stream(&self, bucket: &str, key: &str) -> Result<crate::store::BodyStream> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_stream(bucket, key).await
        }

        async fn copy(&self, source_bucket: &str, source_key: &str, dest_bucket: &str, dest_key: &str) -> Result<()> {
            self.inner.copy(source_bucket, source_key, dest_bucket, dest_key).await
        }

        async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
            self.inner.delete(bucket, key).await
        }

        async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<crate::store::ObjectMeta>> {
            self.inner.list_prefix(bucket, prefix).await
        }
    }

    /// Stands in for KMS: uppercases the ciphertext and counts calls
    struct FakeKms {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CredentialDecryptor for FakeKms {
        fn name(&self) -> &'static str {
            "kms"
        }

        async fn decrypt(&self, ciphertext: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ciphertext.to_uppercase())
        }
    }

    #[tokio::test]
    async fn test_private_key_is_fetched_and_decrypted_once() {
        let store = Arc::new(CountingStore { inner: MemoryObjectStore::new(), reads: AtomicU32::new(0) });
        store.inner.insert("system", "stack/crypto/ingest.pem", "sealed").await;
        let kms = Arc::new(FakeKms { calls: AtomicU32::new(0) });

        let ctx = ProviderContext::new(store.clone(), "system", "stack").with_decryptors(vec![kms.clone()]);
        let mut config = config(Some("ingest.pem"));
        config.cm_key_id = Some("alias/granary".into());
        let client = SftpProviderClient::new(&config, ctx);

        for _ in 0..3 {
            let login = client.login().await.unwrap();
            assert!(matches!(login.auth, Auth::PrivateKey(ref key) if key == "SEALED"));
        }
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        assert_eq!(kms.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_login_without_password_or_key() {
        let ctx = ProviderContext::new(Arc::new(MemoryObjectStore::new()), "system", "stack");
        let client = SftpProviderClient::new(&config(None), ctx);
        assert!(matches!(client.login().await, Err(GranaryError::Config(_))));
    }

    #[test]
    fn test_stat_time() {
        let time = stat_time(Some(1_700_000_000)).unwrap();
        assert_eq!(time.timestamp(), 1_700_000_000);
        assert!(stat_time(None).is_none());
    }
}
