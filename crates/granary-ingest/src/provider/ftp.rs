//! FTP provider client
//!
//! `suppaftp` is synchronous, so every command runs on the blocking pool. One
//! control connection is opened lazily and reused for the rest of the run;
//! any protocol error drops it so the next call reconnects. Calls queue for
//! the connection before their timeout starts, so a long transfer does not
//! make the commands waiting behind it time out.
//!
//! All sessions use Extended Passive Mode (EPSV) for NAT/firewall compatibility.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use granary_common::types::{EntryKind, FileDescriptor, ListEntry};
use granary_common::{GranaryError, Result};
use std::io;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::credentials::Credentials;
use super::stream::{finish, spawn_blocking_body};
use super::{retry_list_on_timeout, with_timeout, Protocol, ProviderClient, ProviderConfig, ProviderContext, SyncedObject};
use crate::lister::{list_recursive, DirectoryLister};
use crate::store::content_type_for;

pub const DEFAULT_FTP_PORT: u16 = 21;
pub const ANONYMOUS_USER: &str = "anonymous";
pub const ANONYMOUS_PASSWORD: &str = "password";

/// Reply code for "file unavailable"
const FILE_UNAVAILABLE: u32 = 550;

type Session = Arc<Mutex<Option<FtpStream>>>;

#[derive(Debug, Clone)]
struct Login {
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

pub struct FtpProviderClient {
    host: String,
    port: u16,
    credentials: Credentials,
    ctx: ProviderContext,
    session: Session,
}

impl FtpProviderClient {
    pub fn new(config: &ProviderConfig, ctx: ProviderContext) -> Self {
        // Unencrypted providers fall back to anonymous login.
        let (username, password) = if config.encrypted {
            (config.username.clone(), config.password.clone())
        } else {
            (
                Some(config.username.clone().unwrap_or_else(|| ANONYMOUS_USER.to_string())),
                Some(config.password.clone().unwrap_or_else(|| ANONYMOUS_PASSWORD.to_string())),
            )
        };

        Self {
            host: config.host.clone(),
            port: config.port.unwrap_or(DEFAULT_FTP_PORT),
            credentials: Credentials::new(username, password, config.encrypted, ctx.decryptors.clone()),
            ctx,
            session: Arc::new(Mutex::new(None)),
        }
    }

    fn remote_url(&self, remote_path: &str) -> String {
        format!("ftp://{}/{}", self.host, remote_path.trim_start_matches('/'))
    }

    async fn login(&self) -> Result<Login> {
        let resolved = self.credentials.resolve().await?;
        let username = resolved
            .username
            .clone()
            .ok_or_else(|| GranaryError::Config("FTP username not set".into()))?;
        let password = resolved
            .password
            .clone()
            .ok_or_else(|| GranaryError::Config("FTP password not set".into()))?;

        Ok(Login {
            host: self.host.clone(),
            port: self.port,
            username,
            password,
            timeout: self.ctx.timeout,
        })
    }

    /// Run `op` against the shared session on the blocking pool
    async fn with_session<T, F>(&self, operation: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T> + Send + 'static,
    {
        let login = self.login().await?;
        let label = operation.to_string();

        // Waiting behind a sibling's transfer is not counted against the timeout.
        let mut session = self.session.clone().lock_owned().await;
        let task = tokio::task::spawn_blocking(move || run_in_session(&mut session, &login, op));
        with_timeout(self.ctx.timeout, &label, async {
            task.await
                .map_err(|e| GranaryError::Transport(format!("FTP task panicked: {}", e)))?
        })
        .await
    }

    async fn list_once(&self, path: &str) -> Result<Vec<ListEntry>> {
        let target = path.to_string();
        let lines = self
            .with_session(&format!("LIST {}", path), move |ftp| {
                ftp.list(Some(&target)).map_err(|e| normalize_ftp_error(e, &target))
            })
            .await?;

        Ok(lines
            .iter()
            .filter_map(|line| parse_list_line(line))
            .filter(|entry| entry.name != "." && entry.name != "..")
            .collect())
    }
}

fn connect(login: &Login) -> Result<FtpStream> {
    debug!(host = %login.host, port = login.port, "Connecting to FTP server");

    let addr = (login.host.as_str(), login.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            GranaryError::RemoteResource(format!("Cannot resolve FTP host {}", login.host))
        })?;

    let mut ftp = FtpStream::connect_timeout(addr, login.timeout)
        .map_err(|e| normalize_ftp_error(e, &login.host))?;
    ftp.get_ref().set_read_timeout(Some(login.timeout))?;

    ftp.set_mode(Mode::ExtendedPassive);

    debug!(username = %login.username, "Logging in");
    ftp.login(&login.username, &login.password)
        .map_err(|e| normalize_ftp_error(e, &login.host))?;
    ftp.transfer_type(FileType::Binary)
        .map_err(|e| normalize_ftp_error(e, &login.host))?;

    Ok(ftp)
}

fn run_in_session<T>(
    guard: &mut Option<FtpStream>,
    login: &Login,
    op: impl FnOnce(&mut FtpStream) -> Result<T>,
) -> Result<T> {
    if guard.is_none() {
        *guard = Some(connect(login)?);
    }
    let ftp = guard
        .as_mut()
        .ok_or_else(|| GranaryError::Transport("FTP session not open".into()))?;

    let result = op(ftp);
    if result.is_err() {
        // A failed command can leave the control channel mid-reply.
        guard.take();
    }
    result
}

/// Map suppaftp errors onto the shared error kinds
fn normalize_ftp_error(err: FtpError, context: &str) -> GranaryError {
    match err {
        FtpError::UnexpectedResponse(response) => {
            let code = response.status.code();
            let text = String::from_utf8_lossy(&response.body).trim().to_string();
            let message = format!(
                "FTP Code {}: {} This may be caused by user permissions disallowing the listing.",
                code, text
            );
            if code == FILE_UNAVAILABLE {
                GranaryError::FileNotFound(format!("{}: {}", context, message))
            } else {
                GranaryError::Transport(format!("{}: {}", context, message))
            }
        },
        FtpError::ConnectionError(e) if is_io_timeout(&e) => {
            GranaryError::RemoteResource(format!("{}: Timed out: {}", context, e))
        },
        FtpError::ConnectionError(e) => GranaryError::RemoteResource(format!("{}: {}", context, e)),
        other => GranaryError::Transport(format!("{}: FTP error: {}", context, other)),
    }
}

fn is_io_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Parse one Unix-style `LIST` line
///
/// `drwxr-xr-x   2 ftp ftp  4096 Jan 15 12:00 dirname`
/// `-rw-r--r--   1 ftp ftp  1234 Jan 15  2024 file name.txt`
pub fn parse_list_line(line: &str) -> Option<ListEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 9 {
        return None;
    }

    let kind = match parts[0].chars().next()? {
        'd' => EntryKind::Directory,
        '-' => EntryKind::File,
        // Links and devices are not walked.
        _ => return None,
    };

    // The name is everything after the eighth field, spaces included.
    let mut rest = line.trim_start();
    for _ in 0..8 {
        rest = rest.split_once(char::is_whitespace)?.1.trim_start();
    }

    Some(ListEntry {
        name: rest.trim_end().to_string(),
        kind,
        size: parts[4].parse().unwrap_or(0),
        time: parse_list_time(parts[5], parts[6], parts[7], Utc::now()),
    })
}

/// `Jan 15 12:00` (within the last year) or `Jan 15 2024`
fn parse_list_time(month: &str, day: &str, year_or_time: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if year_or_time.contains(':') {
        let stamp = format!("{} {} {} {}", month, day, now.year(), year_or_time);
        let parsed = NaiveDateTime::parse_from_str(&stamp, "%b %d %Y %H:%M").ok()?.and_utc();
        if parsed > now {
            let stamp = format!("{} {} {} {}", month, day, now.year() - 1, year_or_time);
            return Some(NaiveDateTime::parse_from_str(&stamp, "%b %d %Y %H:%M").ok()?.and_utc());
        }
        Some(parsed)
    } else {
        let stamp = format!("{} {} {}", month, day, year_or_time);
        let date = NaiveDate::parse_from_str(&stamp, "%b %d %Y").ok()?;
        Some(date.and_hms_opt(0, 0, 0)?.and_utc())
    }
}

#[async_trait]
impl DirectoryLister for FtpProviderClient {
    async fn list_directory(&self, path: &str) -> Result<Vec<ListEntry>> {
        retry_list_on_timeout(path, || self.list_once(path)).await
    }
}

#[async_trait]
impl ProviderClient for FtpProviderClient {
    fn protocol(&self) -> Protocol {
        Protocol::Ftp
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn list(&self, path: &str) -> Result<Vec<FileDescriptor>> {
        let files = list_recursive(self, path).await?;
        info!(count = files.len(), "Files found on FTP provider");
        Ok(files)
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<PathBuf> {
        info!(url = %self.remote_url(remote_path), local = %local_path.display(), "Downloading");

        let remote = remote_path.to_string();
        let local = local_path.to_path_buf();
        self.with_session(&format!("RETR {}", remote_path), move |ftp| {
            let mut file = std::fs::File::create(&local)?;
            ftp.retr(&remote, |reader| {
                io::copy(reader, &mut file).map_err(FtpError::ConnectionError)
            })
            .map_err(|e| normalize_ftp_error(e, &remote))?;
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
            run_in_session(&mut session, &login, |ftp| {
                ftp.retr(&remote, |reader| {
                    sender.forward(reader).map_err(FtpError::ConnectionError)
                })
                .map_err(|e| normalize_ftp_error(e, &remote))?;
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
        let Some(mut ftp) = self.session.lock().await.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || {
            if let Err(e) = ftp.quit() {
                warn!("Failed to quit FTP session gracefully: {}", e);
            }
        })
        .await
        .map_err(|e| GranaryError::Transport(format!("FTP close task panicked: {}", e)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;
    use chrono::TimeZone;

    #[test]
    fn test_parse_directory_entry() {
        let entry = parse_list_line("drwxr-xr-x   2 ftp ftp  4096 Jan 15 12:00 MOD09GQ").unwrap();
        assert_eq!(entry.name, "MOD09GQ");
        assert!(entry.is_directory());
    }

    #[test]
    fn test_parse_file_entry_with_spaces() {
        let entry =
            parse_list_line("-rw-r--r--   1 ftp ftp  123456 Jan 15  2024 granule one.hdf").unwrap();
        assert_eq!(entry.name, "granule one.hdf");
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.size, 123456);
        assert_eq!(entry.time.unwrap(), Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_skips_links_and_short_lines() {
        assert!(parse_list_line("lrwxrwxrwx 1 ftp ftp 7 Jan 15 12:00 latest -> v2").is_none());
        assert!(parse_list_line("total 12").is_none());
        assert!(parse_list_line("").is_none());
    }

    #[test]
    fn test_recent_listing_time_rolls_back_a_year() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let time = parse_list_time("Dec", "31", "23:59", now).unwrap();
        assert_eq!(time, Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 0).unwrap());
    }

    #[test]
    fn test_io_timeout_normalizes_to_timeout() {
        let err = normalize_ftp_error(
            FtpError::ConnectionError(io::Error::new(io::ErrorKind::WouldBlock, "resource unavailable")),
            "/data",
        );
        assert!(err.is_timeout());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_anonymous_defaults() {
        let config = ProviderConfig {
            id: None,
            protocol: Protocol::Ftp,
            host: "ftp.example.com".into(),
            port: None,
            username: None,
            password: None,
            encrypted: false,
            private_key: None,
            cm_key_id: None,
            certificate_uri: None,
            http_list_timeout: None,
        };
        let ctx = ProviderContext::new(Arc::new(MemoryObjectStore::new()), "system", "stack");
        let client = FtpProviderClient::new(&config, ctx);

        assert_eq!(client.port, DEFAULT_FTP_PORT);
        assert_eq!(client.remote_url("/pub/a.hdf"), "ftp://ftp.example.com/pub/a.hdf");

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let login = rt.block_on(client.login()).unwrap();
        assert_eq!(login.username, ANONYMOUS_USER);
        assert_eq!(login.password, ANONYMOUS_PASSWORD);
    }

    #[tokio::test]
    async fn test_waiting_for_busy_session_is_not_a_timeout() {
        // Nothing listens on this port once the temporary listener is dropped.
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let config = ProviderConfig {
            id: None,
            protocol: Protocol::Ftp,
            host: "127.0.0.1".into(),
            port: Some(port),
            username: None,
            password: None,
            encrypted: false,
            private_key: None,
            cm_key_id: None,
            certificate_uri: None,
            http_list_timeout: None,
        };
        let ctx = ProviderContext::new(Arc::new(MemoryObjectStore::new()), "system", "stack")
            .with_timeout(Duration::from_millis(200));
        let client = FtpProviderClient::new(&config, ctx);

        // A sibling transfer holds the connection for longer than the timeout.
        let busy = client.session.clone().lock_owned().await;
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            drop(busy);
        });

        let err = client.with_session("NOOP", |_ftp| Ok(())).await.unwrap_err();
        release.await.unwrap();
        assert!(!err.is_timeout(), "queueing was reported as a timeout: {err}");
    }
}
