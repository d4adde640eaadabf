//! Remote manager daemon: accepts script uploads and execution requests.
//!
//! The daemon speaks JSON over HTTP: `POST /upload` stores a file,
//! `POST /execute` runs a command and returns `(stdout, stderr, error)`, and
//! `POST /map` runs several scripts, replying in order.

use std::time::Duration;

use camino::Utf8Path;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    Backend, BackendError, BackendFuture, LaunchHandle, LaunchRequest, ScriptFile, options,
    read_local_file,
};
use crate::launch::LaunchConfig;
use crate::settings::Settings;

const DEFAULT_SCRIPT_NAME: &str = "sortie_launch.sh";

/// Grace added on top of a remote execution timeout before the HTTP call gives up.
const EXECUTE_SLACK: Duration = Duration::from_secs(30);

/// `(stdout, stderr, error)` reported by the manager.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ManagerReply {
    /// Remote standard output.
    #[serde(default)]
    pub stdout: String,
    /// Remote standard error.
    #[serde(default)]
    pub stderr: String,
    /// Error raised by the manager itself.
    #[serde(default)]
    pub error: Option<String>,
}

/// Client for the manager daemon.
pub trait ManagerClient: Send + Sync {
    /// Uploads the local file at `local` to `remote` on the manager host.
    fn upload_file<'a>(&'a self, local: &'a Utf8Path, remote: &'a str) -> BackendFuture<'a, ()>;

    /// Runs `command`, optionally bounded by `timeout_secs`.
    fn execute<'a>(
        &'a self,
        command: &'a str,
        timeout_secs: Option<u64>,
    ) -> BackendFuture<'a, ManagerReply>;

    /// Runs each script and returns the replies in order.
    fn map<'a>(&'a self, scripts: &'a [String]) -> BackendFuture<'a, Vec<ManagerReply>>;
}

#[derive(Debug, Deserialize)]
struct ManagerOptions {
    host: String,
    launch_dir: String,
    #[serde(default)]
    script_name: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Serialize)]
struct UploadBody<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ExecuteBody<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

#[derive(Serialize)]
struct MapBody<'a> {
    scripts: &'a [String],
}

/// HTTP/JSON implementation of [`ManagerClient`].
///
/// Only uploads are bounded by the client timeout. An execution waits as long
/// as the remote job runs, or its own timeout plus a grace period.
#[derive(Clone, Debug)]
pub struct HttpManagerClient {
    base: String,
    token: Option<String>,
    upload_timeout: Duration,
    http: reqwest::Client,
}

impl HttpManagerClient {
    /// Creates a client for the daemon at `base` (e.g. `http://10.0.0.5:8000`)
    /// whose uploads give up after `upload_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Http`] when the HTTP client cannot be built.
    pub fn new(
        base: &str,
        token: Option<String>,
        upload_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(upload_timeout)
            .build()
            .map_err(|err| BackendError::Http {
                message: err.to_string(),
            })?;
        let trimmed = base.trim_end_matches('/');
        let normalised = if trimmed.contains("://") {
            trimmed.to_owned()
        } else {
            format!("http://{trimmed}")
        };
        Ok(Self {
            base: normalised,
            token,
            upload_timeout,
            http,
        })
    }

    /// Creates a client from the `host` and `token` launch options.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Options`] when `host` is missing.
    pub fn from_launch(config: &LaunchConfig, settings: &Settings) -> Result<Self, BackendError> {
        let opts: ManagerOptions = options(config)?;
        Self::new(
            &opts.host,
            opts.token,
            Duration::from_secs(settings.manager_http_timeout_secs),
        )
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        route: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<T, BackendError> {
        let url = format!("{}/{route}", self.base);
        let mut builder = self.http.post(&url).json(body);
        if let Some(limit) = timeout {
            builder = builder.timeout(limit);
        }
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(|err| BackendError::Http {
            message: err.to_string(),
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|err| BackendError::Http {
            message: err.to_string(),
        })?;
        if !status.is_success() {
            return Err(BackendError::Provider {
                program: url,
                status: status.to_string(),
                stderr: text,
            });
        }
        if text.trim().is_empty() {
            return serde_json::from_str("null").map_err(|err| BackendError::Encode {
                message: err.to_string(),
            });
        }
        serde_json::from_str(&text).map_err(|err| BackendError::Encode {
            message: err.to_string(),
        })
    }
}

impl ManagerClient for HttpManagerClient {
    fn upload_file<'a>(&'a self, local: &'a Utf8Path, remote: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let content = read_local_file(local)?;
            let _: serde_json::Value = self
                .post(
                    "upload",
                    &UploadBody {
                        path: remote,
                        content: &content,
                    },
                    Some(self.upload_timeout),
                )
                .await?;
            Ok(())
        })
    }

    fn execute<'a>(
        &'a self,
        command: &'a str,
        timeout_secs: Option<u64>,
    ) -> BackendFuture<'a, ManagerReply> {
        Box::pin(async move {
            self.post(
                "execute",
                &ExecuteBody {
                    command,
                    timeout: timeout_secs,
                },
                timeout_secs
                    .map(|secs| Duration::from_secs(secs).saturating_add(EXECUTE_SLACK)),
            )
            .await
        })
    }

    fn map<'a>(&'a self, scripts: &'a [String]) -> BackendFuture<'a, Vec<ManagerReply>> {
        Box::pin(async move { self.post("map", &MapBody { scripts }, None).await })
    }
}

/// Uploads the script to the manager and runs it there.
pub struct ManagerBackend<'a> {
    client: &'a dyn ManagerClient,
}

impl<'a> ManagerBackend<'a> {
    /// Creates the adapter around `client`.
    #[must_use]
    pub const fn new(client: &'a dyn ManagerClient) -> Self {
        Self { client }
    }

    /// Pushes mount host setup fragments ahead of the full script.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] from the client.
    pub fn host_setup<'b>(&'b self, fragments: &'b [String]) -> BackendFuture<'b, Vec<ManagerReply>> {
        Box::pin(async move {
            info!(fragments = fragments.len(), "unpacking mounts through the manager");
            let replies = self.client.map(fragments).await?;
            for reply in &replies {
                log_reply(reply);
            }
            Ok(replies)
        })
    }
}

fn log_reply(reply: &ManagerReply) {
    if !reply.stdout.trim().is_empty() {
        info!(stdout = %reply.stdout.trim_end(), "manager output");
    }
    if reply.error.is_some() || !reply.stderr.trim().is_empty() {
        warn!(stderr = %reply.stderr.trim_end(), error = ?reply.error, "manager reported errors");
    }
}

impl Backend for ManagerBackend<'_> {
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, LaunchHandle> {
        Box::pin(async move {
            let opts: ManagerOptions = options(&request.config)?;
            let name = opts.script_name.as_deref().unwrap_or(DEFAULT_SCRIPT_NAME);
            let remote = format!("{}/{name}", opts.launch_dir.trim_end_matches('/'));

            let file = ScriptFile::write("sortie-launch-", &request.script)?;
            self.client.upload_file(file.path(), &remote).await?;
            debug!(remote = %remote, "uploaded launch script to manager");

            let command = format!("bash {remote}");
            let reply = self.client.execute(&command, opts.timeout).await?;
            log_reply(&reply);
            Ok(LaunchHandle::Manager(reply))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeManagerClient;
    use rstest::rstest;
    use serde_yaml::Mapping;
    use uuid::Uuid;

    fn request(text: &str) -> LaunchRequest {
        let raw: Mapping = serde_yaml::from_str(text).expect("yaml fixture");
        LaunchRequest {
            script: String::from("#!/bin/bash\necho hi\n"),
            config: LaunchConfig::from_mapping(raw).expect("launch parses"),
            run_id: Uuid::nil(),
        }
    }

    #[tokio::test]
    async fn launch_uploads_then_executes() {
        let client = FakeManagerClient::new(ManagerReply {
            stdout: String::from("hi\n"),
            ..ManagerReply::default()
        });
        let backend = ManagerBackend::new(&client);

        let handle = backend
            .launch(&request(
                "type: manager\nhost: 10.0.0.5:8000\nlaunch_dir: /srv/launch/\ntimeout: 60\n",
            ))
            .await
            .expect("launches");

        let calls = client.calls();
        assert_eq!(
            calls.uploads,
            vec![(
                String::from("/srv/launch/sortie_launch.sh"),
                String::from("#!/bin/bash\necho hi\n")
            )]
        );
        assert_eq!(
            calls.executed,
            vec![(String::from("bash /srv/launch/sortie_launch.sh"), Some(60))]
        );
        assert!(matches!(handle, LaunchHandle::Manager(ref reply) if reply.stdout == "hi\n"));
        assert_eq!(handle.remote_error(), None);
    }

    #[tokio::test]
    async fn remote_stderr_is_reported_not_raised() {
        let client = FakeManagerClient::new(ManagerReply {
            stderr: String::from("boom"),
            error: Some(String::from("exit 1")),
            ..ManagerReply::default()
        });
        let backend = ManagerBackend::new(&client);

        let handle = backend
            .launch(&request("type: manager\nhost: h\nlaunch_dir: /l\nscript_name: go.sh\n"))
            .await
            .expect("launch itself succeeds");

        let remote = handle.remote_error().expect("remote error surfaced");
        assert_eq!(remote.error.as_deref(), Some("exit 1"));
        assert_eq!(client.calls().executed.first().map(|(cmd, _)| cmd.as_str()), Some("bash /l/go.sh"));
    }

    #[tokio::test]
    async fn host_setup_maps_every_fragment() {
        let client = FakeManagerClient::new(ManagerReply::default());
        let backend = ManagerBackend::new(&client);
        let fragments = vec![String::from("a;"), String::from("b;")];

        let replies = backend.host_setup(&fragments).await.expect("maps");

        assert_eq!(replies.len(), 2);
        assert_eq!(client.calls().mapped, vec![fragments]);
    }

    /// Serves one request, replying with `body` after `delay`.
    fn slow_daemon(delay: Duration, body: &'static str) -> String {
        use std::io::{BufRead, BufReader, Read, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = listener.local_addr().expect("listener address");
        std::thread::spawn(move || -> std::io::Result<()> {
            let (stream, _) = listener.accept()?;
            let mut reader = BufReader::new(stream);
            let mut length = 0_usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line)? == 0 || line == "\r\n" {
                    break;
                }
                if let Some((_, value)) = line
                    .split_once(':')
                    .filter(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                {
                    length = value.trim().parse().unwrap_or(0);
                }
            }
            let mut request_body = vec![0_u8; length];
            reader.read_exact(&mut request_body)?;
            std::thread::sleep(delay);
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            reader.get_mut().write_all(reply.as_bytes())
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn executions_outlive_the_upload_timeout() {
        let addr = slow_daemon(Duration::from_secs(2), r#"{"stdout":"done"}"#);
        let client =
            HttpManagerClient::new(&addr, None, Duration::from_secs(1)).expect("client builds");

        let reply = client
            .execute("bash /srv/sortie_launch.sh", None)
            .await
            .expect("execution waits for the job");

        assert_eq!(reply.stdout, "done");
    }

    #[tokio::test]
    async fn bounded_executions_wait_past_their_timeout_for_the_reply() {
        let addr = slow_daemon(Duration::from_secs(2), r#"{"stdout":"done"}"#);
        let client =
            HttpManagerClient::new(&addr, None, Duration::from_secs(1)).expect("client builds");

        let reply = client
            .execute("bash /srv/sortie_launch.sh", Some(1))
            .await
            .expect("grace covers the remote timeout");

        assert_eq!(reply.stdout, "done");
    }

    #[tokio::test]
    async fn uploads_give_up_after_the_upload_timeout() {
        let addr = slow_daemon(Duration::from_secs(3), "null");
        let client =
            HttpManagerClient::new(&addr, None, Duration::from_secs(1)).expect("client builds");
        let file = ScriptFile::write("sortie-upload-", "echo hi\n").expect("script written");

        let err = client
            .upload_file(file.path(), "/srv/sortie_launch.sh")
            .await
            .expect_err("upload times out");

        assert!(matches!(err, BackendError::Http { .. }), "{err:?}");
    }

    #[rstest]
    #[case("10.0.0.5:8000", "http://10.0.0.5:8000")]
    #[case("https://manager.example/", "https://manager.example")]
    fn base_urls_are_normalised(#[case] host: &str, #[case] expected: &str) {
        let client =
            HttpManagerClient::new(host, None, Duration::from_secs(1)).expect("client builds");

        assert_eq!(client.base, expected);
    }
}
