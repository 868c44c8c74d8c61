//! Providers running as child processes.
//!
//! Each provider speaks newline-delimited JSON-RPC 2.0 on stdin/stdout:
//! the hub sends `{"method": <verb>, "params": <extras>, "id": n}` and
//! expects `{"result": <extras>, "id": n}` back. Processes are spawned on
//! first use and kept alive between calls.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::{Extras, ProviderError, ProviderInfo, ProviderTransport};
use crate::apps::{AppDirectory, AppEntry, ProviderManifest};

const MAX_RESTARTS: u32 = 3;
const RESTART_RESET_WINDOW: Duration = Duration::from_secs(300); // 5 minutes

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Extras,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcReplyError>,
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RpcReplyError {
    code: i64,
    message: String,
}

type Pending = HashMap<u64, oneshot::Sender<Result<Extras, ProviderError>>>;

/// A spawned child. Replies are routed through its own pending map, so a
/// dying child can only fail requests that were sent to it.
struct RunningChild {
    child: Child,
    stdin: ChildStdin,
    pending: Arc<SyncMutex<Pending>>,
}

struct ProcessState {
    running: Option<RunningChild>,
    next_id: u64,
}

/// Removes an unanswered request from its child's pending map when the
/// caller stops waiting, and marks the process for replacement.
struct PendingRequest<'a> {
    pending: Arc<SyncMutex<Pending>>,
    id: u64,
    stale: &'a AtomicBool,
    answered: bool,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        if self.pending.lock().remove(&self.id).is_some() {
            self.stale.store(true, Ordering::Release);
        }
    }
}

/// One running (or restartable) provider process.
struct ProviderProcess {
    authority: String,
    manifest: ProviderManifest,
    working_dir: std::path::PathBuf,
    state: Mutex<ProcessState>,
    /// Set when a caller gave up on a request; the child is replaced on
    /// next use.
    stale: AtomicBool,
    restarts: Mutex<(u32, Option<Instant>)>,
}

impl ProviderProcess {
    fn new(entry: &AppEntry, manifest: ProviderManifest) -> Self {
        Self {
            authority: manifest.authority.clone(),
            manifest,
            working_dir: entry.dir.clone(),
            state: Mutex::new(ProcessState {
                running: None,
                next_id: 1,
            }),
            stale: AtomicBool::new(false),
            restarts: Mutex::new((0, None)),
        }
    }

    async fn spawn(&self) -> Result<RunningChild, ProviderError> {
        {
            let mut restarts = self.restarts.lock().await;
            let (count, last) = &mut *restarts;
            if last.is_some_and(|t| t.elapsed() > RESTART_RESET_WINDOW) {
                *count = 0;
            }
            if *count >= MAX_RESTARTS {
                return Err(ProviderError::Unavailable(format!(
                    "{} exceeded {} restarts",
                    self.authority, MAX_RESTARTS
                )));
            }
            *count += 1;
            *last = Some(Instant::now());
        }

        info!(authority = %self.authority, command = %self.manifest.command, "starting provider process");

        let mut cmd = Command::new(&self.manifest.command);
        cmd.args(&self.manifest.args)
            .envs(&self.manifest.env)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ProviderError::Unavailable(format!("failed to spawn {}: {e}", self.authority))
        })?;
        let missing = || ProviderError::Unavailable("provider stdio not captured".to_string());
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        let authority = self.authority.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(authority = %authority, "provider stderr: {line}");
            }
        });

        let pending: Arc<SyncMutex<Pending>> = Arc::default();
        let authority = self.authority.clone();
        let replies = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let reply = match serde_json::from_str::<RpcReply>(&line) {
                    Ok(reply) => reply,
                    Err(_) => {
                        debug!(authority = %authority, "provider stdout: {line}");
                        continue;
                    }
                };
                let Some(id) = reply.id else { continue };
                let waiting = replies.lock().remove(&id);
                match waiting {
                    Some(sender) => {
                        let _ = sender.send(decode_reply(reply));
                    }
                    None => debug!(authority = %authority, id, "late reply dropped"),
                }
            }
            // Fail whatever is still waiting so callers don't hang until timeout.
            let orphaned: Vec<_> = replies.lock().drain().collect();
            for (_, sender) in orphaned {
                let _ = sender.send(Err(ProviderError::Unavailable(
                    "provider process exited".to_string(),
                )));
            }
            info!(authority = %authority, "provider process closed its output");
        });

        Ok(RunningChild {
            child,
            stdin,
            pending,
        })
    }

    async fn request(&self, verb: &str, params: Extras) -> Result<Extras, ProviderError> {
        let (tx, rx) = oneshot::channel();
        let mut guard = {
            let mut state = self.state.lock().await;
            let stale = self.stale.swap(false, Ordering::AcqRel);
            let exited = match state.running.as_mut() {
                Some(running) => running.child.try_wait().ok().flatten().is_some(),
                None => true,
            };
            if stale || exited {
                if stale {
                    warn!(authority = %self.authority, "provider stopped answering; restarting process");
                }
                // Dropping the old child kills it.
                state.running = None;
                state.running = Some(self.spawn().await?);
            }

            let id = state.next_id;
            state.next_id += 1;
            let line = serde_json::to_string(&RpcRequest {
                jsonrpc: "2.0",
                method: verb,
                params,
                id,
            })
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;

            let running = state
                .running
                .as_mut()
                .ok_or_else(|| ProviderError::Unavailable("provider not connected".to_string()))?;
            running.pending.lock().insert(id, tx);
            let guard = PendingRequest {
                pending: running.pending.clone(),
                id,
                stale: &self.stale,
                answered: false,
            };

            let stdin = &mut running.stdin;
            let written = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                state.running = None;
                return Err(ProviderError::Unavailable(format!("write failed: {e}")));
            }
            guard
        };

        let reply = rx.await;
        guard.answered = true;
        reply.map_err(|_| ProviderError::Unavailable("provider dropped the request".to_string()))?
    }

    #[cfg(test)]
    async fn pending_requests(&self) -> usize {
        let state = self.state.lock().await;
        state
            .running
            .as_ref()
            .map_or(0, |running| running.pending.lock().len())
    }
}

fn decode_reply(reply: RpcReply) -> Result<Extras, ProviderError> {
    if let Some(error) = reply.error {
        return Err(ProviderError::Remote(format!(
            "RPC error {}: {}",
            error.code, error.message
        )));
    }
    match reply.result {
        Some(Value::Object(map)) => Ok(map),
        Some(Value::Null) | None => Err(ProviderError::NoResult),
        Some(other) => Err(ProviderError::Protocol(format!(
            "expected an object result, got {other}"
        ))),
    }
}

/// [`ProviderTransport`] that launches providers declared in an
/// [`AppDirectory`].
///
/// Manifests are read once and kept until [`refresh`](ProviderTransport::refresh),
/// which discovery calls at the start of every scan.
pub struct ProcessTransport {
    apps: AppDirectory,
    manifests: SyncMutex<Option<Arc<HashMap<String, AppEntry>>>>,
    processes: Mutex<HashMap<String, Arc<ProviderProcess>>>,
}

impl ProcessTransport {
    pub fn new(apps: AppDirectory) -> Self {
        Self {
            apps,
            manifests: SyncMutex::new(None),
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn load_manifests(&self) -> Result<Arc<HashMap<String, AppEntry>>, ProviderError> {
        let loaded = self
            .apps
            .providers()
            .map_err(|e| ProviderError::Unavailable(format!("{e:#}")))?;
        let loaded = Arc::new(loaded);
        *self.manifests.lock() = Some(loaded.clone());
        Ok(loaded)
    }

    fn manifests(&self) -> Result<Arc<HashMap<String, AppEntry>>, ProviderError> {
        let cached = self.manifests.lock().clone();
        match cached {
            Some(manifests) => Ok(manifests),
            None => self.load_manifests(),
        }
    }

    fn find(&self, authority: &str) -> Result<Option<AppEntry>, ProviderError> {
        Ok(self.manifests()?.get(authority).cloned())
    }

    async fn process_for(&self, authority: &str) -> Result<Arc<ProviderProcess>, ProviderError> {
        let entry = self.find(authority)?;

        let mut processes = self.processes.lock().await;
        let Some(entry) = entry else {
            // Uninstalled: drop (and thereby kill) any process left behind.
            processes.remove(authority);
            return Err(ProviderError::Unavailable(format!(
                "no provider registered for {authority}"
            )));
        };
        let manifest = entry.manifest.provider.clone().ok_or_else(|| {
            ProviderError::Unavailable(format!("no provider registered for {authority}"))
        })?;

        if let Some(existing) = processes.get(authority) {
            if existing.manifest == manifest {
                return Ok(existing.clone());
            }
            warn!(authority = %authority, "provider manifest changed; restarting process");
        }
        let process = Arc::new(ProviderProcess::new(&entry, manifest));
        processes.insert(authority.to_string(), process.clone());
        Ok(process)
    }
}

#[async_trait]
impl ProviderTransport for ProcessTransport {
    async fn resolve(&self, authority: &str) -> Result<Option<ProviderInfo>, ProviderError> {
        Ok(self.find(authority)?.map(|entry| ProviderInfo {
            package: entry.manifest.package,
        }))
    }

    async fn call(
        &self,
        authority: &str,
        verb: &str,
        extras: Extras,
    ) -> Result<Extras, ProviderError> {
        let process = self.process_for(authority).await?;
        process.request(verb, extras).await
    }

    async fn refresh(&self) {
        let manifests = match self.load_manifests() {
            Ok(manifests) => manifests,
            Err(e) => {
                warn!("failed to reload app manifests: {e}");
                return;
            }
        };
        let mut processes = self.processes.lock().await;
        processes.retain(|authority, process| {
            let keep = manifests
                .get(authority)
                .and_then(|entry| entry.manifest.provider.as_ref())
                .is_some_and(|manifest| *manifest == process.manifest);
            if !keep {
                info!(authority = %authority, "stopping provider of removed or changed app");
            }
            keep
        });
    }
}
