//! Integration registrar - scan, translate, register
//!
//! Owns the "generation" of discovered-app tools currently in the registry
//! and replaces it wholesale on every rescan. Rescans are single-flight: a
//! rescan requested while one is running is folded into the running one,
//! which then makes one more pass.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::scanner::Scanner;
use super::schema::DiscoveredApp;
use super::translator::Translator;
use crate::apps::PackageEvent;
use crate::registry::ToolRegistry;

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Result of one completed generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescanSummary {
    pub apps: usize,
    pub tools: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanOutcome {
    /// This call ran the rescan itself
    Completed(RescanSummary),
    /// Another rescan was already running and will pick this request up
    Coalesced,
}

struct Background {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct IntegrationRegistrar {
    scanner: Arc<Scanner>,
    translator: Translator,
    registry: ToolRegistry,
    /// Tool names registered by the last generation
    generation: tokio::sync::Mutex<Vec<String>>,
    pending: AtomicBool,
    discovered: watch::Sender<Vec<DiscoveredApp>>,
    debounce: Duration,
    listen: bool,
    background: Mutex<Option<Background>>,
}

impl IntegrationRegistrar {
    pub fn new(scanner: Arc<Scanner>, translator: Translator, registry: ToolRegistry) -> Self {
        let (discovered, _) = watch::channel(Vec::new());
        Self {
            scanner,
            translator,
            registry,
            generation: tokio::sync::Mutex::new(Vec::new()),
            pending: AtomicBool::new(false),
            discovered,
            debounce: DEFAULT_DEBOUNCE,
            listen: true,
            background: Mutex::new(None),
        }
    }

    /// Quiet period after the last package event before rescanning.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Whether `register_all` starts the package listener.
    pub fn with_listener(mut self, listen: bool) -> Self {
        self.listen = listen;
        self
    }

    /// Observable list of apps found by the most recent scan.
    pub fn discovered_apps(&self) -> watch::Receiver<Vec<DiscoveredApp>> {
        self.discovered.subscribe()
    }

    /// Tool names of the current generation.
    pub async fn registered_tool_names(&self) -> Vec<String> {
        self.generation.lock().await.clone()
    }

    /// Start listening for package changes, then run the initial rescan.
    pub async fn register_all(self: &Arc<Self>) -> RescanOutcome {
        if self.listen {
            let events = self.scanner.subscribe_changes();
            match self.scanner.register_listener() {
                Ok(()) => self.spawn_listener(events),
                Err(e) => warn!("package listener unavailable, automatic rescans disabled: {e:#}"),
            }
        }
        self.rescan().await
    }

    fn spawn_listener(self: &Arc<Self>, events: broadcast::Receiver<PackageEvent>) {
        let mut background = self.background.lock();
        if background.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen_for_changes(
            Arc::downgrade(self),
            events,
            cancel.clone(),
            self.debounce,
        ));
        *background = Some(Background { cancel, task });
    }

    /// Replace the current generation of tools with a fresh scan.
    pub async fn rescan(&self) -> RescanOutcome {
        self.pending.store(true, Ordering::Release);
        let mut last = None;
        loop {
            let Ok(mut generation) = self.generation.try_lock() else {
                debug!("rescan already running, request coalesced");
                return last.map_or(RescanOutcome::Coalesced, RescanOutcome::Completed);
            };
            while self.pending.swap(false, Ordering::AcqRel) {
                last = Some(self.run_generation(&mut generation).await);
            }
            drop(generation);
            // A request may have landed between the last check and the unlock.
            if !self.pending.load(Ordering::Acquire) {
                break;
            }
        }
        last.map_or(RescanOutcome::Coalesced, RescanOutcome::Completed)
    }

    async fn run_generation(&self, generation: &mut Vec<String>) -> RescanSummary {
        info!("starting app scan");

        for name in generation.drain(..) {
            self.registry.remove(&name);
        }

        let apps = self.scanner.scan().await;
        self.discovered.send_replace(apps.clone());

        if apps.is_empty() {
            info!("no provider apps found");
            return RescanSummary::default();
        }

        for app in &apps {
            match self.translator.translate_app(app) {
                Ok(tools) => {
                    for tool in tools {
                        let name = tool.name().to_string();
                        // Earlier generations are gone, so anything left is someone else's.
                        if self.registry.contains(&name) && !generation.contains(&name) {
                            warn!(app = %app.label, tool = %name, "tool name already taken, skipping");
                            continue;
                        }
                        self.registry.register(tool);
                        generation.push(name);
                    }
                }
                Err(e) => error!(app = %app.label, "error translating tools: {e}"),
            }
        }

        info!(tools = generation.len(), apps = apps.len(), "registered app tools");
        RescanSummary {
            apps: apps.len(),
            tools: generation.len(),
        }
    }

    /// Stop listening and remove every tool of the current generation.
    pub async fn cleanup(&self) {
        if let Some(background) = self.background.lock().take() {
            background.cancel.cancel();
            background.task.abort();
        }
        self.scanner.unregister_listener();

        let mut generation = self.generation.lock().await;
        for name in generation.drain(..) {
            self.registry.remove(&name);
        }
        drop(generation);

        self.discovered.send_replace(Vec::new());
        info!("app integration cleaned up");
    }
}

impl Drop for IntegrationRegistrar {
    fn drop(&mut self) {
        if let Some(background) = self.background.get_mut().take() {
            background.cancel.cancel();
            background.task.abort();
        }
    }
}

async fn listen_for_changes(
    registrar: Weak<IntegrationRegistrar>,
    mut events: broadcast::Receiver<PackageEvent>,
    cancel: CancellationToken,
    debounce: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Ok(PackageEvent::Error(e)) => {
                    warn!("package listener error: {e}");
                    continue;
                }
                Ok(event) => info!(?event, "package change detected"),
                Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "package events lagged"),
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }

        // Let a burst of events settle before scanning.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(debounce) => break,
                event = events.recv() => {
                    if matches!(event, Err(broadcast::error::RecvError::Closed)) {
                        return;
                    }
                }
            }
        }

        let Some(registrar) = registrar.upgrade() else {
            return;
        };
        if let RescanOutcome::Completed(summary) = registrar.rescan().await {
            debug!(?summary, "background rescan finished");
        }
    }
}
