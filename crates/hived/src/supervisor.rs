//! Ties the injection engine to the session registry.
//!
//! - [`Supervisor::inject`] injects one process and registers it Pending
//! - [`Supervisor::refresh`] scans, injects new instances, adopts already
//!   injected ones and reaps sessions whose process exited
//! - [`Supervisor::on_hotkey`] routes a pressed chord
//!
//! Injection blocks on remote calls, so it always runs on the blocking pool;
//! the registry keeps serving channel traffic meanwhile.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_core::{KeyChord, ProcessKey, SessionId};
use hive_inject::{
    Classification, InjectError, InjectOutcome, Injector, ProcessCandidate, ProcessScanner,
};
use thiserror::Error;

use crate::config::{ConfigError, RetryConfig, SupervisorConfig};
use crate::hotkeys::{GlobalAction, HotkeyError, HotkeyRouter, HotkeyTarget};
use crate::registry::{RegistryError, RegistryHandle};

/// Errors surfaced by supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Process {pid} is not a running {target}")]
    NotATarget { pid: u32, target: String },

    #[error(transparent)]
    Inject(#[from] InjectError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hotkey(#[from] HotkeyError),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Counters from one refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub candidates: usize,
    pub injected: usize,
    pub adopted: usize,
    pub failed: usize,
    pub reaped: usize,
}

/// Result of a successful injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectReport {
    pub session_id: SessionId,
    pub outcome: InjectOutcome,
}

/// Cheap to clone; clones share the scanner, injector and hotkey bindings.
#[derive(Clone)]
pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    registry: RegistryHandle,
    scanner: Arc<Mutex<ProcessScanner>>,
    injector: Arc<Injector>,
    hotkeys: Arc<Mutex<HotkeyRouter>>,
    /// Instances already given their one automatic injection attempt
    attempted: Arc<Mutex<HashSet<ProcessKey>>>,
}

impl Supervisor {
    /// Creates a supervisor and binds the configured global hotkeys.
    pub fn new(
        config: SupervisorConfig,
        registry: RegistryHandle,
        scanner: ProcessScanner,
        injector: Injector,
    ) -> Result<Self, SupervisorError> {
        let mut router = HotkeyRouter::new();
        for hotkey in &config.hotkeys {
            router.register(hotkey.chord.clone(), HotkeyTarget::Global(hotkey.action.clone()))?;
        }

        Ok(Self {
            config: Arc::new(config),
            registry,
            scanner: Arc::new(Mutex::new(scanner)),
            injector: Arc::new(injector),
            hotkeys: Arc::new(Mutex::new(router)),
            attempted: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    // ========================================================================
    // Injection
    // ========================================================================

    /// Injects a running target process now and registers it Pending.
    ///
    /// # Errors
    ///
    /// - `SupervisorError::NotATarget` if `pid` is not the target executable
    /// - `SupervisorError::Inject` once the AccessDenied retries are spent,
    ///   or on any other injection failure
    pub async fn inject(&self, pid: u32) -> Result<InjectReport, SupervisorError> {
        let scanner = Arc::clone(&self.scanner);
        let candidate = tokio::task::spawn_blocking(move || lock(&scanner).lookup(pid))
            .await
            .map_err(|e| SupervisorError::Task(e.to_string()))?
            .ok_or_else(|| SupervisorError::NotATarget {
                pid,
                target: self.config.target_executable.clone(),
            })?;

        self.inject_candidate(&candidate, Duration::ZERO).await
    }

    /// Like [`inject`](Self::inject), after waiting `delay` for the client to
    /// finish starting up.
    pub async fn inject_delayed(&self, pid: u32, delay: Duration) -> Result<InjectReport, SupervisorError> {
        sleep(delay).await;
        self.inject(pid).await
    }

    /// Waits `delay`, injects with bounded AccessDenied retries, then
    /// registers the session.
    async fn inject_candidate(
        &self,
        candidate: &ProcessCandidate,
        delay: Duration,
    ) -> Result<InjectReport, SupervisorError> {
        let key = candidate.key();
        if !delay.is_zero() {
            debug!(pid = key.pid, delay_ms = delay.as_millis() as u64, "Delaying injection");
            sleep(delay).await;
        }

        let outcome = inject_with_retry(Arc::clone(&self.injector), key.pid, self.config.retry).await?;

        let session_id = match self.registry.register_pending(key).await {
            Ok(session_id) => session_id,
            Err(RegistryError::SessionAlreadyExists(session_id)) => session_id,
            Err(e) => return Err(e.into()),
        };

        Ok(InjectReport {
            session_id,
            outcome,
        })
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// One scan pass.
    ///
    /// Sessions of exited processes are reaped. Instances not yet in the
    /// registry are injected (when `auto_inject` is set and they have not
    /// been tried before) or, if the module is already mapped, adopted as
    /// Pending so their channel is accepted.
    pub async fn refresh(&self) -> Result<RefreshSummary, SupervisorError> {
        let scanner = Arc::clone(&self.scanner);
        let (live, classified) = tokio::task::spawn_blocking(move || {
            let mut scanner = lock(&scanner);
            let candidates: Vec<ProcessCandidate> = scanner.scan().collect();
            let live: HashSet<ProcessKey> = candidates.iter().map(ProcessCandidate::key).collect();
            let classified: Vec<(ProcessCandidate, Classification)> = candidates
                .into_iter()
                .map(|c| {
                    let class = scanner.classify(&c);
                    (c, class)
                })
                .collect();
            (live, classified)
        })
        .await
        .map_err(|e| SupervisorError::Task(e.to_string()))?;

        let mut summary = RefreshSummary {
            candidates: classified.len(),
            ..RefreshSummary::default()
        };

        summary.reaped = self.registry.reap(live.clone()).await;
        lock(&self.attempted).retain(|key| live.contains(key));

        let known: HashSet<ProcessKey> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .map(|view| ProcessKey::new(view.pid, view.started_at))
            .collect();

        for (candidate, class) in classified {
            let key = candidate.key();
            if known.contains(&key) {
                continue;
            }
            match class {
                Classification::AlreadyInjected => match self.registry.register_pending(key).await {
                    Ok(session_id) => {
                        info!(session_id = %session_id, pid = key.pid, "Adopted injected process");
                        summary.adopted += 1;
                    }
                    Err(e) => debug!(pid = key.pid, error = %e, "Adoption skipped"),
                },
                Classification::NotInjected if self.config.auto_inject => {
                    if !lock(&self.attempted).insert(key) {
                        continue;
                    }
                    match self.inject_candidate(&candidate, self.config.inject_delay()).await {
                        Ok(report) => {
                            info!(
                                session_id = %report.session_id,
                                pid = key.pid,
                                outcome = ?report.outcome,
                                "Process injected"
                            );
                            summary.injected += 1;
                        }
                        Err(e) => {
                            warn!(pid = key.pid, error = %e, "Injection failed");
                            summary.failed += 1;
                        }
                    }
                }
                Classification::NotInjected | Classification::Ineligible => {}
            }
        }

        debug!(?summary, "Refresh complete");
        Ok(summary)
    }

    /// Refreshes every `scan_interval` until cancelled.
    ///
    /// A pass still running when the next tick fires is not doubled up.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pass: Option<JoinHandle<()>> = None;

        info!(
            target = %self.config.target_executable,
            auto_inject = self.config.auto_inject,
            "Supervisor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if pass.as_ref().is_some_and(|p| !p.is_finished()) {
                        debug!("Previous refresh still running");
                        continue;
                    }
                    let this = self.clone();
                    pass = Some(tokio::spawn(async move {
                        if let Err(e) = this.refresh().await {
                            warn!(error = %e, "Refresh failed");
                        }
                    }));
                }
            }
        }

        if let Some(pass) = pass {
            pass.abort();
        }
        info!("Supervisor stopped");
    }

    // ========================================================================
    // Unload & hotkeys
    // ========================================================================

    /// Sends `ForceUnload` to every connected session.
    pub async fn unload_all(&self) -> Vec<SessionId> {
        self.registry.unload_all().await
    }

    pub fn bind_hotkey(&self, chord: KeyChord, target: HotkeyTarget) -> Result<(), SupervisorError> {
        lock(&self.hotkeys).register(chord, target)?;
        Ok(())
    }

    pub fn unbind_hotkey(&self, chord: &KeyChord, target: &HotkeyTarget) -> Result<(), SupervisorError> {
        lock(&self.hotkeys).unregister(chord, target)?;
        Ok(())
    }

    /// Records the focused session, if any.
    pub fn set_foreground(&self, session: Option<SessionId>) {
        lock(&self.hotkeys).set_foreground(session);
    }

    /// Routes a pressed chord and performs the built-in part of the action.
    ///
    /// Session routes publish `Activated`; `unload_all` unloads every
    /// session. The route is returned so a collaborator can handle named
    /// actions. Returns `None` when the chord is dropped.
    pub async fn on_hotkey(&self, chord: &KeyChord) -> Option<HotkeyTarget> {
        let route = lock(&self.hotkeys).on_trigger(chord)?;

        match &route {
            HotkeyTarget::Session(session_id) => {
                if let Err(e) = self.registry.activate(session_id.clone()).await {
                    debug!(chord = %chord, error = %e, "Hotkey target is gone");
                    return None;
                }
            }
            HotkeyTarget::Global(GlobalAction::UnloadAll) => {
                let sessions = self.unload_all().await;
                info!(chord = %chord, count = sessions.len(), "Unload hotkey");
            }
            HotkeyTarget::Global(GlobalAction::Named(name)) => {
                debug!(chord = %chord, action = %name, "Hotkey routed to collaborator");
            }
        }
        Some(route)
    }
}

/// Runs the injector on the blocking pool, retrying only on AccessDenied.
async fn inject_with_retry(
    injector: Arc<Injector>,
    pid: u32,
    retry: RetryConfig,
) -> Result<InjectOutcome, InjectError> {
    let mut attempt = 1;
    loop {
        let worker = Arc::clone(&injector);
        let result = tokio::task::spawn_blocking(move || worker.inject(pid))
            .await
            .unwrap_or_else(|e| {
                Err(InjectError::RemoteFault {
                    pid,
                    reason: format!("injection task failed: {e}"),
                })
            });

        match result {
            Err(InjectError::AccessDenied { .. }) if attempt < retry.attempts => {
                warn!(pid, attempt, max = retry.attempts, "Access denied, retrying");
                attempt += 1;
                sleep(retry.interval()).await;
            }
            other => return other,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{spawn_registry, DEFAULT_PENDING_TIMEOUT};
    use hive_inject::mock::{LoaderBehavior, MockBackend};
    use hive_inject::{InjectorConfig, ProcessSource};

    struct Fixed(Vec<ProcessCandidate>);

    impl ProcessSource for Fixed {
        fn processes(&mut self) -> Vec<ProcessCandidate> {
            self.0.clone()
        }
    }

    fn candidate(pid: u32) -> ProcessCandidate {
        ProcessCandidate {
            pid,
            started_at: 100,
            name: "eqgame.exe".to_string(),
            exe_path: None,
        }
    }

    fn supervisor(backend: &MockBackend, pids: &[u32], retry: RetryConfig) -> Supervisor {
        let module = std::env::temp_dir().join("hive").join("hive.dll");
        let config = SupervisorConfig {
            module_path: Some(module.clone()),
            retry: RetryConfig {
                interval_ms: 1,
                ..retry
            },
            ..SupervisorConfig::default()
        };
        let scanner = ProcessScanner::new(
            Box::new(Fixed(pids.iter().copied().map(candidate).collect())),
            Arc::new(backend.clone()),
            "eqgame.exe",
            "hive.dll",
        );
        let injector = Injector::new(
            Arc::new(backend.clone()),
            InjectorConfig::new(module).with_timeout(Duration::from_millis(50)),
        );
        Supervisor::new(config, spawn_registry(DEFAULT_PENDING_TIMEOUT), scanner, injector).unwrap()
    }

    #[tokio::test]
    async fn test_inject_registers_pending() {
        let backend = MockBackend::new();
        backend.spawn_with_loader(10, LoaderBehavior::Load);
        let sup = supervisor(&backend, &[10], RetryConfig::default());

        let report = sup.inject(10).await.unwrap();
        assert_eq!(report.outcome, InjectOutcome::Injected);
        assert_eq!(report.session_id.as_str(), "10-100");
        assert_eq!(sup.registry().snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_inject_unknown_pid() {
        let backend = MockBackend::new();
        let sup = supervisor(&backend, &[10], RetryConfig::default());
        assert!(matches!(
            sup.inject(99).await,
            Err(SupervisorError::NotATarget { pid: 99, .. })
        ));
    }

    #[tokio::test]
    async fn test_access_denied_is_retried_then_reported() {
        let backend = MockBackend::new();
        backend.spawn_with_loader(10, LoaderBehavior::Load);
        backend.deny_access(10);
        let sup = supervisor(
            &backend,
            &[10],
            RetryConfig {
                attempts: 2,
                interval_ms: 1,
            },
        );

        assert!(matches!(
            sup.inject(10).await,
            Err(SupervisorError::Inject(InjectError::AccessDenied { pid: 10 }))
        ));
        assert!(sup.registry().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_injects_adopts_and_does_not_retry() {
        let backend = MockBackend::new();
        backend.spawn_with_loader(1, LoaderBehavior::Load);
        backend.spawn(2);
        backend.map_module(2, "hive.dll", 0x1000_0000, vec![0; 0x100]);
        backend.spawn_with_loader(3, LoaderBehavior::Fail);
        let sup = supervisor(&backend, &[1, 2, 3], RetryConfig::default());

        let first = sup.refresh().await.unwrap();
        assert_eq!(first.candidates, 3);
        assert_eq!(first.injected, 1);
        assert_eq!(first.adopted, 1);
        assert_eq!(first.failed, 1);

        let second = sup.refresh().await.unwrap();
        assert_eq!(second, RefreshSummary {
            candidates: 3,
            ..RefreshSummary::default()
        });
        assert_eq!(backend.threads_started(3), 1);
    }

    #[tokio::test]
    async fn test_unload_hotkey_routes_to_unload_all() {
        let backend = MockBackend::new();
        let sup = supervisor(&backend, &[], RetryConfig::default());

        let chord: KeyChord = "ctrl+shift+u".parse().unwrap();
        assert_eq!(
            sup.on_hotkey(&chord).await,
            Some(HotkeyTarget::Global(GlobalAction::UnloadAll))
        );
        assert_eq!(sup.on_hotkey(&"ctrl+k".parse().unwrap()).await, None);
    }
}
