//! Public entry point: validates install requests, drives sessions through
//! preprocessing, download and installation, and publishes every state
//! change to the registered listeners.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::config::InstallConfig;
use crate::downloader::{AlwaysOnline, DownloadCallback, Downloader, NetworkMonitor};
use crate::error::{ErrorCode, Result, SplitError};
use crate::installer::{InstallResult, Installer, PendingUninstall};
use crate::integrity::{CertificateVerifier, SignatureVerifier};
use crate::manifest::{Manifest, ManifestVersions, ModuleDescriptor, VersionStartup};
use crate::paths::{CacheReport, PathStore};
use crate::preprocess::{BundledDir, BundledSource, DownloadPlan, DownloadPreprocessor};
use crate::session::{
    session_id_for, InstallSession, SessionListener, SessionRegistry, SessionState, SessionStatus,
};

/// Outcome of [`InstallOrchestrator::start_install`].
#[derive(Debug, Clone, PartialEq)]
pub enum StartInstall {
    /// A session was registered (or resubmitted) and will report through
    /// the listeners.
    Started(u32),
    /// Every module was installed already. No session exists; the state is
    /// a synthesized `POST_INSTALLED` snapshot with session id 0.
    AlreadyInstalled(SessionState),
}

impl StartInstall {
    pub fn session_id(&self) -> u32 {
        match self {
            StartInstall::Started(id) => *id,
            StartInstall::AlreadyInstalled(state) => state.session_id,
        }
    }
}

/// Per-module outcome of a deferred install.
#[derive(Debug, Clone, Default)]
pub struct DeferredReport {
    pub session_id: u32,
    pub installed: Vec<InstallResult>,
    pub failures: Vec<(String, ErrorCode)>,
    pub canceled: bool,
}

impl DeferredReport {
    pub fn is_success(&self) -> bool {
        !self.canceled && self.failures.is_empty()
    }
}

/// Handle on a deferred install running in the background.
#[derive(Debug)]
pub struct DeferredInstall {
    session_id: u32,
    module_names: Vec<String>,
    report: oneshot::Receiver<DeferredReport>,
}

impl DeferredInstall {
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn module_names(&self) -> &[String] {
        &self.module_names
    }

    /// Wait for the batch to finish.
    pub async fn wait(self) -> DeferredReport {
        match self.report.await {
            Ok(report) => report,
            Err(_) => {
                log::error!("Deferred install {} was dropped without a report", self.session_id);
                DeferredReport {
                    session_id: self.session_id,
                    installed: Vec::new(),
                    failures: self
                        .module_names
                        .into_iter()
                        .map(|name| (name, ErrorCode::InternalError))
                        .collect(),
                    canceled: false,
                }
            }
        }
    }
}

/// What [`process_startup`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    pub version: VersionStartup,
    pub removed: Vec<String>,
}

/// Work due at every process start: promote a pending manifest version and
/// remove modules scheduled for uninstall. Only the main process does either.
pub fn process_startup(config: &InstallConfig) -> Result<StartupReport> {
    let versions = ManifestVersions::new(&config.root_dir, config.lock_timeout());
    let version = versions.on_process_start(config.main_process)?;

    if let VersionStartup::Promoted { from, to } = &version {
        log::info!("Manifest {} replaced {}, sibling processes must restart", to, from);
        let pruned = versions.prune()?;
        log::debug!("Pruned {} stale manifest(s)", pruned);
    }

    let removed = match versions.current_manifest()? {
        Some(manifest) if config.main_process => {
            let paths = PathStore::new(&config.root_dir, manifest.id());
            PendingUninstall::new(&paths, config.lock_timeout())?
                .with_max_attempts(config.max_attempts)
                .run_pending(&paths)?
        }
        _ => Vec::new(),
    };

    Ok(StartupReport { version, removed })
}

struct Loaded {
    manifest: Manifest,
    paths: PathStore,
    installer: Installer,
}

struct Inner {
    config: InstallConfig,
    loaded: Option<Loaded>,
    registry: SessionRegistry,
    downloader: Arc<dyn Downloader>,
    network: Arc<dyn NetworkMonitor>,
    bundled: Option<Arc<dyn BundledSource>>,
    runtime: Handle,
}

impl Inner {
    fn loaded(&self) -> Result<&Loaded> {
        self.loaded.as_ref().ok_or_else(|| SplitError::InvalidManifest {
            message: "no valid manifest is loaded".to_string(),
        })
    }

    /// Look up every requested module, deduplicated, in request order.
    fn resolve(&self, loaded: &Loaded, names: &[String]) -> Result<Vec<ModuleDescriptor>> {
        if names.is_empty() {
            return Err(SplitError::InvalidRequest("no modules requested".to_string()));
        }

        let mut modules: Vec<ModuleDescriptor> = Vec::with_capacity(names.len());
        for name in names {
            let name = name.trim();
            if name.is_empty() {
                return Err(SplitError::InvalidRequest("empty module name".to_string()));
            }
            let module = loaded
                .manifest
                .get(name)
                .ok_or_else(|| SplitError::ModuleUnavailable { name: name.to_string() })?;
            if !module.is_compatible(&self.config.device) {
                log::warn!("Module {} is not compatible with this device", name);
                return Err(SplitError::ModuleUnavailable { name: name.to_string() });
            }
            if !modules.iter().any(|m| m.name == module.name) {
                modules.push(module.clone());
            }
        }
        Ok(modules)
    }

    fn preprocess(&self, loaded: &Loaded, modules: &[ModuleDescriptor]) -> Result<DownloadPlan> {
        DownloadPreprocessor::new(&loaded.paths)
            .with_bundled(self.bundled.as_deref())
            .with_max_attempts(self.config.max_attempts)
            .with_lock_timeout(self.config.lock_timeout())
            .prepare(modules)
    }

    fn warn_missing_dependencies(&self, loaded: &Loaded, modules: &[ModuleDescriptor]) {
        let requested: Vec<&ModuleDescriptor> = modules.iter().collect();
        let missing = loaded
            .manifest
            .missing_dependencies(&requested, |m| loaded.paths.is_installed(m));
        if !missing.is_empty() {
            log::warn!(
                "Installing {} without declared dependencies {}",
                modules.iter().map(|m| m.name.as_str()).collect::<Vec<_>>().join(", "),
                missing.join(", ")
            );
        }
    }

    /// Move a session and publish the new state. Returns `None` when the
    /// session is gone or the move is not allowed.
    fn move_to(&self, id: u32, status: SessionStatus, code: ErrorCode) -> Option<SessionState> {
        match self.registry.transition(id, status, code) {
            Ok(state) => {
                self.registry.broadcast(&state);
                Some(state)
            }
            Err(e) => {
                log::debug!("Ignoring move of session {} to {}: {}", id, status, e);
                None
            }
        }
    }

    /// Fetch whatever the session still needs, then install it.
    fn begin_download(self: &Arc<Self>, id: u32) {
        let Some(requests) = self.registry.with_session(id, |s| s.requests().to_vec()) else {
            return;
        };

        if requests.is_empty() {
            self.spawn_install(id);
            return;
        }

        let callback = Arc::new(SessionCallback {
            inner: Arc::clone(self),
            session_id: id,
        });
        self.downloader.start_download(id, requests, callback);
    }

    fn spawn_install(self: &Arc<Self>, id: u32) {
        let inner = Arc::clone(self);
        self.runtime.spawn_blocking(move || inner.install_session(id));
    }

    /// Install every module of a session, all or nothing.
    fn install_session(&self, id: u32) {
        let Some(modules) = self.registry.with_session(id, |s| s.modules().to_vec()) else {
            return;
        };
        let Ok(loaded) = self.loaded() else {
            self.move_to(id, SessionStatus::Failed, ErrorCode::InternalError);
            return;
        };
        if self.move_to(id, SessionStatus::Installing, ErrorCode::NoError).is_none() {
            return;
        }

        match loaded.installer.install_all(&modules) {
            Ok(results) => {
                self.registry.set_results(id, results);
                self.move_to(id, SessionStatus::PostInstalled, ErrorCode::NoError);
                log::info!("Session {} installed", id);
            }
            Err(e) => {
                log::error!("Session {} failed: {}", id, e);
                self.move_to(id, SessionStatus::Failed, e.code());
            }
        }
    }
}

/// Download events of a registered session.
struct SessionCallback {
    inner: Arc<Inner>,
    session_id: u32,
}

impl DownloadCallback for SessionCallback {
    fn on_start(&self) {
        self.inner
            .move_to(self.session_id, SessionStatus::Downloading, ErrorCode::NoError);
    }

    fn on_progress(&self, bytes_downloaded: u64) {
        if let Some(state) = self.inner.registry.update_progress(self.session_id, bytes_downloaded) {
            self.inner.registry.broadcast(&state);
        }
    }

    fn on_completed(&self) {
        if self
            .inner
            .move_to(self.session_id, SessionStatus::Downloaded, ErrorCode::NoError)
            .is_some()
        {
            self.inner.spawn_install(self.session_id);
        }
    }

    fn on_canceled(&self) {
        self.inner
            .move_to(self.session_id, SessionStatus::Canceled, ErrorCode::NoError);
    }

    fn on_error(&self, code: ErrorCode) {
        log::error!("Download for session {} failed with {}", self.session_id, code);
        self.inner.move_to(self.session_id, SessionStatus::Failed, code);
    }
}

/// Download events of a deferred batch. Reports exactly once.
struct DeferredCallback {
    inner: Arc<Inner>,
    session_id: u32,
    modules: Vec<ModuleDescriptor>,
    report: Mutex<Option<oneshot::Sender<DeferredReport>>>,
}

impl DeferredCallback {
    fn send(&self, report: DeferredReport) {
        let sender = self
            .report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                if tx.send(report).is_err() {
                    log::debug!("Nobody waits for deferred install {}", self.session_id);
                }
            }
            None => log::debug!("Deferred install {} already reported", self.session_id),
        }
    }

    fn fail_all(&self, code: ErrorCode) {
        self.send(DeferredReport {
            session_id: self.session_id,
            installed: Vec::new(),
            failures: self.modules.iter().map(|m| (m.name.clone(), code)).collect(),
            canceled: false,
        });
    }

    fn install(self: Arc<Self>) {
        let runtime = self.inner.runtime.clone();
        runtime.spawn_blocking(move || {
            let loaded = match self.inner.loaded() {
                Ok(loaded) => loaded,
                Err(_) => return self.fail_all(ErrorCode::InternalError),
            };
            let (installed, failures) = loaded.installer.install_each(&self.modules);
            log::info!(
                "Deferred install {}: {} installed, {} failed",
                self.session_id,
                installed.len(),
                failures.len()
            );
            self.send(DeferredReport {
                session_id: self.session_id,
                installed,
                failures: failures.into_iter().map(|(name, e)| (name, e.code())).collect(),
                canceled: false,
            });
        });
    }
}

/// [`DownloadCallback`] for an `Arc`, so the batch can hand itself to the
/// blocking pool once the download is done.
struct DeferredHandle(Arc<DeferredCallback>);

impl DownloadCallback for DeferredHandle {
    fn on_start(&self) {
        log::debug!("Deferred download {} started", self.0.session_id);
    }

    fn on_progress(&self, bytes_downloaded: u64) {
        log::trace!("Deferred download {}: {} bytes", self.0.session_id, bytes_downloaded);
    }

    fn on_completed(&self) {
        Arc::clone(&self.0).install();
    }

    fn on_canceled(&self) {
        self.0.send(DeferredReport {
            session_id: self.0.session_id,
            canceled: true,
            ..DeferredReport::default()
        });
    }

    fn on_error(&self, code: ErrorCode) {
        log::error!("Deferred download {} failed with {}", self.0.session_id, code);
        self.0.fail_all(code);
    }
}

/// Builds an [`InstallOrchestrator`] from configuration and collaborators.
pub struct OrchestratorBuilder {
    config: InstallConfig,
    downloader: Arc<dyn Downloader>,
    manifest: Option<Manifest>,
    network: Arc<dyn NetworkMonitor>,
    bundled: Option<Arc<dyn BundledSource>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    runtime: Option<Handle>,
}

impl OrchestratorBuilder {
    pub fn new(config: InstallConfig, downloader: Arc<dyn Downloader>) -> Self {
        Self {
            config,
            downloader,
            manifest: None,
            network: Arc::new(AlwaysOnline),
            bundled: None,
            verifier: None,
            runtime: None,
        }
    }

    /// Use `manifest` instead of the current version under the root dir.
    pub fn manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = network;
        self
    }

    /// Defaults to a [`BundledDir`] over `bundled-dir`, if configured.
    pub fn bundled(mut self, bundled: Arc<dyn BundledSource>) -> Self {
        self.bundled = Some(bundled);
        self
    }

    /// Defaults to a [`CertificateVerifier`] over `host-certificates`.
    /// Ignored when `verify-signature` is off.
    pub fn verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Defaults to the runtime the builder is called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<InstallOrchestrator> {
        let config = self.config;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current()
                .map_err(|e| SplitError::Config(format!("no tokio runtime available: {}", e)))?,
        };

        let manifest = match self.manifest {
            Some(manifest) => Some(manifest),
            None => match ManifestVersions::new(&config.root_dir, config.lock_timeout()).current_manifest() {
                Ok(manifest) => manifest,
                Err(e) => {
                    log::error!("Failed to load the current manifest: {}", e);
                    None
                }
            },
        };
        let manifest = manifest.and_then(|m| match m.validate() {
            Ok(()) => Some(m),
            Err(e) => {
                log::error!("Rejecting manifest {}: {}", m.id(), e);
                None
            }
        });

        let bundled = self.bundled.or_else(|| {
            config
                .bundled_dir
                .as_ref()
                .map(|dir| Arc::new(BundledDir::new(dir)) as Arc<dyn BundledSource>)
        });
        let verifier = if config.verify_signature {
            self.verifier.or_else(|| {
                Some(Arc::new(CertificateVerifier::new(&config.host_certificates)) as Arc<dyn SignatureVerifier>)
            })
        } else {
            None
        };

        let loaded = manifest.map(|manifest| {
            let paths = PathStore::new(&config.root_dir, manifest.id());
            let installer = Installer::new(paths.clone())
                .with_verifier(verifier)
                .with_bundled(bundled.clone())
                .with_native_multi_archive(config.native_multi_archive)
                .with_max_attempts(config.max_attempts)
                .with_lock_timeout(config.lock_timeout());
            Loaded {
                manifest,
                paths,
                installer,
            }
        });

        Ok(InstallOrchestrator {
            inner: Arc::new(Inner {
                config,
                loaded,
                registry: SessionRegistry::new(),
                downloader: self.downloader,
                network: self.network,
                bundled,
                runtime,
            }),
        })
    }
}

/// Installs modules on demand.
///
/// `start_install` runs validation and preprocessing on the calling thread;
/// downloads and installation continue in the background and report through
/// the listeners.
#[derive(Clone)]
pub struct InstallOrchestrator {
    inner: Arc<Inner>,
}

impl InstallOrchestrator {
    pub fn builder(config: InstallConfig, downloader: Arc<dyn Downloader>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config, downloader)
    }

    pub fn config(&self) -> &InstallConfig {
        &self.inner.config
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.inner.loaded.as_ref().map(|l| &l.manifest)
    }

    pub fn paths(&self) -> Option<&PathStore> {
        self.inner.loaded.as_ref().map(|l| &l.paths)
    }

    pub fn register_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner.registry.add_listener(listener);
    }

    /// Start installing `module_names`.
    pub fn start_install(&self, module_names: &[String]) -> Result<StartInstall> {
        let inner = &self.inner;
        let loaded = inner.loaded()?;
        let modules = inner.resolve(loaded, module_names)?;
        let names: Vec<String> = modules.iter().map(|m| m.name.clone()).collect();

        if modules.iter().all(|m| loaded.paths.is_installed(m)) {
            match modules
                .iter()
                .map(|m| loaded.installer.installed_result(m))
                .collect::<Result<Vec<_>>>()
            {
                Ok(results) => {
                    let state = SessionState {
                        session_id: 0,
                        status: SessionStatus::PostInstalled,
                        error_code: ErrorCode::NoError,
                        bytes_downloaded: 0,
                        total_bytes_to_download: 0,
                        module_names: names,
                        confirmation_handle: None,
                        result_artifacts: Some(results),
                    };
                    log::debug!("Modules {} are already installed", state.module_names.join(", "));
                    inner.registry.broadcast(&state);
                    return Ok(StartInstall::AlreadyInstalled(state));
                }
                Err(e) => log::warn!("Installed modules need repair: {}", e),
            }
        }

        inner.warn_missing_dependencies(loaded, &modules);

        let session_id = session_id_for(&modules);
        if let Some(state) = inner.registry.get(session_id) {
            if state.status == SessionStatus::RequiresUserConfirmation {
                inner.registry.broadcast(&state);
                return Ok(StartInstall::Started(session_id));
            }
        }
        if inner.registry.is_at_capacity() {
            return Err(SplitError::ActiveSessionsLimitExceeded);
        }
        if let Some((session_id, modules)) = inner.registry.incompatible_with(&names) {
            return Err(SplitError::IncompatibleWithExistingSession { session_id, modules });
        }

        let plan = inner.preprocess(loaded, &modules)?;
        if plan.bytes_needed > 0 && !inner.network.is_available() {
            return Err(SplitError::NetworkUnavailable {
                bytes: plan.bytes_needed,
            });
        }

        let threshold = inner.downloader.download_size_threshold_when_metered();
        let needs_confirmation = plan.bytes_needed > 0
            && inner.network.is_metered()
            && threshold >= 0
            && plan.bytes_needed > threshold as u64;
        let status = if needs_confirmation {
            SessionStatus::RequiresUserConfirmation
        } else {
            SessionStatus::Pending
        };

        let session = InstallSession::new(session_id, status, modules, plan.requests, plan.total_bytes);
        let state = inner.registry.try_register(session)?;
        inner.registry.broadcast(&state);

        if needs_confirmation {
            log::info!(
                "Session {} needs confirmation to download {} bytes on a metered network",
                session_id,
                plan.bytes_needed
            );
        } else {
            inner.begin_download(session_id);
        }
        Ok(StartInstall::Started(session_id))
    }

    /// Resume a session parked for user confirmation.
    pub fn continue_install_with_user_confirmation(&self, session_id: u32) -> Result<()> {
        let inner = &self.inner;
        let state = inner
            .registry
            .transition(session_id, SessionStatus::Pending, ErrorCode::NoError)?;
        inner.registry.broadcast(&state);

        if !inner.network.is_available() {
            inner.move_to(session_id, SessionStatus::Failed, ErrorCode::NetworkError);
            return Ok(());
        }
        inner.begin_download(session_id);
        Ok(())
    }

    /// Drop a session parked for user confirmation.
    pub fn cancel_install_without_user_confirmation(&self, session_id: u32) -> Result<()> {
        let registry = &self.inner.registry;
        let status = registry
            .with_session(session_id, InstallSession::status)
            .ok_or(SplitError::SessionNotFound(session_id))?;
        if status != SessionStatus::RequiresUserConfirmation {
            return Err(SplitError::InvalidRequest(format!(
                "session {} does not wait for confirmation",
                session_id
            )));
        }
        let state = registry.transition(session_id, SessionStatus::Canceled, ErrorCode::NoError)?;
        registry.broadcast(&state);
        Ok(())
    }

    /// Cancel a session that is pending or downloading.
    pub fn cancel_install(&self, session_id: u32) -> Result<()> {
        let inner = &self.inner;
        let status = inner
            .registry
            .with_session(session_id, InstallSession::status)
            .ok_or(SplitError::SessionNotFound(session_id))?;
        if !matches!(status, SessionStatus::Pending | SessionStatus::Downloading) {
            return Err(SplitError::InvalidRequest(format!(
                "session {} cannot be canceled while {}",
                session_id, status
            )));
        }

        let state = inner
            .registry
            .transition(session_id, SessionStatus::Canceling, ErrorCode::NoError)?;
        inner.registry.broadcast(&state);

        if !inner.downloader.cancel_download_sync(session_id) {
            log::debug!("Downloader had nothing to cancel for session {}", session_id);
            inner.move_to(session_id, SessionStatus::Canceled, ErrorCode::NoError);
        }
        Ok(())
    }

    /// Install `module_names` at low priority, never asking for
    /// confirmation. Every module is attempted; the report lists each
    /// success and failure.
    pub fn deferred_install(&self, module_names: &[String]) -> Result<DeferredInstall> {
        let inner = &self.inner;
        let loaded = inner.loaded()?;
        let modules = inner.resolve(loaded, module_names)?;
        let names: Vec<String> = modules.iter().map(|m| m.name.clone()).collect();

        inner.warn_missing_dependencies(loaded, &modules);
        if let Some((session_id, modules)) = inner.registry.incompatible_with(&names) {
            return Err(SplitError::IncompatibleWithExistingSession { session_id, modules });
        }

        let plan = inner.preprocess(loaded, &modules)?;
        let session_id = session_id_for(&modules);
        let (tx, rx) = oneshot::channel();
        let callback = Arc::new(DeferredCallback {
            inner: Arc::clone(inner),
            session_id,
            modules,
            report: Mutex::new(Some(tx)),
        });

        if plan.requests.is_empty() {
            callback.install();
        } else {
            let allow_metered = !inner.downloader.is_deferred_download_only_on_unmetered();
            inner.downloader.deferred_download(
                session_id,
                plan.requests,
                Arc::new(DeferredHandle(callback)),
                allow_metered,
            );
        }

        Ok(DeferredInstall {
            session_id,
            module_names: names,
            report: rx,
        })
    }

    /// Schedule removal of `module_names` at the next process start.
    pub fn deferred_uninstall(&self, module_names: &[String]) -> Result<Vec<String>> {
        let loaded = self.inner.loaded()?;
        if module_names.is_empty() {
            return Err(SplitError::InvalidRequest("no modules to uninstall".to_string()));
        }
        for name in module_names {
            if loaded.manifest.get(name).is_none() {
                return Err(SplitError::ModuleUnavailable { name: name.clone() });
            }
        }
        PendingUninstall::new(&loaded.paths, self.inner.config.lock_timeout())?
            .with_max_attempts(self.inner.config.max_attempts)
            .record(module_names)
    }

    pub fn get_session_state(&self, session_id: u32) -> Result<SessionState> {
        self.inner
            .registry
            .get(session_id)
            .ok_or(SplitError::SessionNotFound(session_id))
    }

    pub fn get_session_states(&self) -> Vec<SessionState> {
        self.inner.registry.active_sessions()
    }

    /// Names of the manifest's modules that are installed.
    pub fn installed_modules(&self) -> Vec<String> {
        match &self.inner.loaded {
            Some(loaded) => loaded
                .manifest
                .modules()
                .filter(|m| loaded.paths.is_installed(m))
                .map(|m| m.name.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Installed modules this process should load.
    pub fn installed_for_process(&self) -> Result<Vec<InstallResult>> {
        let loaded = self.inner.loaded()?;
        let process = &self.inner.config.process_name;
        loaded
            .manifest
            .modules()
            .filter(|m| m.runs_in(process) && loaded.paths.is_installed(m))
            .map(|m| loaded.installer.installed_result(m))
            .collect()
    }

    /// Remove every version directory the current manifest no longer uses.
    pub fn clear_cache(&self) -> Result<CacheReport> {
        let loaded = self.inner.loaded()?;
        loaded
            .paths
            .clear_cache(&loaded.manifest, self.inner.config.lock_timeout())
    }
}
