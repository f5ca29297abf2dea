/// Integration tests for install sessions
///
/// These tests drive the orchestrator end to end against a temporary root,
/// with a fake downloader whose callbacks the tests fire by hand.

use md5::{Digest, Md5};
use split_installer::session::ChannelListener;
use split_installer::{
    process_startup, BundledDir, DownloadCallback, DownloadRequest, Downloader, ErrorCode, InstallConfig,
    InstallOrchestrator, Manifest, ManifestVersions, ModuleDescriptor, NetworkMonitor, PathStore, SessionState,
    SessionStatus, StartInstall, VersionStartup,
};
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

type Started = (u32, Vec<DownloadRequest>, Arc<dyn DownloadCallback>);

#[derive(Default)]
struct FakeDownloader {
    started: Mutex<Vec<Started>>,
    deferred: Mutex<Vec<(Started, bool)>>,
    canceled: Mutex<Vec<u32>>,
    threshold: i64,
}

impl FakeDownloader {
    fn with_threshold(threshold: i64) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    fn started(&self) -> Vec<Started> {
        self.started.lock().unwrap().clone()
    }

    fn last_started(&self) -> Started {
        self.started.lock().unwrap().last().cloned().expect("no download started")
    }

    fn last_deferred(&self) -> (Started, bool) {
        self.deferred.lock().unwrap().last().cloned().expect("no deferred download")
    }
}

impl Downloader for FakeDownloader {
    fn start_download(&self, session_id: u32, requests: Vec<DownloadRequest>, callback: Arc<dyn DownloadCallback>) {
        self.started.lock().unwrap().push((session_id, requests, callback));
    }

    fn deferred_download(
        &self,
        session_id: u32,
        requests: Vec<DownloadRequest>,
        callback: Arc<dyn DownloadCallback>,
        allow_metered_network: bool,
    ) {
        self.deferred
            .lock()
            .unwrap()
            .push(((session_id, requests, callback), allow_metered_network));
    }

    fn cancel_download_sync(&self, session_id: u32) -> bool {
        self.canceled.lock().unwrap().push(session_id);
        let callback = self
            .started
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _, _)| *id == session_id)
            .map(|(_, _, cb)| Arc::clone(cb));
        match callback {
            Some(callback) => {
                callback.on_canceled();
                true
            }
            None => false,
        }
    }

    fn download_size_threshold_when_metered(&self) -> i64 {
        self.threshold
    }

    fn is_deferred_download_only_on_unmetered(&self) -> bool {
        true
    }
}

struct FakeNetwork {
    available: bool,
    metered: bool,
}

impl NetworkMonitor for FakeNetwork {
    fn is_available(&self) -> bool {
        self.available
    }

    fn is_metered(&self) -> bool {
        self.metered
    }
}

fn package_bytes(name: &str) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file("classes.dex", SimpleFileOptions::default()).unwrap();
    writer.write_all(format!("code of {}", name).as_bytes()).unwrap();
    writer.start_file("resources.arsc", SimpleFileOptions::default()).unwrap();
    writer.write_all(b"resources").unwrap();
    writer.finish().unwrap().into_inner()
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

struct Fixture {
    dir: TempDir,
    packages: HashMap<String, Vec<u8>>,
    manifest: Manifest,
}

impl Fixture {
    /// Remote modules `m1`, `m4`, `m5`, `m6` and the bundled module `m2`.
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut packages = HashMap::new();
        let mut modules = Vec::new();

        for name in ["m1", "m2", "m4", "m5", "m6"] {
            let bytes = package_bytes(name);
            let mut module = ModuleDescriptor::new(name, "1.0", md5_hex(&bytes), bytes.len() as u64);
            if name == "m2" {
                module.built_in = true;
            } else {
                module.url = format!("https://cdn.example.com/{}.zip", name);
            }
            packages.insert(name.to_string(), bytes);
            modules.push(module);
        }

        let bundled = dir.path().join("bundled");
        fs::create_dir_all(&bundled).unwrap();
        fs::write(bundled.join("m2.zip"), &packages["m2"]).unwrap();

        Self {
            dir,
            packages,
            manifest: Manifest::new("app_1", "1.0.0", modules),
        }
    }

    fn config(&self) -> InstallConfig {
        let mut config = InstallConfig::with_root_dir(self.dir.path().join("splits"));
        config.verify_signature = false;
        config.bundled_dir = Some(self.dir.path().join("bundled"));
        config
    }

    fn paths(&self) -> PathStore {
        PathStore::new(self.dir.path().join("splits"), self.manifest.id())
    }

    fn module(&self, name: &str) -> &ModuleDescriptor {
        self.manifest.get(name).unwrap()
    }

    fn orchestrator(
        &self,
        downloader: Arc<FakeDownloader>,
        network: FakeNetwork,
    ) -> (InstallOrchestrator, UnboundedReceiver<SessionState>) {
        let orchestrator = InstallOrchestrator::builder(self.config(), downloader)
            .manifest(self.manifest.clone())
            .network(Arc::new(network))
            .build()
            .unwrap();
        let (listener, rx) = ChannelListener::new();
        orchestrator.register_listener(Arc::new(listener));
        (orchestrator, rx)
    }

    /// Write each request's package, optionally corrupting some, and report
    /// the download as done.
    fn deliver(&self, requests: &[DownloadRequest], callback: &Arc<dyn DownloadCallback>, corrupt: &[&str]) {
        callback.on_start();
        let mut downloaded = 0;
        for request in requests {
            let bytes = if corrupt.contains(&request.module_name.as_str()) {
                vec![0u8; request.size as usize]
            } else {
                self.packages[&request.module_name].clone()
            };
            fs::create_dir_all(&request.file_dir).unwrap();
            fs::write(request.target(), &bytes).unwrap();
            downloaded += bytes.len() as u64;
            callback.on_progress(downloaded);
        }
        callback.on_completed();
    }
}

fn online() -> FakeNetwork {
    FakeNetwork {
        available: true,
        metered: false,
    }
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

async fn next_state(rx: &mut UnboundedReceiver<SessionState>) -> SessionState {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for a session update")
        .expect("listener channel closed")
}

/// Collect distinct statuses until `status` is reached.
async fn wait_for(rx: &mut UnboundedReceiver<SessionState>, status: SessionStatus) -> (Vec<SessionStatus>, SessionState) {
    let mut seen = Vec::new();
    loop {
        let state = next_state(rx).await;
        if seen.last() != Some(&state.status) {
            seen.push(state.status);
        }
        if state.status == status {
            return (seen, state);
        }
    }
}

#[tokio::test]
async fn test_no_network_fails_without_session() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::default());
    let (orchestrator, _rx) = fixture.orchestrator(
        downloader.clone(),
        FakeNetwork {
            available: false,
            metered: false,
        },
    );

    let err = orchestrator.start_install(&names(&["m1"])).unwrap_err();

    assert_eq!(err.code(), ErrorCode::NetworkError);
    assert!(orchestrator.get_session_states().is_empty());
    assert!(downloader.started().is_empty());
}

#[tokio::test]
async fn test_bundled_module_installs_without_download() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::default());
    let (orchestrator, mut rx) = fixture.orchestrator(downloader.clone(), online());

    let started = orchestrator.start_install(&names(&["m2"])).unwrap();
    assert!(matches!(started, StartInstall::Started(_)));

    let (seen, state) = wait_for(&mut rx, SessionStatus::PostInstalled).await;

    assert_eq!(
        seen,
        vec![SessionStatus::Pending, SessionStatus::Installing, SessionStatus::PostInstalled]
    );
    assert_eq!(state.session_id, started.session_id());
    let results = state.result_artifacts.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].module_name, "m2");
    assert!(results[0].first_installed);
    assert!(downloader.started().is_empty());
    assert!(fixture.paths().is_installed(fixture.module("m2")));
    assert!(orchestrator.get_session_states().is_empty());
}

#[tokio::test]
async fn test_installed_module_completes_immediately() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::default());
    let (orchestrator, mut rx) = fixture.orchestrator(downloader.clone(), online());

    orchestrator.start_install(&names(&["m2"])).unwrap();
    wait_for(&mut rx, SessionStatus::PostInstalled).await;

    let again = orchestrator.start_install(&names(&["m2"])).unwrap();

    let StartInstall::AlreadyInstalled(state) = again else {
        panic!("expected an already installed result");
    };
    assert_eq!(state.session_id, 0);
    assert_eq!(state.status, SessionStatus::PostInstalled);
    let results = state.result_artifacts.unwrap();
    assert!(!results[0].first_installed);
    assert!(orchestrator.get_session_states().is_empty());
    assert!(downloader.started().is_empty());
    assert_eq!(orchestrator.installed_modules(), names(&["m2"]));

    let broadcast = next_state(&mut rx).await;
    assert_eq!(broadcast.status, SessionStatus::PostInstalled);
    assert_eq!(broadcast.session_id, 0);
}

#[tokio::test]
async fn test_remote_module_downloads_then_installs() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::default());
    let (orchestrator, mut rx) = fixture.orchestrator(downloader.clone(), online());

    let id = orchestrator.start_install(&names(&["m1"])).unwrap().session_id();
    let pending = next_state(&mut rx).await;
    assert_eq!(pending.status, SessionStatus::Pending);
    assert_eq!(pending.total_bytes_to_download, fixture.module("m1").size);

    let (session_id, requests, callback) = downloader.last_started();
    assert_eq!(session_id, id);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].module_name, "m1");
    assert_eq!(requests[0].target(), fixture.paths().package_path(fixture.module("m1")));

    fixture.deliver(&requests, &callback, &[]);
    let (seen, state) = wait_for(&mut rx, SessionStatus::PostInstalled).await;

    assert_eq!(
        seen,
        vec![
            SessionStatus::Downloading,
            SessionStatus::Downloaded,
            SessionStatus::Installing,
            SessionStatus::PostInstalled
        ]
    );
    assert_eq!(state.bytes_downloaded, fixture.module("m1").size);
    assert!(fixture.paths().is_installed(fixture.module("m1")));
}

#[tokio::test]
async fn test_overlapping_request_is_incompatible() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::default());
    let (orchestrator, _rx) = fixture.orchestrator(downloader.clone(), online());

    let first = orchestrator.start_install(&names(&["m4"])).unwrap().session_id();
    let err = orchestrator.start_install(&names(&["m4", "m5"])).unwrap_err();

    assert_eq!(err.code(), ErrorCode::IncompatibleWithExistingSession);
    assert_eq!(orchestrator.get_session_states().len(), 1);
    assert_eq!(orchestrator.get_session_state(first).unwrap().status, SessionStatus::Pending);
}

#[tokio::test]
async fn test_single_downloading_session() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::default());
    let (orchestrator, _rx) = fixture.orchestrator(downloader.clone(), online());

    orchestrator.start_install(&names(&["m1"])).unwrap();
    let (_, _, callback) = downloader.last_started();
    callback.on_start();

    let err = orchestrator.start_install(&names(&["m5"])).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ActiveSessionsLimitExceeded);

    callback.on_error(ErrorCode::NetworkError);
    assert!(orchestrator.get_session_states().is_empty());
    assert!(orchestrator.start_install(&names(&["m5"])).is_ok());
}

#[tokio::test]
async fn test_corrupted_local_copy_resets_version_dir() {
    let fixture = Fixture::new();
    let paths = fixture.paths();
    let m1 = fixture.module("m1");
    fs::write(paths.package_file(m1).unwrap(), b"not the package").unwrap();
    let leftover = paths.version_dir(m1).unwrap().join("leftover");
    fs::write(&leftover, b"stale").unwrap();

    let downloader = Arc::new(FakeDownloader::default());
    let (orchestrator, _rx) = fixture.orchestrator(downloader.clone(), online());
    orchestrator.start_install(&names(&["m1"])).unwrap();

    assert!(!leftover.exists());
    assert!(!paths.package_path(m1).exists());
    let (_, requests, _) = downloader.last_started();
    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn test_corrupted_download_fails_session() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::default());
    let (orchestrator, mut rx) = fixture.orchestrator(downloader.clone(), online());

    orchestrator.start_install(&names(&["m1"])).unwrap();
    let (_, requests, callback) = downloader.last_started();
    fixture.deliver(&requests, &callback, &["m1"]);

    let (_, state) = wait_for(&mut rx, SessionStatus::Failed).await;

    assert_eq!(state.error_code, ErrorCode::Md5Error);
    assert!(!requests[0].target().exists());
    assert!(!fixture.paths().is_installed(fixture.module("m1")));
}

#[tokio::test]
async fn test_download_error_fails_session() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::default());
    let (orchestrator, mut rx) = fixture.orchestrator(downloader.clone(), online());

    orchestrator.start_install(&names(&["m1"])).unwrap();
    let (_, _, callback) = downloader.last_started();
    callback.on_error(ErrorCode::AccessDenied);

    let (_, state) = wait_for(&mut rx, SessionStatus::Failed).await;
    assert_eq!(state.error_code, ErrorCode::AccessDenied);
}

#[tokio::test]
async fn test_metered_download_waits_for_confirmation() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::with_threshold(1));
    let (orchestrator, mut rx) = fixture.orchestrator(
        downloader.clone(),
        FakeNetwork {
            available: true,
            metered: true,
        },
    );

    let id = orchestrator.start_install(&names(&["m1"])).unwrap().session_id();
    let state = next_state(&mut rx).await;

    assert_eq!(state.status, SessionStatus::RequiresUserConfirmation);
    let handle = state.confirmation_handle.unwrap();
    assert_eq!(handle.session_id, id);
    assert_eq!(handle.bytes_to_download, fixture.module("m1").size);
    assert!(downloader.started().is_empty());

    // Resubmission returns the parked session.
    assert_eq!(orchestrator.start_install(&names(&["m1"])).unwrap(), StartInstall::Started(id));

    orchestrator.continue_install_with_user_confirmation(id).unwrap();
    let (seen, _) = wait_for(&mut rx, SessionStatus::Pending).await;
    assert_eq!(seen.last(), Some(&SessionStatus::Pending));
    assert_eq!(downloader.last_started().0, id);
    assert!(orchestrator
        .get_session_state(id)
        .unwrap()
        .confirmation_handle
        .is_none());
}

#[tokio::test]
async fn test_confirmation_can_be_declined() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::with_threshold(0));
    let (orchestrator, mut rx) = fixture.orchestrator(
        downloader.clone(),
        FakeNetwork {
            available: true,
            metered: true,
        },
    );

    let id = orchestrator.start_install(&names(&["m1"])).unwrap().session_id();
    orchestrator.cancel_install_without_user_confirmation(id).unwrap();

    let (_, state) = wait_for(&mut rx, SessionStatus::Canceled).await;
    assert_eq!(state.session_id, id);
    assert!(orchestrator.get_session_states().is_empty());
    assert!(downloader.started().is_empty());
}

#[tokio::test]
async fn test_cancel_pending_download() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::default());
    let (orchestrator, mut rx) = fixture.orchestrator(downloader.clone(), online());

    let id = orchestrator.start_install(&names(&["m1"])).unwrap().session_id();
    orchestrator.cancel_install(id).unwrap();

    let (seen, _) = wait_for(&mut rx, SessionStatus::Canceled).await;
    assert_eq!(
        seen,
        vec![SessionStatus::Pending, SessionStatus::Canceling, SessionStatus::Canceled]
    );
    assert_eq!(*downloader.canceled.lock().unwrap(), vec![id]);
    assert!(orchestrator.get_session_states().is_empty());

    let err = orchestrator.cancel_install(id).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SessionNotFound);
}

#[tokio::test]
async fn test_cancel_is_rejected_after_download() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::with_threshold(0));
    let (orchestrator, _rx) = fixture.orchestrator(
        downloader.clone(),
        FakeNetwork {
            available: true,
            metered: true,
        },
    );

    let id = orchestrator.start_install(&names(&["m1"])).unwrap().session_id();
    let err = orchestrator.cancel_install(id).unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidRequest);
    assert_eq!(
        orchestrator.get_session_state(id).unwrap().status,
        SessionStatus::RequiresUserConfirmation
    );
}

#[tokio::test]
async fn test_deferred_install_reports_each_module() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::with_threshold(0));
    let (orchestrator, _rx) = fixture.orchestrator(
        downloader.clone(),
        FakeNetwork {
            available: true,
            metered: true,
        },
    );

    let deferred = orchestrator.deferred_install(&names(&["m1", "m6"])).unwrap();
    assert_eq!(deferred.module_names(), names(&["m1", "m6"]).as_slice());
    assert!(orchestrator.get_session_states().is_empty());

    let ((session_id, requests, callback), allow_metered) = downloader.last_deferred();
    assert_eq!(session_id, deferred.session_id());
    assert!(!allow_metered);
    assert_eq!(requests.len(), 2);

    fixture.deliver(&requests, &callback, &["m6"]);
    let report = deferred.wait().await;

    assert!(!report.is_success());
    assert_eq!(report.installed.len(), 1);
    assert_eq!(report.installed[0].module_name, "m1");
    assert_eq!(report.failures, vec![("m6".to_string(), ErrorCode::Md5Error)]);
    assert!(fixture.paths().is_installed(fixture.module("m1")));
    assert!(!fixture.paths().is_installed(fixture.module("m6")));
}

#[tokio::test]
async fn test_deferred_install_of_bundled_module() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::default());
    let (orchestrator, _rx) = fixture.orchestrator(downloader.clone(), online());

    let report = orchestrator.deferred_install(&names(&["m2"])).unwrap().wait().await;

    assert!(report.is_success());
    assert_eq!(report.installed.len(), 1);
    assert!(downloader.deferred.lock().unwrap().is_empty());
}

fn publish_manifest(root: &Path, manifest: &Manifest, version: &str) {
    fs::create_dir_all(root).unwrap();
    let file = root.join(format!("incoming-{}.json", version));
    fs::write(&file, manifest.to_json().unwrap()).unwrap();
    ManifestVersions::new(root, None).update(version, &file).unwrap();
}

#[tokio::test]
async fn test_deferred_uninstall_runs_at_next_start() {
    let fixture = Fixture::new();
    let config = fixture.config();
    publish_manifest(&config.root_dir, &fixture.manifest, "1");

    let startup = process_startup(&config).unwrap();
    assert_eq!(startup.version, VersionStartup::Unchanged { current: "1".to_string() });

    let downloader = Arc::new(FakeDownloader::default());
    let orchestrator = InstallOrchestrator::builder(config.clone(), downloader)
        .build()
        .unwrap();
    assert_eq!(orchestrator.manifest().map(Manifest::id), Some("app_1"));

    let report = orchestrator.deferred_install(&names(&["m2"])).unwrap().wait().await;
    assert!(report.is_success());
    assert_eq!(orchestrator.installed_for_process().unwrap().len(), 1);

    orchestrator.deferred_uninstall(&names(&["m2"])).unwrap();
    assert!(fixture.paths().is_installed(fixture.module("m2")));

    let startup = process_startup(&config).unwrap();
    assert_eq!(startup.removed, names(&["m2"]));
    assert!(!fixture.paths().is_installed(fixture.module("m2")));
    assert!(orchestrator.installed_modules().is_empty());
}

#[tokio::test]
async fn test_clear_cache_after_manifest_update() {
    let fixture = Fixture::new();
    let config = fixture.config();
    publish_manifest(&config.root_dir, &fixture.manifest, "1");

    let (orchestrator, mut rx) = fixture.orchestrator(Arc::new(FakeDownloader::default()), online());
    orchestrator.start_install(&names(&["m2"])).unwrap();
    wait_for(&mut rx, SessionStatus::PostInstalled).await;

    let mut modules: Vec<ModuleDescriptor> = fixture.manifest.modules().cloned().collect();
    for module in &mut modules {
        if module.name == "m2" {
            module.version = "2.0".to_string();
        }
    }
    let updated = Manifest::new("app_1", "1.1.0", modules);
    publish_manifest(&config.root_dir, &updated, "2");

    let startup = process_startup(&config).unwrap();
    assert_eq!(
        startup.version,
        VersionStartup::Promoted {
            from: "1".to_string(),
            to: "2".to_string()
        }
    );

    let orchestrator = InstallOrchestrator::builder(config, Arc::new(FakeDownloader::default()))
        .build()
        .unwrap();
    let report = orchestrator.clear_cache().unwrap();

    assert_eq!(report.removed.len(), 1);
    assert!(report.freed_bytes >= fixture.packages["m2"].len() as u64);
    assert!(!fixture.paths().is_installed(fixture.module("m2")));
}

#[tokio::test]
async fn test_bundled_dir_source_is_used_directly() {
    let fixture = Fixture::new();
    let downloader = Arc::new(FakeDownloader::default());
    let orchestrator = InstallOrchestrator::builder(fixture.config(), downloader)
        .manifest(fixture.manifest.clone())
        .bundled(Arc::new(BundledDir::new(fixture.dir.path().join("bundled")).with_direct_access(true)))
        .build()
        .unwrap();
    let (listener, mut rx) = ChannelListener::new();
    orchestrator.register_listener(Arc::new(listener));

    orchestrator.start_install(&names(&["m2"])).unwrap();
    let (_, state) = wait_for(&mut rx, SessionStatus::PostInstalled).await;

    let results = state.result_artifacts.unwrap();
    assert_eq!(results[0].package_path, fixture.dir.path().join("bundled").join("m2.zip"));
    assert!(!fixture.paths().package_path(fixture.module("m2")).exists());
}
