//! Download tracker.
//!
//! Owns the ordered list of [`DownloadRecord`]s, drives the per-record state
//! machine, and rewrites the whole list to `downloads.json` after every
//! mutation. Download counts are small (tens), so a full rewrite per progress
//! tick is acceptable.
//!
//! ```text
//! waiting_to_start ─► downloading ◄─► paused
//!        │                 │            │
//!        │                 ▼            │
//!        │             completed        │
//!        └──────► cancelled / removed ◄─┘
//! ```
//!
//! Records carry a stable UUID assigned at creation; lookups never depend on
//! a record's position in the list.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PolicyError, Result};
use crate::notify::{Notifier, Severity};
use crate::prompt::{ConfirmRequest, PromptService};
use crate::storage::Storage;

/// Logical name of the persisted download list.
pub const DOWNLOADS_FILE: &str = "downloads.json";

const FALLBACK_FILENAME: &str = "download";

// ─────────────────────────────────────────────────────────────────────────────
// Records and state machine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    WaitingToStart,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Removed,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Removed)
    }

    /// Only `downloading ⇄ paused` moves back and forth; terminal states
    /// never change.
    pub fn can_become(self, next: Self) -> bool {
        use DownloadState::*;
        match (self, next) {
            (Completed | Cancelled | Removed, _) => false,
            (WaitingToStart, Downloading | Completed | Cancelled | Removed) => true,
            (Downloading, Paused | Completed | Cancelled | Removed) => true,
            (Paused, Downloading | Cancelled | Removed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: Uuid,
    pub state: DownloadState,
    pub url: String,
    /// Destination filename.
    pub name: String,
    /// Full save path.
    pub file: PathBuf,
    pub current: u64,
    pub total: u64,
    pub date: DateTime<Utc>,
}

impl DownloadRecord {
    fn transition(&mut self, next: DownloadState) -> bool {
        if !self.state.can_become(next) {
            debug!(id = %self.id, from = ?self.state, to = ?next, "Ignored download transition");
            return false;
        }
        self.state = next;
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host transfer handle
// ─────────────────────────────────────────────────────────────────────────────

/// The host's transfer has already finished or been destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transfer handle no longer exists")]
pub struct StaleHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub received: u64,
    pub total: u64,
    pub paused: bool,
}

/// A live file transfer owned by the page-rendering host.
pub trait TransferHandle {
    fn progress(&self) -> std::result::Result<TransferProgress, StaleHandle>;
    fn pause(&self) -> std::result::Result<(), StaleHandle>;
    fn resume(&self) -> std::result::Result<(), StaleHandle>;
    fn cancel(&self) -> std::result::Result<(), StaleHandle>;
}

fn cancel_quietly(id: Uuid, handle: &dyn TransferHandle) {
    if let Err(e) = handle.cancel() {
        debug!(%id, error = %e, "Cancel on finished transfer ignored");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DownloadMethod {
    #[default]
    Automatic,
    Ask,
    Confirm,
    Block,
}

impl From<String> for DownloadMethod {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "ask" => Self::Ask,
            "confirm" => Self::Confirm,
            "block" => Self::Block,
            _ => Self::Automatic,
        }
    }
}

impl From<DownloadMethod> for String {
    fn from(method: DownloadMethod) -> Self {
        match method {
            DownloadMethod::Automatic => "automatic",
            DownloadMethod::Ask => "ask",
            DownloadMethod::Confirm => "confirm",
            DownloadMethod::Block => "block",
        }
        .to_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    #[serde(alias = "downloadmethod")]
    pub download_method: DownloadMethod,
    #[serde(alias = "downloadpath")]
    pub download_path: PathBuf,
    #[serde(alias = "cleardownloadsoncompleted")]
    pub clear_downloads_on_completed: bool,
    #[serde(alias = "cleardownloadsonquit")]
    pub clear_downloads_on_quit: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            download_method: DownloadMethod::Automatic,
            download_path: default_download_dir(),
            clear_downloads_on_completed: false,
            clear_downloads_on_quit: false,
        }
    }
}

/// `~/Downloads`, or `./downloads` when no home directory is known.
fn default_download_dir() -> PathBuf {
    #[cfg(windows)]
    let home = std::env::var("USERPROFILE").ok();
    #[cfg(not(windows))]
    let home = std::env::var("HOME").ok();

    home.map(|h| PathBuf::from(h).join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Start planning
// ─────────────────────────────────────────────────────────────────────────────

/// What the host tells us about a transfer it is about to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPlan {
    Rejected,
    Confirm { path: PathBuf, prompt: ConfirmRequest },
    Proceed { path: PathBuf },
}

/// Strips directory parts from a suggested filename.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        FALLBACK_FILENAME.to_owned()
    } else {
        base.to_owned()
    }
}

/// `dir/name`, or `dir/stem (n).ext` with the smallest `n >= 2` for which
/// `taken` returns false.
pub fn unique_path(dir: &Path, filename: &str, taken: impl Fn(&Path) -> bool) -> PathBuf {
    let candidate = dir.join(filename);
    if !taken(&candidate) {
        return candidate;
    }

    let (stem, extension) = match filename.rfind('.') {
        Some(dot) if dot > 0 => (&filename[..dot], &filename[dot..]),
        _ => (filename, ""),
    };
    (2..)
        .map(|n| dir.join(format!("{stem} ({n}){extension}")))
        .find(|p| !taken(p))
        .unwrap_or(candidate)
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

fn confirmation(request: &DownloadRequest, name: &str) -> ConfirmRequest {
    let size = request
        .total_bytes
        .filter(|&b| b > 0)
        .map(format_size)
        .unwrap_or_else(|| "unknown".to_owned());
    let mime = request.mime_type.as_deref().unwrap_or("unknown");
    ConfirmRequest {
        title: "Download file?".to_owned(),
        message: format!(
            "name: {name}\ntype: {mime}\nsize: {size}\nurl: {}",
            request.url
        ),
        checkbox: None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracker
// ─────────────────────────────────────────────────────────────────────────────

/// Actions accepted by a `download-list-request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListAction {
    RemoveAll,
    Pause,
    Resume,
    Remove,
    /// Anything else only returns the list.
    Show,
}

impl From<&str> for ListAction {
    fn from(value: &str) -> Self {
        match value {
            "removeall" => Self::RemoveAll,
            "pause" => Self::Pause,
            "resume" => Self::Resume,
            "remove" => Self::Remove,
            _ => Self::Show,
        }
    }
}

pub struct DownloadTracker {
    storage: Storage,
    settings: DownloadSettings,
    notifier: Rc<dyn Notifier>,
    records: Vec<DownloadRecord>,
    handles: HashMap<Uuid, Box<dyn TransferHandle>>,
    /// Paths handed out by `plan` and not yet committed or released.
    reserved: HashSet<PathBuf>,
}

impl DownloadTracker {
    /// Loads the persisted list. Anything that was not completed when the
    /// previous process exited comes back as `cancelled`.
    pub fn load(storage: Storage, settings: DownloadSettings, notifier: Rc<dyn Notifier>) -> Self {
        let records: Vec<DownloadRecord> = match storage.read_json(DOWNLOADS_FILE) {
            Ok(records) => records.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Unreadable download list, starting empty");
                notifier.notify(&format!("Could not read download history: {e}"), Severity::Warning);
                Vec::new()
            }
        };

        let mut tracker = Self {
            storage,
            settings,
            notifier,
            records,
            handles: HashMap::new(),
            reserved: HashSet::new(),
        };

        let mut recovered = 0;
        for record in &mut tracker.records {
            if record.state != DownloadState::Completed && record.state != DownloadState::Cancelled {
                record.state = DownloadState::Cancelled;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "Interrupted downloads marked as cancelled");
            tracker.persist();
        }
        tracker
    }

    pub fn settings(&self) -> &DownloadSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: DownloadSettings) {
        self.settings = settings;
        self.persist();
    }

    pub fn records(&self) -> &[DownloadRecord] {
        &self.records
    }

    pub fn get(&self, id: Uuid) -> Option<&DownloadRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    fn record_mut(&mut self, id: Uuid) -> Result<&mut DownloadRecord> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| PolicyError::UnknownDownload(id.to_string()))
    }

    fn is_taken(&self, path: &Path) -> bool {
        path.exists()
            || self.reserved.contains(path)
            || self
                .records
                .iter()
                .any(|r| !r.state.is_terminal() && r.file == path)
    }

    /// Decides where a transfer goes and whether the user must confirm it.
    /// The chosen path stays reserved until [`commit`](Self::commit) or
    /// [`release`](Self::release), so a second transfer planned while the
    /// first waits on its prompt gets another name.
    pub fn plan(&mut self, request: &DownloadRequest) -> StartPlan {
        if self.settings.download_method == DownloadMethod::Block {
            return StartPlan::Rejected;
        }
        let name = sanitize_filename(&request.filename);
        let path = unique_path(&self.settings.download_path, &name, |p| self.is_taken(p));
        self.reserved.insert(path.clone());
        match self.settings.download_method {
            DownloadMethod::Ask | DownloadMethod::Confirm => {
                let shown = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or(name);
                StartPlan::Confirm {
                    prompt: confirmation(request, &shown),
                    path,
                }
            }
            _ => StartPlan::Proceed { path },
        }
    }

    /// Adds a `waiting_to_start` record for a transfer headed to `path`.
    pub fn commit(
        &mut self,
        request: &DownloadRequest,
        path: PathBuf,
        handle: Box<dyn TransferHandle>,
    ) -> Uuid {
        self.reserved.remove(&path);
        let id = Uuid::new_v4();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| sanitize_filename(&request.filename));
        self.records.push(DownloadRecord {
            id,
            state: DownloadState::WaitingToStart,
            url: request.url.clone(),
            name,
            file: path,
            current: 0,
            total: request.total_bytes.unwrap_or(0),
            date: Utc::now(),
        });
        self.handles.insert(id, handle);
        info!(%id, url = %request.url, "Download started");
        self.persist();
        id
    }

    /// Gives back a planned path that will not be used.
    pub fn release(&mut self, path: &Path) {
        self.reserved.remove(path);
    }

    /// Progress tick: reads the live handle. A handle that can no longer be
    /// read means the transfer already ended: a `waiting_to_start` record
    /// becomes `completed` (it finished before we ever saw it run), a
    /// running or paused one becomes `cancelled`.
    pub fn update(&mut self, id: Uuid) -> Result<()> {
        let progress = self
            .handles
            .get(&id)
            .map_or(Err(StaleHandle), |h| h.progress());
        let record = self.record_mut(id)?;
        match progress {
            Ok(p) => {
                record.current = p.received;
                if p.total > 0 {
                    record.total = p.total;
                }
                let next = if p.paused {
                    DownloadState::Paused
                } else {
                    DownloadState::Downloading
                };
                if record.state == DownloadState::WaitingToStart {
                    record.transition(DownloadState::Downloading);
                }
                if record.state != next {
                    record.transition(next);
                }
            }
            Err(StaleHandle) => {
                let next = if record.state == DownloadState::WaitingToStart {
                    DownloadState::Completed
                } else {
                    DownloadState::Cancelled
                };
                record.transition(next);
                self.handles.remove(&id);
            }
        }
        self.persist();
        Ok(())
    }

    /// Terminal event from the host.
    pub fn finish(&mut self, id: Uuid, completed: bool) -> Result<()> {
        self.handles.remove(&id);
        let record = self.record_mut(id)?;
        let changed = if completed {
            // Resumed and finished between two ticks.
            if record.state == DownloadState::Paused {
                record.transition(DownloadState::Downloading);
            }
            let changed = record.transition(DownloadState::Completed);
            if changed && record.total > 0 {
                record.current = record.total;
            }
            changed
        } else {
            record.transition(DownloadState::Cancelled)
        };
        if changed {
            let (message, severity) = if completed {
                (format!("Download finished: {}", record.name), Severity::Success)
            } else {
                (format!("Download failed: {}", record.name), Severity::Warning)
            };
            self.notifier.notify(&message, severity);
        }
        self.persist();
        Ok(())
    }

    pub fn cancel(&mut self, id: Uuid) -> Result<()> {
        if let Some(handle) = self.handles.remove(&id) {
            cancel_quietly(id, handle.as_ref());
        }
        self.record_mut(id)?.transition(DownloadState::Cancelled);
        self.persist();
        Ok(())
    }

    /// Applies a list action and returns the resulting list.
    pub fn list(&mut self, action: ListAction, id: Option<Uuid>) -> Result<Vec<DownloadRecord>> {
        match (action, id) {
            (ListAction::RemoveAll, _) => self.remove_all(),
            (ListAction::Pause, Some(id)) => self.pause(id)?,
            (ListAction::Resume, Some(id)) => self.resume(id)?,
            (ListAction::Remove, Some(id)) => self.remove(id)?,
            _ => {}
        }
        Ok(self.records.clone())
    }

    fn pause(&mut self, id: Uuid) -> Result<()> {
        if self.record_mut(id)?.state != DownloadState::Downloading {
            return Ok(());
        }
        if let Some(handle) = self.handles.get(&id)
            && let Err(e) = handle.pause()
        {
            debug!(%id, error = %e, "Pause on finished transfer ignored");
        }
        self.record_mut(id)?.transition(DownloadState::Paused);
        self.persist();
        Ok(())
    }

    fn resume(&mut self, id: Uuid) -> Result<()> {
        if self.record_mut(id)?.state != DownloadState::Paused {
            return Ok(());
        }
        if let Some(handle) = self.handles.get(&id)
            && let Err(e) = handle.resume()
        {
            debug!(%id, error = %e, "Resume on finished transfer ignored");
        }
        self.record_mut(id)?.transition(DownloadState::Downloading);
        self.persist();
        Ok(())
    }

    /// Cancels the transfer, marks the record removed, then drops it.
    fn remove(&mut self, id: Uuid) -> Result<()> {
        if let Some(handle) = self.handles.remove(&id) {
            cancel_quietly(id, handle.as_ref());
        }
        self.record_mut(id)?.transition(DownloadState::Removed);
        self.records.retain(|r| r.id != id);
        self.persist();
        Ok(())
    }

    fn remove_all(&mut self) {
        for (id, handle) in self.handles.drain() {
            cancel_quietly(id, handle.as_ref());
        }
        self.records.clear();
        self.persist();
    }

    /// Process exit. With clear-on-quit the history file is deleted.
    pub fn shutdown(&mut self) {
        self.handles.clear();
        if self.settings.clear_downloads_on_quit {
            self.records.clear();
        }
        self.persist();
    }

    /// Full rewrite of the list. Failures are notified, never propagated.
    fn persist(&mut self) {
        if self.settings.clear_downloads_on_completed {
            self.records.retain(|r| {
                !matches!(r.state, DownloadState::Completed | DownloadState::Removed)
            });
        }

        let result = if self.records.is_empty() || self.settings.clear_downloads_on_quit {
            self.storage.remove(DOWNLOADS_FILE)
        } else {
            self.storage.write_json(DOWNLOADS_FILE, &self.records)
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to save download list");
            self.notifier
                .notify(&format!("Failed to save download list: {e}"), Severity::Error);
        }
    }
}

/// Runs the start flow for a new transfer: policy check, optional
/// confirmation, then the record. Returns `None` when the transfer was
/// rejected or declined, in which case the transfer has been cancelled.
pub async fn start(
    tracker: &RefCell<DownloadTracker>,
    prompt: &dyn PromptService,
    notifier: &dyn Notifier,
    request: DownloadRequest,
    handle: Box<dyn TransferHandle>,
) -> Option<Uuid> {
    let plan = tracker.borrow_mut().plan(&request);
    let path = match plan {
        StartPlan::Rejected => {
            cancel_quietly(Uuid::nil(), handle.as_ref());
            notifier.notify(
                &format!("Download blocked by policy: {}", request.url),
                Severity::Warning,
            );
            return None;
        }
        StartPlan::Proceed { path } => path,
        StartPlan::Confirm { path, prompt: question } => {
            if !prompt.confirm(question).await.accepted {
                tracker.borrow_mut().release(&path);
                cancel_quietly(Uuid::nil(), handle.as_ref());
                debug!(url = %request.url, "Download declined");
                return None;
            }
            path
        }
    };
    Some(tracker.borrow_mut().commit(&request, path, handle))
}


#[cfg(test)]
mod tests {
    use super::testing::FakeHandle;
    use super::*;
    use crate::notify::testing::RecordingNotifier;
    use crate::prompt::ConfirmResponse;
    use crate::prompt::testing::ScriptedPrompt;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Storage,
        settings: DownloadSettings,
        notifier: Rc<RecordingNotifier>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let storage = Storage::new(dir.path().join("data"));
            let settings = DownloadSettings {
                download_path: dir.path().join("downloads"),
                ..DownloadSettings::default()
            };
            std::fs::create_dir_all(&settings.download_path).unwrap();
            Self {
                _dir: dir,
                storage,
                settings,
                notifier: Rc::new(RecordingNotifier::default()),
            }
        }

        fn tracker(&self) -> DownloadTracker {
            DownloadTracker::load(
                self.storage.clone(),
                self.settings.clone(),
                self.notifier.clone(),
            )
        }
    }

    fn request(filename: &str) -> DownloadRequest {
        DownloadRequest {
            url: format!("https://files.test/{filename}"),
            filename: filename.to_string(),
            mime_type: Some("application/pdf".to_string()),
            total_bytes: Some(2048),
        }
    }

    fn started(tracker: &mut DownloadTracker, filename: &str) -> (Rc<testing::FakeTransfer>, Uuid) {
        let (transfer, handle) = FakeHandle::new();
        let StartPlan::Proceed { path } = tracker.plan(&request(filename)) else {
            panic!("automatic method should proceed");
        };
        let id = tracker.commit(&request(filename), path, handle);
        (transfer, id)
    }

    #[test]
    fn test_state_machine_rules() {
        use DownloadState::*;
        assert!(WaitingToStart.can_become(Downloading));
        assert!(Downloading.can_become(Paused));
        assert!(Paused.can_become(Downloading));
        assert!(!Completed.can_become(Downloading));
        assert!(!Cancelled.can_become(Removed));
        assert!(!Removed.can_become(Cancelled));
        assert!(!Downloading.can_become(WaitingToStart));
        assert!(!WaitingToStart.can_become(Paused));
        assert!(!Paused.can_become(Completed));
        assert!(WaitingToStart.can_become(Completed));
        assert!(Paused.can_become(Cancelled));
    }

    #[test]
    fn test_unique_path_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_path(dir.path(), "report.pdf", Path::exists);
        assert_eq!(first, dir.path().join("report.pdf"));
        std::fs::write(&first, b"1").unwrap();

        let second = unique_path(dir.path(), "report.pdf", Path::exists);
        assert_eq!(second, dir.path().join("report (2).pdf"));
        std::fs::write(&second, b"2").unwrap();

        let third = unique_path(dir.path(), "report.pdf", Path::exists);
        assert_eq!(third, dir.path().join("report (3).pdf"));
    }

    #[test]
    fn test_unique_path_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README"), b"x").unwrap();
        assert_eq!(
            unique_path(dir.path(), "README", Path::exists),
            dir.path().join("README (2)")
        );
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\temp\\a.txt"), "a.txt");
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename(".."), "download");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024 + 512 * 1024), "5.5 MB");
    }

    #[test]
    fn test_pending_records_reserve_their_path() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        started(&mut tracker, "report.pdf");
        let StartPlan::Proceed { path } = tracker.plan(&request("report.pdf")) else {
            panic!("automatic method should proceed");
        };
        assert_eq!(path, fx.settings.download_path.join("report (2).pdf"));
    }

    #[test]
    fn test_progress_then_completion() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        let (transfer, id) = started(&mut tracker, "report.pdf");

        transfer.received.set(1024);
        transfer.total.set(2048);
        tracker.update(id).unwrap();
        assert_eq!(tracker.get(id).unwrap().state, DownloadState::Downloading);
        assert_eq!(tracker.get(id).unwrap().current, 1024);

        tracker.finish(id, true).unwrap();
        let record = tracker.get(id).unwrap();
        assert_eq!(record.state, DownloadState::Completed);
        assert_eq!(record.current, 2048);
        assert_eq!(fx.notifier.last().unwrap().1, Severity::Success);
    }

    #[test]
    fn test_cancel_before_progress() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        let (transfer, id) = started(&mut tracker, "report.pdf");
        tracker.cancel(id).unwrap();
        assert_eq!(tracker.get(id).unwrap().state, DownloadState::Cancelled);
        assert!(transfer.cancelled.get());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        let (_transfer, id) = started(&mut tracker, "report.pdf");
        tracker.cancel(id).unwrap();
        tracker.finish(id, true).unwrap();
        assert_eq!(tracker.get(id).unwrap().state, DownloadState::Cancelled);
    }

    #[test]
    fn test_stale_handle_completes_waiting_record() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        let (transfer, id) = started(&mut tracker, "report.pdf");
        transfer.destroyed.set(true);
        tracker.update(id).unwrap();
        assert_eq!(tracker.get(id).unwrap().state, DownloadState::Completed);
    }

    #[test]
    fn test_stale_handle_cancels_running_record() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        let (transfer, id) = started(&mut tracker, "report.pdf");
        tracker.update(id).unwrap();
        transfer.destroyed.set(true);
        tracker.update(id).unwrap();
        assert_eq!(tracker.get(id).unwrap().state, DownloadState::Cancelled);

        // The dead transfer is no longer driven by list actions.
        let list = tracker.list(ListAction::Resume, Some(id)).unwrap();
        assert_eq!(list[0].state, DownloadState::Cancelled);
    }

    #[test]
    fn test_stale_handle_cancels_paused_record() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        let (transfer, id) = started(&mut tracker, "report.pdf");
        tracker.update(id).unwrap();
        tracker.list(ListAction::Pause, Some(id)).unwrap();
        transfer.destroyed.set(true);
        tracker.update(id).unwrap();
        assert_eq!(tracker.get(id).unwrap().state, DownloadState::Cancelled);
    }

    #[test]
    fn test_paused_record_completes_through_downloading() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        let (_transfer, id) = started(&mut tracker, "report.pdf");
        tracker.update(id).unwrap();
        tracker.list(ListAction::Pause, Some(id)).unwrap();
        tracker.finish(id, true).unwrap();
        assert_eq!(tracker.get(id).unwrap().state, DownloadState::Completed);
        assert_eq!(fx.notifier.count(Severity::Success), 1);
    }

    #[test]
    fn test_cancel_on_destroyed_handle_is_ignored() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        let (transfer, id) = started(&mut tracker, "report.pdf");
        transfer.destroyed.set(true);
        tracker.cancel(id).unwrap();
        assert_eq!(tracker.get(id).unwrap().state, DownloadState::Cancelled);
    }

    #[test]
    fn test_pause_and_resume() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        let (transfer, id) = started(&mut tracker, "report.pdf");
        tracker.update(id).unwrap();

        tracker.list(ListAction::Pause, Some(id)).unwrap();
        assert!(transfer.paused.get());
        assert_eq!(tracker.get(id).unwrap().state, DownloadState::Paused);

        tracker.list(ListAction::Resume, Some(id)).unwrap();
        assert!(!transfer.paused.get());
        assert_eq!(tracker.get(id).unwrap().state, DownloadState::Downloading);
    }

    #[test]
    fn test_remove_keeps_other_ids_stable() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        let (first_transfer, first) = started(&mut tracker, "a.pdf");
        let (_t, second) = started(&mut tracker, "b.pdf");
        let (_t, third) = started(&mut tracker, "c.pdf");

        let list = tracker.list(ListAction::Remove, Some(first)).unwrap();
        assert!(first_transfer.cancelled.get());
        assert_eq!(list.len(), 2);
        assert_eq!(tracker.get(second).unwrap().name, "b.pdf");
        assert_eq!(tracker.get(third).unwrap().name, "c.pdf");
        assert!(tracker.get(first).is_none());
    }

    #[test]
    fn test_unknown_id_is_an_error() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        assert!(matches!(
            tracker.list(ListAction::Pause, Some(Uuid::new_v4())),
            Err(PolicyError::UnknownDownload(_))
        ));
    }

    #[test]
    fn test_remove_all_deletes_history_file() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        let (transfer, _) = started(&mut tracker, "a.pdf");
        assert!(fx.storage.exists(DOWNLOADS_FILE));
        let list = tracker.list(ListAction::RemoveAll, None).unwrap();
        assert!(list.is_empty());
        assert!(transfer.cancelled.get());
        assert!(!fx.storage.exists(DOWNLOADS_FILE));
    }

    #[test]
    fn test_every_mutation_is_persisted() {
        let fx = Fixture::new();
        let mut tracker = fx.tracker();
        let (transfer, id) = started(&mut tracker, "a.pdf");
        transfer.received.set(10);
        tracker.update(id).unwrap();
        let saved: Vec<DownloadRecord> = fx.storage.read_json(DOWNLOADS_FILE).unwrap().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].current, 10);
        assert_eq!(saved[0].state, DownloadState::Downloading);
    }

    #[test]
    fn test_restart_cancels_interrupted_downloads() {
        let fx = Fixture::new();
        let (done, running) = {
            let mut tracker = fx.tracker();
            let (_t, done) = started(&mut tracker, "done.pdf");
            tracker.update(done).unwrap();
            tracker.finish(done, true).unwrap();
            let (_t, running) = started(&mut tracker, "running.pdf");
            tracker.update(running).unwrap();
            (done, running)
        };

        let tracker = fx.tracker();
        assert_eq!(tracker.get(done).unwrap().state, DownloadState::Completed);
        assert_eq!(tracker.get(running).unwrap().state, DownloadState::Cancelled);
    }

    #[test]
    fn test_clear_on_completed_prunes_history() {
        let mut fx = Fixture::new();
        fx.settings.clear_downloads_on_completed = true;
        let mut tracker = fx.tracker();
        let (_t, id) = started(&mut tracker, "a.pdf");
        tracker.update(id).unwrap();
        tracker.finish(id, true).unwrap();
        assert!(tracker.records().is_empty());
        assert!(!fx.storage.exists(DOWNLOADS_FILE));
    }

    #[test]
    fn test_clear_on_quit_deletes_history() {
        let mut fx = Fixture::new();
        fx.settings.clear_downloads_on_quit = true;
        let mut tracker = fx.tracker();
        started(&mut tracker, "a.pdf");
        tracker.shutdown();
        assert!(!fx.storage.exists(DOWNLOADS_FILE));
        assert!(fx.tracker().records().is_empty());
    }

    #[test]
    fn test_corrupt_history_starts_empty() {
        let fx = Fixture::new();
        fx.storage.write_text(DOWNLOADS_FILE, "{oops").unwrap();
        let tracker = fx.tracker();
        assert!(tracker.records().is_empty());
        assert_eq!(fx.notifier.count(Severity::Warning), 1);
    }

    #[test]
    fn test_settings_accept_flat_keys() {
        let settings: DownloadSettings = serde_json::from_str(
            r#"{"downloadmethod": "confirm", "downloadpath": "/tmp/dl", "cleardownloadsonquit": true}"#,
        )
        .unwrap();
        assert_eq!(settings.download_method, DownloadMethod::Confirm);
        assert_eq!(settings.download_path, PathBuf::from("/tmp/dl"));
        assert!(settings.clear_downloads_on_quit);
        assert!(!settings.clear_downloads_on_completed);
    }

    #[tokio::test]
    async fn test_block_policy_rejects() {
        let mut fx = Fixture::new();
        fx.settings.download_method = DownloadMethod::Block;
        let tracker = RefCell::new(fx.tracker());
        let (transfer, handle) = FakeHandle::new();
        let prompt = ScriptedPrompt::default();

        let id = start(&tracker, &prompt, fx.notifier.as_ref(), request("a.pdf"), handle).await;
        assert!(id.is_none());
        assert!(transfer.cancelled.get());
        assert!(tracker.borrow().records().is_empty());
        assert!(prompt.asked.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_confirm_policy_shows_summary() {
        let mut fx = Fixture::new();
        fx.settings.download_method = DownloadMethod::Confirm;
        let tracker = RefCell::new(fx.tracker());
        let (_transfer, handle) = FakeHandle::new();
        let prompt = ScriptedPrompt::answering([ConfirmResponse {
            accepted: true,
            remember: false,
        }]);

        let id = start(&tracker, &prompt, fx.notifier.as_ref(), request("report.pdf"), handle)
            .await
            .unwrap();
        let asked = prompt.asked.borrow();
        assert!(asked[0].message.contains("report.pdf"));
        assert!(asked[0].message.contains("application/pdf"));
        assert!(asked[0].message.contains("2.0 KB"));
        assert!(asked[0].message.contains("https://files.test/report.pdf"));
        assert_eq!(tracker.borrow().get(id).unwrap().state, DownloadState::WaitingToStart);
    }

    #[tokio::test]
    async fn test_concurrent_confirmations_get_distinct_paths() {
        let mut fx = Fixture::new();
        fx.settings.download_method = DownloadMethod::Confirm;
        let tracker = RefCell::new(fx.tracker());
        let accept = ConfirmResponse {
            accepted: true,
            remember: false,
        };
        let prompt = ScriptedPrompt::answering([accept, accept]);
        let (_a, first) = FakeHandle::new();
        let (_b, second) = FakeHandle::new();

        let (a, b) = tokio::join!(
            start(&tracker, &prompt, fx.notifier.as_ref(), request("report.pdf"), first),
            start(&tracker, &prompt, fx.notifier.as_ref(), request("report.pdf"), second),
        );
        let tracker = tracker.borrow();
        let a = &tracker.get(a.unwrap()).unwrap().file;
        let b = &tracker.get(b.unwrap()).unwrap().file;
        assert_ne!(a, b);
        assert_eq!(a, &fx.settings.download_path.join("report.pdf"));
        assert_eq!(b, &fx.settings.download_path.join("report (2).pdf"));
    }

    #[tokio::test]
    async fn test_declined_confirmation_releases_path() {
        let mut fx = Fixture::new();
        fx.settings.download_method = DownloadMethod::Ask;
        let tracker = RefCell::new(fx.tracker());
        let prompt = ScriptedPrompt::answering([ConfirmResponse::default()]);
        let (_transfer, handle) = FakeHandle::new();
        start(&tracker, &prompt, fx.notifier.as_ref(), request("a.pdf"), handle).await;

        let plan = tracker.borrow_mut().plan(&request("a.pdf"));
        let StartPlan::Confirm { path, .. } = plan else {
            panic!("ask method should confirm");
        };
        assert_eq!(path, fx.settings.download_path.join("a.pdf"));
    }

    #[tokio::test]
    async fn test_declined_confirmation_cancels_transfer() {
        let mut fx = Fixture::new();
        fx.settings.download_method = DownloadMethod::Ask;
        let tracker = RefCell::new(fx.tracker());
        let (transfer, handle) = FakeHandle::new();
        let prompt = ScriptedPrompt::answering([ConfirmResponse::default()]);

        let id = start(&tracker, &prompt, fx.notifier.as_ref(), request("a.pdf"), handle).await;
        assert!(id.is_none());
        assert!(transfer.cancelled.get());
        assert!(tracker.borrow().records().is_empty());
    }
}
