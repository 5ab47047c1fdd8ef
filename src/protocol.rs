//! Pont avec le processus hôte (le moteur de rendu).
//!
//! Un message JSON par ligne : l'hôte écrit ses événements sur notre stdin,
//! nous répondons sur stdout. Chaque message porte un champ `type` en
//! kebab-case.
//!
//! Les flux qui attendent l'utilisateur (prompts) ou le réseau tournent
//! dans des tâches `spawn_local` : la boucle de lecture continue pendant
//! ce temps, sinon la réponse au prompt ne serait jamais lue.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::download::{
    DownloadRecord, DownloadRequest, DownloadSettings, StaleHandle, TransferHandle,
    TransferProgress,
};
use crate::error::{PolicyError, Result};
use crate::filter::{AdblockMode, HeaderMap};
use crate::notify::{Notifier, Severity, TracingNotifier};
use crate::permission::{HostGone, PermissionRequest, PermissionResponder, PermissionSettings};
use crate::prompt::{AuthRequest, ConfirmRequest, ConfirmResponse, Credentials, PromptService};
use crate::session::{RequestOutcome, ResourceRequest, SessionCoordinator};
use crate::storage::Storage;

/// Identifiant choisi par l'hôte (requête, transfert).
pub type HostId = u64;

const EXTENSIONS_EXTERNAL: &str = "extensions are managed outside the policy engine";

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

/// Messages reçus de l'hôte.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Inbound {
    // Configuration
    SetRedirects {
        rules: String,
    },
    SetDownloadSettings {
        settings: DownloadSettings,
    },
    DownloadListRequest {
        #[serde(default)]
        action: String,
        #[serde(default)]
        id: Option<Uuid>,
    },
    SetPermissions {
        settings: PermissionSettings,
    },
    CreateSession {
        name: String,
        adblock: AdblockMode,
        #[serde(default = "default_cache")]
        cache: bool,
    },
    AdblockEnable {
        mode: AdblockMode,
    },
    AdblockDisable,
    DownloadFavicon {
        url: String,
    },
    InstallExtension {
        #[serde(default)]
        id: Option<String>,
    },
    RemoveExtension {
        #[serde(default)]
        id: Option<String>,
    },
    ListExtensions,

    // Événements du moteur de rendu
    BeforeRequest {
        request_id: HostId,
        session: String,
        #[serde(flatten)]
        request: ResourceRequest,
    },
    HeadersReceived {
        request_id: HostId,
        session: String,
        #[serde(flatten)]
        request: ResourceRequest,
        #[serde(default)]
        headers: HeaderMap,
    },
    CosmeticSelectors {
        request_id: HostId,
        session: String,
        url: String,
    },
    Navigated {
        session: String,
    },
    DownloadStarted {
        transfer: HostId,
        #[serde(flatten)]
        request: DownloadRequest,
    },
    DownloadProgress {
        transfer: HostId,
        received: u64,
        #[serde(default)]
        total: u64,
        #[serde(default)]
        paused: bool,
    },
    DownloadDone {
        transfer: HostId,
        completed: bool,
    },
    PermissionRequest {
        request_id: HostId,
        #[serde(flatten)]
        request: PermissionRequest,
    },
    PermissionCheck {
        request_id: HostId,
        #[serde(flatten)]
        request: PermissionRequest,
    },
    AuthChallenge {
        request_id: HostId,
        #[serde(flatten)]
        request: AuthRequest,
    },
    PromptResponse {
        prompt_id: u64,
        #[serde(default)]
        accepted: bool,
        #[serde(default)]
        remember: bool,
        #[serde(default)]
        credentials: Option<Credentials>,
    },
    Shutdown,
}

fn default_cache() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferCommand {
    Pause,
    Resume,
    Cancel,
}

/// Messages envoyés à l'hôte.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Outbound {
    RequestDecision {
        request_id: HostId,
        outcome: RequestOutcome,
    },
    HeadersDecision {
        request_id: HostId,
        headers: Option<HeaderMap>,
    },
    CosmeticSelectors {
        request_id: HostId,
        selectors: Vec<String>,
    },
    DownloadList {
        downloads: Vec<DownloadRecord>,
    },
    DownloadTracked {
        transfer: HostId,
        id: Option<Uuid>,
        file: Option<PathBuf>,
    },
    TransferCommand {
        transfer: HostId,
        command: TransferCommand,
    },
    PermissionDecision {
        request_id: HostId,
        allowed: bool,
    },
    PermissionCheckResult {
        request_id: HostId,
        allowed: bool,
    },
    AuthResponse {
        request_id: HostId,
        credentials: Option<Credentials>,
    },
    ConfirmPrompt {
        prompt_id: u64,
        #[serde(flatten)]
        request: ConfirmRequest,
    },
    CredentialsPrompt {
        prompt_id: u64,
        #[serde(flatten)]
        request: AuthRequest,
    },
    Notification {
        message: String,
        severity: Severity,
    },
    Favicon {
        url: String,
        name: Option<String>,
    },
    Unsupported {
        request: String,
        message: String,
    },
    Error {
        message: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbox : file de sortie vers stdout
// ─────────────────────────────────────────────────────────────────────────────

/// `None` demande au writer de vider la file et de s'arrêter.
pub type Outgoing = mpsc::UnboundedReceiver<Option<Outbound>>;

#[derive(Debug, Clone)]
pub struct Outbox(mpsc::UnboundedSender<Option<Outbound>>);

impl Outbox {
    pub fn channel() -> (Self, Outgoing) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// `false` si le writer est déjà parti.
    pub fn send(&self, message: Outbound) -> bool {
        self.0.send(Some(message)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.0.send(None);
    }
}

/// Écrit chaque message sortant comme une ligne JSON.
pub async fn write_lines<W: AsyncWrite + Unpin>(mut outgoing: Outgoing, mut out: W) -> W {
    while let Some(Some(message)) = outgoing.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Message sortant non sérialisable");
                continue;
            }
        };
        line.push('\n');
        let written = async {
            out.write_all(line.as_bytes()).await?;
            out.flush().await
        };
        if let Err(e) = written.await {
            warn!(error = %e, "Écriture vers l'hôte impossible, arrêt du writer");
            break;
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// HostBridge : prompts, notifications et transferts côté hôte
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PromptAnswer {
    accepted: bool,
    remember: bool,
    credentials: Option<Credentials>,
}

/// État d'un transfert tel que rapporté par l'hôte.
#[derive(Debug, Default)]
struct TransferSlot {
    progress: Cell<TransferProgress>,
    gone: Cell<bool>,
    record: Cell<Option<Uuid>>,
    /// Issue annoncée par l'hôte avant que le record n'existe.
    finished: Cell<Option<bool>>,
}

/// Implémente les services attendus par le coordinateur en les relayant
/// à l'hôte.
pub struct HostBridge {
    outbox: Outbox,
    next_prompt: Cell<u64>,
    prompts: RefCell<HashMap<u64, oneshot::Sender<PromptAnswer>>>,
    transfers: RefCell<HashMap<HostId, Rc<TransferSlot>>>,
}

impl HostBridge {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            next_prompt: Cell::new(1),
            prompts: RefCell::new(HashMap::new()),
            transfers: RefCell::new(HashMap::new()),
        }
    }

    pub fn send(&self, message: Outbound) {
        if !self.outbox.send(message) {
            debug!("Hôte déconnecté, message ignoré");
        }
    }

    pub fn pending_prompts(&self) -> usize {
        self.prompts.borrow().len()
    }

    fn ask(&self, build: impl FnOnce(u64) -> Outbound) -> Option<oneshot::Receiver<PromptAnswer>> {
        let prompt_id = self.next_prompt.get();
        self.next_prompt.set(prompt_id + 1);

        let (tx, rx) = oneshot::channel();
        self.prompts.borrow_mut().insert(prompt_id, tx);
        if !self.outbox.send(build(prompt_id)) {
            self.prompts.borrow_mut().remove(&prompt_id);
            return None;
        }
        Some(rx)
    }

    fn answer(&self, prompt_id: u64, answer: PromptAnswer) {
        let Some(tx) = self.prompts.borrow_mut().remove(&prompt_id) else {
            warn!(prompt_id, "Réponse à un prompt inconnu");
            return;
        };
        if tx.send(answer).is_err() {
            debug!(prompt_id, "Le flux du prompt a déjà abandonné");
        }
    }

    /// Ouvre le suivi d'un transfert et renvoie la poignée confiée au tracker.
    fn open_transfer(&self, transfer: HostId, total: u64) -> Box<dyn TransferHandle> {
        let slot = Rc::new(TransferSlot::default());
        slot.progress.set(TransferProgress {
            total,
            ..TransferProgress::default()
        });
        self.transfers.borrow_mut().insert(transfer, Rc::clone(&slot));
        Box::new(HostTransfer {
            transfer,
            slot,
            outbox: self.outbox.clone(),
        })
    }

    /// Rattache le record au transfert. Renvoie l'issue si l'hôte a déjà
    /// terminé le transfert pendant le prompt.
    fn bind_transfer(&self, transfer: HostId, record: Option<Uuid>) -> Option<bool> {
        let mut transfers = self.transfers.borrow_mut();
        let slot = transfers.get(&transfer)?;
        let finished = slot.finished.get();
        match record {
            Some(id) if finished.is_none() => slot.record.set(Some(id)),
            _ => {
                transfers.remove(&transfer);
            }
        }
        finished
    }

    fn transfer_progress(&self, transfer: HostId, progress: TransferProgress) -> Option<Uuid> {
        let transfers = self.transfers.borrow();
        let slot = transfers.get(&transfer)?;
        slot.progress.set(progress);
        slot.record.get()
    }

    fn close_transfer(&self, transfer: HostId, completed: bool) -> Option<Uuid> {
        let mut transfers = self.transfers.borrow_mut();
        let slot = transfers.get(&transfer)?;
        slot.gone.set(true);
        let Some(id) = slot.record.get() else {
            // Le flux de démarrage attend encore son prompt.
            slot.finished.set(Some(completed));
            return None;
        };
        transfers.remove(&transfer);
        Some(id)
    }
}

#[async_trait(?Send)]
impl PromptService for HostBridge {
    async fn confirm(&self, request: ConfirmRequest) -> ConfirmResponse {
        let Some(rx) = self.ask(|prompt_id| Outbound::ConfirmPrompt { prompt_id, request }) else {
            return ConfirmResponse::default();
        };
        match rx.await {
            Ok(answer) => ConfirmResponse {
                accepted: answer.accepted,
                remember: answer.remember,
            },
            Err(_) => ConfirmResponse::default(),
        }
    }

    async fn credentials(&self, request: AuthRequest) -> Option<Credentials> {
        let rx = self.ask(|prompt_id| Outbound::CredentialsPrompt { prompt_id, request })?;
        rx.await.ok().and_then(|answer| answer.credentials)
    }
}

impl Notifier for HostBridge {
    fn notify(&self, message: &str, severity: Severity) {
        TracingNotifier.notify(message, severity);
        self.send(Outbound::Notification {
            message: message.to_owned(),
            severity,
        });
    }
}

struct HostTransfer {
    transfer: HostId,
    slot: Rc<TransferSlot>,
    outbox: Outbox,
}

impl HostTransfer {
    fn command(&self, command: TransferCommand) -> std::result::Result<(), StaleHandle> {
        if self.slot.gone.get() {
            return Err(StaleHandle);
        }
        let sent = self.outbox.send(Outbound::TransferCommand {
            transfer: self.transfer,
            command,
        });
        if sent { Ok(()) } else { Err(StaleHandle) }
    }
}

impl TransferHandle for HostTransfer {
    fn progress(&self) -> std::result::Result<TransferProgress, StaleHandle> {
        if self.slot.gone.get() {
            return Err(StaleHandle);
        }
        Ok(self.slot.progress.get())
    }

    fn pause(&self) -> std::result::Result<(), StaleHandle> {
        self.command(TransferCommand::Pause)
    }

    fn resume(&self) -> std::result::Result<(), StaleHandle> {
        self.command(TransferCommand::Resume)
    }

    fn cancel(&self) -> std::result::Result<(), StaleHandle> {
        self.command(TransferCommand::Cancel)
    }
}

struct HostResponder {
    request_id: HostId,
    outbox: Outbox,
}

impl PermissionResponder for HostResponder {
    fn respond(self: Box<Self>, allowed: bool) -> std::result::Result<(), HostGone> {
        let sent = self.outbox.send(Outbound::PermissionDecision {
            request_id: self.request_id,
            allowed,
        });
        if sent { Ok(()) } else { Err(HostGone) }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Route chaque message entrant vers le coordinateur.
pub struct Dispatcher {
    coordinator: Rc<SessionCoordinator>,
    bridge: Rc<HostBridge>,
}

impl Dispatcher {
    /// Construit le coordinateur et son pont vers l'hôte.
    pub fn start(config: &Config) -> Result<(Self, Outbox, Outgoing)> {
        let (outbox, outgoing) = Outbox::channel();
        let bridge = Rc::new(HostBridge::new(outbox.clone()));
        let storage = Storage::new(&config.storage.data_dir);
        let coordinator = Rc::new(SessionCoordinator::new(
            config,
            storage,
            bridge.clone(),
            bridge.clone(),
        )?);
        Ok((
            Self {
                coordinator,
                bridge,
            },
            outbox,
            outgoing,
        ))
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    /// Traite une ligne brute. Renvoie `false` quand l'hôte demande l'arrêt.
    pub fn handle_line(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return true;
        }
        match serde_json::from_str::<Inbound>(line) {
            Ok(message) => self.dispatch(message),
            Err(e) => {
                warn!(error = %e, "Message hôte invalide");
                self.bridge.send(Outbound::Error {
                    message: format!("invalid message: {e}"),
                });
                true
            }
        }
    }

    /// Doit tourner dans un `LocalSet` : les flux asynchrones sont lancés
    /// avec `spawn_local`.
    pub fn dispatch(&self, message: Inbound) -> bool {
        let coordinator = &self.coordinator;
        let bridge = &self.bridge;

        match message {
            Inbound::SetRedirects { rules } => coordinator.set_redirects(&rules),
            Inbound::SetDownloadSettings { settings } => coordinator.set_download_settings(settings),
            Inbound::DownloadListRequest { action, id } => {
                match coordinator.download_list(&action, id) {
                    Ok(downloads) => bridge.send(Outbound::DownloadList { downloads }),
                    Err(e) => self.report(e),
                }
            }
            Inbound::SetPermissions { settings } => coordinator.set_permissions(settings),
            Inbound::CreateSession {
                name,
                adblock,
                cache,
            } => {
                if coordinator.register_session(&name, adblock, cache) {
                    let coordinator = Rc::clone(coordinator);
                    tokio::task::spawn_local(async move {
                        coordinator.build_engine(adblock).await;
                    });
                }
            }
            Inbound::AdblockEnable { mode } => {
                let coordinator = Rc::clone(coordinator);
                tokio::task::spawn_local(async move {
                    coordinator.adblock_enable(mode).await;
                });
            }
            Inbound::AdblockDisable => coordinator.adblock_disable(),
            Inbound::DownloadFavicon { url } => {
                let coordinator = Rc::clone(coordinator);
                let bridge = Rc::clone(bridge);
                tokio::task::spawn_local(async move {
                    let name = match coordinator.download_favicon(&url).await {
                        Ok(name) => Some(name),
                        Err(e) => {
                            warn!(url = %url, error = %e, "Favicon non téléchargée");
                            None
                        }
                    };
                    bridge.send(Outbound::Favicon { url, name });
                });
            }
            Inbound::InstallExtension { .. } => self.unsupported("install-extension"),
            Inbound::RemoveExtension { .. } => self.unsupported("remove-extension"),
            Inbound::ListExtensions => self.unsupported("list-extensions"),

            Inbound::BeforeRequest {
                request_id,
                session,
                request,
            } => {
                // Fail-open : une session inconnue laisse passer la requête.
                let outcome = coordinator
                    .before_request(&session, &request)
                    .unwrap_or_else(|e| {
                        self.report(e);
                        RequestOutcome::Allow
                    });
                bridge.send(Outbound::RequestDecision {
                    request_id,
                    outcome,
                });
            }
            Inbound::HeadersReceived {
                request_id,
                session,
                request,
                headers,
            } => {
                let headers = coordinator
                    .headers_received(&session, &request, &headers)
                    .unwrap_or_else(|e| {
                        self.report(e);
                        None
                    });
                bridge.send(Outbound::HeadersDecision {
                    request_id,
                    headers,
                });
            }
            Inbound::CosmeticSelectors {
                request_id,
                session,
                url,
            } => {
                let selectors = coordinator
                    .cosmetic_selectors(&session, &url)
                    .unwrap_or_else(|e| {
                        self.report(e);
                        Vec::new()
                    });
                bridge.send(Outbound::CosmeticSelectors {
                    request_id,
                    selectors,
                });
            }
            Inbound::Navigated { session } => coordinator.navigated(&session),

            Inbound::DownloadStarted { transfer, request } => {
                let handle = bridge.open_transfer(transfer, request.total_bytes.unwrap_or(0));
                let coordinator = Rc::clone(coordinator);
                let bridge = Rc::clone(bridge);
                tokio::task::spawn_local(async move {
                    let id = coordinator.download_started(request, handle).await;
                    let file = id.and_then(|id| coordinator.download(id)).map(|r| r.file);
                    bridge.send(Outbound::DownloadTracked { transfer, id, file });
                    if let Some(completed) = bridge.bind_transfer(transfer, id)
                        && let Some(id) = id
                        && let Err(e) = coordinator.download_done(id, completed)
                    {
                        warn!(%id, error = %e, "Fin de téléchargement non appliquée");
                    }
                });
            }
            Inbound::DownloadProgress {
                transfer,
                received,
                total,
                paused,
            } => {
                let progress = TransferProgress {
                    received,
                    total,
                    paused,
                };
                if let Some(id) = bridge.transfer_progress(transfer, progress)
                    && let Err(e) = coordinator.download_progress(id)
                {
                    self.report(e);
                }
            }
            Inbound::DownloadDone {
                transfer,
                completed,
            } => {
                if let Some(id) = bridge.close_transfer(transfer, completed)
                    && let Err(e) = coordinator.download_done(id, completed)
                {
                    self.report(e);
                }
            }
            Inbound::PermissionRequest {
                request_id,
                request,
            } => {
                let responder = Box::new(HostResponder {
                    request_id,
                    outbox: bridge.outbox.clone(),
                });
                let coordinator = Rc::clone(coordinator);
                tokio::task::spawn_local(async move {
                    coordinator.permission_request(request, responder).await;
                });
            }
            Inbound::PermissionCheck {
                request_id,
                request,
            } => {
                let allowed = coordinator.permission_check(&request);
                bridge.send(Outbound::PermissionCheckResult {
                    request_id,
                    allowed,
                });
            }
            Inbound::AuthChallenge {
                request_id,
                request,
            } => {
                let coordinator = Rc::clone(coordinator);
                let bridge = Rc::clone(bridge);
                tokio::task::spawn_local(async move {
                    let credentials = coordinator.auth_challenge(request).await;
                    bridge.send(Outbound::AuthResponse {
                        request_id,
                        credentials,
                    });
                });
            }
            Inbound::PromptResponse {
                prompt_id,
                accepted,
                remember,
                credentials,
            } => bridge.answer(
                prompt_id,
                PromptAnswer {
                    accepted,
                    remember,
                    credentials,
                },
            ),
            Inbound::Shutdown => {
                coordinator.shutdown();
                return false;
            }
        }
        true
    }

    fn report(&self, error: PolicyError) {
        warn!(error = %error, "Message hôte rejeté");
        self.bridge.send(Outbound::Error {
            message: error.to_string(),
        });
    }

    fn unsupported(&self, request: &str) {
        debug!(request, "Extensions hors périmètre");
        self.bridge.send(Outbound::Unsupported {
            request: request.to_owned(),
            message: EXTENSIONS_EXTERNAL.to_owned(),
        });
    }
}

/// Lit les messages de l'hôte jusqu'à `shutdown` ou fin de flux.
pub async fn serve<R: AsyncBufRead + Unpin>(dispatcher: &Dispatcher, input: R) -> Result<()> {
    let mut lines = input.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !dispatcher.handle_line(&line) {
                    return Ok(());
                }
            }
            Ok(None) => {
                info!("Flux hôte fermé");
                dispatcher.coordinator().shutdown();
                return Ok(());
            }
            Err(e) => return Err(PolicyError::io("<stdin>", e)),
        }
    }
}

/// Boucle principale : stdin → dispatcher, file de sortie → stdout.
pub async fn run(config: Config) -> Result<()> {
    let (dispatcher, outbox, outgoing) = Dispatcher::start(&config)?;
    let writer = tokio::task::spawn_local(write_lines(outgoing, tokio::io::stdout()));

    for name in &config.sessions.startup {
        dispatcher.dispatch(Inbound::CreateSession {
            name: name.clone(),
            adblock: config.adblock.mode,
            cache: config.sessions.cache,
        });
    }
    info!(
        sessions = config.sessions.startup.len(),
        data_dir = %config.storage.data_dir.display(),
        "Moteur de politique prêt"
    );

    let served = serve(&dispatcher, tokio::io::BufReader::new(tokio::io::stdin())).await;
    outbox.close();
    if let Err(e) = writer.await {
        warn!(error = %e, "Writer interrompu");
    }
    served
}
