//! Coordinateur de sessions.
//!
//! Compose les composants de politique pour chaque contexte de navigation
//! nommé (une partition d'isolation, ex. `persist:main`) :
//!
//! 1. **Interception des requêtes** : règles de redirection d'abord ; si
//!    l'URL change, la requête est redirigée et le filtrage est sauté.
//!    Sinon le moteur adblock rattaché à la session décide.
//! 2. **En-têtes de réponse** : injection CSP par le moteur adblock.
//! 3. **Téléchargements** : événements de transfert → [`DownloadTracker`].
//! 4. **Permissions** : requêtes de capacité → [`PermissionArbiter`], avec
//!    prompt modal si nécessaire.
//!
//! Tout vit sur la boucle d'événements principale : l'état est dans des
//! `RefCell` jamais empruntés à travers un `.await`.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::download::{
    self, DownloadRecord, DownloadRequest, DownloadSettings, DownloadTracker, ListAction,
    TransferHandle,
};
use crate::error::{PolicyError, Result};
use crate::favicon;
use crate::filter::{AdblockMode, FilterEngine, HeaderMap};
use crate::net;
use crate::notify::Notifier;
use crate::permission::{
    self, Decision, PermissionArbiter, PermissionRequest, PermissionResponder, PermissionSettings,
};
use crate::prompt::{AuthGate, AuthRequest, Credentials, PromptService};
use crate::redirect::RedirectRules;
use crate::storage::Storage;

/// Requête réseau sortante vue par l'intercepteur.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub url: String,
    /// URL de la page qui a initié la requête.
    #[serde(default)]
    pub source_url: String,
    /// "document", "script", "image", "stylesheet", "other"...
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
}

fn default_resource_type() -> String {
    "other".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum RequestOutcome {
    Allow,
    Cancel,
    Redirect { url: String },
}

/// Un contexte de navigation nommé.
#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub redirects: RedirectRules,
    pub cache: bool,
}

/// Propriétaire unique de l'état de politique du processus.
pub struct SessionCoordinator {
    storage: Storage,
    client: reqwest::Client,
    notifier: Rc<dyn Notifier>,
    prompt: Rc<dyn PromptService>,
    filter: FilterEngine,
    downloads: RefCell<DownloadTracker>,
    permissions: RefCell<PermissionArbiter>,
    sessions: RefCell<BTreeMap<String, Session>>,
    redirects: RefCell<String>,
    building: Cell<bool>,
    auth: AuthGate,
}

impl SessionCoordinator {
    pub fn new(
        config: &Config,
        storage: Storage,
        notifier: Rc<dyn Notifier>,
        prompt: Rc<dyn PromptService>,
    ) -> Result<Self> {
        let client = net::build_client()?;
        let filter = FilterEngine::new(storage.clone(), client.clone(), config.adblock.lists.clone());
        let downloads =
            DownloadTracker::load(storage.clone(), config.downloads.clone(), Rc::clone(&notifier));

        Ok(Self {
            storage,
            client,
            notifier,
            prompt,
            filter,
            downloads: RefCell::new(downloads),
            permissions: RefCell::new(PermissionArbiter::new(config.permissions.clone())),
            sessions: RefCell::new(BTreeMap::new()),
            redirects: RefCell::new(config.sessions.redirects.clone()),
            building: Cell::new(false),
            auth: AuthGate::default(),
        })
    }

    pub fn filter(&self) -> &FilterEngine {
        &self.filter
    }

    pub fn session(&self, name: &str) -> Option<Session> {
        self.sessions.borrow().get(name).cloned()
    }

    pub fn session_names(&self) -> Vec<String> {
        self.sessions.borrow().keys().cloned().collect()
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.sessions.borrow().contains_key(name)
    }

    // ── Sessions et filtrage ──────────────────────────────────────────────

    /// Enregistre une session et la rattache au filtrage si son mode
    /// l'active. Renvoie `true` si le moteur adblock reste à construire.
    pub fn register_session(&self, name: &str, adblock: AdblockMode, cache: bool) -> bool {
        let session = Session {
            name: name.to_owned(),
            redirects: RedirectRules::parse(&self.redirects.borrow()),
            cache,
        };
        self.sessions.borrow_mut().insert(name.to_owned(), session);
        info!(session = name, adblock = adblock.as_str(), cache, "Session créée");

        if !adblock.is_enabled() {
            return false;
        }
        self.filter.attach(name);
        !self.filter.is_enabled()
    }

    /// Construit le moteur au premier rattachement. Un seul chargement à la
    /// fois : les appels concurrents repartent sans rien faire.
    pub async fn build_engine(&self, mode: AdblockMode) {
        if self.filter.is_enabled() || self.building.replace(true) {
            return;
        }
        self.filter.enable(mode, self.notifier.as_ref()).await;
        self.building.set(false);
    }

    pub async fn create_session(&self, name: &str, adblock: AdblockMode, cache: bool) {
        if self.register_session(name, adblock, cache) {
            self.build_engine(adblock).await;
        }
    }

    /// Active le filtrage globalement et le rattache à toutes les sessions.
    pub async fn adblock_enable(&self, mode: AdblockMode) {
        if !mode.is_enabled() {
            self.filter.disable();
            return;
        }
        for name in self.session_names() {
            self.filter.attach(&name);
        }
        self.filter.enable(mode, self.notifier.as_ref()).await;
    }

    pub fn adblock_disable(&self) {
        self.filter.disable();
    }

    /// Remplace les règles de redirection de toutes les sessions.
    pub fn set_redirects(&self, rules: &str) {
        *self.redirects.borrow_mut() = rules.to_owned();
        let parsed = RedirectRules::parse(rules);
        info!(rules = parsed.len(), "Règles de redirection mises à jour");
        for session in self.sessions.borrow_mut().values_mut() {
            session.redirects = parsed.clone();
        }
    }

    /// Décision avant envoi : redirection, annulation, ou passage.
    pub fn before_request(&self, session: &str, request: &ResourceRequest) -> Result<RequestOutcome> {
        let target = {
            let sessions = self.sessions.borrow();
            let session = sessions
                .get(session)
                .ok_or_else(|| PolicyError::UnknownSession(session.to_owned()))?;
            session.redirects.redirect_target(&request.url)
        };
        if let Some(url) = target {
            debug!(from = %request.url, to = %url, "Requête redirigée");
            return Ok(RequestOutcome::Redirect { url });
        }

        let Some(engine) = self.filter.engine_for(session) else {
            return Ok(RequestOutcome::Allow);
        };
        if engine.should_block(&request.url, &request.source_url, &request.resource_type) {
            debug!(url = %request.url, "Requête bloquée par adblock");
            return Ok(RequestOutcome::Cancel);
        }
        Ok(RequestOutcome::Allow)
    }

    /// En-têtes modifiés à la réception, `None` s'il n'y a rien à changer.
    pub fn headers_received(
        &self,
        session: &str,
        request: &ResourceRequest,
        headers: &HeaderMap,
    ) -> Result<Option<HeaderMap>> {
        self.require_session(session)?;
        Ok(self.filter.engine_for(session).and_then(|engine| {
            engine.modify_response_headers(
                &request.url,
                &request.source_url,
                &request.resource_type,
                headers,
            )
        }))
    }

    pub fn cosmetic_selectors(&self, session: &str, page_url: &str) -> Result<Vec<String>> {
        self.require_session(session)?;
        Ok(self
            .filter
            .engine_for(session)
            .map(|engine| engine.cosmetic_selectors(page_url))
            .unwrap_or_default())
    }

    /// Navigation principale : vide le cache de décisions du moteur.
    pub fn navigated(&self, session: &str) {
        if let Some(engine) = self.filter.engine_for(session) {
            engine.clear_cache();
        }
    }

    fn require_session(&self, session: &str) -> Result<()> {
        if self.has_session(session) {
            Ok(())
        } else {
            Err(PolicyError::UnknownSession(session.to_owned()))
        }
    }

    // ── Téléchargements ───────────────────────────────────────────────────

    pub fn set_download_settings(&self, settings: DownloadSettings) {
        self.downloads.borrow_mut().set_settings(settings);
    }

    pub async fn download_started(
        &self,
        request: DownloadRequest,
        handle: Box<dyn TransferHandle>,
    ) -> Option<Uuid> {
        download::start(
            &self.downloads,
            self.prompt.as_ref(),
            self.notifier.as_ref(),
            request,
            handle,
        )
        .await
    }

    pub fn download_progress(&self, id: Uuid) -> Result<()> {
        self.downloads.borrow_mut().update(id)
    }

    pub fn download_done(&self, id: Uuid, completed: bool) -> Result<()> {
        self.downloads.borrow_mut().finish(id, completed)
    }

    pub fn download_list(&self, action: &str, id: Option<Uuid>) -> Result<Vec<DownloadRecord>> {
        self.downloads
            .borrow_mut()
            .list(ListAction::from(action), id)
    }

    pub fn download(&self, id: Uuid) -> Option<DownloadRecord> {
        self.downloads.borrow().get(id).cloned()
    }

    pub fn downloads(&self) -> Vec<DownloadRecord> {
        self.downloads.borrow().records().to_vec()
    }

    // ── Permissions ───────────────────────────────────────────────────────

    pub fn set_permissions(&self, settings: PermissionSettings) {
        self.permissions.borrow_mut().set_settings(settings);
    }

    pub async fn permission_request(
        &self,
        request: PermissionRequest,
        responder: Box<dyn PermissionResponder>,
    ) -> Decision {
        permission::arbitrate(
            &self.permissions,
            self.prompt.as_ref(),
            self.notifier.as_ref(),
            request,
            responder,
        )
        .await
    }

    pub fn permission_check(&self, request: &PermissionRequest) -> bool {
        self.permissions.borrow().check(request)
    }

    // ── Divers ────────────────────────────────────────────────────────────

    /// Défi Basic-auth : un seul prompt d'identifiants visible à la fois.
    pub async fn auth_challenge(&self, request: AuthRequest) -> Option<Credentials> {
        self.auth.challenge(self.prompt.as_ref(), request).await
    }

    pub async fn download_favicon(&self, url: &str) -> Result<String> {
        favicon::download_favicon(&self.client, &self.storage, url).await
    }

    /// Fin de processus : applique la politique clear-on-quit.
    pub fn shutdown(&self) {
        self.downloads.borrow_mut().shutdown();
        info!("Moteur de politique arrêté");
    }
}
