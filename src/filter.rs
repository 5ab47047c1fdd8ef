//! Middleware de filtrage réseau (ad-blocking, tracker blocking).
//!
//! Encapsule le moteur `adblock` de Brave pour filtrer les requêtes HTTP
//! en utilisant des listes de filtres au format Adblock Plus (EasyList,
//! EasyPrivacy, etc.).
//!
//! ## Points de décision
//!
//! 1. Avant l'envoi : [`AdblockEngine::should_block`] annule ou laisse passer.
//! 2. À la réception : [`AdblockEngine::modify_response_headers`] injecte les
//!    directives CSP des filtres `$csp`.
//!
//! ## Rechargement
//!
//! Les listes actives (dans `blocklists/` du dossier de données) sont
//! concaténées puis re-parsées en entier à chaque activation ou mise à jour.
//! Pas de diff incrémental : l'ancien moteur est simplement remplacé.
//!
//! ## Listes de filtres par défaut
//!
//! - EasyList : <https://easylist.to/easylist/easylist.txt>
//! - EasyPrivacy : <https://easylist.to/easylist/easyprivacy.txt>

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use adblock::Engine;
use adblock::lists::{FilterSet, ParseOptions};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::net;
use crate::notify::{Notifier, Severity};
use crate::storage::Storage;

/// Sous-dossier du stockage contenant les listes de filtres.
pub const BLOCKLIST_DIR: &str = "blocklists";

const CSP_HEADER: &str = "content-security-policy";

/// En-têtes de réponse, nom → valeurs (comme `responseHeaders` côté hôte).
pub type HeaderMap = BTreeMap<String, Vec<String>>;

// ─────────────────────────────────────────────────────────────────────────────
// Mode d'activation et sources
// ─────────────────────────────────────────────────────────────────────────────

/// Mode d'activation du filtrage.
///
/// Toute valeur inconnue est traitée comme `Static` : recharger depuis le
/// cache local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AdblockMode {
    Off,
    /// Recharge ce qui est en cache local.
    Static,
    /// Télécharge les listes par défaut, les met en cache, puis recharge.
    Update,
    /// Ne charge que les listes fournies par l'utilisateur.
    Custom,
}

impl AdblockMode {
    pub fn is_enabled(self) -> bool {
        self != Self::Off
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Static => "static",
            Self::Update => "update",
            Self::Custom => "custom",
        }
    }
}

impl From<&str> for AdblockMode {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Self::Off,
            "update" => Self::Update,
            "custom" => Self::Custom,
            _ => Self::Static,
        }
    }
}

impl From<String> for AdblockMode {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<AdblockMode> for String {
    fn from(mode: AdblockMode) -> Self {
        mode.as_str().to_owned()
    }
}

/// Une liste de filtres distante, mise en cache sous `blocklists/<name>.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterListSource {
    pub name: String,
    pub url: String,
}

impl FilterListSource {
    pub fn cache_name(&self) -> String {
        format!("{BLOCKLIST_DIR}/{}.txt", self.name)
    }
}

pub fn default_filter_lists() -> Vec<FilterListSource> {
    vec![
        FilterListSource {
            name: "easylist".to_string(),
            url: "https://easylist.to/easylist/easylist.txt".to_string(),
        },
        FilterListSource {
            name: "easyprivacy".to_string(),
            url: "https://easylist.to/easylist/easyprivacy.txt".to_string(),
        },
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// AdblockEngine : un jeu de règles parsé
// ─────────────────────────────────────────────────────────────────────────────

/// Wrapper autour du moteur `adblock::Engine`.
///
/// Les vérifications se font via `should_block()` qui prend l'URL, l'URL
/// source, et le type de requête.
pub struct AdblockEngine {
    engine: Engine,
    /// Cache of (url, source_url, request_type) → blocked? to avoid redundant
    /// filter matching. Cleared on navigation via `clear_cache()`.
    cache: RefCell<HashMap<(String, String, String), bool>>,
}

impl AdblockEngine {
    /// Parse le texte concaténé des listes actives.
    pub fn load(filter_text: &str) -> Self {
        let mut filter_set = FilterSet::new(false);
        filter_set.add_filter_list(filter_text, ParseOptions::default());
        let engine = Engine::from_filter_set(filter_set, true);
        debug!(line_count = filter_text.lines().count(), "Moteur adblock construit");

        Self {
            engine,
            cache: RefCell::new(HashMap::new()),
        }
    }

    fn request(url: &str, source_url: &str, request_type: &str) -> Option<adblock::request::Request> {
        adblock::request::Request::new(url, source_url, request_type)
            .or_else(|_| adblock::request::Request::new(url, "", "other"))
            .ok()
    }

    /// Vérifie si une requête doit être bloquée.
    ///
    /// - `url` : URL de la ressource demandée
    /// - `source_url` : URL de la page qui a initié la requête
    /// - `request_type` : type de ressource ("document", "script", "image", "stylesheet", "other")
    pub fn should_block(&self, url: &str, source_url: &str, request_type: &str) -> bool {
        let key = (url.to_owned(), source_url.to_owned(), request_type.to_owned());
        if let Some(&cached) = self.cache.borrow().get(&key) {
            return cached;
        }

        // URL unparseable by adblock (data URI, blob, etc.) — allow it.
        let blocked = Self::request(url, source_url, request_type)
            .is_some_and(|request| self.engine.check_network_request(&request).matched);
        self.cache.borrow_mut().insert(key, blocked);
        blocked
    }

    /// Renvoie les en-têtes modifiés si un filtre `$csp` s'applique, `None`
    /// sinon. La directive est ajoutée aux valeurs CSP existantes.
    pub fn modify_response_headers(
        &self,
        url: &str,
        source_url: &str,
        request_type: &str,
        headers: &HeaderMap,
    ) -> Option<HeaderMap> {
        let request = Self::request(url, source_url, request_type)?;
        let directives = self.engine.get_csp_directives(&request)?;

        let mut modified = headers.clone();
        let key = modified
            .keys()
            .find(|k| k.eq_ignore_ascii_case(CSP_HEADER))
            .cloned()
            .unwrap_or_else(|| CSP_HEADER.to_owned());
        modified.entry(key).or_default().push(directives);
        Some(modified)
    }

    /// Sélecteurs CSS de masquage d'éléments applicables à une page.
    pub fn cosmetic_selectors(&self, page_url: &str) -> Vec<String> {
        let resources = self.engine.url_cosmetic_resources(page_url);
        let mut selectors: Vec<String> = resources.hide_selectors.into_iter().collect();
        selectors.sort();
        selectors
    }

    /// Clears the result cache. Call on navigation to avoid unbounded growth.
    pub fn clear_cache(&self) {
        self.cache.borrow_mut().clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FilterEngine : moteur courant + rattachement aux sessions
// ─────────────────────────────────────────────────────────────────────────────

/// Propriétaire du jeu de règles courant, partagé par toutes les sessions.
///
/// Le moteur courant est un `Rc` : le remplacer ne fait que lâcher l'ancienne
/// référence, les décisions en cours gardent la leur jusqu'à la fin.
pub struct FilterEngine {
    storage: Storage,
    client: reqwest::Client,
    default_lists: Vec<FilterListSource>,
    current: RefCell<Option<Rc<AdblockEngine>>>,
    attached: RefCell<BTreeSet<String>>,
}

impl FilterEngine {
    pub fn new(
        storage: Storage,
        client: reqwest::Client,
        default_lists: Vec<FilterListSource>,
    ) -> Self {
        Self {
            storage,
            client,
            default_lists,
            current: RefCell::new(None),
            attached: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.current.borrow().is_some()
    }

    pub fn current(&self) -> Option<Rc<AdblockEngine>> {
        self.current.borrow().clone()
    }

    /// Remplace le jeu de règles courant par `filter_text` parsé.
    pub fn load(&self, filter_text: &str) -> Rc<AdblockEngine> {
        let engine = Rc::new(AdblockEngine::load(filter_text));
        *self.current.borrow_mut() = Some(Rc::clone(&engine));
        engine
    }

    pub fn attach(&self, session: &str) {
        self.attached.borrow_mut().insert(session.to_owned());
    }

    pub fn detach(&self, session: &str) {
        self.attached.borrow_mut().remove(session);
    }

    pub fn is_attached(&self, session: &str) -> bool {
        self.attached.borrow().contains(session)
    }

    pub fn attached_sessions(&self) -> Vec<String> {
        self.attached.borrow().iter().cloned().collect()
    }

    /// Le moteur à consulter pour une session, s'il y est rattaché.
    pub fn engine_for(&self, session: &str) -> Option<Rc<AdblockEngine>> {
        if !self.is_attached(session) {
            return None;
        }
        self.current()
    }

    /// Active le filtrage dans le mode donné.
    ///
    /// Un échec de téléchargement est notifié et n'est jamais fatal : le
    /// jeu de règles précédent reste en place.
    pub async fn enable(&self, mode: AdblockMode, notifier: &dyn Notifier) {
        match mode {
            AdblockMode::Off => self.disable(),
            AdblockMode::Update => {
                let failures = self.update_default_lists(notifier).await;
                if failures > 0 && self.is_enabled() {
                    warn!(failures, "Mise à jour partielle, règles précédentes conservées");
                    return;
                }
                self.reload(mode, notifier);
            }
            AdblockMode::Static | AdblockMode::Custom => self.reload(mode, notifier),
        }
    }

    /// Détruit le moteur et le détache de toutes les sessions.
    pub fn disable(&self) {
        self.current.borrow_mut().take();
        self.attached.borrow_mut().clear();
        info!("Ad-blocking désactivé");
    }

    /// Télécharge toutes les listes par défaut en parallèle et les écrit en
    /// cache. Renvoie le nombre d'échecs.
    async fn update_default_lists(&self, notifier: &dyn Notifier) -> usize {
        let fetches = self.default_lists.iter().map(|list| async move {
            let result = net::fetch_text(&self.client, &list.url).await;
            (list, result)
        });

        let mut failures = 0;
        for (list, result) in join_all(fetches).await {
            let written = result.and_then(|text| self.storage.write_text(&list.cache_name(), &text));
            match written {
                Ok(()) => info!(list = %list.name, "Liste de filtres mise à jour"),
                Err(e) => {
                    failures += 1;
                    warn!(list = %list.name, error = %e, "Échec de mise à jour");
                    notifier.notify(
                        &format!("Failed to update adblock list {}: {e}", list.name),
                        Severity::Error,
                    );
                }
            }
        }
        failures
    }

    /// Concatène les listes en cache selon le mode et reconstruit le moteur.
    fn reload(&self, mode: AdblockMode, notifier: &dyn Notifier) {
        let names = match self.active_list_names(mode) {
            Ok(names) => names,
            Err(e) => {
                notifier.notify(&format!("Failed to read adblock lists: {e}"), Severity::Error);
                return;
            }
        };

        let mut filter_text = String::new();
        let mut loaded = 0;
        for name in &names {
            match self.storage.read_text(name) {
                Ok(Some(content)) => {
                    info!(list = %name, lines = content.lines().count(), "Liste de filtres chargée");
                    filter_text.push_str(&content);
                    filter_text.push('\n');
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(list = %name, error = %e, "Impossible de lire la liste"),
            }
        }

        if loaded == 0 {
            self.current.borrow_mut().take();
            warn!(mode = mode.as_str(), "Aucune liste de filtres trouvée. Ad-blocking inactif.");
            notifier.notify("No adblock lists found, adblocker stays inactive", Severity::Warning);
            return;
        }

        self.load(&filter_text);
        info!(lists = loaded, mode = mode.as_str(), "Moteur adblock initialisé");
    }

    /// Listes à charger : tout le cache, ou seulement les listes utilisateur
    /// en mode `Custom`.
    fn active_list_names(&self, mode: AdblockMode) -> Result<Vec<String>> {
        let cached = self.storage.list(BLOCKLIST_DIR, "txt")?;
        if mode != AdblockMode::Custom {
            return Ok(cached);
        }
        let defaults: BTreeSet<String> = self.default_lists.iter().map(|l| l.cache_name()).collect();
        Ok(cached.into_iter().filter(|n| !defaults.contains(n)).collect())
    }
}
