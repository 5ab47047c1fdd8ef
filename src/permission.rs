//! Permission arbiter.
//!
//! Resolves a page's request for a sensitive capability in three tiers:
//!
//! 1. the process-wide default for `permission<name>` (falling back to
//!    `permissionunknown`),
//! 2. the rule layers `asked` → `blocked` → `allowed`, first hit wins,
//! 3. an interactive prompt when the result is `ask`.
//!
//! Every [`Decision`] carries the tier that produced it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::notify::{Notifier, Severity};
use crate::prompt::{ConfirmRequest, PromptService};

pub const UNKNOWN_KEY: &str = "permissionunknown";

const URL_LINE_WIDTH: usize = 60;
const URL_MAX_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Allow,
    Block,
    Ask,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allow => "allowed",
            Self::Block => "blocked",
            Self::Ask => "asked",
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings and rule layers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleLayer {
    Asked,
    Blocked,
    Allowed,
}

impl RuleLayer {
    /// Fixed evaluation order.
    pub const ORDER: [RuleLayer; 3] = [Self::Asked, Self::Blocked, Self::Allowed];

    pub fn disposition(self) -> Disposition {
        match self {
            Self::Asked => Disposition::Ask,
            Self::Blocked => Disposition::Block,
            Self::Allowed => Disposition::Allow,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Regex matched against the requesting URL.
    pub url_pattern: String,
    /// Matched as suffixes of the canonical key, e.g. `camera`.
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSettings {
    /// `permission<name>` → default disposition.
    pub defaults: BTreeMap<String, Disposition>,
    pub asked: Vec<PermissionRule>,
    pub blocked: Vec<PermissionRule>,
    pub allowed: Vec<PermissionRule>,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        use Disposition::*;
        let defaults = [
            ("permissioncamera", Block),
            ("permissionclipboardread", Block),
            ("permissionclipboardsanitizedwrite", Allow),
            ("permissiondisplaycapture", Block),
            ("permissionfullscreen", Allow),
            ("permissiongeolocation", Block),
            ("permissionidledetection", Block),
            ("permissionmediadevices", Block),
            ("permissionmicrophone", Block),
            ("permissionmidi", Block),
            ("permissionmidisysex", Block),
            ("permissionnotifications", Ask),
            ("permissionopenexternal", Ask),
            ("permissionpersistentstorage", Block),
            ("permissionpointerlock", Block),
            ("permissionscreenwakelock", Block),
            ("permissionsensors", Block),
            ("permissionserial", Block),
            ("permissionusb", Block),
            (UNKNOWN_KEY, Block),
        ]
        .into_iter()
        .map(|(k, d)| (k.to_owned(), d))
        .collect();

        Self {
            defaults,
            asked: Vec::new(),
            blocked: Vec::new(),
            allowed: Vec::new(),
        }
    }
}

impl PermissionSettings {
    fn layer(&self, layer: RuleLayer) -> &[PermissionRule] {
        match layer {
            RuleLayer::Asked => &self.asked,
            RuleLayer::Blocked => &self.blocked,
            RuleLayer::Allowed => &self.allowed,
        }
    }
}

struct CompiledRule {
    pattern: Regex,
    suffixes: Vec<String>,
}

fn compile_layer(rules: &[PermissionRule]) -> Vec<CompiledRule> {
    rules
        .iter()
        .filter_map(|rule| match Regex::new(&rule.url_pattern) {
            Ok(pattern) => Some(CompiledRule {
                pattern,
                suffixes: rule.permissions.iter().map(|p| canonical_name(p)).collect(),
            }),
            Err(e) => {
                debug!(pattern = %rule.url_pattern, error = %e, "Skipping invalid permission rule");
                None
            }
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests and decisions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub permission: String,
    /// URL of the requesting page.
    pub url: String,
    /// Requested media kinds (`audio`, `video`) for `media` requests.
    #[serde(default)]
    pub media_types: Vec<String>,
    /// Target of an `openExternal` request.
    #[serde(default)]
    pub external_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "tier")]
pub enum Provenance {
    /// Hard-wired, no setting or rule can change it.
    Forced,
    /// The default (possibly remembered) for the permission key.
    Setting,
    Rule { layer: RuleLayer },
    Prompt { remembered: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Canonical name, e.g. `camera`.
    pub name: String,
    pub disposition: Disposition,
    pub provenance: Provenance,
}

impl Decision {
    pub fn key(&self) -> String {
        format!("permission{}", self.name)
    }

    pub fn is_allowed(&self) -> bool {
        self.disposition == Disposition::Allow
    }
}

/// Lowercases and strips separators: `clipboard-read` → `clipboardread`.
pub fn canonical_name(permission: &str) -> String {
    permission
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | '.') && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Canonical name of a request, with `media` refined by the requested kinds.
pub fn refine_name(request: &PermissionRequest) -> String {
    let name = canonical_name(&request.permission);
    if name != "media" {
        return name;
    }
    let has = |kind: &str| {
        request
            .media_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(kind))
    };
    if has("video") {
        "camera".to_owned()
    } else if has("audio") {
        "microphone".to_owned()
    } else {
        "displaycapture".to_owned()
    }
}

/// Host callback that delivers a decision to the requesting page.
pub trait PermissionResponder {
    fn respond(self: Box<Self>, allowed: bool) -> Result<(), HostGone>;
}

/// The requesting page was torn down before the decision arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("requesting page no longer exists")]
pub struct HostGone;

// ─────────────────────────────────────────────────────────────────────────────
// Arbiter
// ─────────────────────────────────────────────────────────────────────────────

pub struct PermissionArbiter {
    settings: PermissionSettings,
    compiled: [Vec<CompiledRule>; 3],
}

impl PermissionArbiter {
    pub fn new(settings: PermissionSettings) -> Self {
        let compiled = RuleLayer::ORDER.map(|layer| compile_layer(settings.layer(layer)));
        Self { settings, compiled }
    }

    pub fn settings(&self) -> &PermissionSettings {
        &self.settings
    }

    /// Replaces defaults and rules.
    pub fn set_settings(&mut self, settings: PermissionSettings) {
        *self = Self::new(settings);
    }

    fn default_for(&self, key: &str) -> Disposition {
        self.settings
            .defaults
            .get(key)
            .or_else(|| self.settings.defaults.get(UNKNOWN_KEY))
            .copied()
            .unwrap_or(Disposition::Block)
    }

    fn rule_for(&self, key: &str, url: &str) -> Option<RuleLayer> {
        RuleLayer::ORDER
            .into_iter()
            .zip(&self.compiled)
            .find_map(|(layer, rules)| {
                rules
                    .iter()
                    .any(|r| r.pattern.is_match(url) && r.suffixes.iter().any(|s| key.ends_with(s.as_str())))
                    .then_some(layer)
            })
    }

    /// Tiers one and two. `Ask` means the caller must prompt.
    pub fn resolve(&self, request: &PermissionRequest) -> Decision {
        let name = refine_name(request);
        if name == "mediakeysystem" {
            return Decision {
                name,
                disposition: Disposition::Block,
                provenance: Provenance::Forced,
            };
        }

        let key = format!("permission{name}");
        let (disposition, provenance) = match self.rule_for(&key, &request.url) {
            Some(layer) => (layer.disposition(), Provenance::Rule { layer }),
            None => (self.default_for(&key), Provenance::Setting),
        };
        Decision {
            name,
            disposition,
            provenance,
        }
    }

    /// Non-interactive check: anything short of an explicit allow is denied.
    pub fn check(&self, request: &PermissionRequest) -> bool {
        self.resolve(request).is_allowed()
    }

    /// "Remember for this session". An allow of `displaycapture` is never
    /// remembered. Returns whether the default changed.
    pub fn remember(&mut self, name: &str, disposition: Disposition) -> bool {
        if name == "displaycapture" && disposition == Disposition::Allow {
            return false;
        }
        self.settings
            .defaults
            .insert(format!("permission{name}"), disposition);
        true
    }
}

fn wrap_url(url: &str) -> String {
    let mut chars: Vec<char> = url.chars().collect();
    let truncated = chars.len() > URL_MAX_CHARS;
    chars.truncate(URL_MAX_CHARS);
    let mut wrapped = chars
        .chunks(URL_LINE_WIDTH)
        .map(|line| line.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("\n");
    if truncated {
        wrapped.push_str("...");
    }
    wrapped
}

fn question(decision: &Decision, request: &PermissionRequest) -> ConfirmRequest {
    let message = match (&*decision.name, &request.external_url) {
        ("openexternal", Some(target)) => format!(
            "page:\n{}\n\nwants to open:\n{}",
            wrap_url(&request.url),
            wrap_url(target)
        ),
        _ => format!("page:\n{}", wrap_url(&request.url)),
    };
    ConfirmRequest {
        title: format!("Allow this page to access '{}'?", decision.name),
        message,
        checkbox: Some("Remember for this session".to_owned()),
    }
}

fn describe(decision: &Decision, url: &str) -> String {
    let source = match decision.provenance {
        Provenance::Forced => "which is always blocked".to_owned(),
        Provenance::Setting => format!("by the default setting {}", decision.key()),
        Provenance::Rule { layer } => {
            let layer = match layer {
                RuleLayer::Asked => "permissionsasked",
                RuleLayer::Blocked => "permissionsblocked",
                RuleLayer::Allowed => "permissionsallowed",
            };
            format!("by a {layer} rule")
        }
        Provenance::Prompt { remembered: true } => {
            "by your choice, remembered for this session".to_owned()
        }
        Provenance::Prompt { remembered: false } => "by your choice".to_owned(),
    };
    format!(
        "Permission '{}' {} for {url} {source}",
        decision.name, decision.disposition
    )
}

/// Full arbitration for one request, prompting if needed, then answering the
/// page. A page that has gone away by then is ignored.
pub async fn arbitrate(
    arbiter: &RefCell<PermissionArbiter>,
    prompt: &dyn PromptService,
    notifier: &dyn Notifier,
    request: PermissionRequest,
    responder: Box<dyn PermissionResponder>,
) -> Decision {
    let mut decision = arbiter.borrow().resolve(&request);

    if decision.disposition == Disposition::Ask {
        let answer = prompt.confirm(question(&decision, &request)).await;
        let disposition = if answer.accepted {
            Disposition::Allow
        } else {
            Disposition::Block
        };
        let remembered =
            answer.remember && arbiter.borrow_mut().remember(&decision.name, disposition);
        decision.disposition = disposition;
        decision.provenance = Provenance::Prompt { remembered };
    }

    info!(
        permission = %decision.name,
        url = %request.url,
        disposition = %decision.disposition,
        provenance = ?decision.provenance,
        "Permission decided"
    );
    notifier.notify(&describe(&decision, &request.url), Severity::Permission);

    if let Err(e) = responder.respond(decision.is_allowed()) {
        debug!(url = %request.url, error = %e, "Permission answer dropped");
    }
    decision
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::notify::testing::RecordingNotifier;
    use crate::prompt::ConfirmResponse;
    use crate::prompt::testing::ScriptedPrompt;

    struct Recorder(Rc<Cell<Option<bool>>>);

    impl PermissionResponder for Recorder {
        fn respond(self: Box<Self>, allowed: bool) -> Result<(), HostGone> {
            self.0.set(Some(allowed));
            Ok(())
        }
    }

    struct Gone;

    impl PermissionResponder for Gone {
        fn respond(self: Box<Self>, _allowed: bool) -> Result<(), HostGone> {
            Err(HostGone)
        }
    }

    fn recorder() -> (Rc<Cell<Option<bool>>>, Box<dyn PermissionResponder>) {
        let cell = Rc::new(Cell::new(None));
        (Rc::clone(&cell), Box::new(Recorder(cell)))
    }

    fn request(permission: &str, url: &str) -> PermissionRequest {
        PermissionRequest {
            permission: permission.to_string(),
            url: url.to_string(),
            ..PermissionRequest::default()
        }
    }

    fn rule(pattern: &str, permissions: &[&str]) -> PermissionRule {
        PermissionRule {
            url_pattern: pattern.to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn ask_everything() -> PermissionSettings {
        let mut settings = PermissionSettings::default();
        for value in settings.defaults.values_mut() {
            *value = Disposition::Ask;
        }
        settings
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("clipboard-read"), "clipboardread");
        assert_eq!(canonical_name("Display_Capture"), "displaycapture");
        assert_eq!(canonical_name("openExternal"), "openexternal");
    }

    #[test]
    fn test_media_refinement() {
        let mut req = request("media", "https://meet.test");
        req.media_types = vec!["audio".into()];
        assert_eq!(refine_name(&req), "microphone");
        req.media_types = vec!["audio".into(), "video".into()];
        assert_eq!(refine_name(&req), "camera");
        req.media_types.clear();
        assert_eq!(refine_name(&req), "displaycapture");
    }

    #[test]
    fn test_media_key_system_always_blocked() {
        let mut settings = PermissionSettings::default();
        settings.allowed.push(rule(".*", &["mediakeysystem"]));
        settings
            .defaults
            .insert("permissionmediakeysystem".into(), Disposition::Allow);
        let arbiter = PermissionArbiter::new(settings);
        let decision = arbiter.resolve(&request("mediaKeySystem", "https://video.test"));
        assert_eq!(decision.disposition, Disposition::Block);
        assert_eq!(decision.provenance, Provenance::Forced);
    }

    #[test]
    fn test_default_and_unknown_fallback() {
        let mut settings = PermissionSettings::default();
        settings
            .defaults
            .insert("permissionfullscreen".into(), Disposition::Allow);
        settings.defaults.insert(UNKNOWN_KEY.into(), Disposition::Ask);
        let arbiter = PermissionArbiter::new(settings);

        let decision = arbiter.resolve(&request("fullscreen", "https://a.test"));
        assert_eq!(decision.disposition, Disposition::Allow);
        assert_eq!(decision.provenance, Provenance::Setting);

        let decision = arbiter.resolve(&request("window-management", "https://a.test"));
        assert_eq!(decision.disposition, Disposition::Ask);
    }

    #[test]
    fn test_blocked_layer_wins_over_allowed() {
        let mut settings = PermissionSettings::default();
        settings.blocked.push(rule("example.com", &["camera"]));
        settings.allowed.push(rule(".*", &["camera"]));
        let arbiter = PermissionArbiter::new(settings);

        let decision = arbiter.resolve(&request("camera", "https://example.com/call"));
        assert_eq!(decision.disposition, Disposition::Block);
        assert_eq!(
            decision.provenance,
            Provenance::Rule {
                layer: RuleLayer::Blocked
            }
        );

        let decision = arbiter.resolve(&request("camera", "https://other.test/call"));
        assert_eq!(decision.disposition, Disposition::Allow);
    }

    #[test]
    fn test_asked_layer_checked_first() {
        let mut settings = PermissionSettings::default();
        settings.asked.push(rule("bank\\.test", &["notifications"]));
        settings.blocked.push(rule(".*", &["notifications"]));
        let arbiter = PermissionArbiter::new(settings);
        let decision = arbiter.resolve(&request("notifications", "https://bank.test"));
        assert_eq!(decision.disposition, Disposition::Ask);
    }

    #[test]
    fn test_rule_needs_url_and_suffix() {
        let mut settings = PermissionSettings::default();
        settings.allowed.push(rule("example\\.com", &["microphone"]));
        let arbiter = PermissionArbiter::new(settings);
        let decision = arbiter.resolve(&request("camera", "https://example.com"));
        assert_eq!(decision.provenance, Provenance::Setting);
    }

    #[test]
    fn test_invalid_rule_pattern_skipped() {
        let mut settings = PermissionSettings::default();
        settings.allowed.push(rule("([", &["camera"]));
        settings.allowed.push(rule("ok\\.test", &["camera"]));
        let arbiter = PermissionArbiter::new(settings);
        assert!(arbiter.check(&request("camera", "https://ok.test")));
    }

    #[test]
    fn test_url_wrapping() {
        let long = format!("https://example.com/{}", "a".repeat(300));
        let wrapped = wrap_url(&long);
        assert!(wrapped.ends_with("..."));
        assert!(wrapped.lines().all(|l| l.chars().count() <= URL_LINE_WIDTH + 3));
        assert_eq!(wrap_url("https://a.test"), "https://a.test");
    }

    #[tokio::test]
    async fn test_rule_decision_skips_prompt() {
        let mut settings = PermissionSettings::default();
        settings.allowed.push(rule(".*", &["geolocation"]));
        let arbiter = RefCell::new(PermissionArbiter::new(settings));
        let prompt = ScriptedPrompt::default();
        let notifier = RecordingNotifier::default();
        let (answer, responder) = recorder();

        let decision = arbitrate(
            &arbiter,
            &prompt,
            &notifier,
            request("geolocation", "https://maps.test"),
            responder,
        )
        .await;

        assert!(decision.is_allowed());
        assert_eq!(answer.get(), Some(true));
        assert!(prompt.asked.borrow().is_empty());
        let (message, severity) = notifier.last().unwrap();
        assert_eq!(severity, Severity::Permission);
        assert!(message.contains("permissionsallowed"));
    }

    #[tokio::test]
    async fn test_prompt_remembers_microphone() {
        let arbiter = RefCell::new(PermissionArbiter::new(ask_everything()));
        let prompt = ScriptedPrompt::answering([ConfirmResponse {
            accepted: true,
            remember: true,
        }]);
        let notifier = RecordingNotifier::default();
        let (answer, responder) = recorder();

        let decision = arbitrate(
            &arbiter,
            &prompt,
            &notifier,
            request("microphone", "https://call.test"),
            responder,
        )
        .await;

        assert_eq!(answer.get(), Some(true));
        assert_eq!(decision.provenance, Provenance::Prompt { remembered: true });
        assert_eq!(
            arbiter.borrow().settings().defaults["permissionmicrophone"],
            Disposition::Allow
        );
        assert!(notifier.last().unwrap().0.contains("remembered"));
    }

    #[tokio::test]
    async fn test_display_capture_allow_never_remembered() {
        let arbiter = RefCell::new(PermissionArbiter::new(ask_everything()));
        let prompt = ScriptedPrompt::answering([ConfirmResponse {
            accepted: true,
            remember: true,
        }]);
        let (answer, responder) = recorder();
        let mut req = request("media", "https://share.test");
        req.media_types.clear();

        let decision = arbitrate(&arbiter, &prompt, &RecordingNotifier::default(), req, responder).await;

        assert_eq!(decision.name, "displaycapture");
        assert_eq!(answer.get(), Some(true));
        assert_eq!(decision.provenance, Provenance::Prompt { remembered: false });
        assert_eq!(
            arbiter.borrow().settings().defaults["permissiondisplaycapture"],
            Disposition::Ask
        );
    }

    #[tokio::test]
    async fn test_display_capture_block_is_remembered() {
        let arbiter = RefCell::new(PermissionArbiter::new(ask_everything()));
        let prompt = ScriptedPrompt::answering([ConfirmResponse {
            accepted: false,
            remember: true,
        }]);
        let (_answer, responder) = recorder();
        arbitrate(
            &arbiter,
            &prompt,
            &RecordingNotifier::default(),
            request("display-capture", "https://share.test"),
            responder,
        )
        .await;
        assert_eq!(
            arbiter.borrow().settings().defaults["permissiondisplaycapture"],
            Disposition::Block
        );
    }

    #[tokio::test]
    async fn test_open_external_prompt_shows_both_urls() {
        let arbiter = RefCell::new(PermissionArbiter::new(PermissionSettings::default()));
        let prompt = ScriptedPrompt::default();
        let (answer, responder) = recorder();
        let mut req = request("openExternal", "https://chat.test/room");
        req.external_url = Some("zoommtg://join?id=42".into());

        arbitrate(&arbiter, &prompt, &RecordingNotifier::default(), req, responder).await;

        let asked = prompt.asked.borrow();
        assert!(asked[0].message.contains("https://chat.test/room"));
        assert!(asked[0].message.contains("zoommtg://join?id=42"));
        assert_eq!(answer.get(), Some(false));
    }

    #[tokio::test]
    async fn test_gone_page_is_ignored() {
        let arbiter = RefCell::new(PermissionArbiter::new(PermissionSettings::default()));
        let decision = arbitrate(
            &arbiter,
            &ScriptedPrompt::default(),
            &RecordingNotifier::default(),
            request("camera", "https://a.test"),
            Box::new(Gone),
        )
        .await;
        assert_eq!(decision.disposition, Disposition::Block);
    }

    #[tokio::test]
    async fn test_media_audio_resolves_to_microphone_end_to_end() {
        let mut settings = PermissionSettings::default();
        settings.allowed.push(rule(".*", &["microphone"]));
        let arbiter = RefCell::new(PermissionArbiter::new(settings));
        let (answer, responder) = recorder();
        let mut req = request("media", "https://call.test");
        req.media_types = vec!["audio".into()];

        let decision = arbitrate(
            &arbiter,
            &ScriptedPrompt::default(),
            &RecordingNotifier::default(),
            req,
            responder,
        )
        .await;

        assert_eq!(decision.name, "microphone");
        assert_eq!(decision.key(), "permissionmicrophone");
        assert_eq!(answer.get(), Some(true));
    }
}
