//! Modal-prompt service: yes/no dialogs and Basic-auth credential dialogs.
//!
//! Prompts only suspend the flow that opened them. The one exception is
//! [`AuthGate`]: a single credential dialog may be visible at a time.

use std::cell::Cell;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An allow/deny question, optionally with a "remember" checkbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub title: String,
    pub message: String,
    /// Label of the checkbox, `None` when the dialog has no checkbox.
    pub checkbox: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmResponse {
    pub accepted: bool,
    #[serde(default)]
    pub remember: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub url: String,
    pub realm: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[async_trait(?Send)]
pub trait PromptService {
    /// A closed or dismissed dialog resolves to a denial.
    async fn confirm(&self, request: ConfirmRequest) -> ConfirmResponse;

    /// `None` when the user cancels.
    async fn credentials(&self, request: AuthRequest) -> Option<Credentials>;
}

/// Keeps Basic-auth prompts from stacking.
///
/// While one credential dialog is open, further challenges are declined at
/// once and the request proceeds unauthenticated.
#[derive(Debug, Default)]
pub struct AuthGate {
    visible: Cell<bool>,
}

struct VisibleGuard<'a>(&'a Cell<bool>);

impl Drop for VisibleGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl AuthGate {
    pub fn is_visible(&self) -> bool {
        self.visible.get()
    }

    pub async fn challenge(
        &self,
        prompt: &dyn PromptService,
        request: AuthRequest,
    ) -> Option<Credentials> {
        if self.visible.replace(true) {
            debug!(url = %request.url, "Auth prompt already open, challenge declined");
            return None;
        }
        let _guard = VisibleGuard(&self.visible);
        prompt.credentials(request).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedPrompt;
    use super::*;

    fn challenge(url: &str) -> AuthRequest {
        AuthRequest {
            url: url.to_string(),
            realm: None,
        }
    }

    #[tokio::test]
    async fn test_single_challenge_reaches_prompt() {
        let prompt = ScriptedPrompt::default();
        *prompt.credentials.borrow_mut() = Some(Credentials {
            username: "suri".into(),
            password: "hunter2".into(),
        });
        let gate = AuthGate::default();
        let creds = gate.challenge(&prompt, challenge("https://a.test")).await;
        assert_eq!(creds.unwrap().username, "suri");
        assert!(!gate.is_visible());
    }

    #[tokio::test]
    async fn test_concurrent_challenge_is_declined() {
        let prompt = ScriptedPrompt::default();
        *prompt.credentials.borrow_mut() = Some(Credentials {
            username: "suri".into(),
            password: "pw".into(),
        });
        let gate = AuthGate::default();
        let (first, second) = tokio::join!(
            gate.challenge(&prompt, challenge("https://a.test")),
            gate.challenge(&prompt, challenge("https://b.test")),
        );
        assert!(first.is_some());
        assert!(second.is_none());
        assert!(!gate.is_visible());
    }
}
