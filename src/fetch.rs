//! The fetch-interception state machine (§4.5): resource blocking and
//! in-memory download capture share the single CDP `Fetch` channel and must
//! compose correctly.

use std::collections::HashSet;

use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::error::CdpError;
use crate::types::SessionId;

/// A CDP `Fetch.requestPaused` resource category a caller can block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Image,
    Stylesheet,
    Script,
    Font,
    Media,
    Xhr,
    Other(&'static str),
}

impl ResourceType {
    fn as_cdp_str(&self) -> &str {
        match self {
            ResourceType::Image => "Image",
            ResourceType::Stylesheet => "Stylesheet",
            ResourceType::Script => "Script",
            ResourceType::Font => "Font",
            ResourceType::Media => "Media",
            ResourceType::Xhr => "XHR",
            ResourceType::Other(s) => s,
        }
    }
}

/// The four interception states from §4.5. Patterns are derived, not stored,
/// so the state machine can't drift out of sync with what it requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptState {
    Off,
    BlockingOnly,
    DownloadOnly,
    Both,
}

impl InterceptState {
    fn wants_request_stage(&self) -> bool {
        matches!(self, InterceptState::BlockingOnly | InterceptState::Both)
    }

    fn wants_response_stage(&self) -> bool {
        matches!(self, InterceptState::DownloadOnly | InterceptState::Both)
    }

    fn patterns(&self) -> Vec<Value> {
        let mut patterns = Vec::new();
        if self.wants_request_stage() {
            patterns.push(json!({"urlPattern": "*", "requestStage": "Request"}));
        }
        if self.wants_response_stage() {
            patterns.push(json!({"urlPattern": "*", "requestStage": "Response"}));
        }
        patterns
    }
}

/// Bytes captured from an intercepted download response.
#[derive(Debug, Clone)]
pub struct Download {
    pub data: Vec<u8>,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub size: usize,
}

/// A pending `Fetch.requestPaused` event, enough of it to drive the state
/// machine without depending on a generated CDP type catalog.
#[derive(Debug, Clone)]
pub struct RequestPaused {
    pub request_id: String,
    pub resource_type: ResourceType,
    pub stage_is_response: bool,
    pub response_headers: Vec<(String, String)>,
    pub response_status_code: Option<i64>,
}

impl RequestPaused {
    fn header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Download detection per §4.5 / testable property 8.
    fn detect_download(&self) -> Option<(Option<String>, Option<String>)> {
        if let Some(disposition) = self.header("Content-Disposition") {
            if disposition.contains("attachment") || disposition.contains("filename=") {
                let filename = disposition.split("filename=").nth(1).map(|rest| {
                    rest.trim_matches('"').split(';').next().unwrap_or("").to_string()
                });
                let mime = self
                    .header("Content-Type")
                    .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string());
                return Some((filename, mime));
            }
        }
        if let Some(content_type) = self.header("Content-Type") {
            let mime = content_type.split(';').next().unwrap_or(content_type).trim();
            const BINARY_TYPES: &[&str] =
                &["application/pdf", "application/octet-stream", "application/zip"];
            if BINARY_TYPES.contains(&mime) {
                return Some((None, Some(mime.to_string())));
            }
        }
        None
    }
}

/// What the caller should do in response to a paused request, decided by
/// [`FetchController::on_request_paused`].
#[derive(Debug)]
pub enum InterceptAction {
    ContinueRequest,
    FailRequest { reason: &'static str },
    FetchBodyThenFulfill { base64_encoded_hint: bool },
}

/// Owns the interception state for one tab's session. All transitions issue
/// `Fetch.disable`/`Fetch.enable`/domain commands through the `execute`
/// closure the caller supplies (normally `Tab::execute`), so this type has
/// no direct dependency on the Manager or Connection.
pub struct FetchController {
    session: SessionId,
    state: InterceptState,
    blocked: HashSet<ResourceType>,
    pending_download: Option<oneshot::Sender<Result<Download, CdpError>>>,
}

impl FetchController {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            state: InterceptState::Off,
            blocked: HashSet::new(),
            pending_download: None,
        }
    }

    pub fn state(&self) -> InterceptState {
        self.state
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// `block_resources` transition (§4.5): from any state, land on
    /// `BlockingOnly` if the set is non-empty, else `Off`.
    pub fn block_resources(&mut self, set: HashSet<ResourceType>) -> StateTransition {
        self.blocked = set;
        let next = if self.blocked.is_empty() {
            InterceptState::Off
        } else {
            match self.state {
                InterceptState::DownloadOnly | InterceptState::Both => InterceptState::Both,
                InterceptState::Off | InterceptState::BlockingOnly => InterceptState::BlockingOnly,
            }
        };
        self.transition(next)
    }

    /// `begin expect_download` transition (§4.5): `Both` if currently
    /// `BlockingOnly`, else `DownloadOnly`.
    pub fn begin_expect_download(&mut self) -> StateTransition {
        let next = if self.state == InterceptState::BlockingOnly {
            InterceptState::Both
        } else {
            InterceptState::DownloadOnly
        };
        self.transition(next)
    }

    /// `end expect_download` transition (§4.5): reverts to `BlockingOnly` if
    /// that was the prior steady state, else `Off`.
    pub fn end_expect_download(&mut self) -> StateTransition {
        let next = if self.state == InterceptState::Both {
            InterceptState::BlockingOnly
        } else {
            InterceptState::Off
        };
        self.transition(next)
    }

    fn transition(&mut self, next: InterceptState) -> StateTransition {
        let prev = self.state;
        self.state = next;
        StateTransition {
            disable: prev != InterceptState::Off,
            enable_patterns: if next == InterceptState::Off {
                None
            } else {
                Some(next.patterns())
            },
        }
    }

    /// Registers the oneshot the eventual download bytes will be delivered
    /// on. Overwrites any previous pending download (only one capture is
    /// in flight per tab at a time).
    pub fn awaiting_download(&mut self, tx: oneshot::Sender<Result<Download, CdpError>>) {
        self.pending_download = Some(tx);
    }

    /// Decides what to do about a paused request/response, and — for a
    /// detected download at response stage — returns the metadata needed
    /// to fetch the body and fulfill the request (§4.5). The caller still
    /// performs the actual `Fetch.getResponseBody` / `Fetch.fulfillRequest`
    /// CDP round trips and then calls [`FetchController::deliver_download`].
    pub fn on_request_paused(&self, event: &RequestPaused) -> InterceptAction {
        if event.stage_is_response {
            if event.detect_download().is_some() {
                InterceptAction::FetchBodyThenFulfill {
                    base64_encoded_hint: true,
                }
            } else {
                InterceptAction::ContinueRequest
            }
        } else if self.blocked.contains(&event.resource_type) {
            InterceptAction::FailRequest {
                reason: "BlockedByClient",
            }
        } else {
            InterceptAction::ContinueRequest
        }
    }

    /// Computes the download metadata for a paused response event, without
    /// mutating state — used by the caller once it has decided to fetch the
    /// body.
    pub fn download_metadata(event: &RequestPaused) -> Option<(Option<String>, Option<String>)> {
        event.detect_download()
    }

    /// Delivers captured bytes (or a failure) to whoever is awaiting this
    /// tab's download, per the action-function error propagation rule in
    /// §4.5.
    pub fn deliver_download(&mut self, result: Result<Download, CdpError>) {
        if let Some(tx) = self.pending_download.take() {
            let _ = tx.send(result);
        }
    }

    pub fn blocked_resources(&self) -> &HashSet<ResourceType> {
        &self.blocked
    }
}

/// The CDP round trips a transition implies: disable (if previously active)
/// then re-enable with the new pattern set (if the new state isn't `Off`).
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub disable: bool,
    pub enable_patterns: Option<Vec<Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paused_response(headers: &[(&str, &str)]) -> RequestPaused {
        RequestPaused {
            request_id: "r1".into(),
            resource_type: ResourceType::Xhr,
            stage_is_response: true,
            response_headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            response_status_code: Some(200),
        }
    }

    #[test]
    fn blocking_then_download_composes_to_both() {
        let mut fc = FetchController::new(SessionId::new("s1"));
        fc.block_resources(HashSet::from([ResourceType::Image]));
        assert_eq!(fc.state(), InterceptState::BlockingOnly);
        fc.begin_expect_download();
        assert_eq!(fc.state(), InterceptState::Both);
    }

    #[test]
    fn download_then_blocking_also_composes_to_both() {
        let mut fc = FetchController::new(SessionId::new("s1"));
        fc.begin_expect_download();
        assert_eq!(fc.state(), InterceptState::DownloadOnly);
        fc.block_resources(HashSet::from([ResourceType::Image]));
        assert_eq!(fc.state(), InterceptState::Both);
    }

    #[test]
    fn ending_download_reverts_to_prior_steady_state() {
        let mut fc = FetchController::new(SessionId::new("s1"));
        fc.block_resources(HashSet::from([ResourceType::Image]));
        fc.begin_expect_download();
        fc.end_expect_download();
        assert_eq!(fc.state(), InterceptState::BlockingOnly);

        let mut fc2 = FetchController::new(SessionId::new("s2"));
        fc2.begin_expect_download();
        fc2.end_expect_download();
        assert_eq!(fc2.state(), InterceptState::Off);
    }

    #[test]
    fn unblocking_with_empty_set_reverts_to_off() {
        let mut fc = FetchController::new(SessionId::new("s1"));
        fc.block_resources(HashSet::from([ResourceType::Image]));
        fc.block_resources(HashSet::new());
        assert_eq!(fc.state(), InterceptState::Off);
    }

    #[test]
    fn detects_download_from_content_disposition() {
        let event = paused_response(&[("Content-Disposition", "attachment; filename=\"x.pdf\"")]);
        let (filename, _) = FetchController::download_metadata(&event).unwrap();
        assert_eq!(filename.as_deref(), Some("x.pdf"));
    }

    #[test]
    fn detects_download_from_content_type_alone() {
        let event = paused_response(&[("Content-Type", "application/pdf")]);
        let (filename, mime) = FetchController::download_metadata(&event).unwrap();
        assert_eq!(filename, None);
        assert_eq!(mime.as_deref(), Some("application/pdf"));
    }

    #[test]
    fn non_download_response_is_not_detected() {
        let event = paused_response(&[("Content-Type", "text/html")]);
        assert!(FetchController::download_metadata(&event).is_none());
    }

    #[test]
    fn request_stage_blocked_resource_fails() {
        let mut fc = FetchController::new(SessionId::new("s1"));
        fc.block_resources(HashSet::from([ResourceType::Image]));
        let event = RequestPaused {
            request_id: "r2".into(),
            resource_type: ResourceType::Image,
            stage_is_response: false,
            response_headers: vec![],
            response_status_code: None,
        };
        match fc.on_request_paused(&event) {
            InterceptAction::FailRequest { reason } => assert_eq!(reason, "BlockedByClient"),
            other => panic!("expected FailRequest, got {other:?}"),
        }
    }

    #[test]
    fn request_stage_unblocked_resource_continues() {
        let fc = FetchController::new(SessionId::new("s1"));
        let event = RequestPaused {
            request_id: "r3".into(),
            resource_type: ResourceType::Script,
            stage_is_response: false,
            response_headers: vec![],
            response_status_code: None,
        };
        matches!(fc.on_request_paused(&event), InterceptAction::ContinueRequest);
    }
}
