//! The closed error taxonomy (§4.3, §7) and the `thiserror` error type that
//! carries it.

use thiserror::Error;

/// Closed set of error kinds every user-visible failure is mapped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CdpConnectionFailed,
    CdpDisconnected,
    CdpError,
    NavigationFailed,
    ElementNotFound,
    ElementNotVisible,
    ElementNotInteractable,
    EvalError,
    DownloadTimeout,
    DownloadFailed,
    MaxTabsReached,
    TabClosed,
    Timeout,
    Invalid,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CdpConnectionFailed => "CDP_CONNECTION_FAILED",
            ErrorKind::CdpDisconnected => "CDP_DISCONNECTED",
            ErrorKind::CdpError => "CDP_ERROR",
            ErrorKind::NavigationFailed => "NAVIGATION_FAILED",
            ErrorKind::ElementNotFound => "ELEMENT_NOT_FOUND",
            ErrorKind::ElementNotVisible => "ELEMENT_NOT_VISIBLE",
            ErrorKind::ElementNotInteractable => "ELEMENT_NOT_INTERACTABLE",
            ErrorKind::EvalError => "EVAL_ERROR",
            ErrorKind::DownloadTimeout => "DOWNLOAD_TIMEOUT",
            ErrorKind::DownloadFailed => "DOWNLOAD_FAILED",
            ErrorKind::MaxTabsReached => "MAX_TABS_REACHED",
            ErrorKind::TabClosed => "TAB_CLOSED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Invalid => "INVALID",
        }
    }
}

/// Maps a raw CDP error message (and optional failing method) to one of the
/// closed [`ErrorKind`]s, by substring match, first rule wins (§4.3).
pub fn classify(message: &str, method: Option<&str>) -> (ErrorKind, String) {
    const LIFECYCLE: &[&str] = &[
        "No target with given id",
        "Target closed",
        "Cannot find context",
        "Execution context was destroyed",
        "Session",
        "not found",
    ];
    const NETWORK: &[&str] = &["net::ERR_", "Cannot navigate"];

    // Rule 1: tab/session lifecycle. "Session ... not found" needs both
    // markers, the others are independently sufficient.
    if LIFECYCLE[..4].iter().any(|m| message.contains(m))
        || (message.contains("Session") && message.contains("not found"))
    {
        return (ErrorKind::TabClosed, with_method(message, method));
    }

    // Rule 2: network / navigation.
    if NETWORK.iter().any(|m| message.contains(m)) {
        return (ErrorKind::NavigationFailed, with_method(message, method));
    }

    // Rule 3: DOM.
    if message.contains("Could not find node") || message.contains("No node with given id") {
        return (ErrorKind::ElementNotFound, with_method(message, method));
    }
    if message.contains("Node is not visible") {
        return (ErrorKind::ElementNotVisible, with_method(message, method));
    }
    if message.contains("Node is not an element") || message.contains("not interactable") {
        return (
            ErrorKind::ElementNotInteractable,
            with_method(message, method),
        );
    }

    // Rule 4: JS runtime.
    if message.contains("TypeError") || message.contains("ReferenceError") || message.contains("SyntaxError")
    {
        return (ErrorKind::EvalError, with_method(message, method));
    }

    // Rule 5: fallback.
    (ErrorKind::CdpError, with_method(message, method))
}

fn with_method(message: &str, method: Option<&str>) -> String {
    match method {
        Some(m) => format!("{message} (method: {m})"),
        None => message.to_string(),
    }
}

/// The crate's error type. `Display` renders as `"ERROR_KIND: human description"`
/// per §6.
#[derive(Debug, Error)]
pub enum CdpError {
    #[error("{}: {1}", .0.as_str())]
    Classified(ErrorKind, String),
    #[error("{}: {0}", ErrorKind::Timeout.as_str())]
    Timeout(String),
    #[error("{}: connection lost", ErrorKind::CdpDisconnected.as_str())]
    Disconnected,
    #[error("{}: {0}", ErrorKind::CdpConnectionFailed.as_str())]
    ConnectionFailed(String),
    #[error("{}: tab count at configured cap", ErrorKind::MaxTabsReached.as_str())]
    MaxTabsReached,
    #[error("{}: {0}", ErrorKind::Invalid.as_str())]
    Invalid(String),
    #[error("{}: {0}", ErrorKind::DownloadTimeout.as_str())]
    DownloadTimeout(String),
    #[error("{}: {0}", ErrorKind::DownloadFailed.as_str())]
    DownloadFailed(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CdpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CdpError::Classified(kind, _) => *kind,
            CdpError::Timeout(_) => ErrorKind::Timeout,
            CdpError::Disconnected => ErrorKind::CdpDisconnected,
            CdpError::ConnectionFailed(_) => ErrorKind::CdpConnectionFailed,
            CdpError::MaxTabsReached => ErrorKind::MaxTabsReached,
            CdpError::Invalid(_) => ErrorKind::Invalid,
            CdpError::DownloadTimeout(_) => ErrorKind::DownloadTimeout,
            CdpError::DownloadFailed(_) => ErrorKind::DownloadFailed,
            CdpError::Json(_) => ErrorKind::Invalid,
        }
    }

    /// Builds a `CdpError` from a raw CDP error message via the classifier.
    pub fn from_remote(message: impl Into<String>, method: Option<&str>) -> Self {
        let message = message.into();
        let (kind, full) = classify(&message, method);
        CdpError::Classified(kind, full)
    }
}

pub type Result<T, E = CdpError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_not_found_is_tab_closed() {
        let (kind, _) = classify("Session with given id not found", None);
        assert_eq!(kind, ErrorKind::TabClosed);
    }

    #[test]
    fn net_error_is_navigation_failed() {
        let (kind, _) = classify("net::ERR_NAME_NOT_RESOLVED", None);
        assert_eq!(kind, ErrorKind::NavigationFailed);
    }

    #[test]
    fn unmatched_falls_back_to_cdp_error_with_method() {
        let (kind, msg) = classify("something else entirely", Some("Page.navigate"));
        assert_eq!(kind, ErrorKind::CdpError);
        assert!(msg.contains("Page.navigate"));
    }

    #[test]
    fn display_renders_kind_colon_description() {
        let err = CdpError::from_remote("Session 7F2 not found", None);
        assert_eq!(err.to_string(), "TAB_CLOSED: Session 7F2 not found");
    }

    #[test]
    fn lifecycle_precedes_network_when_both_present() {
        // "Target closed" should win even if message also looks net-ish.
        let (kind, _) = classify("Target closed while net::ERR_FAILED was pending", None);
        assert_eq!(kind, ErrorKind::TabClosed);
    }
}
