//! Submission outcomes and response classification.
//!
//! The marker strings below are copied from the booking site's pages and
//! must match byte for byte. When the site changes its copy, responses start
//! classifying as [`Outcome::MalformedResponse`], which is logged loudly.

use scraper::{Html, Selector};
use std::fmt;
use std::sync::LazyLock;

/// Present in the page rendered after a successful booking.
pub const SUCCESS_MARKER: &str = "<p>Felicitări!</p>";
/// Alert text when the applicant already holds a booking.
pub const ALREADY_REGISTERED_MARKER: &str = "Deja a fost înregistrată o programare";
/// Alert text when the date has no capacity left.
pub const NO_SLOTS_MARKER: &str = "NU mai este loc";

static ALERT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p.alert.alert-danger").expect("valid selector"));

/// Result of one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    /// The applicant already holds a booking. Terminal, not an error.
    AlreadyRegistered,
    /// No capacity left for the date. Ends the whole run.
    NoSlotsRemaining,
    TransientNetworkError,
    /// Retry with a freshly minted token.
    TransientCaptchaRejected,
    /// The page did not match any known shape.
    MalformedResponse,
}

impl Outcome {
    /// No further attempts are needed for the applicant.
    pub fn is_terminal(self) -> bool {
        matches!(self, Outcome::Success | Outcome::AlreadyRegistered)
    }

    /// The attempt may be retried in a later cycle.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Outcome::TransientNetworkError | Outcome::TransientCaptchaRejected | Outcome::MalformedResponse
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Success => "success",
            Outcome::AlreadyRegistered => "already-registered",
            Outcome::NoSlotsRemaining => "no-slots-remaining",
            Outcome::TransientNetworkError => "network-error",
            Outcome::TransientCaptchaRejected => "captcha-rejected",
            Outcome::MalformedResponse => "malformed-response",
        };
        f.write_str(name)
    }
}

/// Classified attempt plus the raw page, kept for audit artifacts.
#[derive(Debug, Clone)]
pub struct Submission {
    pub outcome: Outcome,
    pub body: Option<String>,
}

impl Submission {
    /// Classify a response body.
    pub fn from_body(body: String) -> Self {
        Submission {
            outcome: parse_outcome(&body),
            body: Some(body),
        }
    }

    /// An attempt that produced no page.
    pub fn bare(outcome: Outcome) -> Self {
        Submission { outcome, body: None }
    }
}

/// Classify a registration response page.
pub fn parse_outcome(body: &str) -> Outcome {
    if body.contains(SUCCESS_MARKER) {
        return Outcome::Success;
    }

    let Some(alert) = alert_text(body) else {
        return Outcome::MalformedResponse;
    };
    if alert.contains(ALREADY_REGISTERED_MARKER) {
        Outcome::AlreadyRegistered
    } else if alert.contains(NO_SLOTS_MARKER) {
        Outcome::NoSlotsRemaining
    } else if alert.to_lowercase().contains("captcha") {
        Outcome::TransientCaptchaRejected
    } else {
        Outcome::MalformedResponse
    }
}

/// Text of the first danger alert paragraph, if any.
pub fn alert_text(body: &str) -> Option<String> {
    let document = Html::parse_document(body);
    let text: String = document.select(&ALERT).next()?.text().collect();
    Some(text.trim().to_string())
}

/// Classify a transport failure.
pub fn classify_error(error: &reqwest::Error) -> Outcome {
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() || error.is_redirect() {
        Outcome::TransientNetworkError
    } else {
        Outcome::MalformedResponse
    }
}
