//! HTTP client for the booking endpoint.

use crate::applicant::Applicant;
use crate::captcha::CaptchaTokenSupplier;
use crate::egress::{ClientCache, Egress};
use crate::middleware::ProxyPoolMiddleware;
use crate::outcome::{classify_error, Outcome, Submission};
use crate::pool::ProxyPool;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use log::{debug, error, warn};
use rand::seq::IndexedRandom;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
];

/// Cap on how much of an unrecognized page is logged.
const BODY_EXCERPT: usize = 400;

static SCRIPT: LazyLock<Selector> = LazyLock::new(|| Selector::parse("script").expect("valid selector"));
/// `case 4: var zile = [0, 6];` in the date picker setup.
static WEEKDAY_CASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"case\s*['"]?(\d+)['"]?\s*:\s*(?:var|let|const)?\s*[\w$]+\s*=\s*\[([^\]]*)\]"#)
        .expect("valid regex")
});

/// One submission or availability query against the booking endpoint.
///
/// Attempts never fail: every error is folded into an [`Outcome`].
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, applicant: &Applicant, date: NaiveDate, form_type: u32, egress: &Egress) -> Submission;

    /// Remaining slots for `date`, `None` when the count could not be read.
    async fn check_availability(&self, date: NaiveDate, form_type: u32, egress: &Egress) -> Option<u32>;

    /// URL the submissions go to, used to rank proxies for it.
    fn target_url(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct RemainingSlots {
    numar_ramase: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ClosedDays {
    #[serde(default)]
    data: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationsPage {
    #[serde(default)]
    data: Vec<RegistrationRow>,
}

#[derive(Debug, Deserialize)]
struct RegistrationRow {
    #[serde(default)]
    nume_pasaport: String,
    #[serde(default)]
    prenume_pasaport: String,
}

/// [`Submitter`] speaking the booking site's form protocol.
pub struct SubmissionClient {
    base_url: String,
    submit_url: String,
    tokens: Arc<CaptchaTokenSupplier>,
    pool: Option<Arc<ProxyPool>>,
    clients: ClientCache,
    lookup: ClientWithMiddleware,
}

impl SubmissionClient {
    /// Create a client. With a pool, attempts report back to it and the
    /// registrations lookup is routed through [`ProxyPoolMiddleware`].
    pub fn new(
        base_url: &str,
        tokens: Arc<CaptchaTokenSupplier>,
        pool: Option<Arc<ProxyPool>>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let clients = ClientCache::new(timeout)?;

        let inner = reqwest::Client::builder().timeout(timeout).build()?;
        let lookup = match &pool {
            Some(pool) => ClientBuilder::new(inner)
                .with(ProxyPoolMiddleware::with_pool(Arc::clone(pool))?)
                .build(),
            None => ClientBuilder::new(inner).build(),
        };

        Ok(Self {
            submit_url: format!("{}/programare_online", base_url),
            base_url,
            tokens,
            pool,
            clients,
            lookup,
        })
    }

    pub fn submit_url(&self) -> &str {
        &self.submit_url
    }

    fn headers(&self, referer_path: &str, ajax: bool) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(agent) = USER_AGENTS.choose(&mut rand::rng()) {
            headers.insert(USER_AGENT, HeaderValue::from_static(*agent));
        }
        if let Ok(origin) = HeaderValue::from_str(&self.base_url) {
            headers.insert(ORIGIN, origin);
        }
        if let Ok(referer) = HeaderValue::from_str(&format!("{}/{}", self.base_url, referer_path)) {
            headers.insert(REFERER, referer);
        }
        if ajax {
            headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        }
        headers
    }

    fn feedback(&self, egress: &Egress, success: bool, latency: Option<Duration>) {
        if let (Some(pool), Some(url)) = (&self.pool, egress.proxy_url()) {
            pool.report_for_target(url, &self.submit_url, success, latency);
        }
    }

    /// Names (`SURNAME`, `GIVEN`) already holding a booking between `from`
    /// and `to`, according to the site's public registrations list.
    pub async fn registered_names(
        &self,
        form_type: u32,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<HashSet<(String, String)>, reqwest_middleware::Error> {
        let url = format!("{}/verificare_programare?ajax=true", self.base_url);
        let window = format!("{} AND {}", from.format("%Y-%m-%d"), to.format("%Y-%m-%d"));
        let form = registrations_query(form_type, &window, 5000);

        let response = self
            .lookup
            .post(&url)
            .headers(self.headers("verificare_programare", true))
            .form(&form)
            .send()
            .await?;
        let page: RegistrationsPage = response.json().await?;

        Ok(page
            .data
            .into_iter()
            .map(|row| {
                (
                    row.nume_pasaport.trim().to_uppercase(),
                    row.prenume_pasaport.trim().to_uppercase(),
                )
            })
            .collect())
    }

    /// Days of `year`-`month` the date picker offers for `form_type`: not on
    /// a weekday the form never opens, and not closed by the site.
    pub async fn open_days(
        &self,
        year: i32,
        month: u32,
        form_type: u32,
    ) -> Result<Vec<NaiveDate>, reqwest_middleware::Error> {
        let page = self
            .lookup
            .get(format!("{}/", self.base_url))
            .headers(self.headers("", false))
            .send()
            .await?
            .text()
            .await?;
        let weekdays = disabled_weekdays(&page).remove(&form_type).unwrap_or_else(|| {
            warn!("No weekday rules for form {} on the main page", form_type);
            HashSet::new()
        });

        let form = vec![
            ("azi", format!("{}-{:02}", year, month)),
            ("tip_formular", form_type.to_string()),
        ];
        let closed: ClosedDays = self
            .lookup
            .post(format!("{}/status_zile", self.base_url))
            .headers(self.headers("programare_online", true))
            .form(&form)
            .send()
            .await?
            .json()
            .await?;
        let closed: HashSet<NaiveDate> = closed
            .data
            .iter()
            .filter_map(|day| NaiveDate::parse_from_str(day.trim(), "%Y-%m-%d").ok())
            .collect();

        Ok(month_days(year, month)
            .filter(|day| !weekdays.contains(&day.weekday().num_days_from_sunday()))
            .filter(|day| !closed.contains(day))
            .collect())
    }
}

/// Weekdays (0 = Sunday) each form type never opens on, read from the
/// `switch` over form types in the main page's scripts.
fn disabled_weekdays(html: &str) -> HashMap<u32, HashSet<u32>> {
    let document = Html::parse_document(html);
    let mut rules = HashMap::new();
    for script in document.select(&SCRIPT) {
        let text: String = script.text().collect();
        for caps in WEEKDAY_CASE.captures_iter(&text) {
            let Ok(form_type) = caps[1].parse() else {
                continue;
            };
            let days = caps[2]
                .split(',')
                .filter_map(|d| d.trim().trim_matches(|c: char| c == '"' || c == '\'').parse().ok())
                .collect();
            rules.entry(form_type).or_insert(days);
        }
    }
    rules
}

fn month_days(year: i32, month: u32) -> impl Iterator<Item = NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1);
    first
        .into_iter()
        .flat_map(|first| first.iter_days())
        .take_while(move |day| day.month() == month)
}

/// DataTables request body of the registrations list.
fn registrations_query(form_type: u32, window: &str, limit: usize) -> Vec<(String, String)> {
    let columns: [(&str, String); 8] = [
        ("tip_formular", form_type.to_string()),
        ("email", String::new()),
        ("nume_pasaport", String::new()),
        ("prenume_pasaport", String::new()),
        ("data_nasterii", String::new()),
        ("data_programarii", window.to_string()),
        ("ora_programarii", String::new()),
        ("numar_pasaport", String::new()),
    ];

    let mut form = vec![("draw".to_string(), "1".to_string())];
    for (i, (name, search)) in columns.into_iter().enumerate() {
        form.push((format!("columns[{}][data]", i), name.to_string()));
        form.push((format!("columns[{}][name]", i), String::new()));
        form.push((format!("columns[{}][searchable]", i), "true".to_string()));
        form.push((format!("columns[{}][orderable]", i), "false".to_string()));
        form.push((format!("columns[{}][search][value]", i), search));
        form.push((format!("columns[{}][search][regex]", i), "false".to_string()));
    }
    form.push(("start".to_string(), "0".to_string()));
    form.push(("length".to_string(), limit.to_string()));
    form.push(("search[value]".to_string(), String::new()));
    form.push(("search[regex]".to_string(), "false".to_string()));
    form
}

/// `numar_ramase` arrives either as a number or as a numeric string.
fn remaining_slots(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(BODY_EXCERPT) {
        Some((end, _)) => &body[..end],
        None => body,
    }
}

#[async_trait]
impl Submitter for SubmissionClient {
    async fn submit(&self, applicant: &Applicant, date: NaiveDate, form_type: u32, egress: &Egress) -> Submission {
        let token = match self.tokens.take_or_mint().await {
            Ok(token) => token,
            Err(e) => {
                warn!("No captcha token for {}: {}", applicant.display_name(), e);
                return Submission::bare(Outcome::TransientCaptchaRejected);
            }
        };

        egress.until_ready().await;
        let client = match self.clients.client_for(egress) {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to build client for {}: {}", egress, e);
                self.feedback(egress, false, None);
                return Submission::bare(Outcome::TransientNetworkError);
            }
        };

        let start = Instant::now();
        let result = client
            .post(&self.submit_url)
            .headers(self.headers("programare_online", false))
            .form(&applicant.form_fields(date, form_type, &token.value))
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!("Submission for {} via {} failed: {}", applicant.display_name(), egress, e);
                self.feedback(egress, false, None);
                return Submission::bare(classify_error(&e));
            }
        };

        let status = response.status();
        match response.text().await {
            Ok(body) => {
                self.feedback(egress, status.is_success(), Some(start.elapsed()));
                let submission = Submission::from_body(body);
                if submission.outcome == Outcome::MalformedResponse {
                    error!(
                        "Unrecognized registration page for {} via {} (HTTP {}): {}",
                        applicant.display_name(),
                        egress,
                        status,
                        submission.body.as_deref().map(excerpt).unwrap_or_default()
                    );
                }
                submission
            }
            Err(e) => {
                self.feedback(egress, false, None);
                Submission::bare(classify_error(&e))
            }
        }
    }

    async fn check_availability(&self, date: NaiveDate, form_type: u32, egress: &Egress) -> Option<u32> {
        let client = self.clients.client_for(egress).ok()?;
        let form = vec![
            ("azi", date.format("%Y-%m-%d").to_string()),
            ("tip_formular", form_type.to_string()),
        ];

        let result = client
            .post(format!("{}/status_zii", self.base_url))
            .headers(self.headers("programare_online", true))
            .form(&form)
            .send()
            .await;
        let slots = match result {
            Ok(response) => response.json::<RemainingSlots>().await,
            Err(e) => Err(e),
        };

        match slots {
            Ok(slots) => remaining_slots(&slots.numar_ramase),
            Err(e) => {
                debug!("Availability check via {} failed: {}", egress, e);
                None
            }
        }
    }

    fn target_url(&self) -> Option<&str> {
        Some(&self.submit_url)
    }
}
