//! The MTA-STS resolver: domain name in, `(FetchStatus, policy)` out
//! (spec.md §4.3).
//!
//! Grounded in `examples/original_source/postfix_mta_sts_resolver/resolver.py`:
//! the same nine-step state machine (sanitize → TXT query → record
//! selection/parse → change detection → HTTPS fetch → policy parse/validate),
//! ported from `aiodns`/`aiohttp` onto `domain`'s stub resolver and `reqwest`.

use std::str::FromStr;
use std::time::Duration;

use domain::base::Name;
use domain::resolv::lookup::txt::lookup_txt;
use domain::resolv::stub::conf::ResolvConf;
use domain::resolv::StubResolver;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

/// `mta-sts-daemon` identifies itself on policy fetches (spec.md §6).
pub const USER_AGENT: &str = concat!("mta-sts-daemon/", env!("CARGO_PKG_VERSION"));

/// Hard ceiling on a fetched policy body, enforced against both the
/// declared `Content-Length` and the actual bytes read.
const HARD_RESP_LIMIT: usize = 64 * 1024;
const MAX_MAX_AGE: i64 = 31_557_600;

/// A validated MTA-STS policy (spec.md §3 `PolicyBody`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyBody {
    pub mode: PolicyMode,
    pub max_age: i64,
    pub mx: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    None,
    Testing,
    Enforce,
}

impl FromStr for PolicyMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(PolicyMode::None),
            "testing" => Ok(PolicyMode::Testing),
            "enforce" => Ok(PolicyMode::Enforce),
            _ => Err(()),
        }
    }
}

/// Closed set of outcomes from [`STSResolver::resolve`] (spec.md §3
/// `FetchStatus`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchStatus {
    /// No policy exists for this domain.
    None,
    /// A policy was retrieved and parsed.
    Valid,
    /// The TXT record's `id` matches the caller-supplied known id.
    NotChanged,
    /// A transient or malformed-policy failure.
    FetchError,
}

/// Outcome of a resolve: the policy id and body are present only for
/// [`FetchStatus::Valid`].
pub type ResolveResult = (FetchStatus, Option<(String, PolicyBody)>);

/// Stateless per-zone DNS+HTTPS resolver. Holds a DNS stub client and an
/// HTTPS client, both bounded by the zone's configured timeout.
pub struct STSResolver {
    resolver: StubResolver,
    http: reqwest::Client,
    timeout: Duration,
}

impl STSResolver {
    pub fn new(timeout_secs: f64) -> Result<Self, String> {
        let timeout = Duration::from_secs_f64(timeout_secs.max(0.001));

        let mut conf = ResolvConf::default();
        conf.options.timeout = timeout;
        conf.options.attempts = 1;
        let resolver = StubResolver::from_conf(conf);

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| format!("could not build HTTPS client: {err}"))?;

        Ok(Self {
            resolver,
            http,
            timeout,
        })
    }

    /// Step through the full resolve state machine for `domain`.
    pub async fn resolve(&self, domain: &str, last_known_id: Option<&str>) -> ResolveResult {
        if domain.starts_with('.') {
            return (FetchStatus::None, None);
        }
        let domain = domain.trim_end_matches('.');
        if domain.is_empty() {
            return (FetchStatus::None, None);
        }

        let sts_name = match Name::<Vec<u8>>::from_str(&format!("_mta-sts.{domain}.")) {
            Ok(name) => name,
            Err(_) => return (FetchStatus::None, None),
        };

        let txt = match tokio::time::timeout(self.timeout, lookup_txt(&self.resolver, sts_name)).await
        {
            Err(_) => return (FetchStatus::FetchError, None),
            Ok(Err(_)) => return (FetchStatus::None, None),
            Ok(Ok(found)) => found,
        };

        let mut candidates: Vec<String> = Vec::new();
        for record in txt.iter() {
            let mut text = Vec::new();
            for chunk in record.iter_charstrs() {
                text.extend_from_slice(chunk.as_slice());
            }
            if text.is_ascii() {
                if let Ok(s) = String::from_utf8(text) {
                    if s.starts_with("v=STSv1") {
                        candidates.push(s);
                    }
                }
            }
        }

        if candidates.len() != 1 {
            return (FetchStatus::None, None);
        }

        let fields = parse_mta_sts_record(&candidates[0]);
        let Some(id) = fields.get("id") else {
            return (FetchStatus::None, None);
        };
        if fields.get("v").map(String::as_str) != Some("STSv1") {
            return (FetchStatus::None, None);
        }

        if last_known_id == Some(id.as_str()) {
            return (FetchStatus::NotChanged, None);
        }

        let url = format!("https://mta-sts.{domain}/.well-known/mta-sts.txt");
        match self.fetch_policy(&url).await {
            Some(body) => (FetchStatus::Valid, Some((id.clone(), body))),
            None => (FetchStatus::FetchError, None),
        }
    }

    async fn fetch_policy(&self, url: &str) -> Option<PolicyBody> {
        let resp = self.http.get(url).send().await.ok()?;
        if resp.status() != reqwest::StatusCode::OK {
            return None;
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !is_plaintext(content_type) {
            return None;
        }

        if let Some(len) = resp.content_length() {
            if len as usize > HARD_RESP_LIMIT {
                return None;
            }
        }

        let charset = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').nth(1))
            .and_then(|param| param.trim().strip_prefix("charset="))
            .map(str::to_ascii_lowercase);

        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.ok()?;
            body.extend_from_slice(&chunk);
            if body.len() > HARD_RESP_LIMIT {
                return None;
            }
        }

        let text = decode_body(&body, charset.as_deref())?;

        let raw = parse_mta_sts_policy(&text);
        validate_policy(raw)
    }
}

/// Split `"v=STSv1; id=...;"` on `;`, then each segment on the first `=`.
fn parse_mta_sts_record(record: &str) -> std::collections::HashMap<String, String> {
    record
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|field| {
            let (key, value) = field.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

struct RawPolicy {
    version: Option<String>,
    mode: Option<String>,
    max_age: Option<String>,
    mx: Vec<String>,
}

/// Line-oriented `key: value` parse; `mx:` lines accumulate, others are
/// single-valued with last-occurrence-wins.
fn parse_mta_sts_policy(text: &str) -> RawPolicy {
    let mut version = None;
    let mut mode = None;
    let mut max_age = None;
    let mut mx = Vec::new();

    for line in text.lines() {
        let line = line.trim_end();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim_start().to_string();
        match key {
            "mx" => mx.push(value),
            "version" => version = Some(value),
            "mode" => mode = Some(value),
            "max_age" => max_age = Some(value),
            _ => {}
        }
    }

    RawPolicy {
        version,
        mode,
        max_age,
        mx,
    }
}

fn validate_policy(raw: RawPolicy) -> Option<PolicyBody> {
    if raw.version.as_deref() != Some("STSv1") {
        return None;
    }
    let max_age: i64 = raw.max_age?.parse().ok()?;
    if !(0..=MAX_MAX_AGE).contains(&max_age) {
        return None;
    }
    let mode: PolicyMode = raw.mode?.parse().ok()?;
    if mode != PolicyMode::None && raw.mx.is_empty() {
        return None;
    }
    Some(PolicyBody {
        mode,
        max_age,
        mx: raw.mx,
    })
}

/// Decode `body` per the declared charset, mirroring the original's
/// `.decode(charset)` inside a broad `except Exception` (`resolver.py`):
/// any decode failure, including an unrecognized charset, is `None`
/// (propagated by the caller as `FETCH_ERROR`), never a lossy recovery.
fn decode_body(body: &[u8], charset: Option<&str>) -> Option<String> {
    match charset {
        None | Some("ascii") | Some("us-ascii") => {
            body.is_ascii().then(|| String::from_utf8_lossy(body).into_owned())
        }
        Some("utf-8") | Some("utf8") => String::from_utf8(body.to_vec()).ok(),
        Some("iso-8859-1") | Some("latin-1") | Some("latin1") => {
            Some(body.iter().map(|&b| b as char).collect())
        }
        _ => None,
    }
}

fn is_plaintext(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .eq_ignore_ascii_case("text/plain")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_txt_record_fields() {
        let fields = parse_mta_sts_record("v=STSv1; id=20180907T090909;");
        assert_eq!(fields.get("v").map(String::as_str), Some("STSv1"));
        assert_eq!(fields.get("id").map(String::as_str), Some("20180907T090909"));
    }

    #[test]
    fn parses_and_validates_enforce_policy() {
        let raw = parse_mta_sts_policy(
            "version: STSv1\nmode: enforce\nmax_age: 86400\nmx: mail.loc\nmx: *.mail.loc\n",
        );
        let body = validate_policy(raw).unwrap();
        assert_eq!(body.mode, PolicyMode::Enforce);
        assert_eq!(body.max_age, 86400);
        assert_eq!(body.mx, vec!["mail.loc".to_string(), "*.mail.loc".to_string()]);
    }

    #[test]
    fn none_mode_allows_empty_mx() {
        let raw = parse_mta_sts_policy("version: STSv1\nmode: none\nmax_age: 86400\n");
        let body = validate_policy(raw).unwrap();
        assert_eq!(body.mode, PolicyMode::None);
        assert!(body.mx.is_empty());
    }

    #[test]
    fn enforce_mode_requires_mx() {
        let raw = parse_mta_sts_policy("version: STSv1\nmode: enforce\nmax_age: 86400\n");
        assert!(validate_policy(raw).is_none());
    }

    #[test]
    fn max_age_out_of_range_rejected() {
        let raw = parse_mta_sts_policy("version: STSv1\nmode: none\nmax_age: 99999999999\n");
        assert!(validate_policy(raw).is_none());
    }

    #[test]
    fn content_type_plaintext_ignores_parameters() {
        assert!(is_plaintext("text/plain; charset=utf-8"));
        assert!(!is_plaintext("text/html"));
    }

    #[test]
    fn decode_body_rejects_non_ascii_when_charset_is_ascii_or_absent() {
        let body = b"version: STSv1\xE2\x98\x83\n";
        assert!(decode_body(body, None).is_none());
        assert!(decode_body(body, Some("ascii")).is_none());
    }

    #[test]
    fn decode_body_accepts_ascii_as_ascii_or_absent() {
        let body = b"version: STSv1\n";
        assert_eq!(decode_body(body, None).as_deref(), Some("version: STSv1\n"));
        assert_eq!(
            decode_body(body, Some("ascii")).as_deref(),
            Some("version: STSv1\n")
        );
    }

    #[test]
    fn decode_body_rejects_invalid_utf8_when_declared_utf8() {
        let body = b"version: STSv1\xFF\n";
        assert!(decode_body(body, Some("utf-8")).is_none());
    }

    #[test]
    fn decode_body_rejects_unknown_charset() {
        assert!(decode_body(b"version: STSv1\n", Some("windows-1252")).is_none());
    }
}
