//! Open-signal classification.
//!
//! Scans a fetched provider page for lexical open/closed signals. Ties always
//! favor `closed`: a false negative costs one more poll cycle, a false
//! positive triggers a paid registration attempt.

use std::time::Duration;

use aho_corasick::AhoCorasick;

use crate::plan::DetectionSignal;

/// Phrases that indicate registration is open.
pub const POSITIVE_SIGNALS: &[&str] = &[
    "register now",
    "registration open",
    "registration is open",
    "registration is now open",
    "sign up now",
    "sign-up now",
    "enroll now",
    "enrollment open",
    "add to cart",
];

/// Phrases that indicate registration is closed or exhausted.
pub const NEGATIVE_SIGNALS: &[&str] = &[
    "registration closed",
    "registration is closed",
    "closed for registration",
    "sold out",
    "sold-out",
    "waitlist only",
    "wait list only",
    "join the waitlist",
    "not yet open",
    "coming soon",
    "opens on",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Open,
    Closed,
}

/// Result of scanning one page body.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub verdict: Verdict,
    pub positive_hits: Vec<&'static str>,
    pub negative_hits: Vec<&'static str>,
}

/// Result of one full probe: fetch plus scan, or a fetch failure.
#[derive(Debug, Clone)]
pub struct Observation {
    pub signal: DetectionSignal,
    pub evidence: String,
}

pub struct SignalClassifier {
    client: reqwest::Client,
    positive: AhoCorasick,
    negative: AhoCorasick,
}

impl SignalClassifier {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            positive: keyword_set(POSITIVE_SIGNALS),
            negative: keyword_set(NEGATIVE_SIGNALS),
        })
    }

    /// Scan a page body. Verdict is `Open` iff at least one positive signal
    /// matches and no negative signal matches.
    pub fn scan(&self, body: &str) -> ScanResult {
        let positive_hits = hits(&self.positive, POSITIVE_SIGNALS, body);
        let negative_hits = hits(&self.negative, NEGATIVE_SIGNALS, body);

        let verdict = if !positive_hits.is_empty() && negative_hits.is_empty() {
            Verdict::Open
        } else {
            Verdict::Closed
        };

        ScanResult {
            verdict,
            positive_hits,
            negative_hits,
        }
    }

    /// Fetch the detection URL and classify the body.
    ///
    /// Never returns an error: fetch failures and provider 5xx become
    /// `DetectionSignal::Error` observations so the caller always has one
    /// entry to log per probe.
    pub async fn probe(&self, url: &str) -> Observation {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                return Observation {
                    signal: DetectionSignal::Error,
                    evidence: format!("fetch failed: {}", e),
                };
            }
        };

        let status = response.status();
        if status.is_server_error() {
            return Observation {
                signal: DetectionSignal::Error,
                evidence: format!("provider error: http {}", status.as_u16()),
            };
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Observation {
                    signal: DetectionSignal::Error,
                    evidence: format!("body read failed: {}", e),
                };
            }
        };

        let scan = self.scan(&body);
        let signal = match scan.verdict {
            Verdict::Open => DetectionSignal::OpenDetected,
            Verdict::Closed => DetectionSignal::ClosedDetected,
        };

        Observation {
            signal,
            evidence: format!(
                "http {}; positive=[{}] negative=[{}]",
                status.as_u16(),
                scan.positive_hits.join(", "),
                scan.negative_hits.join(", "),
            ),
        }
    }
}

fn keyword_set(patterns: &[&str]) -> AhoCorasick {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(patterns)
        .expect("keyword set compiles")
}

fn hits(ac: &AhoCorasick, patterns: &'static [&'static str], body: &str) -> Vec<&'static str> {
    let mut seen = Vec::new();
    for m in ac.find_iter(body) {
        let pattern = patterns[m.pattern().as_usize()];
        if !seen.contains(&pattern) {
            seen.push(pattern);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn classifier() -> SignalClassifier {
        SignalClassifier::new(Duration::from_secs(5)).expect("client builds")
    }

    #[test]
    fn positive_signal_alone_is_open() {
        let scan = classifier().scan("<h1>Summer Camp</h1><a>Register Now</a>");
        assert_eq!(scan.verdict, Verdict::Open);
        assert_eq!(scan.positive_hits, vec!["register now"]);
    }

    #[test]
    fn negative_overrides_positive() {
        let scan = classifier().scan("Register Now — oops, Registration Closed for 2026");
        assert_eq!(scan.verdict, Verdict::Closed);
        assert!(!scan.positive_hits.is_empty());
        assert!(!scan.negative_hits.is_empty());
    }

    #[test]
    fn no_signal_is_closed() {
        let scan = classifier().scan("Welcome to our camp. Dates TBD.");
        assert_eq!(scan.verdict, Verdict::Closed);
        assert!(scan.positive_hits.is_empty());
    }

    #[test]
    fn matching_is_case_insensitive() {
        let scan = classifier().scan("ENROLLMENT OPEN for cabin A");
        assert_eq!(scan.verdict, Verdict::Open);
    }

    #[tokio::test]
    async fn unreachable_host_probes_as_error() {
        let c = SignalClassifier::new(Duration::from_millis(200)).expect("client builds");
        let obs = c.probe("http://127.0.0.1:1/never").await;
        assert_eq!(obs.signal, DetectionSignal::Error);
        assert!(obs.evidence.contains("fetch failed"));
    }
}
