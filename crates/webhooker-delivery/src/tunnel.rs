//! Failure policy for ephemeral tunnel endpoints.
//!
//! Developers point subscribers at short-lived tunnels (ngrok and similar)
//! that disappear when the laptop closes. Once a tunnel is gone its
//! subscriber should stop receiving traffic instead of burning through the
//! retry budget, so non-2xx responses from tunnel URLs are classified
//! separately from ordinary endpoint failures.

use std::fmt;

use regex::Regex;

use crate::{
    error::{DeliveryError, Result},
    outcome::TerminalReason,
};

/// Host suffix of the default tunnel provider.
pub const NGROK_SUFFIX: &str = "ngrok.io";

/// What the worker should do after a non-2xx response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Leave the subscriber alone and ask the queue to try again.
    Retry,
    /// Disable the subscriber and stop.
    Disable(TerminalReason),
}

/// Recognizes ephemeral tunnel endpoints and their "tunnel is gone" replies.
pub trait TunnelDetector: Send + Sync + fmt::Debug {
    /// Returns true when `url` points at a tunnel service.
    fn is_tunnel(&self, url: &str) -> bool;

    /// Returns true when a 404 body is the tunnel service's own
    /// "tunnel not found" page rather than the subscriber's.
    fn is_tunnel_not_found(&self, body: &str) -> bool;

    /// Classifies a non-2xx response from `url`.
    fn failure_action(&self, url: &str, status: u16, body: &str) -> FailureAction {
        if !self.is_tunnel(url) {
            return FailureAction::Retry;
        }

        match status {
            404 if self.is_tunnel_not_found(body) => {
                FailureAction::Disable(TerminalReason::TunnelNotFound)
            },
            504 => FailureAction::Disable(TerminalReason::TunnelGatewayTimeout),
            _ => FailureAction::Retry,
        }
    }
}

/// Detects tunnels by host suffix.
#[derive(Debug, Clone)]
pub struct HostSuffixTunnelDetector {
    suffixes: Vec<String>,
    not_found: Regex,
}

impl HostSuffixTunnelDetector {
    /// Builds a detector for the given host suffixes, e.g. `ngrok.io`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if no usable suffix is given.
    pub fn new<I, S>(suffixes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let suffixes: Vec<String> = suffixes
            .into_iter()
            .map(|s| s.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        if suffixes.is_empty() {
            return Err(DeliveryError::configuration("at least one tunnel host suffix is required"));
        }

        let alternatives =
            suffixes.iter().map(|s| regex::escape(s)).collect::<Vec<_>>().join("|");
        let not_found = Regex::new(&format!(r"(?i)tunnel .+?\.(?:{alternatives}) not found"))
            .map_err(|e| DeliveryError::configuration(format!("invalid tunnel suffix: {e}")))?;

        Ok(Self { suffixes, not_found })
    }

    /// Detector for ngrok tunnels only.
    ///
    /// # Errors
    ///
    /// See [`HostSuffixTunnelDetector::new`].
    pub fn ngrok() -> Result<Self> {
        Self::new([NGROK_SUFFIX])
    }

    /// Returns the configured suffixes, lowercased.
    pub fn suffixes(&self) -> &[String] {
        &self.suffixes
    }
}

impl TunnelDetector for HostSuffixTunnelDetector {
    fn is_tunnel(&self, url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();

        self.suffixes.iter().any(|suffix| {
            host.strip_suffix(suffix.as_str()).is_some_and(|rest| rest.ends_with('.'))
        })
    }

    fn is_tunnel_not_found(&self, body: &str) -> bool {
        self.not_found.is_match(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TUNNEL_URL: &str = "https://ab12cd34.ngrok.io/hooks";
    const GONE_BODY: &str = "Tunnel ab12cd34.ngrok.io not found";

    #[test]
    fn recognizes_tunnel_hosts_case_insensitively() {
        let detector = HostSuffixTunnelDetector::ngrok().unwrap();
        assert!(detector.is_tunnel(TUNNEL_URL));
        assert!(detector.is_tunnel("http://AB12.NGROK.IO/x"));
        assert!(!detector.is_tunnel("https://hooks.example.com/ngrok.io"));
        assert!(!detector.is_tunnel("https://notngrok.io/hooks"));
        assert!(!detector.is_tunnel("not a url"));
    }

    #[test]
    fn ordinary_urls_always_retry() {
        let detector = HostSuffixTunnelDetector::ngrok().unwrap();
        for status in [404, 500, 502, 504] {
            assert_eq!(
                detector.failure_action("https://hooks.example.com/in", status, GONE_BODY),
                FailureAction::Retry
            );
        }
    }

    #[test]
    fn tunnel_statuses_follow_policy() {
        let detector = HostSuffixTunnelDetector::ngrok().unwrap();
        assert_eq!(
            detector.failure_action(TUNNEL_URL, 404, GONE_BODY),
            FailureAction::Disable(TerminalReason::TunnelNotFound)
        );
        assert_eq!(detector.failure_action(TUNNEL_URL, 404, "no such route"), FailureAction::Retry);
        assert_eq!(detector.failure_action(TUNNEL_URL, 502, ""), FailureAction::Retry);
        assert_eq!(
            detector.failure_action(TUNNEL_URL, 504, ""),
            FailureAction::Disable(TerminalReason::TunnelGatewayTimeout)
        );
        assert_eq!(detector.failure_action(TUNNEL_URL, 500, ""), FailureAction::Retry);
    }

    #[test]
    fn custom_suffixes_extend_detection() {
        let detector = HostSuffixTunnelDetector::new(["ngrok.io", ".loca.lt"]).unwrap();
        assert_eq!(detector.suffixes(), ["ngrok.io", "loca.lt"]);
        assert!(detector.is_tunnel("https://quiet-fox.loca.lt/hook"));
        assert!(detector.is_tunnel_not_found("tunnel quiet-fox.loca.lt not found"));
        assert!(!detector.is_tunnel_not_found("tunnel quiet-fox.example.com not found"));
    }

    #[test]
    fn empty_suffix_list_rejected() {
        assert!(HostSuffixTunnelDetector::new(Vec::<String>::new()).is_err());
        assert!(HostSuffixTunnelDetector::new(["  "]).is_err());
    }
}
