use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

/// Kind of discovery server used for NAT traversal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Stun,
    Turn,
}

/// One ICE server entry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IceServerConfig {
    pub kind: ServerKind,
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            kind: ServerKind::Stun,
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            kind: ServerKind::Turn,
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Prefixes the URL with `stun:`/`turn:` when the scheme is missing.
    pub fn url_with_scheme(&self) -> String {
        if self.url.starts_with("stun:") || self.url.starts_with("turn:") {
            return self.url.clone();
        }
        let scheme = match self.kind {
            ServerKind::Stun => "stun:",
            ServerKind::Turn => "turn:",
        };
        format!("{}{}", scheme, self.url)
    }

    fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: vec![self.url_with_scheme()],
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Tunables of the orchestrator. The defaults match the running system:
/// Google STUN, a 2 s discovery beacon and a 500 ms follow-up after bind.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Period of the self-announcement broadcast.
    pub discovery_interval: Duration,
    /// Delay of the one-shot follow-up announcement after bind.
    pub discovery_follow_up: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
                IceServerConfig::stun("stun:stun1.l.google.com:19302"),
            ],
            discovery_interval: Duration::from_secs(2),
            discovery_follow_up: Duration::from_millis(500),
        }
    }
}

impl OrchestratorConfig {
    pub(crate) fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(IceServerConfig::to_rtc)
                .collect(),
            ice_candidate_pool_size: 10,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_is_added_when_missing() {
        let server = IceServerConfig::stun("stun.example.org:3478");
        assert_eq!(server.url_with_scheme(), "stun:stun.example.org:3478");

        let server = IceServerConfig::turn("turn.example.org:3478", "u", "p");
        assert_eq!(server.url_with_scheme(), "turn:turn.example.org:3478");
    }

    #[test]
    fn scheme_is_kept_when_present() {
        let server = IceServerConfig::stun("stun:stun.example.org");
        assert_eq!(server.url_with_scheme(), "stun:stun.example.org");
    }

    #[test]
    fn default_config_builds_rtc_configuration() {
        let rtc = OrchestratorConfig::default().rtc_config();
        assert_eq!(rtc.ice_servers.len(), 2);
        assert_eq!(rtc.ice_candidate_pool_size, 10);
    }

    #[test]
    fn server_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ServerKind::Turn).unwrap();
        assert_eq!(json, "\"turn\"");
    }
}
