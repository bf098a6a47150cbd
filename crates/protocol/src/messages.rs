use serde::{Deserialize, Serialize};

/// Signaling messages exchanged between broadcaster, viewers and the broker.
///
/// The wire tag is kebab-case (`"viewer-ready"`, `"ice-candidate"`, ...) so
/// every variant carries its own `rename` rather than a blanket case
/// conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalingMessage {
    #[serde(rename = "register")]
    Register { stream_id: String, role: Role },

    #[serde(rename = "registered")]
    Registered { stream_id: String },

    #[serde(rename = "join")]
    Join { stream_id: String },

    #[serde(rename = "joined")]
    Joined { viewer_id: String, stream_id: String },

    #[serde(rename = "viewer-ready")]
    ViewerReady {},

    #[serde(rename = "viewer-joined")]
    ViewerJoined { viewer_id: String },

    #[serde(rename = "viewer-left")]
    ViewerLeft { viewer_id: String },

    #[serde(rename = "broadcaster-left")]
    BroadcasterLeft {},

    #[serde(rename = "offer")]
    Offer {
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        sdp: String,
    },

    #[serde(rename = "answer")]
    Answer {
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        sdp: String,
    },

    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        candidate: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: u16,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Broadcaster,
}

impl SignalingMessage {
    /// Fill in `sdpMid`/`sdpMLineIndex` defaults the way a lenient client does:
    /// a missing `sdpMid` becomes the string form of the m-line index.
    pub fn ice_candidate(
        to: Option<String>,
        from: Option<String>,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Self {
        let sdp_mline_index = sdp_mline_index.unwrap_or(0);
        let sdp_mid = sdp_mid.or_else(|| Some(sdp_mline_index.to_string()));
        SignalingMessage::IceCandidate {
            to,
            from,
            candidate,
            sdp_mid,
            sdp_mline_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_tag_is_kebab_case() {
        let msg = SignalingMessage::Register {
            stream_id: "s1".to_string(),
            role: Role::Broadcaster,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"register""#));
        assert!(json.contains(r#""role":"broadcaster""#));
    }

    #[test]
    fn registered_roundtrip() {
        let msg = SignalingMessage::Registered {
            stream_id: "s1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"registered""#));
        assert!(json.contains(r#""streamId":"s1""#));
    }

    #[test]
    fn joined_has_viewer_and_stream_id() {
        let msg = SignalingMessage::Joined {
            viewer_id: "viewer-1".to_string(),
            stream_id: "s1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"joined""#));
    }

    #[test]
    fn viewer_ready_has_no_extra_fields() {
        let msg = SignalingMessage::ViewerReady {};
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"viewer-ready"}"#);
    }

    #[test]
    fn viewer_joined_tag_is_kebab_case() {
        let msg = SignalingMessage::ViewerJoined {
            viewer_id: "viewer-1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"viewer-joined""#));
        assert!(!json.contains("viewer_joined"));
    }

    #[test]
    fn ice_candidate_tag_is_kebab_case_not_snake_case() {
        let msg = SignalingMessage::ice_candidate(
            Some("viewer-1".to_string()),
            None,
            "candidate:1 1 UDP 2130706431 192.168.1.1 50000 typ host".to_string(),
            None,
            Some(0),
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"ice-candidate""#));
        assert!(!json.contains("ice_candidate"));
    }

    #[test]
    fn ice_candidate_defaults_sdp_mid_from_mline_index() {
        let msg = SignalingMessage::ice_candidate(
            None,
            Some("s1".to_string()),
            "candidate:1 1 UDP 2130706431 192.168.1.1 50000 typ host".to_string(),
            None,
            Some(2),
        );
        match msg {
            SignalingMessage::IceCandidate {
                sdp_mid,
                sdp_mline_index,
                ..
            } => {
                assert_eq!(sdp_mline_index, 2);
                assert_eq!(sdp_mid.as_deref(), Some("2"));
            }
            _ => panic!("expected IceCandidate"),
        }
    }

    #[test]
    fn ice_candidate_defaults_mline_index_to_zero() {
        let msg = SignalingMessage::ice_candidate(
            None,
            Some("s1".to_string()),
            "candidate:1 1 UDP 2130706431 192.168.1.1 50000 typ host".to_string(),
            Some("audio".to_string()),
            None,
        );
        match msg {
            SignalingMessage::IceCandidate {
                sdp_mline_index,
                sdp_mid,
                ..
            } => {
                assert_eq!(sdp_mline_index, 0);
                assert_eq!(sdp_mid.as_deref(), Some("audio"));
            }
            _ => panic!("expected IceCandidate"),
        }
    }

    #[test]
    fn error_message_roundtrip() {
        let msg = SignalingMessage::Error {
            message: "Stream not found: missing".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains("Stream not found: missing"));
    }

    #[test]
    fn parse_join_from_viewer() {
        let raw = r#"{"type":"join","streamId":"s1"}"#;
        let msg: SignalingMessage = serde_json::from_str(raw).unwrap();
        match msg {
            SignalingMessage::Join { stream_id } => assert_eq!(stream_id, "s1"),
            _ => panic!("expected Join"),
        }
    }

    #[test]
    fn parse_offer_from_broadcaster() {
        let raw = r#"{"type":"offer","to":"viewer-2","sdp":"v=0..."}"#;
        let msg: SignalingMessage = serde_json::from_str(raw).unwrap();
        match msg {
            SignalingMessage::Offer { to, sdp, .. } => {
                assert_eq!(to.as_deref(), Some("viewer-2"));
                assert_eq!(sdp, "v=0...");
            }
            _ => panic!("expected Offer"),
        }
    }
}
