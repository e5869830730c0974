use serde::{Deserialize, Serialize};

/// HTTP endpoint paths of the local node API.
pub mod endpoints {
    pub const HEALTH: &str = "/v1/health";
    pub const STATS: &str = "/v1/stats";
    pub const POST: &str = "/v1/posts/:id";
    pub const POST_BODY: &str = "/v1/posts/:id/body";
    pub const CONTENT: &str = "/v1/content/:cid";
    pub const SYNC: &str = "/v1/sync";
}

/// Health check response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub protocol_version: u32,
    pub node_id: String,
    pub connected_peers: usize,
}

impl HealthResponse {
    pub fn ok(node_id: impl Into<String>, connected_peers: usize) -> Self {
        Self {
            status: "ok".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            protocol_version: super::message::PROTOCOL_VERSION,
            node_id: node_id.into(),
            connected_peers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_fields() {
        let h = HealthResponse::ok("node-a", 2);
        assert_eq!(h.status, "ok");
        assert_eq!(h.protocol_version, 1);
        assert_eq!(h.connected_peers, 2);
    }

    #[test]
    fn endpoint_paths() {
        assert_eq!(endpoints::HEALTH, "/v1/health");
        assert_eq!(endpoints::POST_BODY, "/v1/posts/:id/body");
        assert_eq!(endpoints::SYNC, "/v1/sync");
    }
}
