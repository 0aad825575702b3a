//! Wire-level types shared by server and client
//!
//! These structures travel over the control streams as RPC arguments and
//! replies. Field names are part of the wire contract: both endpoints must
//! agree on them, and the JSON names of [`TargetService`] are also what the
//! admin surface consumes.

use serde::{Deserialize, Serialize};

/// Protocol version exchanged during the handshake
pub const VERSION: &str = "1.0.0";

/// RPC method names
///
/// A method name identifies the remote handler; the two control streams
/// carry disjoint sets (`ServerRPCContext.*` on the forward stream,
/// `ClientRPC.*` on the reverse stream).
pub mod methods {
    /// Initial client registration, must be the first call on a session
    pub const HANDSHAKE: &str = "ServerRPCContext.Handshake";
    /// Whole-list replacement of the client's advertised services
    pub const SYNC_CONFIG: &str = "ServerRPCContext.SyncConfig";
    /// Liveness probe, no effect
    pub const HEARTBEAT: &str = "ServerRPCContext.Heartbeat";
    /// Server-initiated replacement of the client's local service list
    pub const PUSH_CONFIG: &str = "ClientRPC.PushConfig";
}

/// A service the client wants exposed through the server
///
/// `remote_port == 0` means "not yet assigned"; the server fills it in
/// during reconciliation and keeps it stable for a given `id` across
/// re-syncs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetService {
    /// Stable identifier, unique within one client's list
    pub id: String,
    /// Host the client dials on its own network
    pub local_ip: String,
    /// Port the client dials on its own network
    pub local_port: u16,
    /// Public port assigned on the server, 0 while unassigned
    #[serde(default)]
    pub remote_port: u16,
    /// Free-form description
    #[serde(default)]
    pub remark: String,
}

impl TargetService {
    /// The `host:port` the client dials when bridging a data stream
    #[must_use]
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }
}

/// Arguments for simple requests that only identify the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseArgs {
    pub client_id: String,
}

/// Reply shared by all control-plane operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl BaseReply {
    /// A successful reply with the given message
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Arguments for the initial handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeArgs {
    pub client_id: String,
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub remark: String,
}

/// Arguments for a client-initiated service sync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfigArgs {
    pub client_id: String,
    pub services: Vec<TargetService>,
}

/// Arguments for a server-initiated config push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfigArgs {
    pub services: Vec<TargetService>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_service_json_field_names() {
        let service = TargetService {
            id: "s1".into(),
            local_ip: "127.0.0.1".into(),
            local_port: 22,
            remote_port: 10000,
            remark: "ssh".into(),
        };

        let json = serde_json::to_value(&service).unwrap();
        assert_eq!(json["id"], "s1");
        assert_eq!(json["local_ip"], "127.0.0.1");
        assert_eq!(json["local_port"], 22);
        assert_eq!(json["remote_port"], 10000);
        assert_eq!(json["remark"], "ssh");
    }

    #[test]
    fn test_target_service_remote_port_defaults_to_zero() {
        let service: TargetService = serde_json::from_str(
            r#"{"id":"s1","local_ip":"10.0.0.5","local_port":8080}"#,
        )
        .unwrap();
        assert_eq!(service.remote_port, 0);
        assert!(service.remark.is_empty());
    }

    #[test]
    fn test_local_addr_format() {
        let service = TargetService {
            id: "s1".into(),
            local_ip: "192.168.1.10".into(),
            local_port: 3306,
            remote_port: 0,
            remark: String::new(),
        };
        assert_eq!(service.local_addr(), "192.168.1.10:3306");
    }

    #[test]
    fn test_version_string() {
        assert_eq!(VERSION, "1.0.0");
    }

    #[test]
    fn test_base_reply_ok() {
        let reply = BaseReply::ok("Welcome");
        assert!(reply.success);
        assert_eq!(reply.message, "Welcome");
    }
}
