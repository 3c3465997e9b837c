use tether_gateway::GatewayError;
use tether_rpc::RpcError;

/// Failures bringing up or talking to a replica.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ReplicaError {
    #[error("failed to spawn replica thread: {0}")]
    Spawn(String),

    /// The replica came up but its gateway would not start.
    #[error("replica handshake failed: {0}")]
    Handshake(String),

    #[error("replica returned a malformed response: {0}")]
    Malformed(String),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Failures selecting a registration for a request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("no live replica for service '{name}'")]
    NoLiveReplica { name: String },

    #[error("unknown server id '{id}'")]
    UnknownServer { id: String },
}
