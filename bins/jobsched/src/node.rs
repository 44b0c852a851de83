use uuid::Uuid;

/// Identity of this process within the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub instance_id: String,
    pub hostname: String,
    pub port: u16,
}

impl Node {
    /// Fresh process-unique identity.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self { instance_id: Uuid::new_v4().to_string(), hostname: hostname.into(), port }
    }

    /// `host:port`, as recorded in leases and on executions.
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// OS hostname, or `localhost` when it cannot be read.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
