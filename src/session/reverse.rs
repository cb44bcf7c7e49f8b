use std::collections::HashMap;
use std::sync::Arc;

use super::socket::AdbSocket;

/// Receives sockets the device opens towards a registered reverse tunnel.
///
/// Called on the dispatcher loop, so implementations must not block; hand the
/// socket to a task or channel. Returning an error refuses the connection.
pub trait ReverseTunnelHandler: Send + Sync {
    fn accept(&self, socket: AdbSocket) -> anyhow::Result<()>;
}

impl<F> ReverseTunnelHandler for F
where
    F: Fn(AdbSocket) -> anyhow::Result<()> + Send + Sync,
{
    fn accept(&self, socket: AdbSocket) -> anyhow::Result<()> {
        self(socket)
    }
}

/// Address to handler mapping, owned by the dispatcher loop.
#[derive(Default)]
pub(crate) struct ReverseTunnelRegistry {
    handlers: HashMap<String, Arc<dyn ReverseTunnelHandler>>,
}

impl ReverseTunnelRegistry {
    /// Register `handler`, replacing any previous handler for `address`.
    pub fn add(&mut self, address: String, handler: Arc<dyn ReverseTunnelHandler>) {
        self.handlers.insert(address, handler);
    }

    pub fn remove(&mut self, address: &str) -> bool {
        self.handlers.remove(address).is_some()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn get(&self, address: &str) -> Option<Arc<dyn ReverseTunnelHandler>> {
        self.handlers.get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

/// A fresh `localabstract:reverse_<n>` address.
pub fn random_address() -> String {
    format!("localabstract:reverse_{}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_add_remove() {
        let mut registry = ReverseTunnelRegistry::default();
        let accept = |_socket: AdbSocket| -> anyhow::Result<()> { Ok(()) };
        registry.add("tcp:8080".into(), Arc::new(accept));
        registry.add("tcp:9090".into(), Arc::new(accept));
        assert_eq!(registry.len(), 2);
        assert!(registry.get("tcp:8080").is_some());

        assert!(registry.remove("tcp:8080"));
        assert!(!registry.remove("tcp:8080"));
        assert!(registry.get("tcp:8080").is_none());

        registry.clear();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_random_address_format() {
        let address = random_address();
        let suffix = address.strip_prefix("localabstract:reverse_").unwrap();
        assert!(suffix.parse::<u32>().is_ok());
    }
}
