use std::collections::HashMap;
use std::sync::Arc;

use fm_core::types::Tier;

use crate::backend::WorkerBackend;

// ---------------------------------------------------------------------------
// BackendRegistry
// ---------------------------------------------------------------------------

/// Maps tiers to registered worker backends by name.
#[derive(Default)]
pub struct BackendRegistry {
    by_name: HashMap<String, Arc<dyn WorkerBackend>>,
    by_tier: HashMap<Tier, String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn WorkerBackend>) {
        self.by_name.insert(backend.name().to_string(), backend);
    }

    /// Route a tier to a backend name; dispatches for that tier use it.
    pub fn route(&mut self, tier: Tier, backend_name: impl Into<String>) {
        self.by_tier.insert(tier, backend_name.into());
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkerBackend>> {
        self.by_name.get(name).cloned()
    }

    /// Backend for a tier, falling back to any registered backend when the
    /// tier has no explicit route.
    pub fn for_tier(&self, tier: Tier) -> Option<Arc<dyn WorkerBackend>> {
        if let Some(name) = self.by_tier.get(&tier) {
            return self.get(name);
        }
        self.by_name.values().next().cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.by_name.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Result, WorkerHandle, WorkerState};
    use async_trait::async_trait;

    struct FakeBackend(&'static str);

    #[async_trait]
    impl WorkerBackend for FakeBackend {
        fn name(&self) -> &str {
            self.0
        }
        async fn dispatch(
            &self,
            _agent: &str,
            _prompt: &str,
            _model: &str,
            _thinking_level: &str,
            _work_dir: &str,
        ) -> Result<WorkerHandle> {
            Ok(WorkerHandle {
                pid: Some(1),
                session_name: String::new(),
                backend: self.0.to_string(),
            })
        }
        async fn status(&self, _handle: &WorkerHandle) -> Result<WorkerState> {
            Ok(WorkerState::Running)
        }
        async fn capture_output(&self, _handle: &WorkerHandle) -> Result<String> {
            Ok(String::new())
        }
        async fn kill(&self, _handle: &WorkerHandle) -> Result<()> {
            Ok(())
        }
        async fn cleanup(&self, _handle: &WorkerHandle) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn tier_routes_resolve_to_backends() {
        let mut reg = BackendRegistry::new();
        reg.register(Arc::new(FakeBackend("tmux")));
        reg.register(Arc::new(FakeBackend("headless_cli")));
        reg.route(Tier::Premium, "tmux");
        reg.route(Tier::Fast, "headless_cli");

        assert_eq!(reg.for_tier(Tier::Premium).unwrap().name(), "tmux");
        assert_eq!(reg.for_tier(Tier::Fast).unwrap().name(), "headless_cli");
        // Unrouted tier falls back to some registered backend.
        assert!(reg.for_tier(Tier::Balanced).is_some());
    }
}
