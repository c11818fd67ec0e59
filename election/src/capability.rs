// Workload registry - fixed, typed lookup of protected work by name

use crate::{
    work::{Heartbeat, Idle, ProtectedWork},
    Error, Result,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type WorkFactory = Box<dyn Fn() -> Arc<dyn ProtectedWork> + Send + Sync>;

/// Named factories for the work a leader can run.
///
/// Lookup happens at startup; an unknown name is a configuration error, so
/// the election never starts with work it cannot run.
pub struct WorkloadRegistry {
    factories: BTreeMap<String, WorkFactory>,
}

impl WorkloadRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// `idle` (hold leadership, do nothing) and `heartbeat` (log while leading).
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.factories.insert(
            "idle".to_string(),
            Box::new(|| Arc::new(Idle) as Arc<dyn ProtectedWork>),
        );
        registry.factories.insert(
            "heartbeat".to_string(),
            Box::new(|| Arc::new(Heartbeat::default()) as Arc<dyn ProtectedWork>),
        );
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn() -> Arc<dyn ProtectedWork> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::DuplicateWorkload(name));
        }
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ProtectedWork>> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(Error::UnknownWorkload {
                name: name.to_string(),
                available: self.names().join(", "),
            }),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for WorkloadRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for WorkloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadRegistry")
            .field("workloads", &self.names())
            .finish()
    }
}
