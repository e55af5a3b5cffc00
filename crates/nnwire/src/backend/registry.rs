//! Runtime backend registry for selecting backends by name.
//!
//! Backend crates register a constructor under a short name (for example `"cpu"`);
//! contexts, including the ones a wire server creates on behalf of a client, look
//! backends up by that name.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use super::spec::Backend;

/// Factory function that creates a new backend instance.
pub type BackendConstructor = Box<dyn Fn() -> Arc<dyn Backend> + Send + Sync>;

/// Global backend registry mapping backend names to constructors.
struct BackendRegistry {
    backends: RwLock<HashMap<String, BackendConstructor>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, constructor: BackendConstructor) {
        let mut backends = self.backends.write().expect("backend registry poisoned");
        if backends.insert(name.clone(), constructor).is_some() {
            tracing::debug!(backend = %name, "replaced registered backend constructor");
        }
    }

    fn create(&self, name: &str) -> Option<Arc<dyn Backend>> {
        let registry = self.backends.read().expect("backend registry poisoned");
        let constructor = registry.get(name)?;
        Some(constructor())
    }

    fn list_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .read()
            .expect("backend registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn has_backend(&self, name: &str) -> bool {
        self.backends
            .read()
            .expect("backend registry poisoned")
            .contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Register a backend by name with a constructor function.
///
/// The constructor runs each time the backend is requested via [`create_backend`].
/// Registering the same name twice replaces the earlier constructor.
///
/// # Example
/// ```ignore
/// use nnwire::backend::registry::register_backend;
///
/// pub fn register() {
///     register_backend("my_backend", || Arc::new(MyBackend::default()));
/// }
/// ```
pub fn register_backend<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> Arc<dyn Backend> + Send + Sync + 'static,
{
    global_registry().register(name.into(), Box::new(constructor));
}

/// Create a backend instance by name.
///
/// Returns `None` if no backend with the given name has been registered.
pub fn create_backend(name: &str) -> Option<Arc<dyn Backend>> {
    global_registry().create(name)
}

/// List all registered backend names in sorted order.
pub fn list_backends() -> Vec<String> {
    global_registry().list_backends()
}

/// Check if a backend with the given name is registered.
pub fn has_backend(name: &str) -> bool {
    global_registry().has_backend(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{BackendError, BackendResult, GraphCompiler};

    struct NamedOnly(&'static str);

    impl Backend for NamedOnly {
        fn backend_name(&self) -> &str {
            self.0
        }

        fn create_graph(&self) -> BackendResult<Box<dyn GraphCompiler>> {
            Err(BackendError::unavailable(self.0))
        }
    }

    #[test]
    fn registered_backends_are_constructible_by_name() {
        register_backend("registry-test", || Arc::new(NamedOnly("registry-test")));
        assert!(has_backend("registry-test"));
        assert!(list_backends().iter().any(|name| name == "registry-test"));
        let backend = create_backend("registry-test").expect("registered");
        assert_eq!(backend.backend_name(), "registry-test");
        assert!(create_backend("registry-missing").is_none());
    }
}
