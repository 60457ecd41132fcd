//! Maps request paths to actor methods.

use std::sync::Arc;

use crate::actors::Actor;

/// A resolved request path.
#[derive(Clone)]
pub struct Route {
    pub actor: Arc<dyn Actor>,
    pub prefix: String,
    pub method: String,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("prefix", &self.prefix)
            .field("method", &self.method)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("No actor registered for '{0}'")]
    UnknownActor(String),

    #[error("Unknown method '{method}' on actor '{prefix}'")]
    UnknownMethod { prefix: String, method: String },

    #[error("Malformed request path '{0}'")]
    Malformed(String),
}

struct Registration {
    prefix: String,
    explicit: bool,
    actor: Arc<dyn Actor>,
}

/// Registered actors, keyed by path prefix.
#[derive(Default)]
pub struct ActorRegistry {
    actors: Vec<Registration>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an actor under `prefix`, or its own default prefix.
    ///
    /// Registering the same prefix twice replaces the earlier actor.
    pub fn register(&mut self, actor: Arc<dyn Actor>, prefix: Option<&str>) {
        let explicit = prefix.is_some();
        let prefix = prefix
            .unwrap_or_else(|| actor.prefix())
            .trim_matches('/')
            .to_string();
        self.actors.retain(|r| r.prefix != prefix);
        tracing::debug!(prefix = %prefix, "[setup] Registered actor");
        self.actors.push(Registration {
            prefix,
            explicit,
            actor,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Every exposed path, as `/<prefix>/<method>`.
    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self
            .actors
            .iter()
            .flat_map(|r| {
                r.actor
                    .methods()
                    .iter()
                    .map(move |m| format!("/{}/{}", r.prefix, m))
            })
            .collect();
        services.sort();
        services
    }

    pub fn actor_for(&self, prefix: &str) -> Option<Arc<dyn Actor>> {
        self.actors
            .iter()
            .find(|r| r.prefix == prefix)
            .map(|r| r.actor.clone())
    }

    /// Resolve a path of the form `/prefix/method`, `/prefix` or `/`.
    ///
    /// An empty prefix selects the sole actor registered without an explicit
    /// prefix; a missing method selects the actor's default method.
    pub fn resolve(&self, path: &str) -> Result<Route, ResolveError> {
        let parts: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();
        let (prefix, method) = match parts.as_slice() {
            [] => (None, None),
            [prefix] => (Some(*prefix), None),
            [prefix, method] => (Some(*prefix), Some(*method)),
            _ => return Err(ResolveError::Malformed(path.to_string())),
        };

        let registration = match prefix {
            Some(prefix) => self.actors.iter().find(|r| r.prefix == prefix),
            None => {
                let mut implicit = self.actors.iter().filter(|r| !r.explicit);
                match (implicit.next(), implicit.next()) {
                    (Some(only), None) => Some(only),
                    _ => None,
                }
            }
        }
        .ok_or_else(|| ResolveError::UnknownActor(prefix.unwrap_or_default().to_string()))?;

        let method = method
            .or_else(|| registration.actor.default_method())
            .ok_or_else(|| ResolveError::UnknownMethod {
                prefix: registration.prefix.clone(),
                method: String::new(),
            })?;
        if !registration.actor.methods().contains(&method) {
            return Err(ResolveError::UnknownMethod {
                prefix: registration.prefix.clone(),
                method: method.to_string(),
            });
        }

        Ok(Route {
            actor: registration.actor.clone(),
            prefix: registration.prefix.clone(),
            method: method.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActorError;
    use crate::packet::Envelope;
    use async_trait::async_trait;

    struct Foo;

    #[async_trait]
    impl Actor for Foo {
        fn prefix(&self) -> &str {
            "foo"
        }

        fn methods(&self) -> &[&'static str] {
            &["bar", "baz"]
        }

        fn default_method(&self) -> Option<&str> {
            Some("bar")
        }

        async fn invoke(
            &self,
            method: &str,
            _payload: serde_json::Value,
            _request: &Envelope,
        ) -> Result<serde_json::Value, ActorError> {
            Ok(serde_json::json!(method))
        }
    }

    #[test]
    fn test_resolve_paths() {
        let mut registry = ActorRegistry::new();
        registry.register(Arc::new(Foo), None);

        let route = registry.resolve("/foo/baz").unwrap();
        assert_eq!((route.prefix.as_str(), route.method.as_str()), ("foo", "baz"));

        assert_eq!(registry.resolve("/foo").unwrap().method, "bar");
        assert_eq!(registry.resolve("/").unwrap().prefix, "foo");
        assert_eq!(registry.services(), vec!["/foo/bar", "/foo/baz"]);

        assert!(matches!(
            registry.resolve("/foo/missing"),
            Err(ResolveError::UnknownMethod { .. })
        ));
        assert!(matches!(
            registry.resolve("/nope/bar"),
            Err(ResolveError::UnknownActor(_))
        ));
        assert!(matches!(
            registry.resolve("/a/b/c"),
            Err(ResolveError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_prefix_needs_sole_implicit_actor() {
        let mut registry = ActorRegistry::new();
        registry.register(Arc::new(Foo), Some("other"));
        assert!(registry.resolve("/").is_err());
        assert_eq!(registry.resolve("/other/baz").unwrap().prefix, "other");

        registry.register(Arc::new(Foo), None);
        assert_eq!(registry.resolve("/").unwrap().prefix, "foo");
    }
}
