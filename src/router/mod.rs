//! API Router
//!
//! Maps request paths to configured routes and the access rule each one
//! carries. Rules are built once at startup and never change.

use crate::authz::PermissionRequirement;
use crate::config::RouteConfig;
use std::collections::HashSet;
use thiserror::Error;

/// Router errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouterError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Duplicate path prefix: {0}")]
    DuplicatePrefix(String),
}

/// Who may call a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAccess {
    /// No token needed
    Public,
    /// Verified token carrying the listed permissions
    Protected(PermissionRequirement),
}

/// A configured route
#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    pub path_prefix: String,
    /// Upper-cased allowed methods; empty allows any
    pub methods: Vec<String>,
    pub access: RouteAccess,
    pub message: Option<String>,
}

impl Route {
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m == method)
    }

    /// Match on prefix boundary: the path either equals the prefix or
    /// continues with '/' after it.
    fn matches(&self, path: &str) -> bool {
        if self.path_prefix == "/" {
            return path.starts_with('/');
        }
        match path.strip_prefix(self.path_prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// Route table resolved from configuration
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn from_config(routes: &[RouteConfig]) -> Result<Self, RouterError> {
        let routes = routes
            .iter()
            .map(|config| {
                if !config.path_prefix.starts_with('/') {
                    return Err(RouterError::InvalidPath(config.path_prefix.clone()));
                }
                let path_prefix = config.normalized_prefix().to_string();

                let methods = config
                    .methods
                    .iter()
                    .map(|m| {
                        let m = m.to_ascii_uppercase();
                        if m.is_empty() || !m.bytes().all(|b| b.is_ascii_uppercase()) {
                            Err(RouterError::InvalidMethod(m))
                        } else {
                            Ok(m)
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                let access = if config.public {
                    RouteAccess::Public
                } else {
                    RouteAccess::Protected(PermissionRequirement::new(
                        config.permissions.iter().cloned(),
                    ))
                };

                Ok(Route {
                    name: config.name.clone(),
                    path_prefix,
                    methods,
                    access,
                    message: config.message.clone(),
                })
            })
            .collect::<Result<Vec<Route>, _>>()?;

        let mut seen = HashSet::new();
        for route in &routes {
            if !seen.insert(route.path_prefix.as_str()) {
                return Err(RouterError::DuplicatePrefix(route.path_prefix.clone()));
            }
        }

        Ok(Self { routes })
    }

    /// Find the route for a path.
    ///
    /// Returns the longest matching prefix so `/api/private-scoped` is not
    /// swallowed by `/api/private` and `/apix` does not match `/api`.
    pub fn find(&self, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|route| route.matches(path))
            .max_by_key(|route| route.path_prefix.len())
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, prefix: &str, public: bool, permissions: &[&str]) -> RouteConfig {
        RouteConfig {
            name: name.into(),
            path_prefix: prefix.into(),
            methods: vec![],
            public,
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            message: None,
        }
    }

    fn table() -> RouteTable {
        RouteTable::from_config(&[
            route("public", "/api/public", true, &[]),
            route("private", "/api/private", false, &[]),
            route("scoped", "/api/private-scoped", false, &["read:messages"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_exact_and_nested_paths_match() {
        let table = table();
        assert_eq!(table.find("/api/public").unwrap().name, "public");
        assert_eq!(table.find("/api/public/items/1").unwrap().name, "public");
    }

    #[test]
    fn test_prefix_boundary_respected() {
        let table = table();
        assert_eq!(table.find("/api/private-scoped").unwrap().name, "scoped");
        assert_eq!(table.find("/api/private").unwrap().name, "private");
        assert!(table.find("/api/publicity").is_none());
        assert!(table.find("/other").is_none());
    }

    #[test]
    fn test_access_rules_built() {
        let table = table();
        assert_eq!(table.find("/api/public").unwrap().access, RouteAccess::Public);
        assert_eq!(
            table.find("/api/private-scoped").unwrap().access,
            RouteAccess::Protected(PermissionRequirement::new(["read:messages"]))
        );
    }

    #[test]
    fn test_methods_normalized() {
        let mut config = route("r", "/r", false, &[]);
        config.methods = vec!["get".into(), "Post".into()];
        let table = RouteTable::from_config(&[config]).unwrap();
        let route = table.find("/r").unwrap();
        assert!(route.allows_method("GET"));
        assert!(route.allows_method("POST"));
        assert!(!route.allows_method("DELETE"));
    }

    #[test]
    fn test_invalid_method_rejected() {
        let mut config = route("r", "/r", false, &[]);
        config.methods = vec!["GE T".into()];
        assert!(matches!(
            RouteTable::from_config(&[config]),
            Err(RouterError::InvalidMethod(_))
        ));
    }

    #[test]
    fn test_root_prefix_catches_all() {
        let table = RouteTable::from_config(&[
            route("root", "/", true, &[]),
            route("api", "/api", false, &[]),
        ])
        .unwrap();
        assert_eq!(table.find("/anything").unwrap().name, "root");
        assert_eq!(table.find("/api/x").unwrap().name, "api");
    }

    #[test]
    fn test_trailing_slash_prefix_normalized() {
        let table = RouteTable::from_config(&[route("r", "/r/", false, &[])]).unwrap();
        assert_eq!(table.find("/r").unwrap().name, "r");
        assert_eq!(table.find("/r/x").unwrap().name, "r");
    }

    #[test]
    fn test_prefixes_equal_after_normalization_rejected() {
        let result = RouteTable::from_config(&[
            route("bare", "/r", false, &[]),
            route("slashed", "/r/", false, &[]),
        ]);
        assert_eq!(result.unwrap_err(), RouterError::DuplicatePrefix("/r".into()));
    }
}
