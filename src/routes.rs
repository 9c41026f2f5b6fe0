use crate::config::{ExecDefaults, RouteConfig};
use hyper::Method;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// A single dispatch target, resolved from configuration at startup
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// Request path this entry is bound to
    pub path: String,
    /// HTTP method this entry is bound to
    pub method: Method,
    /// Executable invoked when the route matches.
    /// Startup configuration only, never derived from request input.
    pub executable: PathBuf,
    /// Whether the request headers are forwarded as an encoded argument
    pub forward_headers: bool,
    /// Wall-clock timeout for this route's invocations
    pub timeout: Duration,
}

/// Immutable lookup table from (method, path) to a [`RouteEntry`].
///
/// Built once at startup and shared across request tasks behind an `Arc`;
/// it is never mutated afterwards, so concurrent lookups need no
/// synchronization. Keying routes by path in the configuration means no two
/// entries can share a (method, path) pair.
pub struct RouteTable {
    entries: HashMap<(Method, String), RouteEntry>,
}

impl RouteTable {
    /// Build the table from validated route configuration
    pub fn build(
        routes: &HashMap<String, RouteConfig>,
        defaults: &ExecDefaults,
    ) -> anyhow::Result<Self> {
        let mut entries = HashMap::with_capacity(routes.len());

        for (path, route) in routes {
            route
                .validate(path)
                .map_err(|e| anyhow::anyhow!("Invalid route: {}", e))?;

            let method: Method = match route.method {
                Some(ref m) => m
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Route '{}': invalid method '{}'", path, m))?,
                None => Method::GET,
            };

            let entry = RouteEntry {
                path: path.clone(),
                method: method.clone(),
                executable: PathBuf::from(&route.executable),
                forward_headers: route.forward_headers,
                timeout: route.timeout(defaults),
            };

            entries.insert((method, path.clone()), entry);
        }

        Ok(Self { entries })
    }

    /// Look up the entry for a (method, path) pair. Exact match only:
    /// no patterns, no wildcards, no trailing-slash normalization.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<&RouteEntry> {
        self.entries.get(&(method.clone(), path.to_string()))
    }

    /// Number of registered routes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all registered entries (for the startup banner)
    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn table_from_toml(toml: &str) -> RouteTable {
        let config: Config = toml::from_str(toml).unwrap();
        RouteTable::build(&config.routes, &config.defaults).unwrap()
    }

    #[test]
    fn test_resolve_exact_match() {
        let table = table_from_toml(
            r#"
[routes."/"]
executable = "bin/status"

[routes."/probe"]
executable = "bin/probe"
forward_headers = true
"#,
        );

        assert_eq!(table.len(), 2);

        let entry = table.resolve(&Method::GET, "/").unwrap();
        assert_eq!(entry.executable, PathBuf::from("bin/status"));
        assert!(!entry.forward_headers);

        let entry = table.resolve(&Method::GET, "/probe").unwrap();
        assert_eq!(entry.executable, PathBuf::from("bin/probe"));
        assert!(entry.forward_headers);
    }

    #[test]
    fn test_resolve_no_pattern_matching() {
        let table = table_from_toml(
            r#"
[routes."/probe"]
executable = "bin/probe"
"#,
        );

        assert!(table.resolve(&Method::GET, "/probe").is_some());
        assert!(table.resolve(&Method::GET, "/probe/").is_none());
        assert!(table.resolve(&Method::GET, "/probe/sub").is_none());
        assert!(table.resolve(&Method::GET, "/PROBE").is_none());
        assert!(table.resolve(&Method::GET, "/unknown").is_none());
    }

    #[test]
    fn test_resolve_respects_method() {
        let table = table_from_toml(
            r#"
[routes."/hook"]
executable = "bin/hook"
method = "POST"
"#,
        );

        assert!(table.resolve(&Method::POST, "/hook").is_some());
        assert!(table.resolve(&Method::GET, "/hook").is_none());
    }

    #[test]
    fn test_route_timeout_override() {
        let table = table_from_toml(
            r#"
[defaults]
timeout_secs = 20

[routes."/"]
executable = "bin/status"

[routes."/slow"]
executable = "bin/slow"
timeout_secs = 90
"#,
        );

        assert_eq!(
            table.resolve(&Method::GET, "/").unwrap().timeout,
            Duration::from_secs(20)
        );
        assert_eq!(
            table.resolve(&Method::GET, "/slow").unwrap().timeout,
            Duration::from_secs(90)
        );
    }

    #[test]
    fn test_build_rejects_invalid_route() {
        let config: Config = toml::from_str(
            r#"
[routes."no-leading-slash"]
executable = "bin/001"
"#,
        )
        .unwrap();

        assert!(RouteTable::build(&config.routes, &config.defaults).is_err());
    }

    #[test]
    fn test_builtin_routes_resolve() {
        let config = Config::default();
        let table = RouteTable::build(&config.routes, &config.defaults).unwrap();

        assert_eq!(table.len(), 6);
        assert_eq!(
            table.resolve(&Method::GET, "/").unwrap().executable,
            PathBuf::from("bin/001")
        );
        assert_eq!(
            table
                .resolve(&Method::GET, "/secret_word")
                .unwrap()
                .executable,
            PathBuf::from("bin/006")
        );
    }
}
