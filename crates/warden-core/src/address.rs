//! Canonical service addresses: `scheme://namespace/instance/slug[?query]`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address must look like scheme://namespace/instance/slug, got {0:?}")]
    Malformed(String),
    #[error("address is missing its scheme")]
    MissingScheme,
    #[error("unknown service slug: {0}")]
    UnknownSlug(String),
}

/// A fully-qualified handle to a service: the scheme names the running
/// application (e.g. `warden`), `namespace` is the app's configured name,
/// `instance` distinguishes replicas of the same app, and `slug` names one
/// service inside it.
///
/// Two addresses are equal, and hash the same, purely by [`Address::path`]:
/// the scheme and any query parameters are metadata, not identity.
#[derive(Debug, Clone)]
pub struct Address {
    scheme: String,
    namespace: String,
    instance: String,
    slug: String,
    query: BTreeMap<String, String>,
}

impl Address {
    pub fn new(
        scheme: impl Into<String>,
        namespace: impl Into<String>,
        instance: impl Into<String>,
        slug: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            namespace: namespace.into(),
            instance: instance.into(),
            slug: slug.into(),
            query: BTreeMap::new(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// A copy of this address pointing at a different slug within the same
    /// namespace/instance -- how a host address becomes a service address.
    pub fn with_slug(&self, slug: impl Into<String>) -> Self {
        Self {
            scheme: self.scheme.clone(),
            namespace: self.namespace.clone(),
            instance: self.instance.clone(),
            slug: slug.into(),
            query: self.query.clone(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// `namespace/instance/slug` -- the part two addresses are compared by.
    pub fn path(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.instance, self.slug)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.path() == other.path()
    }
}
impl Eq for Address {}

impl std::hash::Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.path().hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.path())?;
        if !self.query.is_empty() {
            write!(f, "?")?;
            for (i, (k, v)) in self.query.iter().enumerate() {
                if i > 0 {
                    write!(f, "&")?;
                }
                write!(f, "{k}={v}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| AddressError::MissingScheme)?;
        if scheme.is_empty() {
            return Err(AddressError::MissingScheme);
        }
        let (path, query_str) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (rest, None),
        };
        let mut parts = path.splitn(3, '/');
        let namespace = parts.next().filter(|s| !s.is_empty());
        let instance = parts.next().filter(|s| !s.is_empty());
        let slug = parts.next().filter(|s| !s.is_empty());
        let (namespace, instance, slug) = match (namespace, instance, slug) {
            (Some(n), Some(i), Some(s)) => (n, i, s),
            _ => return Err(AddressError::Malformed(s.to_string())),
        };

        let mut query = BTreeMap::new();
        if let Some(q) = query_str {
            for pair in q.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) => {
                        query.insert(k.to_string(), v.to_string());
                    }
                    None => {
                        query.insert(pair.to_string(), String::new());
                    }
                }
            }
        }

        Ok(Address {
            scheme: scheme.to_string(),
            namespace: namespace.to_string(),
            instance: instance.to_string(),
            slug: slug.to_string(),
            query,
        })
    }
}

/// Resolves a bare service slug into a fully-qualified [`Address`], using the
/// host application's own address as the namespace/instance prefix.
pub trait AddressResolver: Send + Sync {
    fn resolve_service(&self, slug: &str) -> Result<Address, AddressError>;
    fn host_address(&self) -> &Address;
}

/// The straightforward resolver: every slug becomes `host_address.with_slug(slug)`.
pub struct HostResolver {
    host: Address,
}

impl HostResolver {
    pub fn new(host: Address) -> Self {
        Self { host }
    }
}

impl AddressResolver for HostResolver {
    fn resolve_service(&self, slug: &str) -> Result<Address, AddressError> {
        if slug.is_empty() {
            return Err(AddressError::UnknownSlug(slug.to_string()));
        }
        Ok(self.host.with_slug(slug))
    }

    fn host_address(&self) -> &Address {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_parse() {
        let addr = Address::new("warden", "demo", "primary", "lidar");
        let parsed: Address = addr.to_string().parse().unwrap();
        assert_eq!(addr, parsed);
        assert_eq!(parsed.path(), "demo/primary/lidar");
    }

    #[test]
    fn equality_ignores_scheme_and_query() {
        let a = Address::new("warden", "demo", "primary", "lidar");
        let b = Address::new("other-scheme", "demo", "primary", "lidar").with_query("k", "v");
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_missing_segments() {
        assert!("warden://demo/primary".parse::<Address>().is_err());
        assert!("demo/primary/lidar".parse::<Address>().is_err());
    }

    #[test]
    fn host_resolver_projects_slug() {
        let host = Address::new("warden", "demo", "primary", "app");
        let resolver = HostResolver::new(host);
        let resolved = resolver.resolve_service("lidar").unwrap();
        assert_eq!(resolved.path(), "demo/primary/lidar");
        assert!(resolver.resolve_service("").is_err());
    }
}
