//! The typed event that flows through the engine's dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A scalar value carried by an [`Event`] or one of its payload entries.
///
/// `Nil` is a first-class sentinel rather than an `Option<EventValue>` wrapper:
/// the dispatcher logs at `warn` when a dispatched event's scalar is `Nil`,
/// which would be awkward to special-case through an `Option`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Nil,
}

impl EventValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, EventValue::Nil)
    }

    /// Non-empty string scalar, if this is a `Str` variant other than `"bundle"`.
    pub fn as_slug(&self) -> Option<&str> {
        match self {
            EventValue::Str(s) if !s.is_empty() && s != "bundle" => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_bundle(&self) -> bool {
        matches!(self, EventValue::Str(s) if s == "bundle")
    }
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventValue::Str(s) => write!(f, "{s}"),
            EventValue::Int(i) => write!(f, "{i}"),
            EventValue::Float(v) => write!(f, "{v}"),
            EventValue::Bool(b) => write!(f, "{b}"),
            EventValue::Nil => write!(f, "nil"),
        }
    }
}

impl From<&str> for EventValue {
    fn from(s: &str) -> Self {
        EventValue::Str(s.to_string())
    }
}

impl From<String> for EventValue {
    fn from(s: String) -> Self {
        EventValue::Str(s)
    }
}

impl From<i64> for EventValue {
    fn from(v: i64) -> Self {
        EventValue::Int(v)
    }
}

impl From<bool> for EventValue {
    fn from(v: bool) -> Self {
        EventValue::Bool(v)
    }
}

pub type Payload = HashMap<String, EventValue>;

/// Immutable `(scope, key, value, payload)` tuple dispatched through the engine.
///
/// `scope` and `key` are kept as `Arc<str>` so fanning one event out to every
/// container (see `Engine::dispatch`) clones cheaply.
#[derive(Debug, Clone)]
pub struct Event {
    scope: Arc<str>,
    key: Arc<str>,
    value: EventValue,
    payload: Option<Payload>,
}

impl Event {
    pub fn new(scope: impl Into<Arc<str>>, key: impl Into<Arc<str>>, value: EventValue) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
            value,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &EventValue {
        &self.value
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// `scope"."key`, the key listeners and the subscription table index on.
    pub fn subscription_key(&self) -> String {
        format!("{}.{}", self.scope, self.key)
    }

    pub fn is_degenerate(&self) -> bool {
        self.scope.is_empty() || self.key.is_empty()
    }
}

/// A `(scope, key)` prototype that stamps out [`Event`] instances sharing the
/// same subscription key without re-allocating the scope/key strings.
#[derive(Debug, Clone)]
pub struct EventFactory {
    scope: Arc<str>,
    key: Arc<str>,
}

impl EventFactory {
    pub fn new(scope: impl Into<Arc<str>>, key: impl Into<Arc<str>>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
        }
    }

    pub fn create(&self, value: EventValue, payload: Option<Payload>) -> Event {
        Event {
            scope: self.scope.clone(),
            key: self.key.clone(),
            value,
            payload,
        }
    }

    pub fn subscription_key(&self) -> String {
        format!("{}.{}", self.scope, self.key)
    }
}

/// Builds the `service.N -> path` payload a loader bundle carries.
pub fn bundle_payload<'a>(paths: impl IntoIterator<Item = &'a str>) -> Payload {
    let mut payload = Payload::new();
    for (i, path) in paths.into_iter().enumerate() {
        payload.insert(format!("service.{i}"), EventValue::Str(path.to_string()));
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_key_joins_scope_and_key() {
        let ev = Event::new("service", "started", EventValue::Str("lidar".into()));
        assert_eq!(ev.subscription_key(), "service.started");
    }

    #[test]
    fn factory_stamps_same_subscription_key() {
        let factory = EventFactory::new("services", "start.services");
        let a = factory.create(EventValue::from("bundle"), None);
        let b = factory.create(EventValue::from("nav"), None);
        assert_eq!(a.subscription_key(), b.subscription_key());
        assert_eq!(a.subscription_key(), "services.start.services");
    }

    #[test]
    fn nil_is_not_a_slug() {
        assert!(EventValue::Nil.as_slug().is_none());
        assert!(EventValue::from("bundle").as_slug().is_none());
        assert_eq!(EventValue::from("nav").as_slug(), Some("nav"));
    }

    #[test]
    fn bundle_payload_indexes_sequentially() {
        let payload = bundle_payload(["app/svc/a", "app/svc/b"]);
        assert_eq!(
            payload.get("service.0"),
            Some(&EventValue::Str("app/svc/a".into()))
        );
        assert_eq!(
            payload.get("service.1"),
            Some(&EventValue::Str("app/svc/b".into()))
        );
    }
}
