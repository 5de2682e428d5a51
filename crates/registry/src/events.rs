//! Named events with a fixed parameter schema and handlers attached by name.
//!
//! An event is an ordinary `event` artifact: its JSON document under
//! `events/data/` records the type, the `async` and `broadcast` flags, the
//! parameter schema (in `parameters`) and the names of attached handlers.
//! The callables themselves only live in this process, so a handler named in
//! the document but never attached here is skipped when the event fires.
//!
//! For a synchronous event, handlers run in the order they were attached
//! and `trigger` returns after the last one. For an async event every
//! handler is spawned and `trigger` returns once they are scheduled.

use crate::Registries;
use crate::error::{ErrorKind, Result};
use crate::registry::{Outcome, Registered};
use derive_more::Display;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;
use wold_codec::document::Template;
use wold_metadata::models::EventAttributes;

/// Prefix of the bus topic a broadcast event is published on.
pub const TOPIC_PREFIX: &str = "events.";

/// What a handler receives. One variant per kind of occurrence, plus
/// [`Custom`](Self::Custom) for events defined by users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Empty,
    AssetRegistered { kind: String, name: String, outcome: Outcome },
    PipelineFinished { job: String, source: String, outputs: Vec<String>, ok: bool },
    SettingChanged { name: String, value: Value },
    Custom { fields: Map<String, Value> },
}

impl EventPayload {
    pub fn custom(fields: impl IntoIterator<Item = (impl Into<String>, Value)>) -> Self {
        Self::Custom { fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect() }
    }

    /// The named values the schema is checked against.
    pub fn fields(&self) -> Map<String, Value> {
        match self {
            Self::Custom { fields } => fields.clone(),
            other => match serde_json::to_value(other) {
                Ok(Value::Object(mut map)) => {
                    map.remove("type");
                    map
                },
                _ => Map::new(),
            },
        }
    }
}

/// Type of one schema parameter.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[display("string")]
    String,
    #[display("integer")]
    Integer,
    #[display("number")]
    Number,
    #[display("boolean")]
    Boolean,
    #[display("array")]
    Array,
    #[display("object")]
    Object,
    #[display("any")]
    Any,
}

impl ParamType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventDefinition {
    pub event_type: String,
    pub is_async: bool,
    pub is_broadcast: bool,
    /// Every trigger must carry exactly these parameters. An empty schema
    /// accepts any payload.
    pub schema: BTreeMap<String, ParamType>,
}

type SyncFn = dyn Fn(&EventPayload) + Send + Sync;
type AsyncFn = dyn Fn(EventPayload) -> BoxFuture<'static, ()> + Send + Sync;

#[derive(Clone)]
pub enum Handler {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl Handler {
    pub fn sync(f: impl Fn(&EventPayload) + Send + Sync + 'static) -> Self {
        Self::Sync(Arc::new(f))
    }

    pub fn task<F, Fut>(f: F) -> Self
    where
        F: Fn(EventPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Async(Arc::new(move |payload| Box::pin(f(payload))))
    }

    async fn call(&self, payload: &EventPayload) {
        match self {
            Self::Sync(f) => f(payload),
            Self::Async(f) => f(payload.clone()).await,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Handler::Sync"),
            Self::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerReport {
    pub event: String,
    /// Handlers that ran to completion before `trigger` returned.
    pub invoked: usize,
    /// Handlers handed to the runtime.
    pub scheduled: usize,
    /// Handler names in the document with nothing attached in this process.
    pub detached: Vec<String>,
    /// Bus subscribers that received a broadcast.
    pub delivered: usize,
    pub trigger_count: u64,
}

#[derive(Debug)]
pub struct EventManager {
    registries: Arc<Registries>,
    handlers: Mutex<HashMap<String, Vec<(String, Handler)>>>,
}

impl EventManager {
    pub fn new(registries: Arc<Registries>) -> Self {
        Self { registries, handlers: Mutex::new(HashMap::new()) }
    }

    /// Create the event's document and register it.
    ///
    /// # Errors
    /// [`Constraint`](ErrorKind::Constraint) when the name is taken.
    #[instrument(skip_all, fields(event = %name))]
    pub async fn register_event(&self, name: &str, definition: EventDefinition) -> Result<Registered<EventAttributes>> {
        let mut parameters = Map::new();
        for (key, kind) in &definition.schema {
            parameters.insert(key.clone(), Value::String(kind.to_string()));
        }
        let mut fields = Map::new();
        fields.insert("async".into(), definition.is_async.into());
        fields.insert("broadcast".into(), definition.is_broadcast.into());
        let template = Template {
            doc_type: Some(definition.event_type).filter(|t| !t.is_empty()),
            parameters,
            fields,
            ..Template::default()
        };
        self.registries.events.create(name, template).await
    }

    /// Parameter schema of a registered event. Entries whose type isn't
    /// recognised accept anything.
    pub async fn schema(&self, name: &str) -> Result<BTreeMap<String, ParamType>> {
        let record = self.require(name).await?;
        Ok(record
            .common
            .parameters
            .iter()
            .map(|(key, kind)| (key.clone(), serde_json::from_value(kind.clone()).unwrap_or(ParamType::Any)))
            .collect())
    }

    async fn require(&self, name: &str) -> Result<wold_metadata::Record<EventAttributes>> {
        match self.registries.events.get(name).await {
            Some(record) => Ok(record),
            None => exn::bail!(ErrorKind::NotFound(format!("event `{name}`"))),
        }
    }

    /// Attach `handler` under `handler_name`. Attaching a name again
    /// replaces the callable and keeps its place in the order.
    #[instrument(skip_all, fields(event = %event, handler = %handler_name))]
    pub async fn add_handler(&self, event: &str, handler_name: &str, handler: Handler) -> Result<()> {
        if handler_name.trim().is_empty() {
            exn::bail!(ErrorKind::Constraint("handler name is empty".to_string()));
        }
        let record = self.require(event).await?;
        if !record.attributes.handlers.iter().any(|h| h == handler_name) {
            self.registries
                .events
                .edit_document(event, |doc| {
                    let handlers = doc.entry("handlers").or_insert_with(|| Value::Array(Vec::new()));
                    if !handlers.is_array() {
                        *handlers = Value::Array(Vec::new());
                    }
                    if let Value::Array(list) = handlers {
                        list.push(Value::String(handler_name.to_string()));
                    }
                    Ok(())
                })
                .await?;
        }
        let mut live = self.handlers.lock();
        let attached = live.entry(event.to_string()).or_default();
        match attached.iter_mut().find(|(name, _)| name == handler_name) {
            Some(slot) => slot.1 = handler,
            None => attached.push((handler_name.to_string(), handler)),
        }
        tracing::debug!("Handler attached");
        Ok(())
    }

    /// Detach a handler. Returns `false` if it wasn't attached.
    #[instrument(skip_all, fields(event = %event, handler = %handler_name))]
    pub async fn remove_handler(&self, event: &str, handler_name: &str) -> Result<bool> {
        let record = self.require(event).await?;
        let listed = record.attributes.handlers.iter().any(|h| h == handler_name);
        if listed {
            self.registries
                .events
                .edit_document(event, |doc| {
                    if let Some(Value::Array(list)) = doc.get_mut("handlers") {
                        list.retain(|h| h.as_str() != Some(handler_name));
                    }
                    Ok(())
                })
                .await?;
        }
        let live = {
            let mut live = self.handlers.lock();
            let attached = live.entry(event.to_string()).or_default();
            let before = attached.len();
            attached.retain(|(name, _)| name != handler_name);
            before != attached.len()
        };
        Ok(listed || live)
    }

    /// Names of the handlers attached in this process, in call order.
    pub fn attached(&self, event: &str) -> Vec<String> {
        self.handlers.lock().get(event).map(|list| list.iter().map(|(n, _)| n.clone()).collect()).unwrap_or_default()
    }

    /// Fire `event` with `payload`.
    ///
    /// # Errors
    /// [`NotFound`](ErrorKind::NotFound) for an unknown event,
    /// [`Constraint`](ErrorKind::Constraint) when the payload doesn't match
    /// the schema. No handler runs in either case.
    #[instrument(skip_all, fields(event = %event, invoked = tracing::field::Empty))]
    pub async fn trigger(&self, event: &str, payload: EventPayload) -> Result<TriggerReport> {
        let record = self.require(event).await?;
        let schema = self.schema(event).await?;
        check_payload(event, &schema, &payload)?;

        let handlers: Vec<(String, Option<Handler>)> = {
            let live = self.handlers.lock();
            let attached = live.get(event);
            record
                .attributes
                .handlers
                .iter()
                .map(|name| {
                    let handler = attached.and_then(|list| list.iter().find(|(n, _)| n == name)).map(|(_, h)| h.clone());
                    (name.clone(), handler)
                })
                .collect()
        };

        let mut report = TriggerReport {
            event: event.to_string(),
            invoked: 0,
            scheduled: 0,
            detached: Vec::new(),
            delivered: 0,
            trigger_count: 0,
        };
        for (name, handler) in handlers {
            let Some(handler) = handler else {
                tracing::debug!(handler = %name, "Handler not attached in this process");
                report.detached.push(name);
                continue;
            };
            match record.attributes.is_async {
                true => {
                    let payload = payload.clone();
                    tokio::spawn(async move { handler.call(&payload).await });
                    report.scheduled += 1;
                },
                false => {
                    handler.call(&payload).await;
                    report.invoked += 1;
                },
            }
        }
        tracing::Span::current().record("invoked", report.invoked);

        if record.attributes.is_broadcast {
            match serde_json::to_value(&payload) {
                Ok(value) => report.delivered = self.registries.events.context().bus.publish(&topic(event), value),
                Err(err) => tracing::warn!(error = ?err, "Could not serialize broadcast payload"),
            }
        }

        let now = OffsetDateTime::now_utc();
        let updated = self
            .registries
            .events
            .update(event, |record| {
                record.attributes.trigger_count += 1;
                record.attributes.last_triggered_at = Some(now);
            })
            .await?;
        report.trigger_count = updated.attributes.trigger_count;
        Ok(report)
    }
}

/// Bus topic a broadcast of `event` goes out on.
pub fn topic(event: &str) -> String {
    format!("{TOPIC_PREFIX}{event}")
}

fn check_payload(event: &str, schema: &BTreeMap<String, ParamType>, payload: &EventPayload) -> Result<()> {
    if schema.is_empty() {
        return Ok(());
    }
    let fields = payload.fields();
    for (key, kind) in schema {
        match fields.get(key) {
            Some(value) if kind.accepts(value) => {},
            Some(_) => exn::bail!(ErrorKind::Constraint(format!("`{event}`: parameter `{key}` must be {kind}"))),
            None => exn::bail!(ErrorKind::Constraint(format!("`{event}`: parameter `{key}` is missing"))),
        }
    }
    if let Some(key) = fields.keys().find(|key| !schema.contains_key(*key)) {
        exn::bail!(ErrorKind::Constraint(format!("`{event}` has no parameter `{key}`")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use rstest::rstest;
    use serde_json::json;
    use std::time::Duration;

    fn greeting() -> EventDefinition {
        EventDefinition {
            event_type: "ui".to_string(),
            schema: BTreeMap::from([("user".to_string(), ParamType::String), ("count".to_string(), ParamType::Integer)]),
            ..Default::default()
        }
    }

    fn hello(count: i64) -> EventPayload {
        EventPayload::custom([("user", json!("ada")), ("count", json!(count))])
    }

    #[tokio::test]
    async fn test_handler_sees_payload_until_removed() {
        let (_dir, registries) = testing::registries().await;
        let events = EventManager::new(registries.clone());
        events.register_event("greet", greeting()).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.add_handler("greet", "log", Handler::sync(move |p| sink.lock().push(p.clone()))).await.unwrap();
        let report = events.trigger("greet", hello(1)).await.unwrap();
        assert_eq!(report.invoked, 1);
        assert_eq!(*seen.lock(), vec![hello(1)]);

        assert!(events.remove_handler("greet", "log").await.unwrap());
        let report = events.trigger("greet", hello(2)).await.unwrap();
        assert_eq!(report.invoked, 0);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(report.trigger_count, 2);

        let record = registries.events.get("greet").await.unwrap();
        assert!(record.attributes.handlers.is_empty());
        assert!(record.attributes.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn test_sync_handlers_run_in_attach_order() {
        let (_dir, registries) = testing::registries().await;
        let events = EventManager::new(registries);
        events.register_event("tick", EventDefinition::default()).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = order.clone();
            events.add_handler("tick", name, Handler::sync(move |_| order.lock().push(name))).await.unwrap();
        }
        events.trigger("tick", EventPayload::Empty).await.unwrap();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
        assert_eq!(events.attached("tick"), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_async_event_schedules_handlers() {
        let (_dir, registries) = testing::registries().await;
        let events = EventManager::new(registries);
        let definition = EventDefinition { is_async: true, ..Default::default() };
        events.register_event("later", definition).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler = Handler::task(move |payload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload);
            }
        });
        events.add_handler("later", "forward", handler).await.unwrap();

        let report = events.trigger("later", EventPayload::Empty).await.unwrap();
        assert_eq!((report.invoked, report.scheduled), (0, 1));
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(received, Some(EventPayload::Empty));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_bus() {
        let (_dir, registries) = testing::registries().await;
        let events = EventManager::new(registries.clone());
        let definition = EventDefinition { is_broadcast: true, ..Default::default() };
        events.register_event("news", definition).await.unwrap();
        let mut rx = registries.events.context().bus.subscribe(&topic("news"));

        let payload = EventPayload::SettingChanged { name: "audio.volume".into(), value: json!(0.5) };
        let report = events.trigger("news", payload).await.unwrap();
        assert_eq!(report.delivered, 1);
        let message = rx.recv().await.unwrap();
        assert_eq!(message.payload["type"], "setting_changed");
        assert_eq!(message.payload["name"], "audio.volume");
    }

    #[rstest]
    #[case::wrong_type(EventPayload::custom([("user", json!("ada")), ("count", json!("two"))]))]
    #[case::missing(EventPayload::custom([("user", json!("ada"))]))]
    #[case::unknown(EventPayload::custom([("user", json!("ada")), ("count", json!(1)), ("extra", json!(true))]))]
    #[tokio::test]
    async fn test_payload_must_match_schema(#[case] payload: EventPayload) {
        let (_dir, registries) = testing::registries().await;
        let events = EventManager::new(registries);
        events.register_event("greet", greeting()).await.unwrap();
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        events.add_handler("greet", "mark", Handler::sync(move |_| *flag.lock() = true)).await.unwrap();

        let err = events.trigger("greet", payload).await.unwrap_err();
        assert!(err.is_constraint());
        assert!(!*called.lock());
    }

    #[tokio::test]
    async fn test_unknown_event() {
        let (_dir, registries) = testing::registries().await;
        let events = EventManager::new(registries);
        assert!(events.trigger("nope", EventPayload::Empty).await.unwrap_err().is_not_found());
        assert!(events.add_handler("nope", "h", Handler::sync(|_| {})).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_schema_round_trips_through_document() {
        let (_dir, registries) = testing::registries().await;
        let events = EventManager::new(registries);
        events.register_event("greet", greeting()).await.unwrap();
        assert_eq!(events.schema("greet").await.unwrap(), greeting().schema);
    }
}
