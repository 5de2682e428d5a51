//! Typed settings with constraints.
//!
//! Settings live in their own store (`settings/metadata/settings_metadata.json`)
//! rather than in artifact documents. A setting's value satisfies its
//! constraints at all times: a write that would break them is refused and
//! the stored value stays as it was.

use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::events::EventPayload;
use derive_more::Display;
use exn::ResultExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::instrument;
use wold_metadata::MetadataStore;
use wold_metadata::models::DEFAULT_VERSION;

/// Kind under which settings are stored.
pub const KIND: &str = "setting";

/// Topic a [`EventPayload::SettingChanged`] goes out on after every change.
pub const SETTINGS_TOPIC: &str = "settings";

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    #[display("bool")]
    #[serde(alias = "boolean")]
    Bool,
    #[display("int")]
    #[serde(alias = "integer")]
    Int,
    #[display("float")]
    #[serde(alias = "number")]
    Float,
    #[display("str")]
    #[serde(alias = "string")]
    Str,
    #[display("list")]
    #[serde(alias = "array")]
    List,
    #[display("dict")]
    #[serde(alias = "object")]
    Dict,
}

impl SettingType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Bool => value.is_boolean(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Str => value.is_string(),
            Self::List => value.is_array(),
            Self::Dict => value.is_object(),
        }
    }
}

impl FromStr for SettingType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_ascii_lowercase()))
            .or_raise(|| ErrorKind::Constraint(format!("unknown setting type `{s}`")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<SettingType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Value>>,
    /// Regular expression the whole string form of the value must match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl Constraints {
    pub fn typed(value_type: SettingType) -> Self {
        Self { value_type: Some(value_type), ..Self::default() }
    }

    pub fn range(self, min: f64, max: f64) -> Self {
        Self { min: Some(min), max: Some(max), ..self }
    }

    pub fn options(self, options: impl IntoIterator<Item = Value>) -> Self {
        Self { options: Some(options.into_iter().collect()), ..self }
    }

    pub fn pattern(self, pattern: impl Into<String>) -> Self {
        Self { pattern: Some(pattern.into()), ..self }
    }

    /// How many constraints are set.
    pub fn count(&self) -> usize {
        usize::from(self.value_type.is_some())
            + usize::from(self.min.is_some())
            + usize::from(self.max.is_some())
            + usize::from(self.options.is_some())
            + usize::from(self.pattern.is_some())
    }

    /// First constraint `value` breaks, if any.
    pub fn violation(&self, value: &Value) -> Option<String> {
        if let Some(kind) = self.value_type
            && !kind.accepts(value)
        {
            return Some(format!("expected a {kind}, got {value}"));
        }
        if self.min.is_some() || self.max.is_some() {
            let Some(number) = magnitude(value) else {
                return Some(format!("{value} has no size to compare"));
            };
            if let Some(min) = self.min
                && number < min
            {
                return Some(format!("{value} is below the minimum {min}"));
            }
            if let Some(max) = self.max
                && number > max
            {
                return Some(format!("{value} is above the maximum {max}"));
            }
        }
        if let Some(options) = &self.options
            && !options.contains(value)
        {
            return Some(format!("{value} is not one of the allowed options"));
        }
        if let Some(pattern) = &self.pattern {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match Regex::new(&format!("^(?:{pattern})$")) {
                Ok(regex) if regex.is_match(&text) => {},
                Ok(_) => return Some(format!("`{text}` does not match `{pattern}`")),
                Err(_) => return Some(format!("`{pattern}` is not a valid pattern")),
            }
        }
        None
    }
}

/// Numbers compare by value, strings and lists by length.
fn magnitude(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => Some(s.chars().count() as f64),
        Value::Array(items) => Some(items.len() as f64),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub name: String,
    #[serde(rename = "type")]
    pub setting_type: SettingType,
    #[serde(default)]
    pub category: String,
    pub value: Value,
    pub default_value: Value,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_custom: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified_at: OffsetDateTime,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// What [`SettingsManager::create`] needs.
#[derive(Debug, Clone)]
pub struct NewSetting {
    pub setting_type: SettingType,
    pub value: Value,
    pub category: String,
    pub description: String,
    pub constraints: Constraints,
    pub is_default: bool,
    pub is_custom: bool,
    pub is_system: bool,
}

impl NewSetting {
    pub fn new(setting_type: SettingType, value: Value) -> Self {
        Self {
            setting_type,
            value,
            category: String::new(),
            description: String::new(),
            constraints: Constraints::typed(setting_type),
            is_default: false,
            is_custom: false,
            is_system: false,
        }
    }

    pub fn category(self, category: impl Into<String>) -> Self {
        Self { category: category.into(), ..self }
    }

    pub fn description(self, description: impl Into<String>) -> Self {
        Self { description: description.into(), ..self }
    }

    pub fn constraints(self, constraints: Constraints) -> Self {
        Self { constraints, ..self }
    }

    pub fn system(self) -> Self {
        Self { is_system: true, ..self }
    }

    pub fn custom(self) -> Self {
        Self { is_custom: true, ..self }
    }

    pub fn default_setting(self) -> Self {
        Self { is_default: true, ..self }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SettingCheck {
    pub has_value: bool,
    pub has_default: bool,
    pub has_description: bool,
    pub has_constraints: bool,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ConstraintBucket {
    #[serde(rename = "0")]
    None,
    #[serde(rename = "1-2")]
    Few,
    #[serde(rename = "3-5")]
    Several,
    #[serde(rename = "5+")]
    Many,
}
impl ConstraintBucket {
    pub fn of(count: usize) -> Self {
        match count {
            0 => Self::None,
            1..=2 => Self::Few,
            3..=5 => Self::Several,
            _ => Self::Many,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettingStats {
    pub total: usize,
    pub default: usize,
    pub custom: usize,
    pub system: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub by_constraint_count: BTreeMap<ConstraintBucket, usize>,
}

#[derive(Debug)]
pub struct SettingsManager {
    ctx: Context,
    store: MetadataStore<Setting>,
}

fn store_failed() -> ErrorKind {
    ErrorKind::Store(KIND.to_string())
}

impl SettingsManager {
    #[instrument(skip_all)]
    pub async fn open(ctx: Context) -> Result<Self> {
        let store = MetadataStore::open(ctx.backend.clone(), KIND).await.or_raise(store_failed)?;
        Ok(Self { ctx, store })
    }

    async fn require(&self, name: &str) -> Result<Setting> {
        match self.store.get(name).await {
            Some(setting) => Ok(setting),
            None => exn::bail!(ErrorKind::NotFound(format!("setting `{name}`"))),
        }
    }

    /// Create a setting whose current and default value are `new.value`.
    ///
    /// # Errors
    /// [`Constraint`](ErrorKind::Constraint) when the name is taken or the
    /// value breaks the constraints.
    #[instrument(skip_all, fields(setting = %name))]
    pub async fn create(&self, name: &str, new: NewSetting) -> Result<Setting> {
        if name.trim().is_empty() {
            exn::bail!(ErrorKind::Constraint("setting name is empty".to_string()));
        }
        if self.store.contains(name).await {
            exn::bail!(ErrorKind::Constraint(format!("setting `{name}` already exists")));
        }
        if let Some(kind) = new.constraints.value_type
            && kind != new.setting_type
        {
            exn::bail!(ErrorKind::Constraint(format!("`{name}` is a {} but constrained to {kind}", new.setting_type)));
        }
        if !new.setting_type.accepts(&new.value) {
            exn::bail!(ErrorKind::Constraint(format!("`{name}`: {} is not a {}", new.value, new.setting_type)));
        }
        if let Some(problem) = new.constraints.violation(&new.value) {
            exn::bail!(ErrorKind::Constraint(format!("`{name}`: {problem}")));
        }
        let now = OffsetDateTime::now_utc();
        let setting = Setting {
            name: name.to_string(),
            setting_type: new.setting_type,
            category: new.category,
            default_value: new.value.clone(),
            value: new.value,
            description: new.description,
            constraints: new.constraints,
            is_default: new.is_default,
            is_custom: new.is_custom,
            is_system: new.is_system,
            version: default_version(),
            created_at: now,
            last_modified_at: now,
            extra: Map::new(),
        };
        let result = self.store.put(name, setting.clone()).await.or_raise(store_failed);
        self.ctx.ledger().track("create_setting", result).await?;
        tracing::info!(category = %setting.category, "Setting created");
        Ok(setting)
    }

    pub async fn get(&self, name: &str) -> Option<Setting> {
        self.store.get(name).await
    }

    /// Current value, or `None` for an unknown setting.
    pub async fn value(&self, name: &str) -> Option<Value> {
        self.store.get(name).await.map(|s| s.value)
    }

    /// Change the value.
    ///
    /// # Errors
    /// [`Constraint`](ErrorKind::Constraint) when `value` breaks the
    /// constraints; the stored value is unchanged.
    #[instrument(skip_all, fields(setting = %name))]
    pub async fn set(&self, name: &str, value: Value) -> Result<Setting> {
        let setting = self.require(name).await?;
        if !setting.setting_type.accepts(&value) {
            exn::bail!(ErrorKind::Constraint(format!("`{name}`: {value} is not a {}", setting.setting_type)));
        }
        if let Some(problem) = setting.constraints.violation(&value) {
            tracing::debug!(problem = %problem, "Setting value refused");
            exn::bail!(ErrorKind::Constraint(format!("`{name}`: {problem}")));
        }
        self.assign(name, value, false).await
    }

    /// Put the default value back and mark the setting as default again.
    pub async fn reset(&self, name: &str) -> Result<Setting> {
        let setting = self.require(name).await?;
        self.assign(name, setting.default_value, true).await
    }

    async fn assign(&self, name: &str, value: Value, is_default: bool) -> Result<Setting> {
        let now = OffsetDateTime::now_utc();
        let updated = self
            .store
            .update(name, |setting| {
                setting.value = value.clone();
                setting.is_default = is_default;
                setting.last_modified_at = now;
            })
            .await
            .or_raise(store_failed);
        let setting = match self.ctx.ledger().track("set_setting", updated).await? {
            Some(setting) => setting,
            None => exn::bail!(ErrorKind::NotFound(format!("setting `{name}`"))),
        };
        let changed = EventPayload::SettingChanged { name: name.to_string(), value };
        if let Ok(payload) = serde_json::to_value(&changed) {
            self.ctx.bus.publish(SETTINGS_TOPIC, payload);
        }
        Ok(setting)
    }

    /// Remove a setting. Returns `false` if there was none.
    ///
    /// # Errors
    /// [`Constraint`](ErrorKind::Constraint) for system settings.
    #[instrument(skip_all, fields(setting = %name))]
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let Some(setting) = self.store.get(name).await else {
            return Ok(false);
        };
        if setting.is_system {
            exn::bail!(ErrorKind::Constraint(format!("`{name}` is a system setting")));
        }
        let result = self.store.delete(name).await.or_raise(store_failed);
        self.ctx.ledger().track("delete_setting", result).await
    }

    pub async fn list(&self) -> Vec<Setting> {
        self.select(|_| true).await
    }

    pub async fn by_category(&self, category: &str) -> Vec<Setting> {
        self.select(|s| s.category == category).await
    }

    pub async fn defaults(&self) -> Vec<Setting> {
        self.select(|s| s.is_default).await
    }

    pub async fn custom(&self) -> Vec<Setting> {
        self.select(|s| s.is_custom).await
    }

    pub async fn system(&self) -> Vec<Setting> {
        self.select(|s| s.is_system).await
    }

    async fn select(&self, keep: impl Fn(&Setting) -> bool) -> Vec<Setting> {
        self.store.snapshot().await.into_values().filter(|s| keep(s)).collect()
    }

    pub async fn validate(&self, name: &str) -> Result<SettingCheck> {
        let setting = self.require(name).await?;
        Ok(SettingCheck {
            has_value: !setting.value.is_null(),
            has_default: !setting.default_value.is_null(),
            has_description: !setting.description.is_empty(),
            has_constraints: setting.constraints.count() > 0,
            is_valid: setting.setting_type.accepts(&setting.value) && setting.constraints.violation(&setting.value).is_none(),
        })
    }

    pub async fn stats(&self) -> SettingStats {
        let mut stats = SettingStats::default();
        for setting in self.store.snapshot().await.into_values() {
            stats.total += 1;
            stats.default += usize::from(setting.is_default);
            stats.custom += usize::from(setting.is_custom);
            stats.system += usize::from(setting.is_system);
            *stats.by_category.entry(setting.category).or_default() += 1;
            *stats.by_type.entry(setting.setting_type.to_string()).or_default() += 1;
            *stats.by_constraint_count.entry(ConstraintBucket::of(setting.constraints.count())).or_default() += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use rstest::rstest;
    use serde_json::json;

    fn fps_cap() -> NewSetting {
        NewSetting::new(SettingType::Int, json!(60))
            .category("graphics")
            .constraints(Constraints::typed(SettingType::Int).range(30.0, 240.0))
    }

    #[tokio::test]
    async fn test_out_of_range_value_is_refused() {
        let (_dir, ctx) = testing::context().await;
        let settings = SettingsManager::open(ctx).await.unwrap();
        settings.create("graphics.fps_cap", fps_cap()).await.unwrap();

        let err = settings.set("graphics.fps_cap", json!(500)).await.unwrap_err();
        assert!(err.is_constraint());
        assert_eq!(settings.value("graphics.fps_cap").await, Some(json!(60)));

        settings.set("graphics.fps_cap", json!(144)).await.unwrap();
        assert_eq!(settings.value("graphics.fps_cap").await, Some(json!(144)));
        let reset = settings.reset("graphics.fps_cap").await.unwrap();
        assert_eq!(reset.value, json!(60));
    }

    #[rstest]
    #[case::set_clears(false, false)]
    #[case::reset_restores(true, true)]
    #[tokio::test]
    async fn test_is_default_follows_writes(#[case] reset: bool, #[case] expected: bool) {
        let (_dir, ctx) = testing::context().await;
        let settings = SettingsManager::open(ctx).await.unwrap();
        let created = settings.create("graphics.fps_cap", fps_cap().default_setting()).await.unwrap();
        assert!(created.is_default);

        let changed = settings.set("graphics.fps_cap", json!(144)).await.unwrap();
        assert!(!changed.is_default);
        let after = match reset {
            true => settings.reset("graphics.fps_cap").await.unwrap(),
            false => settings.set("graphics.fps_cap", json!(120)).await.unwrap(),
        };
        assert_eq!(after.is_default, expected);
        assert_eq!(settings.get("graphics.fps_cap").await.unwrap().is_default, expected);
        assert_eq!(settings.defaults().await.len(), usize::from(expected));
    }

    #[tokio::test]
    async fn test_refused_writes_leave_no_ledger_entry() {
        let (_dir, ctx) = testing::context().await;
        let settings = SettingsManager::open(ctx.clone()).await.unwrap();
        settings.create("graphics.fps_cap", fps_cap()).await.unwrap();
        let _ = settings.set("graphics.fps_cap", json!(1)).await;
        assert!(ctx.errors.unresolved().await.is_empty());
    }

    #[rstest]
    #[case::wrong_type(Constraints::typed(SettingType::Int), json!("sixty"), false)]
    #[case::float_is_not_int(Constraints::typed(SettingType::Int), json!(60.5), false)]
    #[case::int_is_float(Constraints::typed(SettingType::Float), json!(60), true)]
    #[case::in_options(Constraints::default().options([json!("low"), json!("high")]), json!("high"), true)]
    #[case::not_in_options(Constraints::default().options([json!("low"), json!("high")]), json!("ultra"), false)]
    #[case::full_match(Constraints::default().pattern("[a-z]+"), json!("abc"), true)]
    #[case::partial_match(Constraints::default().pattern("[a-z]+"), json!("abc1"), false)]
    #[case::alternation_is_anchored(Constraints::default().pattern("a|b"), json!("ab"), false)]
    #[case::string_length(Constraints::default().range(2.0, 4.0), json!("abcde"), false)]
    #[case::bad_pattern(Constraints::default().pattern("("), json!("x"), false)]
    fn test_constraints(#[case] constraints: Constraints, #[case] value: Value, #[case] valid: bool) {
        assert_eq!(constraints.violation(&value).is_none(), valid);
    }

    #[tokio::test]
    async fn test_create_checks_initial_value() {
        let (_dir, ctx) = testing::context().await;
        let settings = SettingsManager::open(ctx).await.unwrap();
        let bad = NewSetting::new(SettingType::Int, json!(10)).constraints(Constraints::default().range(30.0, 240.0));
        assert!(settings.create("fps", bad).await.unwrap_err().is_constraint());
        assert!(settings.get("fps").await.is_none());
        settings.create("fps", fps_cap()).await.unwrap();
        assert!(settings.create("fps", fps_cap()).await.unwrap_err().is_constraint());
    }

    #[tokio::test]
    async fn test_system_settings_cannot_be_deleted() {
        let (_dir, ctx) = testing::context().await;
        let settings = SettingsManager::open(ctx).await.unwrap();
        settings.create("core.locale", NewSetting::new(SettingType::Str, json!("en")).system()).await.unwrap();
        settings.create("ui.theme", NewSetting::new(SettingType::Str, json!("dark")).custom()).await.unwrap();
        assert!(settings.delete("core.locale").await.unwrap_err().is_constraint());
        assert!(settings.delete("ui.theme").await.unwrap());
        assert!(!settings.delete("ui.theme").await.unwrap());
        assert_eq!(settings.system().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_and_queries() {
        let (_dir, ctx) = testing::context().await;
        let settings = SettingsManager::open(ctx).await.unwrap();
        settings.create("graphics.fps_cap", fps_cap().default_setting()).await.unwrap();
        settings.create("audio.volume", NewSetting::new(SettingType::Float, json!(0.8)).category("audio")).await.unwrap();

        let stats = settings.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.default, 1);
        assert_eq!(stats.by_category.get("graphics"), Some(&1));
        // type only
        assert_eq!(stats.by_constraint_count.get(&ConstraintBucket::Few), Some(&1));
        // type, min, max
        assert_eq!(stats.by_constraint_count.get(&ConstraintBucket::Several), Some(&1));
        assert_eq!(settings.by_category("audio").await[0].name, "audio.volume");

        let check = settings.validate("graphics.fps_cap").await.unwrap();
        assert!(check.is_valid && check.has_constraints && !check.has_description);
        assert!(settings.validate("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let (_dir, ctx) = testing::context().await;
        let mut rx = ctx.bus.subscribe(SETTINGS_TOPIC);
        let settings = SettingsManager::open(ctx).await.unwrap();
        settings.create("graphics.fps_cap", fps_cap()).await.unwrap();
        settings.set("graphics.fps_cap", json!(120)).await.unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.payload, json!({ "type": "setting_changed", "name": "graphics.fps_cap", "value": 120 }));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let (_dir, ctx) = testing::context().await;
        let created = SettingsManager::open(ctx.clone()).await.unwrap().create("graphics.fps_cap", fps_cap()).await.unwrap();
        let reopened = SettingsManager::open(ctx).await.unwrap();
        assert_eq!(reopened.get("graphics.fps_cap").await, Some(created));
    }
}
