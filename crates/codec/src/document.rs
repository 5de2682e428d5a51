//! JSON-authored artifacts: scenes, prefabs, effects, configs, materials,
//! states and events.
//!
//! Documents are kept as plain JSON objects so keys this crate doesn't know
//! about survive a rewrite. Every document may carry `name`, `version` and a
//! `parameters` object; the rest is per kind. A `has_*` flag is set when the
//! matching section is present and non-empty.

use crate::Decoded;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use wold_metadata::models::{
    ConfigAttributes, EffectAttributes, EventAttributes, MaterialAttributes, PrefabAttributes, SceneAttributes,
    StateAttributes,
};

pub type Document = Map<String, Value>;

pub const FORMATS: &[&str] = &["json"];

/// Material map slots, in the order their textures are listed.
pub const MAP_SLOTS: &[&str] = &["texture", "normal", "roughness", "metalness", "emission", "ao"];

/// A sub-element attached to a composite document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "component", rename_all = "snake_case")]
pub enum Component {
    Script { name: String },
    Mesh { name: String },
    Material { name: String },
    Animation { name: String },
    Shader { name: String },
    Texture { slot: String, name: String },
    Object {
        name: String,
        #[serde(default)]
        data: Map<String, Value>,
    },
}
impl Component {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Script { .. } => "script",
            Self::Mesh { .. } => "mesh",
            Self::Material { .. } => "material",
            Self::Animation { .. } => "animation",
            Self::Shader { .. } => "shader",
            Self::Texture { .. } => "texture",
            Self::Object { .. } => "object",
        }
    }
}

/// Attributes read from a JSON-authored document.
pub trait Authored: Sized {
    /// Sections a freshly created document starts with.
    fn skeleton() -> Document;

    fn read(doc: &Document) -> Self;

    fn dependencies(&self, _doc: &Document) -> Vec<String> {
        Vec::new()
    }

    /// Attach `component`, returning `false` when this kind has no place
    /// for it.
    fn attach(_doc: &mut Document, _component: &Component) -> bool {
        false
    }
}

/// What [`create()`] needs beyond the name.
#[derive(Debug, Clone, Default)]
pub struct Template {
    pub version: Option<String>,
    /// Written as the document's `type`.
    pub doc_type: Option<String>,
    pub parameters: Map<String, Value>,
    /// Overrides applied on top of the kind's skeleton.
    pub fields: Map<String, Value>,
}

pub fn parse(bytes: &[u8]) -> Result<Document> {
    match serde_json::from_slice(bytes).or_raise(|| ErrorKind::malformed("JSON document"))? {
        Value::Object(doc) => Ok(doc),
        _ => exn::bail!(ErrorKind::malformed("JSON document: top level is not an object")),
    }
}

pub fn to_bytes(doc: &Document) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(doc).or_raise(|| ErrorKind::Encode("JSON document"))
}

pub fn decode<A: Authored>(bytes: &[u8]) -> Result<Decoded<A>> {
    let doc = parse(bytes)?;
    Ok(read(&doc))
}

pub fn read<A: Authored>(doc: &Document) -> Decoded<A> {
    let attributes = A::read(doc);
    let dependencies = attributes.dependencies(doc);
    Decoded {
        attributes,
        parameters: doc.get("parameters").and_then(Value::as_object).cloned().unwrap_or_default(),
        version: match doc.get("version") {
            Some(Value::String(v)) => Some(v.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        },
        dependencies,
    }
}

/// A new document for `A`, named `name`.
pub fn create<A: Authored>(name: &str, template: Template) -> Document {
    let mut doc = Document::new();
    doc.insert("name".into(), name.into());
    doc.insert(
        "version".into(),
        template.version.unwrap_or_else(|| wold_metadata::models::DEFAULT_VERSION.to_string()).into(),
    );
    if let Some(doc_type) = template.doc_type {
        doc.insert("type".into(), doc_type.into());
    }
    doc.insert("parameters".into(), Value::Object(template.parameters));
    doc.extend(A::skeleton());
    doc.extend(template.fields);
    doc
}

pub fn add_component<A: Authored>(doc: &mut Document, component: &Component) -> Result<()> {
    match A::attach(doc, component) {
        true => Ok(()),
        false => exn::bail!(ErrorKind::InvalidArgument(format!(
            "a {} component does not fit this document",
            component.label()
        ))),
    }
}

pub fn set_parameter(doc: &mut Document, key: &str, value: Value) {
    let parameters = doc.entry("parameters").or_insert_with(|| Value::Object(Map::new()));
    if !parameters.is_object() {
        *parameters = Value::Object(Map::new());
    }
    if let Value::Object(map) = parameters {
        map.insert(key.to_string(), value);
    }
}

fn filled(doc: &Document, key: &str) -> bool {
    match doc.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::Object(o)) => !o.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(_)) => true,
    }
}

fn any_filled(doc: &Document, keys: &[&str]) -> bool {
    keys.iter().any(|k| filled(doc, k))
}

/// The first boolean found under any of `keys`.
fn flag(doc: &Document, keys: &[&str], default: bool) -> bool {
    keys.iter().find_map(|k| doc.get(*k).and_then(Value::as_bool)).unwrap_or(default)
}

fn number(doc: &Document, keys: &[&str]) -> f64 {
    keys.iter().find_map(|k| doc.get(*k).and_then(Value::as_f64)).unwrap_or_default()
}

fn string(doc: &Document, key: &str) -> String {
    doc.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Name of a reference that is either a bare string or an object with a
/// `name`.
fn reference(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(o) => o.get("name").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn names(doc: &Document, key: &str) -> Vec<String> {
    match doc.get(key) {
        Some(Value::Array(items)) => items.iter().filter_map(reference).collect(),
        Some(single @ (Value::String(_) | Value::Object(_))) => reference(single).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn dedup(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

/// Append to the array at `key`, unless an equal reference is already there.
fn push_reference(doc: &mut Document, key: &str, value: Value) {
    let slot = doc.entry(key).or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    if let Value::Array(items) = slot {
        let name = reference(&value);
        if name.is_none() || !items.iter().any(|i| reference(i) == name) {
            items.push(value);
        }
    }
}

impl Authored for SceneAttributes {
    fn skeleton() -> Document {
        let Value::Object(doc) = json!({
            "environment": {}, "lighting": {}, "physics": {}, "audio": {},
            "scripts": [], "objects": [], "dependencies": [],
        }) else {
            return Document::new();
        };
        doc
    }

    fn read(doc: &Document) -> Self {
        Self {
            has_environment: filled(doc, "environment"),
            has_lighting: filled(doc, "lighting"),
            has_physics: filled(doc, "physics"),
            has_audio: filled(doc, "audio"),
            has_scripts: filled(doc, "scripts"),
            objects: names(doc, "objects"),
            dependencies: names(doc, "dependencies"),
        }
    }

    fn dependencies(&self, _doc: &Document) -> Vec<String> {
        self.dependencies.clone()
    }

    fn attach(doc: &mut Document, component: &Component) -> bool {
        match component {
            Component::Script { name } => push_reference(doc, "scripts", name.as_str().into()),
            Component::Object { name, data } => {
                let mut object = data.clone();
                object.insert("name".into(), name.as_str().into());
                push_reference(doc, "objects", Value::Object(object));
            },
            Component::Mesh { name } | Component::Material { name } | Component::Animation { name } => {
                push_reference(doc, "dependencies", name.as_str().into())
            },
            Component::Shader { .. } | Component::Texture { .. } => return false,
        }
        true
    }
}

impl Authored for PrefabAttributes {
    fn skeleton() -> Document {
        let Value::Object(doc) = json!({
            "mesh": {}, "materials": [], "animations": [], "physics": {},
            "scripts": [], "dependencies": [],
        }) else {
            return Document::new();
        };
        doc
    }

    fn read(doc: &Document) -> Self {
        let dependencies = dedup(
            names(doc, "dependencies")
                .into_iter()
                .chain(names(doc, "mesh"))
                .chain(names(doc, "materials"))
                .chain(names(doc, "animations")),
        );
        Self {
            has_mesh: filled(doc, "mesh"),
            has_materials: filled(doc, "materials"),
            has_animations: filled(doc, "animations"),
            has_physics: filled(doc, "physics"),
            has_scripts: filled(doc, "scripts"),
            dependencies,
        }
    }

    fn dependencies(&self, _doc: &Document) -> Vec<String> {
        self.dependencies.clone()
    }

    fn attach(doc: &mut Document, component: &Component) -> bool {
        match component {
            Component::Mesh { name } => {
                doc.insert("mesh".into(), json!({ "name": name }));
            },
            Component::Material { name } => push_reference(doc, "materials", name.as_str().into()),
            Component::Animation { name } => push_reference(doc, "animations", name.as_str().into()),
            Component::Script { name } => push_reference(doc, "scripts", name.as_str().into()),
            _ => return false,
        }
        true
    }
}

impl Authored for EffectAttributes {
    fn skeleton() -> Document {
        let Value::Object(doc) = json!({
            "duration": 0.0, "loop": false, "shaders": [], "textures": [],
            "particles": {}, "lighting": {}, "post_processing": {},
        }) else {
            return Document::new();
        };
        doc
    }

    fn read(doc: &Document) -> Self {
        Self {
            duration_s: number(doc, &["duration_s", "duration"]),
            is_looping: flag(doc, &["is_looping", "isLooping", "loop"], false),
            has_particles: filled(doc, "particles"),
            has_lighting: filled(doc, "lighting"),
            has_post_processing: any_filled(doc, &["post_processing", "postProcessing"]),
            shaders: names(doc, "shaders"),
            textures: names(doc, "textures"),
        }
    }

    fn dependencies(&self, _doc: &Document) -> Vec<String> {
        dedup(self.shaders.iter().chain(&self.textures).cloned())
    }

    fn attach(doc: &mut Document, component: &Component) -> bool {
        match component {
            Component::Shader { name } => push_reference(doc, "shaders", name.as_str().into()),
            Component::Texture { slot, name } => push_reference(doc, "textures", json!({ "name": name, "type": slot })),
            _ => return false,
        }
        true
    }
}

impl Authored for ConfigAttributes {
    fn skeleton() -> Document {
        ["graphics", "audio", "input", "network", "physics", "ui"]
            .into_iter()
            .map(|section| (section.to_string(), Value::Object(Map::new())))
            .collect()
    }

    fn read(doc: &Document) -> Self {
        Self {
            config_type: string(doc, "type"),
            has_graphics: filled(doc, "graphics"),
            has_audio: filled(doc, "audio"),
            has_input: filled(doc, "input"),
            has_network: filled(doc, "network"),
            has_physics: filled(doc, "physics"),
            has_ui: filled(doc, "ui"),
        }
    }
}

impl Authored for MaterialAttributes {
    fn skeleton() -> Document {
        let Value::Object(doc) = json!({ "transparent": false, "maps": {} }) else {
            return Document::new();
        };
        doc
    }

    fn read(doc: &Document) -> Self {
        let empty = Map::new();
        let maps = doc.get("maps").and_then(Value::as_object).unwrap_or(&empty);
        let material_type = string(doc, "type");
        let alpha = doc.get("base_color").and_then(|c| c.get(3)).and_then(Value::as_f64).unwrap_or(1.0);
        let textures = MAP_SLOTS.iter().filter_map(|slot| maps.get(*slot).and_then(reference)).collect();
        Self {
            is_pbr: material_type.eq_ignore_ascii_case("pbr") || flag(doc, &["is_pbr", "pbr"], false),
            is_transparent: flag(doc, &["transparent", "is_transparent"], false) || alpha < 1.0,
            has_texture_map: filled(maps, "texture"),
            has_normal_map: filled(maps, "normal"),
            has_roughness_map: filled(maps, "roughness"),
            has_metalness_map: filled(maps, "metalness"),
            has_emission_map: filled(maps, "emission"),
            has_ao_map: filled(maps, "ao"),
            material_type,
            textures,
        }
    }

    fn dependencies(&self, doc: &Document) -> Vec<String> {
        dedup(self.textures.iter().cloned().chain(names(doc, "shader")))
    }

    fn attach(doc: &mut Document, component: &Component) -> bool {
        match component {
            Component::Texture { slot, name } if MAP_SLOTS.contains(&slot.as_str()) => {
                let maps = doc.entry("maps").or_insert_with(|| Value::Object(Map::new()));
                if !maps.is_object() {
                    *maps = Value::Object(Map::new());
                }
                if let Value::Object(maps) = maps {
                    maps.insert(slot.clone(), name.as_str().into());
                }
            },
            Component::Shader { name } => {
                doc.insert("shader".into(), name.as_str().into());
            },
            _ => return false,
        }
        true
    }
}

impl Authored for StateAttributes {
    fn skeleton() -> Document {
        let Value::Object(doc) = json!({
            "persistent": true, "volatile": false, "shared": false,
            "value": null, "dependencies": [],
        }) else {
            return Document::new();
        };
        doc
    }

    fn read(doc: &Document) -> Self {
        Self {
            state_type: string(doc, "type"),
            is_persistent: flag(doc, &["persistent", "is_persistent"], true),
            is_volatile: flag(doc, &["volatile", "is_volatile"], false),
            is_shared: flag(doc, &["shared", "is_shared"], false),
            dependencies: names(doc, "dependencies"),
            value: doc.get("value").cloned().unwrap_or_default(),
        }
    }

    fn dependencies(&self, _doc: &Document) -> Vec<String> {
        self.dependencies.clone()
    }
}

/// Trigger bookkeeping isn't part of the document; the registry carries it
/// over from the previous record.
impl Authored for EventAttributes {
    fn skeleton() -> Document {
        let Value::Object(doc) = json!({ "async": false, "broadcast": false, "handlers": [] }) else {
            return Document::new();
        };
        doc
    }

    fn read(doc: &Document) -> Self {
        Self {
            event_type: string(doc, "type"),
            is_async: flag(doc, &["async", "is_async"], false),
            is_broadcast: flag(doc, &["broadcast", "is_broadcast"], false),
            handlers: names(doc, "handlers"),
            trigger_count: 0,
            last_triggered_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_new_scene_has_no_sections() {
        let doc = create::<SceneAttributes>("plaza", Template::default());
        let decoded = read::<SceneAttributes>(&doc);
        assert_eq!(decoded.version.as_deref(), Some("1.0"));
        assert!(!decoded.attributes.has_environment);
        assert!(!decoded.attributes.has_scripts);
        assert!(decoded.dependencies.is_empty());
    }

    #[test]
    fn test_scene_flags_follow_content() {
        let doc = parse(
            br#"{"name":"plaza","version":2,"environment":{"sky":"dusk"},"lighting":{},
                "objects":[{"name":"fountain"},"bench"],"dependencies":["fountain_model"],
                "parameters":{"gravity":-9.8},"editor":{"zoom":3}}"#,
        )
        .unwrap();
        let decoded = read::<SceneAttributes>(&doc);
        assert!(decoded.attributes.has_environment);
        assert!(!decoded.attributes.has_lighting);
        assert_eq!(decoded.attributes.objects, ["fountain", "bench"]);
        assert_eq!(decoded.dependencies, ["fountain_model"]);
        assert_eq!(decoded.version.as_deref(), Some("2"));
        assert_eq!(decoded.parameters["gravity"], json!(-9.8));
    }

    #[test]
    fn test_prefab_components_become_dependencies() {
        let mut doc = create::<PrefabAttributes>("chair", Template::default());
        add_component::<PrefabAttributes>(&mut doc, &Component::Mesh { name: "chair_mesh".into() }).unwrap();
        add_component::<PrefabAttributes>(&mut doc, &Component::Material { name: "oak".into() }).unwrap();
        add_component::<PrefabAttributes>(&mut doc, &Component::Material { name: "oak".into() }).unwrap();
        let decoded = read::<PrefabAttributes>(&doc);
        assert!(decoded.attributes.has_mesh);
        assert!(decoded.attributes.has_materials);
        assert!(!decoded.attributes.has_animations);
        assert_eq!(decoded.dependencies, ["chair_mesh", "oak"]);
    }

    #[rstest]
    #[case(Component::Shader { name: "s".into() })]
    #[case(Component::Texture { slot: "albedo".into(), name: "t".into() })]
    fn test_prefab_rejects_foreign_components(#[case] component: Component) {
        let mut doc = create::<PrefabAttributes>("chair", Template::default());
        let err = add_component::<PrefabAttributes>(&mut doc, &component).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidArgument(_)));
    }

    #[test]
    fn test_effect_accepts_legacy_keys() {
        let doc = parse(
            br#"{"duration":1.5,"isLooping":true,"postProcessing":{"bloom":1},
                "shaders":[{"path":"x","name":"glow"}],"textures":["spark"]}"#,
        )
        .unwrap();
        let decoded = read::<EffectAttributes>(&doc);
        assert_eq!(decoded.attributes.duration_s, 1.5);
        assert!(decoded.attributes.is_looping);
        assert!(decoded.attributes.has_post_processing);
        assert_eq!(decoded.dependencies, ["glow", "spark"]);
    }

    #[test]
    fn test_material_maps() {
        let mut doc = create::<MaterialAttributes>(
            "brick",
            Template { doc_type: Some("PBR".into()), ..Default::default() },
        );
        add_component::<MaterialAttributes>(&mut doc, &Component::Texture { slot: "normal".into(), name: "brick_n".into() })
            .unwrap();
        add_component::<MaterialAttributes>(&mut doc, &Component::Texture { slot: "texture".into(), name: "brick_c".into() })
            .unwrap();
        let bad = add_component::<MaterialAttributes>(&mut doc, &Component::Texture { slot: "gloss".into(), name: "g".into() });
        assert!(bad.is_err());
        let decoded = read::<MaterialAttributes>(&doc);
        assert!(decoded.attributes.is_pbr);
        assert!(decoded.attributes.has_normal_map);
        assert!(!decoded.attributes.has_ao_map);
        assert_eq!(decoded.attributes.textures, ["brick_c", "brick_n"]);
    }

    #[test]
    fn test_translucent_base_color() {
        let doc = parse(br#"{"base_color":[1,1,1,0.5]}"#).unwrap();
        assert!(read::<MaterialAttributes>(&doc).attributes.is_transparent);
    }

    #[test]
    fn test_state_defaults_to_persistent() {
        let doc = create::<StateAttributes>(
            "score",
            Template {
                doc_type: Some("counter".into()),
                fields: [("value".to_string(), json!(0))].into_iter().collect(),
                ..Default::default()
            },
        );
        let state = read::<StateAttributes>(&doc).attributes;
        assert!(state.is_persistent);
        assert_eq!(state.state_type, "counter");
        assert_eq!(state.value, json!(0));
    }

    #[test]
    fn test_set_parameter_repairs_non_object() {
        let mut doc = parse(br#"{"parameters":[1,2]}"#).unwrap();
        set_parameter(&mut doc, "speed", json!(3));
        assert_eq!(doc["parameters"], json!({"speed": 3}));
    }

    #[test]
    fn test_top_level_array_is_malformed() {
        let err = decode::<ConfigAttributes>(b"[]").unwrap_err();
        assert!(matches!(&*err, ErrorKind::Malformed(_)));
    }
}
