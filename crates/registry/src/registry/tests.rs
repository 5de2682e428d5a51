use super::*;
use crate::Registries;
use crate::kind::{ArtifactKind, Model, Scene, Texture};
use crate::testing::{self, cube_glb, png};
use futures::TryStreamExt;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use wold_codec::document::Component;
use wold_storage::HashIndex;

async fn models() -> (TempDir, ArtifactRegistry<Model>) {
    let (dir, ctx) = testing::context().await;
    let models = ArtifactRegistry::<Model>::open(ctx).await.unwrap();
    (dir, models)
}

#[tokio::test]
async fn test_register_cube() {
    let (dir, models) = models().await;
    let bytes = cube_glb();
    let path = testing::write(&dir, "models/cube.glb", &bytes);

    let registered = models.register(&path, RegisterOptions::default()).await.unwrap();
    assert_eq!(registered.outcome, Outcome::Created);
    let record = registered.record;
    assert_eq!(record.common.name, "cube");
    assert_eq!(record.common.kind, "model");
    assert_eq!(record.common.format, "glb");
    assert_eq!(record.common.size_bytes, 2048);
    assert_eq!(record.common.content_hash, HashIndex::hash_bytes(&bytes));
    assert_eq!(record.common.source_path, PathBuf::from("models/cube.glb"));
    assert_eq!(record.attributes.vertex_count, 8);
    assert_eq!(record.attributes.face_count, 12);
    assert_eq!(record.attributes.material_count, 1);
    assert_eq!(record.attributes.animation_count, 0);
    assert_eq!(record.attributes.lod_level, None);
    assert_eq!(record.attributes.bounds.min, [-1.0, -1.0, -1.0]);
    assert_eq!(record.attributes.bounds.max, [1.0, 1.0, 1.0]);
    assert_eq!(models.get("cube").await, Some(record));
}

#[tokio::test]
async fn test_registration_is_announced() {
    let (dir, models) = models().await;
    let mut notices = models.context().bus.subscribe(REGISTERED_TOPIC);
    let path = testing::write(&dir, "models/cube.glb", &cube_glb());
    models.register(&path, RegisterOptions::default()).await.unwrap();
    models.register(&path, RegisterOptions::default()).await.unwrap();

    let first = notices.recv().await.unwrap().payload;
    assert_eq!(first, json!({ "type": "asset_registered", "kind": "model", "name": "cube", "outcome": "created" }));
    let second = notices.recv().await.unwrap().payload;
    assert_eq!(second["outcome"], "unchanged");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_of_one_name() {
    let (dir, models) = models().await;
    let models = Arc::new(models);
    let path = testing::write(&dir, "models/cube.glb", &cube_glb());
    let tasks = (0..8).map(|_| {
        let (models, path) = (models.clone(), path.clone());
        tokio::spawn(async move { models.register(&path, RegisterOptions::default()).await })
    });
    let mut outcomes = Vec::new();
    for task in futures::future::join_all(tasks).await {
        outcomes.push(task.unwrap().unwrap().outcome);
    }

    assert_eq!(outcomes.iter().filter(|o| **o == Outcome::Created).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| **o == Outcome::Unchanged).count(), 7);
    assert_eq!(models.len().await, 1);
    assert!(models.context().errors.unresolved().await.is_empty());
}

#[tokio::test]
async fn test_unchanged_file_only_moves_timestamp() {
    let (dir, models) = models().await;
    let path = testing::write(&dir, "models/cube.glb", &cube_glb());
    let first = models.register(&path, RegisterOptions::default()).await.unwrap().record;
    let again = models.register(&path, RegisterOptions::default()).await.unwrap();
    assert_eq!(again.outcome, Outcome::Unchanged);

    let mut second = again.record;
    assert!(second.common.last_modified_at >= first.common.last_modified_at);
    second.common.last_modified_at = first.common.last_modified_at;
    assert_eq!(second, first);
}

#[tokio::test]
async fn test_changed_file_keeps_created_at() {
    let (dir, models) = models().await;
    let path = testing::write(&dir, "models/cube.obj", b"v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n");
    let first = models.register(&path, RegisterOptions::default()).await.unwrap().record;
    std::fs::write(&path, b"v 0 0 0\nv 1 0 0\nv 0 1 0\nv 1 1 0\nf 1 2 3\nf 2 4 3\n").unwrap();

    let updated = models.register(&path, RegisterOptions::default()).await.unwrap();
    assert_eq!(updated.outcome, Outcome::Updated);
    assert_eq!(updated.record.common.created_at, first.common.created_at);
    assert_ne!(updated.record.common.content_hash, first.common.content_hash);
    assert_eq!(updated.record.attributes.face_count, 2);
}

#[tokio::test]
async fn test_register_failures() {
    let (dir, models) = models().await;
    let missing = dir.path().canonicalize().unwrap().join("models/none.glb");
    assert!(models.register(&missing, RegisterOptions::default()).await.unwrap_err().is_not_found());

    let wrong = testing::write(&dir, "models/notes.txt", b"not a model");
    let err = models.register(&wrong, RegisterOptions::default()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Decode(_)));

    let broken = testing::write(&dir, "models/broken.glb", b"glTF\x02\x00\x00\x00");
    let err = models.register(&broken, RegisterOptions::default()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Decode(_)));
    assert!(models.is_empty().await);

    // decode failures go to the ledger, not-found doesn't
    let errors = models.context().errors.unresolved().await;
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.error_type == "DECODE"));
}

#[tokio::test]
async fn test_validate_reports_drift_and_missing_source() {
    let (dir, models) = models().await;
    let path = testing::write(&dir, "models/cube.glb", &cube_glb());
    models.register(&path, RegisterOptions::default()).await.unwrap();
    assert!(models.validate("cube").await.unwrap().is_valid());

    let mut changed = cube_glb();
    changed[2047] = b'\x01';
    std::fs::write(&path, &changed).unwrap();
    let report = models.validate("cube").await.unwrap();
    assert!(report.exists);
    assert!(!report.hash_matches);
    assert!(matches!(report.warnings[0], ValidationWarning::HashDrift { .. }));

    std::fs::remove_file(&path).unwrap();
    let report = models.validate("cube").await.unwrap();
    assert!(!report.exists);
    assert_eq!(report.warnings, vec![ValidationWarning::MissingSource { path: PathBuf::from("models/cube.glb") }]);

    assert!(models.validate("sphere").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_dependency_cycle_is_flagged() {
    let (dir, models) = models().await;
    let a = testing::write(&dir, "models/a.glb", &cube_glb());
    let b = testing::write(&dir, "models/b.glb", &cube_glb());

    models.register(&a, RegisterOptions::default().depends_on(["b"])).await.unwrap();
    let second = models.register(&b, RegisterOptions::default().depends_on(["a"])).await.unwrap();
    assert_eq!(second.warnings.len(), 1);

    let graph = &models.context().graph;
    assert!(graph.get("b").await.unwrap().is_circular);
    assert!(graph.get("a").await.unwrap().is_circular);
    assert!(models.validate("a").await.unwrap().has_circular());
}

#[tokio::test]
async fn test_missing_dependency_is_a_warning() {
    let (dir, models) = models().await;
    let path = testing::write(&dir, "models/cube.glb", &cube_glb());
    models.register(&path, RegisterOptions::default().depends_on(["steel"])).await.unwrap();
    let report = models.validate("cube").await.unwrap();
    assert_eq!(report.warnings, vec![ValidationWarning::MissingDependency { name: "steel".to_string() }]);
}

#[tokio::test]
async fn test_delete_refuses_while_required() {
    let (dir, models) = models().await;
    let base = testing::write(&dir, "models/base.glb", &cube_glb());
    let top = testing::write(&dir, "models/top.glb", &cube_glb());
    models.register(&base, RegisterOptions::default()).await.unwrap();
    models.register(&top, RegisterOptions::default().depends_on(["base"])).await.unwrap();

    assert!(models.delete("base").await.unwrap_err().is_constraint());
    assert!(models.contains("base").await);
    assert!(models.delete("top").await.unwrap());
    assert!(models.delete("base").await.unwrap());
    assert!(!models.delete("base").await.unwrap());
    assert!(models.context().graph.get("base").await.is_none());
}

#[tokio::test]
async fn test_update_keeps_identity() {
    let (dir, models) = models().await;
    let path = testing::write(&dir, "models/cube.glb", &cube_glb());
    models.register(&path, RegisterOptions::default()).await.unwrap();
    let updated = models
        .update("cube", |record| {
            record.common.name = "renamed".to_string();
            record.common.version = "2.0.0".to_string();
        })
        .await
        .unwrap();
    assert_eq!(updated.common.name, "cube");
    assert_eq!(updated.common.version, "2.0.0");
    assert!(models.update("sphere", |_| {}).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_set_parameter_on_binary_kind() {
    let (dir, models) = models().await;
    let path = testing::write(&dir, "models/cube.glb", &cube_glb());
    models.register(&path, RegisterOptions::default()).await.unwrap();
    let record = models.set_parameter("cube", "scale", json!(2.5)).await.unwrap();
    assert_eq!(record.common.parameters["scale"], json!(2.5));
    // the next registration of the same file keeps it
    let again = models.register(&path, RegisterOptions::default()).await.unwrap();
    assert_eq!(again.record.common.parameters["scale"], json!(2.5));
}

#[tokio::test]
async fn test_authored_scene_lifecycle() {
    let (_dir, ctx) = testing::context().await;
    let scenes = ArtifactRegistry::<Scene>::open(ctx).await.unwrap();

    let created = scenes.create("plaza", Template::default()).await.unwrap();
    assert_eq!(created.outcome, Outcome::Created);
    assert_eq!(created.record.common.source_path, PathBuf::from("scenes/data/plaza.json"));
    assert!(!created.record.attributes.has_scripts);
    assert!(scenes.create("plaza", Template::default()).await.unwrap_err().is_constraint());

    let scripted = scenes.add_component("plaza", &Component::Script { name: "doors".into() }).await.unwrap();
    assert!(scripted.record.attributes.has_scripts);
    assert_eq!(scripted.record.common.created_at, created.record.common.created_at);

    let err = scenes.add_component("plaza", &Component::Texture { slot: "normal".into(), name: "n".into() }).await;
    assert!(err.unwrap_err().is_constraint());

    let record = scenes.set_parameter("plaza", "gravity", json!(-9.8)).await.unwrap();
    assert_eq!(record.common.parameters["gravity"], json!(-9.8));
    let (_, bytes) = scenes.read_source("plaza").await.unwrap();
    let doc = document::parse(&bytes).unwrap();
    assert_eq!(doc["parameters"]["gravity"], json!(-9.8));
}

#[tokio::test]
async fn test_scene_dependencies_reach_graph() {
    let (dir, ctx) = testing::context().await;
    let scenes = ArtifactRegistry::<Scene>::open(ctx.clone()).await.unwrap();
    let models = ArtifactRegistry::<Model>::open(ctx.clone()).await.unwrap();
    let path = testing::write(&dir, "models/cube.glb", &cube_glb());
    models.register(&path, RegisterOptions::default()).await.unwrap();

    scenes.create("plaza", Template::default()).await.unwrap();
    scenes.add_component("plaza", &Component::Mesh { name: "cube".into() }).await.unwrap();
    assert_eq!(ctx.graph.dependents("cube", false).await, vec!["plaza".to_string()]);
    assert!(models.delete("cube").await.unwrap_err().is_constraint());
}

#[tokio::test]
async fn test_create_rejects_bad_names() {
    let (_dir, ctx) = testing::context().await;
    let scenes = ArtifactRegistry::<Scene>::open(ctx).await.unwrap();
    for name in ["", "../escape", ".hidden"] {
        assert!(scenes.create(name, Template::default()).await.unwrap_err().is_constraint(), "{name}");
    }
}

#[tokio::test]
async fn test_scan_registers_and_skips() {
    let (dir, ctx) = testing::context().await;
    let textures = ArtifactRegistry::<Texture>::open(ctx).await.unwrap();
    testing::write(&dir, "textures/sky.png", &png(4, 4));
    testing::write(&dir, "textures/ui/button.png", &png(2, 2));
    testing::write(&dir, "textures/readme.txt", b"hello");
    testing::write(&dir, "textures/broken.png", b"not a png");

    let events: Vec<ScanEvent> = textures.scan().try_collect().await.unwrap();
    assert_eq!(events.first(), Some(&ScanEvent::Started));
    assert_eq!(events.last(), Some(&ScanEvent::Complete { registered: 2, skipped: 2 }));
    assert!(textures.contains("sky").await);
    assert!(textures.contains("button").await);

    // the metadata document written by the scan isn't picked up the next time
    let again: Vec<ScanEvent> = textures.scan().try_collect().await.unwrap();
    assert_eq!(again.last(), Some(&ScanEvent::Complete { registered: 2, skipped: 2 }));
    let unchanged = again.iter().filter(|e| matches!(e, ScanEvent::Registered { outcome: Outcome::Unchanged, .. }));
    assert_eq!(unchanged.count(), 2);
}

#[tokio::test]
async fn test_stats() {
    let (dir, ctx) = testing::context().await;
    let textures = ArtifactRegistry::<Texture>::open(ctx).await.unwrap();
    let sky = testing::write(&dir, "textures/sky.png", &png(8, 4));
    let odd = testing::write(&dir, "textures/odd.png", &png(3, 3));
    textures.register(&sky, RegisterOptions::default()).await.unwrap();
    textures.register(&odd, RegisterOptions::default().depends_on(["sky"])).await.unwrap();

    let stats = textures.stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_format.get("png"), Some(&2));
    assert_eq!(stats.features.get("has_alpha"), Some(&2));
    assert_eq!(stats.groups["power_of_two"].get("true"), Some(&1));
    assert_eq!(stats.by_dependency_count.get(&DependencyBucket::Few), Some(&1));

    let report = textures.validate("odd").await.unwrap();
    assert_eq!(report.warnings, vec![ValidationWarning::Content { message: "3x3 is not a power of two".into() }]);
}

#[tokio::test]
async fn test_any_registry_by_kind() {
    let (dir, ctx) = testing::context().await;
    let registries = Arc::new(Registries::open(&ctx).await.unwrap());
    let path = testing::write(&dir, "models/cube.glb", &cube_glb());

    let models = registries.get(ArtifactKind::Model);
    assert_eq!(models.kind(), "model");
    let registered = models.register(&path, RegisterOptions::default()).await.unwrap();
    assert_eq!(registered["outcome"], "created");
    assert_eq!(registered["record"]["vertex_count"], 8);
    assert_eq!(models.get("cube").await.unwrap().unwrap()["format"], "glb");
    assert_eq!(models.list().await.unwrap().len(), 1);
    assert!(registries.get(ArtifactKind::Texture).get("cube").await.unwrap().is_none());
    assert_eq!(registries.all().count(), ArtifactKind::ALL.len());
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let (dir, ctx) = testing::context().await;
    let path = testing::write(&dir, "models/cube.glb", &cube_glb());
    let first = ArtifactRegistry::<Model>::open(ctx.clone()).await.unwrap();
    first.register(&path, RegisterOptions::default()).await.unwrap();
    let snapshot = first.list().await;

    let reopened = ArtifactRegistry::<Model>::open(ctx).await.unwrap();
    assert_eq!(reopened.list().await, snapshot);
}

#[test]
fn test_merge_keeps_order_and_drops_duplicates() {
    let merged = merge(vec!["a".into(), "b".into(), String::new()], vec!["b".into(), "c".into()]);
    assert_eq!(merged, vec!["a", "b", "c"]);
}
