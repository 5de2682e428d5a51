//! Directed graph of which artifact needs which.
//!
//! Each registered node lists the names it depends on. Names that are
//! referenced but not registered are kept as placeholders: they show up in
//! `validate` as missing and can be registered later without touching the
//! nodes that point at them. Cycles are allowed when they come from
//! `register` (the node is flagged and a warning returned) but refused when
//! they would come from `add_edge`.
//!
//! The graph is persisted as a metadata store of kind `dependency`, one
//! record per registered node, and rebuilt from it on open.

mod arena;
pub mod error;
mod model;

pub use crate::arena::NodeInfo;
pub use crate::model::{DependencyBucket, DependencyRecord, GraphStats, GraphValidation, Registration};

use crate::arena::Arena;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use tokio::sync::RwLock;
use tracing::instrument;
use wold_metadata::MetadataStore;
use wold_storage::BackendHandle;

/// Kind under which the graph is stored.
pub const KIND: &str = "dependency";

#[derive(Debug)]
pub struct DependencyGraph {
    arena: RwLock<Arena>,
    store: MetadataStore<DependencyRecord>,
}

impl DependencyGraph {
    #[instrument(skip_all)]
    pub async fn open(backend: BackendHandle) -> Result<Self> {
        let store = MetadataStore::open(backend, KIND).await.or_raise(|| ErrorKind::Store)?;
        let arena = Arena::from_records(store.snapshot().await.values());
        Ok(Self { arena: RwLock::new(arena), store })
    }

    /// Apply `change` to a copy of the graph, persist the result and only
    /// then make it visible.
    async fn mutate<T>(&self, change: impl FnOnce(&mut Arena) -> Result<T>) -> Result<T> {
        let mut arena = self.arena.write().await;
        let mut staged = arena.clone();
        let out = change(&mut staged)?;
        staged.recompute_cycles();
        self.store.replace(staged.records()).await.or_raise(|| ErrorKind::Store)?;
        *arena = staged;
        Ok(out)
    }

    /// Register `name` (or re-register it), replacing its outgoing edges with
    /// `depends_on`.
    #[instrument(skip_all, fields(name = %name, circular = tracing::field::Empty))]
    pub async fn register(&self, name: &str, info: NodeInfo, depends_on: Vec<String>) -> Result<Registration> {
        if name.is_empty() {
            exn::bail!(ErrorKind::Constraint("dependency name is empty".to_string()));
        }
        let record = self
            .mutate(|arena| {
                arena.set_node(name, info, &depends_on);
                // The returned record has to carry the flags of the new edges.
                arena.recompute_cycles();
                let id = arena.registered_id(name);
                Ok(id.and_then(|id| arena.record(id)))
            })
            .await?;
        let Some(record) = record else {
            exn::bail!(ErrorKind::NotFound(name.to_string()));
        };
        tracing::Span::current().record("circular", record.is_circular);
        let warning = record.is_circular.then(|| {
            tracing::warn!(name = %name, "dependency is part of a cycle");
            format!("{name} is part of a dependency cycle")
        });
        Ok(Registration { record, warning })
    }

    /// Add the edge `name → target`. Returns `false` when it already existed.
    ///
    /// # Errors
    /// [`NotFound`](ErrorKind::NotFound) when `name` isn't registered,
    /// [`Constraint`](ErrorKind::Constraint) when the edge would close a cycle.
    #[instrument(skip_all, fields(name = %name, target = %target))]
    pub async fn add_edge(&self, name: &str, target: &str) -> Result<bool> {
        self.mutate(|arena| {
            let Some(from) = arena.registered_id(name) else {
                exn::bail!(ErrorKind::NotFound(name.to_string()));
            };
            if let Some(to) = arena.id(target)
                && arena.reaches(to, from)
            {
                exn::bail!(ErrorKind::Constraint(format!("{name} -> {target} would create a cycle")));
            }
            if name == target {
                exn::bail!(ErrorKind::Constraint(format!("{name} cannot depend on itself")));
            }
            Ok(arena.add_edge(from, target))
        })
        .await
    }

    /// Remove the edge `name → target`. Returns whether it existed.
    #[instrument(skip_all, fields(name = %name, target = %target))]
    pub async fn remove_edge(&self, name: &str, target: &str) -> Result<bool> {
        self.mutate(|arena| {
            let Some(from) = arena.registered_id(name) else {
                exn::bail!(ErrorKind::NotFound(name.to_string()));
            };
            Ok(arena.remove_edge(from, target))
        })
        .await
    }

    /// Drop `name` from the graph.
    ///
    /// # Errors
    /// [`Constraint`](ErrorKind::Constraint) while registered nodes still
    /// depend on it.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn unregister(&self, name: &str) -> Result<bool> {
        self.mutate(|arena| {
            let Some(id) = arena.registered_id(name) else {
                return Ok(false);
            };
            let dependents: Vec<&str> = arena
                .direct(id, false)
                .iter()
                .filter(|&&d| d != id && !arena.is_placeholder(d))
                .map(|&d| arena.name(d))
                .collect();
            if !dependents.is_empty() {
                exn::bail!(ErrorKind::Constraint(format!(
                    "{name} is still required by {}",
                    dependents.join(", ")
                )));
            }
            arena.unset_node(id);
            Ok(true)
        })
        .await
    }

    pub async fn get(&self, name: &str) -> Option<DependencyRecord> {
        let arena = self.arena.read().await;
        arena.registered_id(name).and_then(|id| arena.record(id))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.arena.read().await.registered_id(name).is_some()
    }

    /// Names of all registered nodes, sorted.
    pub async fn names(&self) -> Vec<String> {
        self.store.names().await
    }

    /// What `name` depends on: direct edges only, or everything reachable.
    /// Unknown names have no dependencies.
    pub async fn dependencies(&self, name: &str, recursive: bool) -> Vec<String> {
        self.neighbours(name, recursive, true).await
    }

    /// What depends on `name`: direct edges only, or everything that reaches
    /// it.
    pub async fn dependents(&self, name: &str, recursive: bool) -> Vec<String> {
        self.neighbours(name, recursive, false).await
    }

    async fn neighbours(&self, name: &str, recursive: bool, forward: bool) -> Vec<String> {
        let arena = self.arena.read().await;
        let Some(id) = arena.id(name) else {
            return Vec::new();
        };
        let ids = match recursive {
            true => arena.walk(id, forward),
            false => arena.direct(id, forward).iter().copied().filter(|&n| n != id).collect(),
        };
        ids.into_iter().map(|n| arena.name(n).to_string()).collect()
    }

    /// Check everything `name` transitively needs.
    ///
    /// # Errors
    /// [`NotFound`](ErrorKind::NotFound) when `name` isn't registered.
    pub async fn validate(&self, name: &str) -> Result<GraphValidation> {
        let arena = self.arena.read().await;
        let Some(id) = arena.registered_id(name) else {
            exn::bail!(ErrorKind::NotFound(name.to_string()));
        };
        let reachable = arena.walk(id, true);
        let missing = reachable
            .iter()
            .filter(|&&n| arena.is_placeholder(n))
            .map(|&n| arena.name(n).to_string())
            .collect();
        let has_circular = arena.is_circular(id) || reachable.iter().any(|&n| arena.is_circular(n));
        Ok(GraphValidation { missing, has_circular })
    }

    pub async fn stats(&self) -> GraphStats {
        GraphStats::collect(self.store.snapshot().await.values())
    }
}
