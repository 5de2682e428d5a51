use super::{ArtifactRegistry, Outcome, RegisterOptions};
use crate::error::{ErrorKind, Result};
use crate::kind::Kind;
use async_stream::stream;
use exn::ResultExt;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use wold_storage::layout;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    Started,
    Registered { name: String, outcome: Outcome },
    /// A file that isn't an artifact of this kind, or that failed to decode.
    Skipped { path: PathBuf, reason: String },
    Complete { registered: usize, skipped: usize },
}

impl<K: Kind> ArtifactRegistry<K> {
    /// Register every file below `<kind>s/`, leaving out the metadata and
    /// cache directories.
    ///
    /// Files that aren't this kind's formats, or that don't decode, are
    /// reported and skipped. I/O and store failures are yielded as errors and
    /// the scan moves on.
    pub fn scan(&self) -> impl Stream<Item = Result<ScanEvent>> + '_ {
        stream! {
            yield Ok(ScanEvent::Started);
            let root = layout::kind_dir(K::NAME);
            let metadata_dir = root.join("metadata");
            let cache_dir = layout::cache_dir(K::NAME);
            let (mut registered, mut skipped) = (0, 0);

            let mut files = self.ctx.backend.list_stream(Some(&root));
            while let Some(item) = files.next().await {
                let info = match item {
                    Ok(info) => info,
                    Err(err) => {
                        let failed: Result<ScanEvent> = Err(err).or_raise(|| ErrorKind::Io(root.clone()));
                        yield failed;
                        continue;
                    },
                };
                let relative = info.path.clone();
                if relative.starts_with(&metadata_dir) || relative.starts_with(&cache_dir) {
                    continue;
                }
                let format = layout::format_of(&relative);
                if !K::FORMATS.contains(&format.as_str()) {
                    skipped += 1;
                    yield Ok(ScanEvent::Skipped { path: relative, reason: format!("not a {} format", K::NAME) });
                    continue;
                }
                let absolute = match self.ctx.backend.resolve(&relative) {
                    Ok(absolute) => absolute,
                    Err(err) => {
                        let failed: Result<ScanEvent> = Err(err).or_raise(|| ErrorKind::Io(relative.clone()));
                        yield failed;
                        continue;
                    },
                };
                match self.register(&absolute, RegisterOptions::default()).await {
                    Ok(done) => {
                        registered += 1;
                        yield Ok(ScanEvent::Registered { name: done.record.common.name, outcome: done.outcome });
                    },
                    Err(err) if matches!(&*err, ErrorKind::Decode(_) | ErrorKind::Constraint(_)) => {
                        skipped += 1;
                        yield Ok(ScanEvent::Skipped { path: relative, reason: err.to_string() });
                    },
                    Err(err) => yield Err(err),
                }
            }
            tracing::info!(kind = K::NAME, registered, skipped, "Scan complete");
            yield Ok(ScanEvent::Complete { registered, skipped });
        }
    }
}
