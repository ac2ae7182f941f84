//! Rescans the catalog when shard files appear.
//!
//! notify delivers events on its own thread; they are forwarded over a
//! channel to a bridge thread that evicts the affected shard and rescans.
//! Dropping the [`ShardWatcher`] closes the channel and ends the bridge.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::catalog::{is_shard_file_name, ShardCatalog};
use crate::Result;

pub struct ShardWatcher {
    // Owns the sending half of the bridge channel.
    _watcher: RecommendedWatcher,
    dir: PathBuf,
}

impl ShardWatcher {
    /// Watch `catalog`'s shard directory.
    pub fn start(catalog: Arc<ShardCatalog>) -> Result<Self> {
        let dir = catalog.shard_dir().to_path_buf();
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        std::thread::Builder::new()
            .name("shardlog-watcher".into())
            .spawn(move || {
                while let Ok(res) = rx.recv() {
                    match res {
                        Ok(event) => {
                            for path in created_shards(&event) {
                                if let Err(err) = catalog.handle_created(&path) {
                                    tracing::error!(path = %path.display(), error = %err, "rescan after shard creation failed");
                                }
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "shard watcher error"),
                    }
                }
                tracing::debug!("shard watcher channel closed");
            })?;

        tracing::info!(dir = %dir.display(), "watching shard directory");
        Ok(Self { _watcher: watcher, dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Shard files created by `event`, including files renamed into place.
fn created_shards(event: &Event) -> Vec<PathBuf> {
    let paths: &[PathBuf] = match &event.kind {
        EventKind::Create(_) => &event.paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => &event.paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event.paths.get(1..).unwrap_or_default(),
        _ => &[],
    };
    paths
        .iter()
        .filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(is_shard_file_name))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(PathBuf::from(p)))
    }

    #[test]
    fn test_create_events_for_shards_only() {
        let e = event(
            EventKind::Create(CreateKind::File),
            &["/data/message_4.db", "/data/message_4.db-journal", "/data/contact.db"],
        );
        assert_eq!(created_shards(&e), vec![PathBuf::from("/data/message_4.db")]);
    }

    #[test]
    fn test_rename_into_place() {
        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/data/tmp123", "/data/message_5.db"],
        );
        assert_eq!(created_shards(&both), vec![PathBuf::from("/data/message_5.db")]);

        let from = event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/data/message_5.db"]);
        assert!(created_shards(&from).is_empty());
    }

    #[test]
    fn test_modify_and_remove_ignored() {
        let e = event(EventKind::Remove(notify::event::RemoveKind::File), &["/data/message_1.db"]);
        assert!(created_shards(&e).is_empty());
    }
}
