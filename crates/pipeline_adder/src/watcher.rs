//! Reloads the `add` list when the adder's configuration file changes.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use pipeline_plugin::config::load_stage_config;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AddConfiguration, AdderConfiguration};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Polls the directory holding `path` and publishes the new `add` list on
/// `updates` whenever the file is created or modified. A file that fails to
/// load is logged and the previous list stays in effect.
pub fn watch_config(
    path: PathBuf,
    updates: watch::Sender<Vec<AddConfiguration>>,
    poll_interval: Duration,
    token: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let file_name = path
        .file_name()
        .map(OsString::from)
        .with_context(|| format!("{} does not name a file", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = PollWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        Config::default()
            .with_poll_interval(poll_interval)
            .with_compare_contents(true),
    )
    .context("creating configuration watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {}", dir.display()))?;
    info!(config = %path.display(), "watching configuration for changes");

    Ok(tokio::spawn(async move {
        // dropping the watcher stops polling
        let _watcher = watcher;
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                Ok(Event {
                    kind: EventKind::Create(_) | EventKind::Modify(_),
                    paths,
                    ..
                }) => {
                    if paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
                        reload(&path, &updates);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "configuration watcher error"),
            }
        }
        debug!("configuration watcher stopped");
    }))
}

fn reload(path: &Path, updates: &watch::Sender<Vec<AddConfiguration>>) {
    match load_stage_config::<AdderConfiguration>(path) {
        Ok(config) => {
            info!(fields = config.add.len(), "configuration changed, updated fields to add");
            updates.send_replace(config.add);
        }
        Err(e) => warn!(config = %path.display(), error = %e, "ignoring changed configuration"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AdderPlugin;
    use pipeline_plugin::PipelinePlugin;

    const HEADER: &str = "plugin:\n  id: adder\n  pluginManager: 127.0.0.1:5555\n";

    fn write_config(path: &Path, add: &str) {
        std::fs::write(path, format!("{HEADER}add:\n{add}")).unwrap();
    }

    async fn wait_for_output(plugin: &mut AdderPlugin, expected: &str) -> String {
        let mut output = String::new();
        for _ in 0..100 {
            output = plugin.process("{}".into()).await.unwrap().unwrap();
            if output == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        output
    }

    #[tokio::test]
    async fn changed_file_replaces_the_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adder.yaml");
        write_config(&path, "  - key: version\n    value: '1'\n");
        let config: AdderConfiguration = load_stage_config(&path).unwrap();
        let (mut plugin, updates) = AdderPlugin::watching(config);

        let token = CancellationToken::new();
        let task = watch_config(path.clone(), updates, Duration::from_millis(50), token.clone()).unwrap();
        assert_eq!(plugin.process("{}".into()).await.unwrap().as_deref(), Some(r#"{"version":"1"}"#));

        write_config(&path, "  - key: release\n    value: stable\n");
        assert_eq!(wait_for_output(&mut plugin, r#"{"release":"stable"}"#).await, r#"{"release":"stable"}"#);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn broken_file_keeps_the_previous_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adder.yaml");
        write_config(&path, "  - key: version\n    value: '1'\n");
        let config: AdderConfiguration = load_stage_config(&path).unwrap();
        let (mut plugin, updates) = AdderPlugin::watching(config);

        let token = CancellationToken::new();
        let task = watch_config(path.clone(), updates, Duration::from_millis(50), token.clone()).unwrap();

        std::fs::write(&path, "add: [not: valid").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(plugin.process("{}".into()).await.unwrap().as_deref(), Some(r#"{"version":"1"}"#));

        token.cancel();
        task.await.unwrap();
    }
}
