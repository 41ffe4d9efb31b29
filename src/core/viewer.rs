use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::io::AsyncWriteExt;

use crate::config::{ViewerCommand, ViewerConfig};
use crate::core::error::{TransportError, WatchError};
use crate::core::mime;
use crate::core::models::{MessageKey, Representation};

/// Runs an external viewer to completion.
pub trait ViewerLauncher: Send + Sync {
    /// Spawn `command` with `path` appended and wait for it. `Ok(None)` means
    /// the process was killed by a signal.
    fn launch(&self, command: &ViewerCommand, path: &Path) -> BoxFuture<'static, io::Result<Option<i32>>>;
}

pub struct ProcessLauncher;

impl ViewerLauncher for ProcessLauncher {
    fn launch(&self, command: &ViewerCommand, path: &Path) -> BoxFuture<'static, io::Result<Option<i32>>> {
        let mut child = tokio::process::Command::new(&command.program);
        child.args(&command.args).arg(path);
        async move {
            let status = child.status().await?;
            Ok(status.code())
        }
        .boxed()
    }
}

/// A materialized copy of a message, removed exactly once: explicitly via
/// [`TransientFile::remove`] or on drop.
#[derive(Debug)]
pub struct TransientFile {
    path: PathBuf,
    removed: bool,
}

impl TransientFile {
    pub async fn create(path: PathBuf) -> Result<(Self, tokio::fs::File), WatchError> {
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|source| WatchError::TransientFile {
                path: path.clone(),
                source,
            })?;
        Ok((TransientFile { path, removed: false }, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remove(mut self) -> Result<(), WatchError> {
        self.removed = true;
        std::fs::remove_file(&self.path).map_err(|source| WatchError::TransientFile {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for TransientFile {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Result of one view session, handed back to the event loop.
#[derive(Debug)]
pub struct ViewOutcome {
    pub key: MessageKey,
    pub representation: Representation,
    /// `Ok` only when the viewer exited with code zero.
    pub result: Result<(), WatchError>,
}

/// What to materialize for one message, and where.
#[derive(Debug, Clone)]
pub struct ViewRequest {
    pub key: MessageKey,
    pub viewers: ViewerConfig,
    pub spool_dir: PathBuf,
}

/// A message written to disk, waiting for its viewer. Dropping it removes
/// the file.
#[derive(Debug)]
pub struct PreparedView {
    pub key: MessageKey,
    pub representation: Representation,
    command: ViewerCommand,
    transient: TransientFile,
}

impl PreparedView {
    #[cfg(test)]
    pub fn path(&self) -> &Path {
        self.transient.path()
    }
}

/// Fetch the message and write the chosen representation to the spool.
/// Nothing is left on disk if this fails or is dropped part way.
pub async fn prepare_view(
    request: ViewRequest,
    body: BoxStream<'static, Result<Vec<u8>, TransportError>>,
) -> Result<PreparedView, WatchError> {
    let key = request.key;
    let stem = request.spool_dir.join(key.file_stem());

    if let Some(command) = &request.viewers.full {
        let path = stem.with_extension(Representation::Full.extension());
        let (transient, mut file) = TransientFile::create(path).await?;
        stream_into(&mut file, body, key, transient.path()).await?;
        return Ok(PreparedView {
            key,
            representation: Representation::Full,
            command: command.clone(),
            transient,
        });
    }

    let raw = collect(body, key).await?;
    let allow_html = request.viewers.html.is_some();
    let (representation, content) =
        mime::render_for_viewer(&raw, allow_html).ok_or(WatchError::Unparseable { key })?;
    let command = request
        .viewers
        .command(representation)
        .cloned()
        .ok_or(WatchError::NoViewer(representation))?;
    let path = stem.with_extension(representation.extension());
    let (transient, mut file) = TransientFile::create(path).await?;
    write_all(&mut file, content.as_bytes(), transient.path()).await?;
    flush(&mut file, transient.path()).await?;
    Ok(PreparedView {
        key,
        representation,
        command,
        transient,
    })
}

/// Run the viewer on a prepared file and remove the file once it exits.
pub async fn run_viewer(launcher: Arc<dyn ViewerLauncher>, prepared: PreparedView) -> ViewOutcome {
    let PreparedView {
        key,
        representation,
        command,
        transient,
    } = prepared;

    log::info!(
        "Opening message {} with {} ({})",
        key,
        command.program,
        transient.path().display()
    );
    let exit = launcher.launch(&command, transient.path()).await;
    if let Err(e) = transient.remove() {
        log::warn!("{}", e);
    }

    let result = match exit {
        Ok(Some(0)) => Ok(()),
        Ok(code) => Err(WatchError::NonZeroViewerExit {
            program: command.program,
            code,
        }),
        Err(source) => Err(WatchError::ViewerLaunch {
            program: command.program,
            source,
        }),
    };
    ViewOutcome {
        key,
        representation,
        result,
    }
}

async fn collect(
    mut body: BoxStream<'static, Result<Vec<u8>, TransportError>>,
    key: MessageKey,
) -> Result<Vec<u8>, WatchError> {
    let mut raw = Vec::new();
    while let Some(chunk) = body.next().await {
        raw.extend(chunk.map_err(|source| WatchError::Fetch { key, source })?);
    }
    Ok(raw)
}

async fn stream_into(
    file: &mut tokio::fs::File,
    mut body: BoxStream<'static, Result<Vec<u8>, TransportError>>,
    key: MessageKey,
    path: &Path,
) -> Result<(), WatchError> {
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|source| WatchError::Fetch { key, source })?;
        write_all(file, &chunk, path).await?;
    }
    flush(file, path).await
}

async fn write_all(file: &mut tokio::fs::File, bytes: &[u8], path: &Path) -> Result<(), WatchError> {
    file.write_all(bytes)
        .await
        .map_err(|source| WatchError::TransientFile {
            path: path.to_path_buf(),
            source,
        })
}

// tokio completes file writes in the background; the viewer must see them.
async fn flush(file: &mut tokio::fs::File, path: &Path) -> Result<(), WatchError> {
    file.flush().await.map_err(|source| WatchError::TransientFile {
        path: path.to_path_buf(),
        source,
    })
}
