use std::future::Future;

use futures::stream::{self, AbortHandle, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::mpsc::UnboundedSender;

/// Deferred work returned by an update handler. Every item any of its
/// futures or streams yields is fed back into the update loop.
pub struct Task<M> {
    streams: Vec<BoxStream<'static, M>>,
}

impl<M: Send + 'static> Task<M> {
    pub fn none() -> Self {
        Task {
            streams: Vec::new(),
        }
    }

    pub fn future(future: impl Future<Output = M> + Send + 'static) -> Self {
        Self::stream(future.into_stream())
    }

    pub fn stream(stream: impl Stream<Item = M> + Send + 'static) -> Self {
        Task {
            streams: vec![stream.boxed()],
        }
    }

    pub fn batch(tasks: impl IntoIterator<Item = Task<M>>) -> Self {
        Task {
            streams: tasks.into_iter().flat_map(|t| t.streams).collect(),
        }
    }

    /// Merge into one task that can be cancelled from outside.
    pub fn abortable(self) -> (Self, AbortHandle) {
        let (stream, handle) = stream::abortable(stream::select_all(self.streams));
        (Self::stream(stream), handle)
    }

    #[cfg(test)]
    pub fn is_none(&self) -> bool {
        self.streams.is_empty()
    }

    /// Run every stream on the tokio runtime, forwarding items to `output`.
    pub fn spawn(self, output: &UnboundedSender<M>) {
        for mut stream in self.streams {
            let output = output.clone();
            tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    if output.send(item).is_err() {
                        break;
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn batch_forwards_every_item() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = Task::batch([
            Task::future(async { 1 }),
            Task::none(),
            Task::stream(stream::iter([2, 3])),
        ]);
        task.spawn(&tx);
        drop(tx);

        let mut seen = Vec::new();
        while let Some(item) = rx.recv().await {
            seen.push(item);
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_task_yields_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (task, handle) = Task::future(async {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            "connected"
        })
        .abortable();
        task.spawn(&tx);
        drop(tx);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        handle.abort();
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn none_is_empty() {
        assert!(Task::<()>::none().is_none());
        assert!(Task::batch([Task::<()>::none(), Task::none()]).is_none());
    }
}
