//! Streaming view of a request: task creation, status polls, then the result.

use tokio::sync::mpsc;

use super::tasks::poll_interval;
use super::{Protocol, RequestOptions};
use crate::schema::{ResultSchema, Typed};
use crate::types::{CreateTaskResult, ProtocolError, ProtocolResult, Request, Task, TaskStatus};

/// One item of a [`ResponseStream`]. The last item is always `Result` or
/// `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMessage<T> {
    TaskCreated(Task),
    TaskStatus(Task),
    Result(T),
    Error(ProtocolError),
}

impl<T> ResponseMessage<T> {
    pub fn is_final(&self) -> bool {
        matches!(self, ResponseMessage::Result(_) | ResponseMessage::Error(_))
    }
}

pub struct ResponseStream<T> {
    rx: mpsc::Receiver<ResponseMessage<T>>,
}

impl<T> ResponseStream<T> {
    pub async fn next(&mut self) -> Option<ResponseMessage<T>> {
        self.rx.recv().await
    }

    /// Read every remaining item.
    pub async fn collect(mut self) -> Vec<ResponseMessage<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.rx.recv().await {
            items.push(item);
        }
        items
    }
}

impl Protocol {
    /// Send a request and follow it to completion.
    ///
    /// Without `options.task` the stream carries the single outcome. With it,
    /// the stream reports the created task, each polled status, and finally the
    /// task's result or failure.
    pub fn request_stream<S: ResultSchema>(
        &self,
        request: Request,
        schema: S,
        options: RequestOptions,
    ) -> ResponseStream<S::Output> {
        let (tx, rx) = mpsc::channel(16);
        let this = self.clone();
        tokio::spawn(async move {
            if options.task.is_none() {
                let item = match this.request(request, schema, options).await {
                    Ok(result) => ResponseMessage::Result(result),
                    Err(error) => ResponseMessage::Error(error),
                };
                let _ = tx.send(item).await;
                return;
            }
            if let Err(error) = this.follow_task(request, schema, options, &tx).await {
                let _ = tx.send(ResponseMessage::Error(error)).await;
            }
        });
        ResponseStream { rx }
    }

    async fn follow_task<S: ResultSchema>(
        &self,
        request: Request,
        schema: S,
        options: RequestOptions,
        tx: &mpsc::Sender<ResponseMessage<S::Output>>,
    ) -> ProtocolResult<()> {
        let created = self
            .request(request, Typed::<CreateTaskResult>::new(), options.clone())
            .await?;
        let task_id = created.task.task_id.clone();
        if tx.send(ResponseMessage::TaskCreated(created.task)).await.is_err() {
            return Ok(());
        }

        // Follow-up calls must not ask for another task.
        let follow = RequestOptions {
            task: None,
            ..options
        };
        loop {
            let task = self.get_task(&task_id, follow.clone()).await?;
            let status = task.status;
            let interval = poll_interval(&task, self.inner.options.default_task_poll_interval);
            if tx.send(ResponseMessage::TaskStatus(task)).await.is_err() {
                return Ok(());
            }

            let last = match status {
                TaskStatus::Completed | TaskStatus::InputRequired => {
                    let result = self.get_task_result(&task_id, schema, follow).await?;
                    ResponseMessage::Result(result)
                }
                TaskStatus::Failed => ResponseMessage::Error(ProtocolError::InternalError(format!(
                    "Task {task_id} failed"
                ))),
                TaskStatus::Cancelled => ResponseMessage::Error(ProtocolError::InternalError(
                    format!("Task {task_id} was cancelled"),
                )),
                TaskStatus::Working => {
                    match &follow.signal {
                        Some(signal) => {
                            tokio::select! {
                                _ = tokio::time::sleep(interval) => {}
                                _ = signal.aborted() => {
                                    return Err(ProtocolError::from_abort_reason(signal.reason()));
                                }
                            }
                        }
                        None => tokio::time::sleep(interval).await,
                    }
                    continue;
                }
            };
            let _ = tx.send(last).await;
            return Ok(());
        }
    }
}
