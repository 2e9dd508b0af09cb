//! In-memory task store and message queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tokio::time::{Duration, Instant};

use super::{QueueEntry, TaskMessageQueue, TaskStore};
use crate::types::{
    ListTasksResult, ProtocolError, ProtocolResult, RequestDescriptor, RequestId, Task,
    TaskCreationParams, TaskStatus,
};

/// Tasks returned per `list_tasks` page.
pub const PAGE_SIZE: usize = 10;

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct StoredTask {
    task: Task,
    seq: u64,
    session_id: Option<String>,
    request_id: RequestId,
    request: RequestDescriptor,
    result: Option<Value>,
    expires_at: Option<Instant>,
}

impl StoredTask {
    fn visible_to(&self, session_id: Option<&str>) -> bool {
        self.session_id.is_none() || self.session_id.as_deref() == session_id
    }
}

#[derive(Default)]
struct StoreState {
    tasks: HashMap<String, StoredTask>,
    next_seq: u64,
}

impl StoreState {
    /// Drop every task whose ttl has run out.
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.tasks
            .retain(|_, stored| stored.expires_at.map_or(true, |at| at > now));
    }

    fn find_mut(&mut self, task_id: &str, session_id: Option<&str>) -> Option<&mut StoredTask> {
        self.purge_expired();
        self.tasks
            .get_mut(task_id)
            .filter(|stored| stored.visible_to(session_id))
    }
}

/// Process-local `TaskStore`. Expired tasks are purged lazily on access.
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    default_ttl: Option<u64>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ttl applied when the creating request does not ask for one.
    pub fn with_default_ttl(mut self, ttl_ms: Option<u64>) -> Self {
        self.default_ttl = ttl_ms;
        self
    }

    pub fn len(&self) -> usize {
        let mut state = lock(&self.state);
        state.purge_expired();
        state.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The request that created `task_id`.
    pub fn provenance(&self, task_id: &str) -> Option<(RequestId, RequestDescriptor)> {
        let mut state = lock(&self.state);
        state.purge_expired();
        state
            .tasks
            .get(task_id)
            .map(|stored| (stored.request_id.clone(), stored.request.clone()))
    }
}

fn not_found(task_id: &str) -> ProtocolError {
    ProtocolError::InvalidParams(format!("Task with ID {task_id} not found"))
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(
        &self,
        params: TaskCreationParams,
        request_id: RequestId,
        request: RequestDescriptor,
        session_id: Option<&str>,
    ) -> ProtocolResult<Task> {
        let now = timestamp();
        let ttl = params.ttl.or(self.default_ttl);
        let task = Task {
            task_id: uuid::Uuid::new_v4().to_string(),
            status: TaskStatus::Working,
            ttl,
            created_at: now.clone(),
            last_updated_at: now,
            poll_interval: params.poll_interval,
            status_message: None,
        };

        let mut state = lock(&self.state);
        state.purge_expired();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.tasks.insert(
            task.task_id.clone(),
            StoredTask {
                task: task.clone(),
                seq,
                session_id: session_id.map(str::to_string),
                request_id,
                request,
                result: None,
                expires_at: ttl.map(|ms| Instant::now() + Duration::from_millis(ms)),
            },
        );
        tracing::debug!(task_id = %task.task_id, ?ttl, "Task created");
        Ok(task)
    }

    async fn get_task(
        &self,
        task_id: &str,
        session_id: Option<&str>,
    ) -> ProtocolResult<Option<Task>> {
        let mut state = lock(&self.state);
        Ok(state
            .find_mut(task_id, session_id)
            .map(|stored| stored.task.clone()))
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        status_message: Option<String>,
        session_id: Option<&str>,
    ) -> ProtocolResult<()> {
        let mut state = lock(&self.state);
        let stored = state
            .find_mut(task_id, session_id)
            .ok_or_else(|| not_found(task_id))?;
        if stored.task.status.is_terminal() {
            return Err(ProtocolError::InvalidParams(format!(
                "Cannot update task {task_id} from terminal status '{}' to '{status}'",
                stored.task.status
            )));
        }
        stored.task.status = status;
        stored.task.status_message = status_message;
        stored.task.last_updated_at = timestamp();
        Ok(())
    }

    async fn store_task_result(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Value,
        session_id: Option<&str>,
    ) -> ProtocolResult<()> {
        let mut state = lock(&self.state);
        let stored = state
            .find_mut(task_id, session_id)
            .ok_or_else(|| not_found(task_id))?;
        if stored.task.status.is_terminal() {
            return Err(ProtocolError::InvalidParams(format!(
                "Cannot store result for task {task_id} in terminal status '{}'",
                stored.task.status
            )));
        }
        stored.task.status = status;
        stored.task.last_updated_at = timestamp();
        stored.result = Some(result);
        Ok(())
    }

    async fn get_task_result(
        &self,
        task_id: &str,
        session_id: Option<&str>,
    ) -> ProtocolResult<Value> {
        let mut state = lock(&self.state);
        let stored = state
            .find_mut(task_id, session_id)
            .ok_or_else(|| not_found(task_id))?;
        stored.result.clone().ok_or_else(|| {
            ProtocolError::InvalidParams(format!("Task {task_id} has no result stored"))
        })
    }

    async fn list_tasks(
        &self,
        cursor: Option<&str>,
        session_id: Option<&str>,
    ) -> ProtocolResult<ListTasksResult> {
        let mut state = lock(&self.state);
        state.purge_expired();

        let mut visible: Vec<&StoredTask> = state
            .tasks
            .values()
            .filter(|stored| stored.visible_to(session_id))
            .collect();
        visible.sort_by_key(|stored| stored.seq);

        let start = match cursor {
            Some(cursor) => {
                visible
                    .iter()
                    .position(|stored| stored.task.task_id == cursor)
                    .ok_or_else(|| {
                        ProtocolError::InvalidParams(format!("Invalid cursor: {cursor}"))
                    })?
                    + 1
            }
            None => 0,
        };

        let page: Vec<Task> = visible
            .iter()
            .skip(start)
            .take(PAGE_SIZE)
            .map(|stored| stored.task.clone())
            .collect();
        let next_cursor = if start + page.len() < visible.len() {
            page.last().map(|task| task.task_id.clone())
        } else {
            None
        };

        Ok(ListTasksResult {
            tasks: page,
            next_cursor,
        })
    }
}

type QueueKey = (String, Option<String>);

/// Process-local `TaskMessageQueue`.
#[derive(Default)]
pub struct InMemoryTaskMessageQueue {
    queues: Mutex<HashMap<QueueKey, VecDeque<QueueEntry>>>,
}

impl InMemoryTaskMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(task_id: &str, session_id: Option<&str>) -> QueueKey {
        (task_id.to_string(), session_id.map(str::to_string))
    }
}

#[async_trait]
impl TaskMessageQueue for InMemoryTaskMessageQueue {
    async fn enqueue(
        &self,
        task_id: &str,
        entry: QueueEntry,
        session_id: Option<&str>,
        max_queue_size: Option<usize>,
    ) -> ProtocolResult<()> {
        let mut queues = lock(&self.queues);
        let queue = queues.entry(Self::key(task_id, session_id)).or_default();
        if let Some(max) = max_queue_size {
            if queue.len() >= max {
                return Err(ProtocolError::InternalError(format!(
                    "Task message queue overflow: queue size ({}) exceeds maximum ({max})",
                    queue.len() + 1
                )));
            }
        }
        queue.push_back(entry);
        Ok(())
    }

    async fn dequeue(
        &self,
        task_id: &str,
        session_id: Option<&str>,
    ) -> ProtocolResult<Option<QueueEntry>> {
        let mut queues = lock(&self.queues);
        let key = Self::key(task_id, session_id);
        let entry = queues.get_mut(&key).and_then(VecDeque::pop_front);
        if queues.get(&key).is_some_and(VecDeque::is_empty) {
            queues.remove(&key);
        }
        Ok(entry)
    }

    async fn dequeue_all(
        &self,
        task_id: &str,
        session_id: Option<&str>,
    ) -> ProtocolResult<Vec<QueueEntry>> {
        let mut queues = lock(&self.queues);
        Ok(queues
            .remove(&Self::key(task_id, session_id))
            .map(Vec::from)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::QueuedMessage;
    use crate::types::JsonRpcNotification;
    use serde_json::json;

    fn descriptor() -> RequestDescriptor {
        RequestDescriptor {
            method: "tools/call".to_string(),
            params: None,
        }
    }

    async fn create(store: &InMemoryTaskStore, ttl: Option<u64>, session: Option<&str>) -> Task {
        store
            .create_task(
                TaskCreationParams {
                    ttl,
                    poll_interval: None,
                },
                RequestId::Number(1),
                descriptor(),
                session,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryTaskStore::new();
        let task = create(&store, Some(60_000), None).await;
        assert_eq!(task.status, TaskStatus::Working);
        assert_eq!(task.created_at, task.last_updated_at);

        let fetched = store.get_task(&task.task_id, None).await.unwrap();
        assert_eq!(fetched, Some(task.clone()));
        let (request_id, request) = store.provenance(&task.task_id).unwrap();
        assert_eq!(request_id, RequestId::Number(1));
        assert_eq!(request.method, "tools/call");
        assert_eq!(store.get_task("nope", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let store = InMemoryTaskStore::new();
        let task = create(&store, None, None).await;
        store
            .store_task_result(&task.task_id, TaskStatus::Completed, json!({"ok": true}), None)
            .await
            .unwrap();

        let err = store
            .update_task_status(&task.task_id, TaskStatus::Working, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidParams(_)));

        let current = store.get_task(&task.task_id, None).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Completed);
        assert_eq!(
            store.get_task_result(&task.task_id, None).await.unwrap(),
            json!({"ok": true})
        );
    }

    #[tokio::test]
    async fn test_missing_result() {
        let store = InMemoryTaskStore::new();
        let task = create(&store, None, None).await;
        assert!(store.get_task_result(&task.task_id, None).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryTaskStore::new();
        let short = create(&store, Some(100), None).await;
        let forever = create(&store, None, None).await;

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(store.get_task(&short.task_id, None).await.unwrap(), None);
        assert!(store.get_task(&forever.task_id, None).await.unwrap().is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_default_ttl_applies() {
        let store = InMemoryTaskStore::new().with_default_ttl(Some(5_000));
        assert_eq!(create(&store, None, None).await.ttl, Some(5_000));
        assert_eq!(create(&store, Some(10), None).await.ttl, Some(10));
    }

    #[tokio::test]
    async fn test_session_isolation() {
        let store = InMemoryTaskStore::new();
        let mine = create(&store, None, Some("s1")).await;

        assert!(store.get_task(&mine.task_id, Some("s1")).await.unwrap().is_some());
        assert!(store.get_task(&mine.task_id, Some("s2")).await.unwrap().is_none());
        assert!(store
            .update_task_status(&mine.task_id, TaskStatus::Failed, None, Some("s2"))
            .await
            .is_err());
        assert!(store.list_tasks(None, Some("s2")).await.unwrap().tasks.is_empty());
    }

    #[tokio::test]
    async fn test_pagination() {
        let store = InMemoryTaskStore::new();
        let mut ids = Vec::new();
        for _ in 0..(PAGE_SIZE + 3) {
            ids.push(create(&store, None, None).await.task_id);
        }

        let first = store.list_tasks(None, None).await.unwrap();
        assert_eq!(first.tasks.len(), PAGE_SIZE);
        assert_eq!(first.tasks[0].task_id, ids[0]);
        let cursor = first.next_cursor.unwrap();
        assert_eq!(cursor, ids[PAGE_SIZE - 1]);

        let second = store.list_tasks(Some(&cursor), None).await.unwrap();
        assert_eq!(second.tasks.len(), 3);
        assert_eq!(second.next_cursor, None);

        let err = store.list_tasks(Some("bogus"), None).await.unwrap_err();
        assert_eq!(err, ProtocolError::InvalidParams("Invalid cursor: bogus".into()));
    }

    fn note(n: i64) -> QueueEntry {
        QueueEntry {
            message: QueuedMessage::Notification(JsonRpcNotification::new(
                "notifications/message",
                Some(json!({ "n": n })),
            )),
            timestamp: n,
        }
    }

    #[tokio::test]
    async fn test_queue_fifo_and_drain() {
        let queue = InMemoryTaskMessageQueue::new();
        for n in 0..3 {
            queue.enqueue("t", note(n), None, None).await.unwrap();
        }
        assert_eq!(queue.dequeue("t", None).await.unwrap(), Some(note(0)));
        assert_eq!(queue.dequeue_all("t", None).await.unwrap(), vec![note(1), note(2)]);
        assert_eq!(queue.dequeue("t", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queue_overflow() {
        let queue = InMemoryTaskMessageQueue::new();
        queue.enqueue("t", note(0), None, Some(2)).await.unwrap();
        queue.enqueue("t", note(1), None, Some(2)).await.unwrap();
        let err = queue.enqueue("t", note(2), None, Some(2)).await.unwrap_err();
        assert!(err.to_string().contains("overflow"));
        assert_eq!(queue.dequeue_all("t", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_queue_sessions_are_separate() {
        let queue = InMemoryTaskMessageQueue::new();
        queue.enqueue("t", note(0), Some("a"), None).await.unwrap();
        assert_eq!(queue.dequeue("t", Some("b")).await.unwrap(), None);
        assert!(queue.dequeue("t", Some("a")).await.unwrap().is_some());
    }
}
