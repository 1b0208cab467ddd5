// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The live conversation actor.
//!
//! One task owns one [`ConversationRecord`]; every read and mutation arrives
//! as a command on an mpsc channel, so access is serialised without shared
//! mutable state.  Synchronous queries carry a oneshot reply channel.
//!
//! User interrupts queue here and are injected into the message list only
//! when the completion driver drains them at its next safe point; they are
//! additive, never preemptive, and never silently dropped.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use uuid::Uuid;

use fnord_model::Message;

use crate::conversation::{ConversationRecord, ConversationStore, StoreError};
use crate::memory::MemoryEntry;
use crate::tasks::{self, Task, TaskError, TaskLists};

/// Prefix attached to queued user interrupts.
pub const INTERJECTION_PREFIX: &str = "[User Interjection] ";

enum Command {
    Load {
        id: Uuid,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    AppendMsg(Message),
    ReplaceMsgs(Vec<Message>),
    GetMessages(oneshot::Sender<Vec<Message>>),
    GetRecord(oneshot::Sender<ConversationRecord>),
    SetMetadata {
        key: String,
        value: Value,
    },
    PutMemory(Vec<MemoryEntry>),
    GetMemory(oneshot::Sender<Vec<MemoryEntry>>),
    UpsertTaskList {
        id: String,
        tasks: Vec<Task>,
    },
    GetTaskLists(oneshot::Sender<TaskLists>),
    TaskOp {
        op: TaskOp,
        reply: oneshot::Sender<Result<TaskOpOutput, TaskError>>,
    },
    Save(oneshot::Sender<Result<(), StoreError>>),
    Interrupt(String),
    DrainInterrupts(oneshot::Sender<Vec<Message>>),
}

enum TaskOp {
    Start { id: Option<String> },
    Add { list: String, id: String, data: Value },
    Push { list: String, id: String, data: Value },
    Complete { list: String, id: String, result: Value },
    Fail { list: String, id: String, message: String },
    Peek { list: String },
    AllComplete { list: String },
}

enum TaskOpOutput {
    Id(String),
    Unit,
    Task(Task),
    Bool(bool),
}

/// Cloneable handle to a running conversation server.
#[derive(Clone)]
pub struct ConversationHandle {
    tx: mpsc::Sender<Command>,
    id: Uuid,
}

/// Spawn the actor owning `record`, persisting through `store`.
pub fn spawn(store: ConversationStore, record: ConversationRecord) -> ConversationHandle {
    let (tx, rx) = mpsc::channel(64);
    let id = record.id;
    tokio::spawn(run(store, record, rx));
    ConversationHandle { tx, id }
}

async fn run(store: ConversationStore, mut record: ConversationRecord, mut rx: mpsc::Receiver<Command>) {
    let mut interrupts: Vec<Message> = Vec::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Load { id, reply } => {
                let result = store.load(id).map(|loaded| {
                    record = loaded;
                });
                let _ = reply.send(result);
            }
            Command::AppendMsg(msg) => record.messages.push(msg),
            Command::ReplaceMsgs(msgs) => record.messages = msgs,
            Command::GetMessages(reply) => {
                let _ = reply.send(record.messages.clone());
            }
            Command::GetRecord(reply) => {
                let _ = reply.send(record.clone());
            }
            Command::SetMetadata { key, value } => {
                record.metadata.insert(key, value);
            }
            Command::PutMemory(entries) => record.memory = entries,
            Command::GetMemory(reply) => {
                let _ = reply.send(record.memory.clone());
            }
            Command::UpsertTaskList { id, tasks } => {
                record.tasks.insert(id, tasks);
            }
            Command::GetTaskLists(reply) => {
                let _ = reply.send(record.tasks.clone());
            }
            Command::TaskOp { op, reply } => {
                let _ = reply.send(apply_task_op(&mut record.tasks, op));
            }
            Command::Save(reply) => {
                // Persist, then reload so the in-memory state matches what
                // the boilerplate filter actually wrote.
                let mut result = store.save(&record);
                if result.is_ok() {
                    match store.load(record.id) {
                        Ok(loaded) => record = loaded,
                        Err(e) => result = Err(e),
                    }
                }
                let _ = reply.send(result);
            }
            Command::Interrupt(text) => {
                interrupts.push(Message::user(format!("{INTERJECTION_PREFIX}{text}")));
            }
            Command::DrainInterrupts(reply) => {
                let drained = std::mem::take(&mut interrupts);
                record.messages.extend(drained.iter().cloned());
                let _ = reply.send(drained);
            }
        }
    }
}

fn apply_task_op(lists: &mut TaskLists, op: TaskOp) -> Result<TaskOpOutput, TaskError> {
    match op {
        TaskOp::Start { id } => tasks::start_list(lists, id).map(TaskOpOutput::Id),
        TaskOp::Add { list, id, data } => {
            tasks::add_task(lists, &list, &id, data).map(|()| TaskOpOutput::Unit)
        }
        TaskOp::Push { list, id, data } => {
            tasks::push_task(lists, &list, &id, data).map(|()| TaskOpOutput::Unit)
        }
        TaskOp::Complete { list, id, result } => {
            tasks::complete_task(lists, &list, &id, result).map(|()| TaskOpOutput::Unit)
        }
        TaskOp::Fail { list, id, message } => {
            tasks::fail_task(lists, &list, &id, &message).map(|()| TaskOpOutput::Unit)
        }
        TaskOp::Peek { list } => tasks::peek_task(lists, &list)
            .map(|t| TaskOpOutput::Task(t.clone())),
        TaskOp::AllComplete { list } => {
            tasks::all_tasks_complete(lists, &list).map(TaskOpOutput::Bool)
        }
    }
}

impl ConversationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    async fn send(&self, cmd: Command) -> anyhow::Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("conversation server is gone"))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await
            .map_err(|_| anyhow::anyhow!("conversation server dropped the reply"))
    }

    /// Replace the live state with the conversation stored under `id`.
    pub async fn load(&self, id: Uuid) -> anyhow::Result<Result<(), StoreError>> {
        self.request(|reply| Command::Load { id, reply }).await
    }

    pub async fn append_msg(&self, msg: Message) -> anyhow::Result<()> {
        self.send(Command::AppendMsg(msg)).await
    }

    pub async fn replace_msgs(&self, msgs: Vec<Message>) -> anyhow::Result<()> {
        self.send(Command::ReplaceMsgs(msgs)).await
    }

    pub async fn get_messages(&self) -> anyhow::Result<Vec<Message>> {
        self.request(Command::GetMessages).await
    }

    pub async fn get_record(&self) -> anyhow::Result<ConversationRecord> {
        self.request(Command::GetRecord).await
    }

    pub async fn set_metadata(&self, key: impl Into<String>, value: Value) -> anyhow::Result<()> {
        self.send(Command::SetMetadata {
            key: key.into(),
            value,
        })
        .await
    }

    pub async fn put_memory(&self, entries: Vec<MemoryEntry>) -> anyhow::Result<()> {
        self.send(Command::PutMemory(entries)).await
    }

    pub async fn get_memory(&self) -> anyhow::Result<Vec<MemoryEntry>> {
        self.request(Command::GetMemory).await
    }

    pub async fn upsert_task_list(&self, id: impl Into<String>, tasks: Vec<Task>) -> anyhow::Result<()> {
        self.send(Command::UpsertTaskList {
            id: id.into(),
            tasks,
        })
        .await
    }

    pub async fn get_task_lists(&self) -> anyhow::Result<TaskLists> {
        self.request(Command::GetTaskLists).await
    }

    /// Persist the current snapshot and re-sync from disk.
    pub async fn save(&self) -> anyhow::Result<()> {
        match self.request(Command::Save).await? {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("conversation save failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Enqueue a user interrupt.  It reaches the message list when the driver
    /// next drains interrupts.
    pub async fn interrupt(&self, text: impl Into<String>) -> anyhow::Result<()> {
        self.send(Command::Interrupt(text.into())).await
    }

    /// Take all queued interrupts, appending them to the conversation in
    /// order.  Returns the drained messages for the driver's local state.
    pub async fn drain_interrupts(&self) -> anyhow::Result<Vec<Message>> {
        self.request(Command::DrainInterrupts).await
    }

    // ── Task service ──────────────────────────────────────────────────────────

    async fn task_op(&self, op: TaskOp) -> anyhow::Result<Result<TaskOpOutput, TaskError>> {
        self.request(|reply| Command::TaskOp { op, reply }).await
    }

    pub async fn start_list(&self, id: Option<String>) -> anyhow::Result<Result<String, TaskError>> {
        Ok(self.task_op(TaskOp::Start { id }).await?.map(|out| match out {
            TaskOpOutput::Id(id) => id,
            _ => unreachable!("start returns an id"),
        }))
    }

    pub async fn add_task(
        &self,
        list: &str,
        id: &str,
        data: Value,
    ) -> anyhow::Result<Result<(), TaskError>> {
        Ok(self
            .task_op(TaskOp::Add {
                list: list.into(),
                id: id.into(),
                data,
            })
            .await?
            .map(|_| ()))
    }

    pub async fn push_task(
        &self,
        list: &str,
        id: &str,
        data: Value,
    ) -> anyhow::Result<Result<(), TaskError>> {
        Ok(self
            .task_op(TaskOp::Push {
                list: list.into(),
                id: id.into(),
                data,
            })
            .await?
            .map(|_| ()))
    }

    pub async fn complete_task(
        &self,
        list: &str,
        id: &str,
        result: Value,
    ) -> anyhow::Result<Result<(), TaskError>> {
        Ok(self
            .task_op(TaskOp::Complete {
                list: list.into(),
                id: id.into(),
                result,
            })
            .await?
            .map(|_| ()))
    }

    pub async fn fail_task(
        &self,
        list: &str,
        id: &str,
        message: &str,
    ) -> anyhow::Result<Result<(), TaskError>> {
        Ok(self
            .task_op(TaskOp::Fail {
                list: list.into(),
                id: id.into(),
                message: message.into(),
            })
            .await?
            .map(|_| ()))
    }

    pub async fn peek_task(&self, list: &str) -> anyhow::Result<Result<Task, TaskError>> {
        Ok(self
            .task_op(TaskOp::Peek { list: list.into() })
            .await?
            .map(|out| match out {
                TaskOpOutput::Task(t) => t,
                _ => unreachable!("peek returns a task"),
            }))
    }

    pub async fn all_tasks_complete(&self, list: &str) -> anyhow::Result<Result<bool, TaskError>> {
        Ok(self
            .task_op(TaskOp::AllComplete { list: list.into() })
            .await?
            .map(|out| match out {
                TaskOpOutput::Bool(b) => b,
                _ => unreachable!("all_complete returns a bool"),
            }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn temp_server() -> (tempfile::TempDir, ConversationStore, ConversationHandle) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        let handle = spawn(store.clone(), ConversationRecord::new());
        (dir, store, handle)
    }

    #[tokio::test]
    async fn append_and_get_messages() {
        let (_dir, _store, handle) = temp_server();
        handle.append_msg(Message::user("hi")).await.unwrap();
        handle.append_msg(Message::assistant("hello")).await.unwrap();
        let msgs = handle.get_messages().await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].text(), Some("hi"));
    }

    #[tokio::test]
    async fn replace_overwrites_messages() {
        let (_dir, _store, handle) = temp_server();
        handle.append_msg(Message::user("old")).await.unwrap();
        handle.replace_msgs(vec![Message::user("new")]).await.unwrap();
        let msgs = handle.get_messages().await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text(), Some("new"));
    }

    #[tokio::test]
    async fn save_persists_and_resyncs() {
        let (_dir, store, handle) = temp_server();
        handle
            .append_msg(Message::system("Your name is Zaphod."))
            .await
            .unwrap();
        handle.append_msg(Message::user("hi")).await.unwrap();
        // This transient system message must not survive the save.
        handle
            .append_msg(Message::system("per-turn instructions"))
            .await
            .unwrap();
        handle.save().await.unwrap();

        // In-memory state re-synced from disk: the filter has applied.
        let msgs = handle.get_messages().await.unwrap();
        assert_eq!(msgs.len(), 2);

        // And the file itself agrees.
        let loaded = store.load(handle.id()).unwrap();
        assert_eq!(loaded.messages, msgs);
    }

    #[tokio::test]
    async fn load_replaces_live_state() {
        let (_dir, store, handle) = temp_server();

        let mut other = ConversationRecord::new();
        other.messages.push(Message::user("from disk"));
        store.save(&other).unwrap();

        handle.append_msg(Message::user("live")).await.unwrap();
        handle.load(other.id).await.unwrap().unwrap();
        let msgs = handle.get_messages().await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text(), Some("from disk"));
    }

    #[tokio::test]
    async fn load_unknown_id_surfaces_not_found() {
        let (_dir, _store, handle) = temp_server();
        let missing = Uuid::new_v4();
        assert!(matches!(
            handle.load(missing).await.unwrap(),
            Err(StoreError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn interrupts_queue_until_drained() {
        let (_dir, _store, handle) = temp_server();
        handle.interrupt("wait, check the tests too").await.unwrap();
        handle.interrupt("and the docs").await.unwrap();

        let drained = handle.drain_interrupts().await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(
            drained[0].text(),
            Some("[User Interjection] wait, check the tests too")
        );

        // Drained interrupts are now part of the conversation...
        let msgs = handle.get_messages().await.unwrap();
        assert_eq!(msgs.len(), 2);

        // ...and the queue is empty.
        assert!(handle.drain_interrupts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_and_metadata_round_trip() {
        let (_dir, _store, handle) = temp_server();
        handle
            .put_memory(vec![MemoryEntry::session("t", "c")])
            .await
            .unwrap();
        handle.set_metadata("project", json!("fnord")).await.unwrap();
        let memory = handle.get_memory().await.unwrap();
        assert_eq!(memory.len(), 1);
        let record = handle.get_record().await.unwrap();
        assert_eq!(record.metadata["project"], json!("fnord"));
    }

    #[tokio::test]
    async fn task_ops_flow_through_the_server() {
        let (_dir, _store, handle) = temp_server();
        let list = handle.start_list(None).await.unwrap().unwrap();
        assert_eq!(list, "tasks-1");
        handle.add_task(&list, "a", json!(1)).await.unwrap().unwrap();
        handle.add_task(&list, "b", json!(2)).await.unwrap().unwrap();

        let first = handle.peek_task(&list).await.unwrap().unwrap();
        assert_eq!(first.id, "a");

        handle
            .complete_task(&list, "a", json!("ok"))
            .await
            .unwrap()
            .unwrap();
        handle.fail_task(&list, "b", "broke").await.unwrap().unwrap();
        assert!(handle.all_tasks_complete(&list).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn task_updates_persist_with_next_save() {
        let (_dir, store, handle) = temp_server();
        let list = handle.start_list(Some("plan".into())).await.unwrap().unwrap();
        handle.add_task(&list, "a", json!(1)).await.unwrap().unwrap();

        // Not on disk yet: persistence is batched with save().
        assert!(matches!(
            store.load(handle.id()),
            Err(StoreError::NotFound(_))
        ));

        handle.save().await.unwrap();
        let loaded = store.load(handle.id()).unwrap();
        assert_eq!(loaded.tasks["plan"].len(), 1);
    }

    #[tokio::test]
    async fn duplicate_list_id_is_reported() {
        let (_dir, _store, handle) = temp_server();
        handle.start_list(Some("x".into())).await.unwrap().unwrap();
        assert_eq!(
            handle.start_list(Some("x".into())).await.unwrap(),
            Err(TaskError::Exists("x".into()))
        );
    }
}
