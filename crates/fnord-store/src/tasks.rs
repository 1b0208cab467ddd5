// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Named ordered task lists scoped to a conversation.
//!
//! The lists live inside the conversation record and reach disk with the
//! conversation's next `save()`; mutations themselves touch only memory.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    #[default]
    Todo,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub outcome: TaskOutcome,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            outcome: TaskOutcome::Todo,
            data,
            result: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task list {0:?} already exists")]
    Exists(String),
    #[error("task list {0:?} not found")]
    ListNotFound(String),
    #[error("no task {id:?} in list {list:?}")]
    TaskNotFound { list: String, id: String },
    #[error("task list {0:?} has no todo tasks")]
    Empty(String),
}

pub type TaskLists = HashMap<String, Vec<Task>>;

/// Create a list.  `id: None` auto-generates `tasks-<n>` with the smallest
/// `n` past every existing auto id, so ids stay unique across reloads.
pub fn start_list(lists: &mut TaskLists, id: Option<String>) -> Result<String, TaskError> {
    let id = match id {
        Some(id) => {
            if lists.contains_key(&id) {
                return Err(TaskError::Exists(id));
            }
            id
        }
        None => {
            let next = lists
                .keys()
                .filter_map(|k| k.strip_prefix("tasks-"))
                .filter_map(|n| n.parse::<u64>().ok())
                .max()
                .map(|n| n + 1)
                .unwrap_or(1);
            format!("tasks-{next}")
        }
    };
    lists.insert(id.clone(), Vec::new());
    Ok(id)
}

/// Append a task; a present id makes this a no-op.
pub fn add_task(lists: &mut TaskLists, list: &str, id: &str, data: Value) -> Result<(), TaskError> {
    let tasks = lists
        .get_mut(list)
        .ok_or_else(|| TaskError::ListNotFound(list.to_string()))?;
    if !tasks.iter().any(|t| t.id == id) {
        tasks.push(Task::new(id, data));
    }
    Ok(())
}

/// Prepend a task; a present id makes this a no-op.
pub fn push_task(lists: &mut TaskLists, list: &str, id: &str, data: Value) -> Result<(), TaskError> {
    let tasks = lists
        .get_mut(list)
        .ok_or_else(|| TaskError::ListNotFound(list.to_string()))?;
    if !tasks.iter().any(|t| t.id == id) {
        tasks.insert(0, Task::new(id, data));
    }
    Ok(())
}

/// Mark the first task with the given id as done.  Later duplicates, if the
/// list somehow contains any, are untouched.
pub fn complete_task(
    lists: &mut TaskLists,
    list: &str,
    id: &str,
    result: Value,
) -> Result<(), TaskError> {
    resolve_first(lists, list, id).map(|task| {
        task.outcome = TaskOutcome::Done;
        task.result = Some(result);
    })
}

/// Mark the first task with the given id as failed, recording the message.
pub fn fail_task(
    lists: &mut TaskLists,
    list: &str,
    id: &str,
    message: &str,
) -> Result<(), TaskError> {
    resolve_first(lists, list, id).map(|task| {
        task.outcome = TaskOutcome::Failed;
        task.result = Some(Value::String(message.to_string()));
    })
}

fn resolve_first<'a>(
    lists: &'a mut TaskLists,
    list: &str,
    id: &str,
) -> Result<&'a mut Task, TaskError> {
    let tasks = lists
        .get_mut(list)
        .ok_or_else(|| TaskError::ListNotFound(list.to_string()))?;
    tasks
        .iter_mut()
        .find(|t| t.id == id)
        .ok_or_else(|| TaskError::TaskNotFound {
            list: list.to_string(),
            id: id.to_string(),
        })
}

/// First task still todo, front to back.
pub fn peek_task<'a>(lists: &'a TaskLists, list: &str) -> Result<&'a Task, TaskError> {
    let tasks = lists
        .get(list)
        .ok_or_else(|| TaskError::ListNotFound(list.to_string()))?;
    tasks
        .iter()
        .find(|t| t.outcome == TaskOutcome::Todo)
        .ok_or_else(|| TaskError::Empty(list.to_string()))
}

/// True iff no task in the list is still todo.
pub fn all_tasks_complete(lists: &TaskLists, list: &str) -> Result<bool, TaskError> {
    let tasks = lists
        .get(list)
        .ok_or_else(|| TaskError::ListNotFound(list.to_string()))?;
    Ok(tasks.iter().all(|t| t.outcome != TaskOutcome::Todo))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
