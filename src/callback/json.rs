//! The machine-readable output stream.
//!
//! Accumulates the whole run as one JSON document and prints it at recap
//! time. Per-host entries are keyed on `(task_index, host_name)`, so
//! results arriving out of order within a task land in the right slot.

use super::Callback;
use crate::executor::{HostStats, TaskResult};
use indexmap::IndexMap;
use serde_json::{json, Value};

#[derive(Default)]
struct PlayRecord {
    name: String,
    hosts: Vec<String>,
    /// Task records indexed by task_index.
    tasks: IndexMap<usize, TaskRecord>,
}

#[derive(Default)]
struct TaskRecord {
    name: String,
    module: String,
    per_host: IndexMap<String, Value>,
}

/// Collects the structured result document.
#[derive(Default)]
pub struct JsonCallback {
    plays: Vec<PlayRecord>,
}

impl JsonCallback {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    fn result_to_value(result: &TaskResult) -> Value {
        let mut entry = json!({
            "status": result.status.to_string(),
            "changed": result.changed,
        });
        if let Some(msg) = &result.msg {
            entry["msg"] = json!(msg);
        }
        for key in ["stdout", "stderr", "rc", "results"] {
            if let Some(value) = result.value.get(key) {
                entry[key] = value.clone();
            }
        }
        if let Some(diff) = &result.diff {
            entry["diff"] = json!({
                "before": diff.before,
                "after": diff.after,
                "before_header": diff.before_header,
                "after_header": diff.after_header,
            });
        }
        entry
    }
}

impl Callback for JsonCallback {
    fn on_play_start(&mut self, name: &str, hosts: &[String]) {
        self.plays.push(PlayRecord {
            name: name.to_string(),
            hosts: hosts.to_vec(),
            tasks: IndexMap::new(),
        });
    }

    fn on_task_start(&mut self, task_index: usize, name: &str, module: &str, _is_handler: bool) {
        if let Some(play) = self.plays.last_mut() {
            play.tasks.insert(
                task_index,
                TaskRecord {
                    name: name.to_string(),
                    module: module.to_string(),
                    per_host: IndexMap::new(),
                },
            );
        }
    }

    fn on_host_result(&mut self, task_index: usize, host: &str, result: &TaskResult) {
        if let Some(play) = self.plays.last_mut() {
            // Keyed on (task_index, host): late arrivals within a task
            // cannot clobber another task's slot.
            let record = play.tasks.entry(task_index).or_default();
            record
                .per_host
                .insert(host.to_string(), Self::result_to_value(result));
        }
    }

    fn on_recap(&mut self, stats: &IndexMap<String, HostStats>) {
        let plays: Vec<Value> = self
            .plays
            .iter()
            .map(|play| {
                let tasks: Vec<Value> = play
                    .tasks
                    .values()
                    .map(|task| {
                        json!({
                            "name": task.name,
                            "module": task.module,
                            "per_host": task.per_host,
                        })
                    })
                    .collect();
                json!({
                    "name": play.name,
                    "hosts": play.hosts,
                    "tasks": tasks,
                })
            })
            .collect();

        let stats: IndexMap<&String, Value> = stats
            .iter()
            .map(|(host, stat)| {
                (
                    host,
                    json!({
                        "ok": stat.ok,
                        "changed": stat.changed,
                        "failed": stat.failed,
                        "skipped": stat.skipped,
                        "unreachable": stat.unreachable,
                    }),
                )
            })
            .collect();

        let document = json!({
            "plays": plays,
            "stats": stats,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&document).unwrap_or_else(|_| "{}".to_string())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskStatus;

    #[test]
    fn test_out_of_order_results_keyed_correctly() {
        let mut callback = JsonCallback::new();
        callback.on_play_start("p", &["a".to_string(), "b".to_string()]);
        callback.on_task_start(0, "first", "debug", false);
        callback.on_task_start(1, "second", "debug", false);

        // Host b's result for task 0 arrives after task 1 started.
        callback.on_host_result(1, "a", &TaskResult::skipped("later"));
        callback.on_host_result(0, "b", &TaskResult::failed("early"));

        let play = &callback.plays[0];
        assert_eq!(
            play.tasks[&0].per_host["b"]["status"],
            serde_json::json!(TaskStatus::Failed.to_string())
        );
        assert_eq!(
            play.tasks[&1].per_host["a"]["status"],
            serde_json::json!("skipped")
        );
    }
}
