//! End-to-end runner behavior over the local transport.

use indexmap::IndexMap;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::Value;
use stagehand::callback::Callback;
use stagehand::executor::{HostStats, PlaybookRunner, RunnerOptions, TaskResult, TaskStatus};
use stagehand::inventory::Inventory;
use stagehand::playbook::Playbook;
use std::sync::Arc;

/// One recorded reporting event.
#[derive(Debug, Clone)]
enum Event {
    TaskStart {
        index: usize,
        name: String,
        is_handler: bool,
    },
    HostResult {
        index: usize,
        host: String,
        status: TaskStatus,
        changed: bool,
        value: Value,
    },
    Recap(IndexMap<String, HostStats>),
}

/// Callback that records every event for assertions.
#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn results_for_task(&self, task_name: &str) -> Vec<(String, TaskStatus, Value)> {
        let events = self.events();
        let index = events.iter().find_map(|e| match e {
            Event::TaskStart { index, name, .. } if name == task_name => Some(*index),
            _ => None,
        });
        let Some(task_index) = index else {
            return Vec::new();
        };
        events
            .iter()
            .filter_map(|e| match e {
                Event::HostResult {
                    index,
                    host,
                    status,
                    value,
                    ..
                } if *index == task_index => Some((host.clone(), *status, value.clone())),
                _ => None,
            })
            .collect()
    }

    fn recap(&self) -> IndexMap<String, HostStats> {
        self.events()
            .iter()
            .rev()
            .find_map(|e| match e {
                Event::Recap(stats) => Some(stats.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

impl Callback for Recorder {
    fn on_task_start(&mut self, index: usize, name: &str, _module: &str, is_handler: bool) {
        self.events.lock().push(Event::TaskStart {
            index,
            name: name.to_string(),
            is_handler,
        });
    }

    fn on_host_result(&mut self, index: usize, host: &str, result: &TaskResult) {
        self.events.lock().push(Event::HostResult {
            index,
            host: host.to_string(),
            status: result.status,
            changed: result.changed,
            value: result.value.clone(),
        });
    }

    fn on_recap(&mut self, stats: &IndexMap<String, HostStats>) {
        self.events.lock().push(Event::Recap(stats.clone()));
    }
}

fn local_inventory(hosts: &[&str], group: &str) -> Inventory {
    let mut lines = vec![format!("[{}]", group)];
    for host in hosts {
        lines.push(format!("{} ansible_connection=local", host));
    }
    Inventory::from_ini_str(&lines.join("\n")).unwrap()
}

async fn run_playbook(
    inventory: Inventory,
    playbook_yaml: &str,
    options: RunnerOptions,
) -> (Recorder, stagehand::executor::RunReport) {
    let playbook = Playbook::parse(playbook_yaml, None).unwrap();
    let recorder = Recorder::default();
    let mut runner = PlaybookRunner::new(inventory, options);
    runner.add_callback(Box::new(recorder.clone()));
    let report = runner.run(&playbook).await.unwrap();
    (recorder, report)
}

#[tokio::test]
async fn two_hosts_linear_fan_out() {
    let inventory = local_inventory(&["web1", "web2"], "web");
    let playbook = r#"
- name: fan out
  hosts: web
  gather_facts: false
  tasks:
    - name: greet
      debug:
        msg: "hello {{ inventory_hostname }}"
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;

    let results = recorder.results_for_task("greet");
    assert_eq!(results.len(), 2);
    for (host, status, value) in &results {
        assert_eq!(*status, TaskStatus::Ok);
        let stdout = value["stdout"].as_str().unwrap();
        assert_eq!(stdout, format!("hello {}", host));
    }

    let recap = recorder.recap();
    assert_eq!(recap["web1"].ok, 1);
    assert_eq!(recap["web2"].ok, 1);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn loop_with_conditional_and_register() {
    let inventory = local_inventory(&["solo"], "box");
    let playbook = r#"
- hosts: box
  gather_facts: false
  tasks:
    - name: echo items
      command: "/bin/echo {{ item }}"
      loop: [a, b, c]
      when: item != 'b'
      register: r
    - name: verify register
      assert:
        that:
          - r.results | length == 3
          - r.changed
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;

    let results = recorder.results_for_task("echo items");
    assert_eq!(results.len(), 1);
    let (_, status, value) = &results[0];
    assert_eq!(*status, TaskStatus::Changed);

    let iterations = value["results"].as_array().unwrap();
    assert_eq!(iterations.len(), 3);
    assert_eq!(iterations[0]["stdout"].as_str().unwrap().trim(), "a");
    assert_eq!(iterations[1]["skipped"], Value::Bool(true));
    assert_eq!(iterations[2]["stdout"].as_str().unwrap().trim(), "c");

    let verify = recorder.results_for_task("verify register");
    assert_eq!(verify[0].1, TaskStatus::Ok);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn empty_loop_is_skipped_unchanged() {
    let inventory = local_inventory(&["solo"], "box");
    let playbook = r#"
- hosts: box
  gather_facts: false
  vars:
    nothing: []
  tasks:
    - name: looped over nothing
      command: "/bin/echo {{ item }}"
      loop: "{{ nothing }}"
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;
    let (_, status, value) = &recorder.results_for_task("looped over nothing")[0];
    assert_eq!(*status, TaskStatus::Skipped);
    assert_eq!(value["changed"], Value::Bool(false));
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn block_rescue_always() {
    let inventory = local_inventory(&["solo"], "box");
    let playbook = r#"
- hosts: box
  gather_facts: false
  tasks:
    - block:
        - name: body ok
          command: /bin/true
        - name: body fails
          command: /bin/false
        - name: body never reached
          debug:
      rescue:
        - name: rescue task
          debug:
            msg: rescued
      always:
        - name: always task
          debug:
            msg: cleanup
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;

    assert_eq!(
        recorder.results_for_task("body ok")[0].1,
        TaskStatus::Changed
    );
    assert_eq!(
        recorder.results_for_task("body fails")[0].1,
        TaskStatus::Failed
    );
    assert!(recorder.results_for_task("body never reached").is_empty());
    assert_eq!(
        recorder.results_for_task("rescue task")[0].1,
        TaskStatus::Ok
    );
    assert_eq!(
        recorder.results_for_task("always task")[0].1,
        TaskStatus::Ok
    );

    // The rescued failure does not count against the host.
    let recap = recorder.recap();
    assert_eq!(recap["solo"].failed, 0);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn always_runs_without_rescue() {
    let inventory = local_inventory(&["solo"], "box");
    let playbook = r#"
- hosts: box
  gather_facts: false
  tasks:
    - block:
        - name: failing body
          command: /bin/false
      always:
        - name: cleanup anyway
          debug:
    - name: after block
      debug:
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;

    assert_eq!(
        recorder.results_for_task("cleanup anyway")[0].1,
        TaskStatus::Ok
    );
    // No rescue: the failure sticks and later tasks skip the host.
    assert!(recorder.results_for_task("after block").is_empty());
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn empty_body_with_always_still_runs_always() {
    let inventory = local_inventory(&["solo"], "box");
    let playbook = r#"
- hosts: box
  gather_facts: false
  tasks:
    - block: []
      always:
        - name: lone always
          debug:
"#;

    let (recorder, _) = run_playbook(inventory, playbook, RunnerOptions::default()).await;
    assert_eq!(
        recorder.results_for_task("lone always")[0].1,
        TaskStatus::Ok
    );
}

#[tokio::test]
async fn handler_notified_once_runs_once_at_flush() {
    let inventory = local_inventory(&["solo"], "box");
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let playbook = format!(
        r#"
- hosts: box
  gather_facts: false
  tasks:
    - name: task a
      command: /bin/echo change
      notify: bump counter
    - name: task a again
      command: /bin/echo change
      notify: bump counter
    - name: task b
      debug:
  handlers:
    - name: bump counter
      shell: "echo x >> {}"
"#,
        counter.display()
    );

    let (recorder, report) =
        run_playbook(inventory, &playbook, RunnerOptions::default()).await;

    // The handler ran exactly once, after the tasks.
    let content = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(content.lines().count(), 1);

    let events = recorder.events();
    let handler_start = events
        .iter()
        .position(|e| matches!(e, Event::TaskStart { is_handler: true, .. }))
        .unwrap();
    let task_b_start = events
        .iter()
        .position(|e| matches!(e, Event::TaskStart { name, .. } if name == "task b"))
        .unwrap();
    assert!(handler_start > task_b_start, "handler must flush after tasks");
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn unnotified_handler_never_runs() {
    let inventory = local_inventory(&["solo"], "box");
    let playbook = r#"
- hosts: box
  gather_facts: false
  tasks:
    - name: no change
      debug:
  handlers:
    - name: silent
      command: /bin/false
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;
    assert!(recorder.results_for_task("silent").is_empty());
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn unreachable_host_is_excluded() {
    // host2 points at a closed local port over ssh; connect attempts fail
    // fast and classify as unreachable.
    let inventory = Inventory::from_ini_str(
        r#"
[mixed]
host1 ansible_connection=local
host2 ansible_host=127.0.0.1 ansible_port=1
"#,
    )
    .unwrap();

    let playbook = r#"
- hosts: mixed
  gather_facts: false
  tasks:
    - name: first
      command: /bin/echo one
    - name: second
      command: /bin/echo two
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;

    let first = recorder.results_for_task("first");
    assert_eq!(first.len(), 2);
    let host2_status = first.iter().find(|(h, _, _)| h == "host2").unwrap().1;
    assert_eq!(host2_status, TaskStatus::Unreachable);

    // host2 receives no further attempts; host1 completes everything.
    let second = recorder.results_for_task("second");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].0, "host1");

    let recap = recorder.recap();
    assert_eq!(recap["host2"].unreachable, 1);
    assert_eq!(recap["host1"].ok, 2);
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn set_fact_and_register_visible_to_later_tasks() {
    let inventory = local_inventory(&["solo"], "box");
    let playbook = r#"
- hosts: box
  gather_facts: false
  tasks:
    - name: remember
      set_fact:
        color: teal
    - name: capture
      command: /bin/echo captured
      register: echoed
    - name: check both
      assert:
        that:
          - color == 'teal'
          - "'captured' in echoed.stdout"
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;
    assert_eq!(recorder.results_for_task("check both")[0].1, TaskStatus::Ok);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn ignore_errors_keeps_host_eligible() {
    let inventory = local_inventory(&["solo"], "box");
    let playbook = r#"
- hosts: box
  gather_facts: false
  tasks:
    - name: soft failure
      command: /bin/false
      ignore_errors: true
    - name: still runs
      debug:
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;
    assert_eq!(recorder.results_for_task("still runs")[0].1, TaskStatus::Ok);
    let recap = recorder.recap();
    assert_eq!(recap["solo"].failed, 0);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn failed_when_and_changed_when_overrides() {
    let inventory = local_inventory(&["solo"], "box");
    let playbook = r#"
- hosts: box
  gather_facts: false
  tasks:
    - name: rc gated
      command: /bin/echo fine
      register: out
      failed_when: out.rc != 0
      changed_when: false
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;
    let (_, status, value) = &recorder.results_for_task("rc gated")[0];
    assert_eq!(*status, TaskStatus::Ok);
    assert_eq!(value["changed"], Value::Bool(false));
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn check_mode_skips_commands_and_reports_would_change() {
    let inventory = local_inventory(&["solo"], "box");
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("never-created");
    let playbook = format!(
        r#"
- hosts: box
  gather_facts: false
  tasks:
    - name: dry command
      command: "/bin/touch {target}"
    - name: dry copy
      copy:
        content: data
        dest: "{target}"
"#,
        target = target.display()
    );

    let options = RunnerOptions {
        check_mode: true,
        ..Default::default()
    };
    let (recorder, report) = run_playbook(inventory, &playbook, options).await;

    assert_eq!(
        recorder.results_for_task("dry command")[0].1,
        TaskStatus::Skipped
    );
    assert_eq!(
        recorder.results_for_task("dry copy")[0].1,
        TaskStatus::Changed
    );
    assert!(!target.exists());
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn any_errors_fatal_stops_all_hosts() {
    let inventory = local_inventory(&["a", "b"], "pair");
    let playbook = r#"
- hosts: pair
  gather_facts: false
  any_errors_fatal: true
  tasks:
    - name: fail on one
      command: "{{ '/bin/false' if inventory_hostname == 'a' else '/bin/true' }}"
    - name: never runs
      debug:
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;
    assert!(recorder.results_for_task("never runs").is_empty());
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn forks_one_behaves_serially() {
    let inventory = local_inventory(&["h1", "h2", "h3"], "trio");
    let playbook = r#"
- hosts: trio
  gather_facts: false
  tasks:
    - name: serial echo
      command: "/bin/echo {{ inventory_hostname }}"
"#;

    let options = RunnerOptions {
        forks: 1,
        ..Default::default()
    };
    let (recorder, report) = run_playbook(inventory, playbook, options).await;
    let results = recorder.results_for_task("serial echo");
    assert_eq!(results.len(), 3);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn empty_inventory_completes_cleanly() {
    let inventory = Inventory::from_ini_str("").unwrap();
    let playbook = r#"
- hosts: all
  gather_facts: false
  tasks:
    - name: unreached
      debug:
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;
    assert!(recorder.results_for_task("unreached").is_empty());
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn delegation_uses_origin_vars() {
    let inventory = Inventory::from_ini_str(
        r#"
[app]
origin ansible_connection=local role_name=frontend

[util]
runner ansible_connection=local
"#,
    )
    .unwrap();
    let playbook = r#"
- hosts: origin
  gather_facts: false
  tasks:
    - name: delegated echo
      command: "/bin/echo {{ role_name }} {{ inventory_hostname }}"
      delegate_to: runner
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;
    let (_, status, value) = &recorder.results_for_task("delegated echo")[0];
    assert_eq!(*status, TaskStatus::Changed);
    // Templating stayed on the originating host's variables.
    assert_eq!(value["stdout"].as_str().unwrap().trim(), "frontend origin");
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn meta_flush_handlers_runs_pending_early() {
    let inventory = local_inventory(&["solo"], "box");
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("order");
    let playbook = format!(
        r#"
- hosts: box
  gather_facts: false
  tasks:
    - name: notify early
      command: /bin/echo changed
      notify: record
    - name: flush now
      meta: flush_handlers
    - name: after flush
      shell: "echo after >> {marker}"
  handlers:
    - name: record
      shell: "echo handler >> {marker}"
"#,
        marker = marker.display()
    );

    let (_, report) = run_playbook(inventory, &playbook, RunnerOptions::default()).await;
    let content = std::fs::read_to_string(&marker).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines, vec!["handler", "after"]);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn tag_filtering_selects_tasks() {
    let inventory = local_inventory(&["solo"], "box");
    let playbook = r#"
- hosts: box
  gather_facts: false
  tasks:
    - name: tagged wanted
      debug:
      tags: [deploy]
    - name: tagged other
      debug:
      tags: [cleanup]
    - name: untagged
      debug:
"#;

    let options = RunnerOptions {
        tags: vec!["deploy".to_string()],
        ..Default::default()
    };
    let (recorder, _) = run_playbook(inventory, playbook, options).await;
    assert_eq!(recorder.results_for_task("tagged wanted").len(), 1);
    assert!(recorder.results_for_task("tagged other").is_empty());
    assert!(recorder.results_for_task("untagged").is_empty());
}

#[tokio::test]
async fn gather_facts_exposes_os_family() {
    let inventory = local_inventory(&["solo"], "box");
    let playbook = r#"
- hosts: box
  gather_facts: true
  tasks:
    - name: facts present
      assert:
        that:
          - ansible_os_family is defined
          - ansible_hostname is defined
"#;

    let (recorder, report) = run_playbook(inventory, playbook, RunnerOptions::default()).await;
    assert_eq!(
        recorder.results_for_task("facts present")[0].1,
        TaskStatus::Ok
    );
    assert_eq!(report.exit_code(), 0);
}
