//! CLI-level checks: exit codes and the diagnostic dry runs.

use assert_cmd::Command;
use predicates::prelude::*;

fn write(dir: &std::path::Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

const INVENTORY: &str = "[web]\nweb1 ansible_connection=local\nweb2 ansible_connection=local\n";

#[test]
fn syntax_check_passes_valid_playbook() {
    let dir = tempfile::tempdir().unwrap();
    let inventory = write(dir.path(), "hosts", INVENTORY);
    let playbook = write(
        dir.path(),
        "site.yml",
        "- hosts: web\n  gather_facts: false\n  tasks:\n    - debug:\n",
    );

    Command::cargo_bin("stagehand")
        .unwrap()
        .args(["--syntax-check", "-i"])
        .arg(&inventory)
        .arg(&playbook)
        .assert()
        .success()
        .stdout(predicate::str::contains("syntax check passed"));
}

#[test]
fn malformed_playbook_exits_three() {
    let dir = tempfile::tempdir().unwrap();
    let playbook = write(dir.path(), "bad.yml", "just a scalar\n");

    Command::cargo_bin("stagehand")
        .unwrap()
        .arg("--syntax-check")
        .arg(&playbook)
        .assert()
        .code(3);
}

#[test]
fn unsupported_construct_exits_four() {
    let dir = tempfile::tempdir().unwrap();
    let playbook = write(
        dir.path(),
        "serial.yml",
        "- hosts: all\n  serial: 2\n  tasks: []\n",
    );

    Command::cargo_bin("stagehand")
        .unwrap()
        .arg("--syntax-check")
        .arg(&playbook)
        .assert()
        .code(4);
}

#[test]
fn failing_task_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    let inventory = write(dir.path(), "hosts", "[one]\nsolo ansible_connection=local\n");
    let playbook = write(
        dir.path(),
        "fail.yml",
        "- hosts: one\n  gather_facts: false\n  tasks:\n    - command: /bin/false\n",
    );

    Command::cargo_bin("stagehand")
        .unwrap()
        .arg("-i")
        .arg(&inventory)
        .arg(&playbook)
        .assert()
        .code(2);
}

#[test]
fn list_hosts_prints_matches_without_contact() {
    let dir = tempfile::tempdir().unwrap();
    let inventory = write(dir.path(), "hosts", INVENTORY);
    let playbook = write(
        dir.path(),
        "site.yml",
        "- name: demo\n  hosts: web\n  tasks:\n    - debug:\n",
    );

    Command::cargo_bin("stagehand")
        .unwrap()
        .args(["--list-hosts", "-i"])
        .arg(&inventory)
        .arg(&playbook)
        .assert()
        .success()
        .stdout(predicate::str::contains("web1").and(predicate::str::contains("web2")));
}

#[test]
fn list_tasks_and_tags() {
    let dir = tempfile::tempdir().unwrap();
    let inventory = write(dir.path(), "hosts", INVENTORY);
    let playbook = write(
        dir.path(),
        "site.yml",
        r#"
- name: demo
  hosts: web
  tasks:
    - name: first step
      debug:
      tags: [setup]
    - name: second step
      debug:
      tags: [deploy]
"#,
    );

    Command::cargo_bin("stagehand")
        .unwrap()
        .args(["--list-tasks", "--list-tags", "-i"])
        .arg(&inventory)
        .arg(&playbook)
        .assert()
        .success()
        .stdout(
            predicate::str::contains("first step")
                .and(predicate::str::contains("second step"))
                .and(predicate::str::contains("deploy")),
        );
}

#[test]
fn json_output_emits_document() {
    let dir = tempfile::tempdir().unwrap();
    let inventory = write(dir.path(), "hosts", "[one]\nsolo ansible_connection=local\n");
    let playbook = write(
        dir.path(),
        "ok.yml",
        "- name: json demo\n  hosts: one\n  gather_facts: false\n  tasks:\n    - name: hello\n      debug:\n        msg: hi\n",
    );

    let output = Command::cargo_bin("stagehand")
        .unwrap()
        .args(["--output", "json", "-i"])
        .arg(&inventory)
        .arg(&playbook)
        .output()
        .unwrap();
    assert!(output.status.success());

    let document: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(document["plays"][0]["name"], "json demo");
    assert_eq!(
        document["plays"][0]["tasks"][0]["per_host"]["solo"]["status"],
        "ok"
    );
    assert_eq!(document["stats"]["solo"]["ok"], 1);
}
