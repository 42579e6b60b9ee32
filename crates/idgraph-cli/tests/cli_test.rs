//! End-to-end tests driving the idgraph binary against a file store

use std::path::Path;
use std::process::{Command, Output};

use idgraph_config::testing::{TestEnvironment, TEST_LDAP_ACCESSOR, TEST_USERPASS_ACCESSOR};
use serde_json::Value;

fn write_config(env: &TestEnvironment) -> std::path::PathBuf {
    let contents = format!(
        r#"
[storage]
root = {root:?}
backend = "file"

[identity]
load_workers = 4

[[mounts]]
accessor = "{userpass}"
type = "userpass"
path = "auth/userpass/"

[[mounts]]
accessor = "{ldap}"
type = "ldap"
path = "auth/ldap/"

[logging]
level = "error"
"#,
        root = env.storage_root.display().to_string(),
        userpass = TEST_USERPASS_ACCESSOR,
        ldap = TEST_LDAP_ACCESSOR,
    );
    env.write_config(&contents).unwrap()
}

fn idgraph(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_idgraph"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("IDGRAPH_LOG")
        .env_remove("RUST_LOG")
        .env_remove("IDGRAPH_STORAGE_ROOT")
        .env_remove("IDGRAPH_LOG_LEVEL")
        .output()
        .expect("Failed to execute idgraph")
}

fn json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_login_is_idempotent_across_runs() {
    let env = TestEnvironment::new().unwrap();
    let config = write_config(&env);

    let first = json(&idgraph(&config, &["login", "--mount", TEST_USERPASS_ACCESSOR, "alice"]));
    let second = json(&idgraph(&config, &["login", "--mount", TEST_USERPASS_ACCESSOR, "alice"]));
    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["aliases"][0]["name"], "alice");

    let stats = json(&idgraph(&config, &["stats"]));
    assert_eq!(stats["entities"], 1);
    assert_eq!(stats["entity_aliases"], 1);
}

#[test]
fn test_alias_collision_is_reported() {
    let env = TestEnvironment::new().unwrap();
    let config = write_config(&env);

    json(&idgraph(&config, &["login", "--mount", TEST_USERPASS_ACCESSOR, "bob"]));
    let other = json(&idgraph(&config, &["entity", "write-by-name", "robert"]));
    let id = other["id"].as_str().unwrap();

    let output = idgraph(
        &config,
        &[
            "alias",
            "write",
            "--canonical-id",
            id,
            "--name",
            "bob",
            "--mount-accessor",
            TEST_USERPASS_ACCESSOR,
        ],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("combination of mount and alias name is already in use"));
}

#[test]
fn test_group_policies_and_external_login() {
    let env = TestEnvironment::new().unwrap();
    let config = write_config(&env);

    let entity = json(&idgraph(&config, &["login", "--mount", TEST_LDAP_ACCESSOR, "carol"]));
    let entity_id = entity["id"].as_str().unwrap();

    json(&idgraph(
        &config,
        &[
            "group",
            "write-by-name",
            "eng",
            "--policies",
            "build,deploy",
            "--member-entity-ids",
            entity_id,
        ],
    ));
    let ops = json(&idgraph(
        &config,
        &["group", "write-by-name", "ops", "--type", "external", "--policies", "pager"],
    ));
    json(&idgraph(
        &config,
        &[
            "group-alias",
            "write",
            "--canonical-id",
            ops["id"].as_str().unwrap(),
            "--name",
            "cn=ops",
            "--mount-accessor",
            TEST_LDAP_ACCESSOR,
        ],
    ));

    let view = json(&idgraph(
        &config,
        &[
            "login",
            "--mount",
            TEST_LDAP_ACCESSOR,
            "carol",
            "--group-alias",
            "cn=ops",
        ],
    ));
    assert_eq!(view["id"], entity["id"]);
    assert_eq!(
        view["group_policies"],
        serde_json::json!(["build", "deploy", "pager"])
    );

    let missing = idgraph(&config, &["lookup", "--name", "nobody"]);
    assert!(!missing.status.success());
}
