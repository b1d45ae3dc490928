// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the rdgate binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn rdgate() -> Command {
    Command::cargo_bin("rdgate").unwrap()
}

/// Write `contents` as rdgate.toml in a fresh temp dir
fn config_dir(contents: &str) -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("rdgate.toml"), contents).unwrap();
    temp
}

#[test]
fn test_version_command() {
    rdgate()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("rdgate v"));
}

#[test]
fn test_help_command() {
    rdgate()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Remote Desktop Gateway"))
        .stdout(predicate::str::contains("synth"))
        .stdout(predicate::str::contains("bootstrap"));
}

#[test]
fn test_synth_default_template() {
    let temp = TempDir::new().unwrap();

    rdgate()
        .current_dir(temp.path())
        .arg("synth")
        .assert()
        .success()
        .stdout(predicate::str::contains("AWS::EC2::VPC"))
        .stdout(predicate::str::contains("AWS::IAM::Role"))
        .stdout(predicate::str::contains("AWS::EC2::SecurityGroup"))
        .stdout(predicate::str::contains("AWS::EC2::Instance"))
        .stdout(predicate::str::contains("AWS::EC2::InternetGateway"))
        .stdout(predicate::str::contains("gatewayInstance"))
        .stdout(predicate::str::contains("58.96.89.81/32"));
}

#[test]
fn test_synth_writes_output_file() {
    let temp = TempDir::new().unwrap();
    let output = temp.path().join("template.json");

    rdgate()
        .current_dir(temp.path())
        .args(["synth", "--output"])
        .arg(&output)
        .assert()
        .success();

    let template: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
    assert!(template["Outputs"]["gatewayInstance"].is_object());
    assert_eq!(template["Resources"].as_object().unwrap().len(), 11);
    assert_eq!(template["Resources"]["vpcPublicSubnet1"]["Type"], "AWS::EC2::Subnet");
    assert_eq!(
        template["Resources"]["RoleInstanceProfile"]["Type"],
        "AWS::IAM::InstanceProfile"
    );
}

#[test]
fn test_synth_rejects_bad_network() {
    let temp = config_dir(
        r#"
[network]
cidr = "10.0.0.1/16"
"#,
    );

    rdgate()
        .current_dir(temp.path())
        .arg("synth")
        .assert()
        .failure()
        .stderr(predicate::str::contains("network"));
}

#[test]
fn test_synth_rejects_bad_peer() {
    let temp = config_dir(
        r#"
[[security.trusted_peers]]
peer = "not-an-address"
ports = "3389"
protocol = "tcp"
"#,
    );

    rdgate()
        .current_dir(temp.path())
        .arg("synth")
        .assert()
        .failure()
        .stderr(predicate::str::contains("security"));
}

#[test]
fn test_synth_rejects_bad_dns_name() {
    let temp = config_dir(
        r#"
[bootstrap]
dns_name = "-bad-.example.com"
"#,
    );

    rdgate()
        .current_dir(temp.path())
        .arg("synth")
        .assert()
        .failure()
        .stderr(predicate::str::contains("bootstrap-script"));
}

#[test]
fn test_script_substitutes_dns_name() {
    let temp = config_dir(
        r#"
[bootstrap]
dns_name = "gw.example.com"
"#,
    );

    rdgate()
        .current_dir(temp.path())
        .arg("script")
        .assert()
        .success()
        .stdout(predicate::str::contains("New-SelfSignedCertificate"))
        .stdout(predicate::str::contains("gw.example.com"))
        .stdout(predicate::str::contains("Restart-Service TSGateway"))
        .stdout(predicate::str::contains("{{").not());
}

#[test]
fn test_deploy_dry_run_prints_instance_handle() {
    let temp = TempDir::new().unwrap();

    rdgate()
        .current_dir(temp.path())
        .args(["--dry-run", "deploy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[DRY RUN]"))
        .stdout(predicate::str::contains("gatewayInstance = i-"));
}

#[test]
fn test_deploy_without_collaborator_fails() {
    let temp = TempDir::new().unwrap();

    rdgate()
        .current_dir(temp.path())
        .arg("deploy")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--dry-run"));
}

#[test]
fn test_bootstrap_dry_run() {
    let temp = TempDir::new().unwrap();

    rdgate()
        .current_dir(temp.path())
        .args(["--dry-run", "bootstrap"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1.GenerateCertificate"))
        .stdout(predicate::str::contains("6.ActivateConfiguration"))
        .stdout(predicate::str::contains("RD-CAP-"))
        .stdout(predicate::str::contains("RD-RAP-"))
        .stdout(predicate::str::contains("Bootstrap completed successfully"));
}

#[test]
fn test_bootstrap_missing_powershell_halts_at_first_state() {
    let temp = config_dir(
        r#"
[bootstrap]
powershell = "rdgate-no-such-powershell"
"#,
    );

    rdgate()
        .current_dir(temp.path())
        .arg("bootstrap")
        .assert()
        .failure()
        .stdout(predicate::str::contains("[failed] 1.GenerateCertificate"))
        .stdout(predicate::str::contains("2.ExportCertificate").not());
}

#[test]
fn test_init_command() {
    let temp = TempDir::new().unwrap();
    let config_path = temp.path().join("rdgate.toml");

    rdgate()
        .arg("--config")
        .arg(&config_path)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created configuration file"));

    assert!(config_path.exists());
    let content = fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("[network]"));
    assert!(content.contains("[bootstrap]"));
    assert!(content.contains("allow_all_outbound = false"));
    assert!(content.contains("Outbound traffic is denied by default"));
    assert!(content.contains("egress entry for 443"));
    assert!(!content.contains("user_groups"));
}

#[test]
fn test_init_configuration_synthesizes() {
    let temp = TempDir::new().unwrap();

    rdgate()
        .current_dir(temp.path())
        .arg("init")
        .assert()
        .success();

    rdgate()
        .current_dir(temp.path())
        .arg("synth")
        .assert()
        .success()
        .stdout(predicate::str::contains("gatewayInstance"));
}

#[test]
fn test_init_no_overwrite() {
    let temp = config_dir("# existing config");

    rdgate()
        .current_dir(temp.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_init_force_overwrite() {
    let temp = config_dir("# existing config");

    rdgate()
        .current_dir(temp.path())
        .args(["init", "--force"])
        .assert()
        .success();

    let content = fs::read_to_string(temp.path().join("rdgate.toml")).unwrap();
    assert!(content.contains("[network]"));
}

#[test]
fn test_config_command_defaults() {
    let temp = TempDir::new().unwrap();

    rdgate()
        .current_dir(temp.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Using defaults"))
        .stdout(predicate::str::contains("RdGateStack"))
        .stdout(predicate::str::contains("172.16.0.0/16"));
}

#[test]
fn test_config_command_rejects_bad_log_level() {
    let temp = config_dir(
        r#"
[logging]
level = "loud"
"#,
    );

    rdgate()
        .current_dir(temp.path())
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown log level"));
}
