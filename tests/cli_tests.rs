use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

fn isotest() -> Command {
    let mut cmd = Command::cargo_bin("isotest").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

// 帮助信息中不出现内部子命令
#[test]
fn test_help_lists_commands() {
    isotest()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("discover"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("__remote-executor").not());
}

// 不是动态库的文件：报告一条错误，但发现本身正常结束
#[test]
fn test_discover_reports_malformed_module() {
    let dir = tempdir().unwrap();
    let module = dir.path().join("libgarbage_tests.so");
    fs::write(&module, "this is not a shared library").unwrap();

    isotest()
        .arg("discover")
        .arg(&module)
        .assert()
        .success()
        .stderr(predicate::str::contains("libgarbage_tests.so"))
        .stderr(predicate::str::contains("ImageError"));
}

#[test]
fn test_run_with_errors_exits_non_zero() {
    let dir = tempdir().unwrap();
    let module = dir.path().join("libgarbage_tests.so");
    fs::write(&module, "this is not a shared library").unwrap();

    isotest()
        .args(["-q", "run"])
        .arg(&module)
        .assert()
        .failure()
        .stdout(predicate::str::contains("Test Execution Summary"))
        .stdout(predicate::str::contains("1 errors"));
}

#[test]
fn test_excluded_modules_are_skipped() {
    let dir = tempdir().unwrap();
    let framework = dir.path().join("libtestkit.so");
    fs::write(&framework, "framework").unwrap();

    isotest()
        .args(["-v", "discover"])
        .arg(&framework)
        .assert()
        .success()
        .stderr(predicate::str::contains("Excluded"))
        .stderr(predicate::str::contains("ImageError").not());
}

#[test]
fn test_missing_config_file_fails() {
    isotest()
        .args(["--config", "definitely-missing.toml", "discover", "x.so"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("definitely-missing.toml"));
}

// 直接与远程执行器对话：一行请求，按行返回事件
#[test]
fn test_remote_executor_protocol() {
    let dir = tempdir().unwrap();
    let module = dir.path().join("libgarbage_tests.so");
    fs::write(&module, "garbage").unwrap();
    let path = module.display().to_string();

    let request = serde_json::json!({
        "operation": "discover",
        "target": {
            "display_path": path,
            "load_path": path,
            "search_roots": [dir.path().display().to_string()],
        },
        "framework": {},
    });

    isotest()
        .arg("__remote-executor")
        .write_stdin(format!("{request}\n"))
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""event":"message""#))
        .stdout(predicate::str::contains(r#""is_error":true"#))
        .stdout(predicate::str::contains("ImageError"));
}

#[test]
fn test_remote_executor_rejects_malformed_request() {
    isotest()
        .arg("__remote-executor")
        .write_stdin("hello\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Malformed request"));
}
