use std::process::Command;

fn merge_lora() -> Command {
    Command::new(env!("CARGO_BIN_EXE_merge-lora"))
}

#[test]
fn test_missing_arguments_exit_nonzero() {
    let output = merge_lora().env_remove("HF_TOKEN").output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--base_model"), "{stderr}");
}

#[test]
fn test_unusable_output_dir_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"x").unwrap();
    let output = merge_lora()
        .args(["--base_model", "org/base", "--lora_adapter", "org/lora"])
        .arg("--output_dir")
        .arg(blocker.join("out"))
        .arg("--cache_dir")
        .arg(dir.path().join("cache"))
        .env("HF_HUB_OFFLINE", "1")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(!blocker.join("out").exists());
}
