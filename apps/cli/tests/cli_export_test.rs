//! Integration tests for `loka-export`, driven from a freshly trained adapter.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn tiny_model(root: &Path, name: &str) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let descriptor = serde_json::json!({
        "architecture": { "family": "phi3", "hidden_size": 32, "intermediate_size": 64, "num_layers": 1 },
        "chat_template": "phi3",
        "seed": 11
    });
    std::fs::write(dir.join("lokallm_model.json"), descriptor.to_string()).unwrap();
    dir
}

/// Trains a one-record adapter on the tiny model and returns its directory.
fn trained_adapter(temp: &TempDir, base: &Path) -> PathBuf {
    let target = serde_json::json!({ "score": 0.1, "reasoning": "Simple greeting" }).to_string();
    let line = serde_json::json!({ "instruction": "Hello!", "complexity_score": 0.1, "tier": "local", "target": target });
    let dataset = temp.path().join("dataset.jsonl");
    std::fs::write(&dataset, format!("{line}\n")).unwrap();
    let adapter = temp.path().join("adapter");

    Command::cargo_bin("loka-train")
        .unwrap()
        .current_dir(temp.path())
        .env("HOME", temp.path())
        .arg("--dataset")
        .arg(&dataset)
        .arg("--output_dir")
        .arg(&adapter)
        .arg("--base_model")
        .arg(base)
        .args(["--epochs", "1", "--batch_size", "1", "--grad_accum", "1", "--lora_r", "4", "--max_seq_len", "128"])
        .assert()
        .success();
    adapter
}

fn export(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("loka-export").unwrap();
    cmd.current_dir(temp.path()).env("HOME", temp.path());
    cmd
}

#[test]
fn test_export_help() {
    Command::cargo_bin("loka-export")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--adapter"))
        .stdout(predicate::str::contains("--quant"));
}

#[test]
fn test_export_prints_modelfile_with_turn_delimiters() {
    let temp = TempDir::new().unwrap();
    let base = tiny_model(temp.path(), "tiny-phi3");
    let adapter = trained_adapter(&temp, &base);
    let output = temp.path().join("dist").join("router.gguf");

    export(&temp)
        .arg("--adapter")
        .arg(&adapter)
        .arg("--base_model")
        .arg(&base)
        .arg("--output")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("FROM {}", output.display())))
        .stdout(predicate::str::contains("<|user|>"))
        .stdout(predicate::str::contains("<|assistant|>"))
        .stdout(predicate::str::contains("PARAMETER stop \"<|end|>\""));

    let bytes = std::fs::read(&output).unwrap();
    assert_eq!(&bytes[..4], b"GGUF");
    assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 3);
}

#[test]
fn test_export_q8_from_config() {
    let temp = TempDir::new().unwrap();
    let base = tiny_model(temp.path(), "tiny-phi3");
    let adapter = trained_adapter(&temp, &base);
    std::fs::write(temp.path().join("lokallm.toml"), "[export]\nquantization = \"q8_0\"\n").unwrap();
    let output = temp.path().join("router.gguf");

    export(&temp)
        .arg("--adapter")
        .arg(&adapter)
        .arg("--base_model")
        .arg(&base)
        .arg("--output")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("q8_0"));

    assert!(output.is_file());
}

#[test]
fn test_base_model_mismatch_writes_nothing() {
    let temp = TempDir::new().unwrap();
    let base = tiny_model(temp.path(), "tiny-phi3");
    let other = tiny_model(temp.path(), "other-phi3");
    let adapter = trained_adapter(&temp, &base);
    let output = temp.path().join("dist").join("router.gguf");

    export(&temp)
        .arg("--adapter")
        .arg(&adapter)
        .arg("--base_model")
        .arg(&other)
        .arg("--output")
        .arg(&output)
        .assert()
        .failure()
        .stderr(predicate::str::contains("was trained against"));

    assert!(!output.exists());
    assert!(!temp.path().join("dist").exists());
}

#[test]
fn test_unknown_quantization_fails() {
    let temp = TempDir::new().unwrap();

    export(&temp)
        .arg("--adapter")
        .arg(temp.path())
        .arg("--output")
        .arg(temp.path().join("router.gguf"))
        .args(["--quant", "q2_k"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown quantization"));
}

#[test]
fn test_missing_adapter_fails() {
    let temp = TempDir::new().unwrap();
    let output = temp.path().join("router.gguf");

    export(&temp)
        .arg("--adapter")
        .arg(temp.path().join("nowhere"))
        .arg("--output")
        .arg(&output)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no training manifest"));

    assert!(!output.exists());
}
