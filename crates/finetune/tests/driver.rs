//! End-to-end run of the sweep driver on a local checkpoint

mod common;

use common::*;
use sumtune::driver;
use sumtune::{DriverConfig, MODEL_DIR, TOKENIZER_DIR};

#[test]
fn test_driver_stores_each_run() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("tiny-bart");
    tiny_model().save_pretrained(&checkpoint).unwrap();
    tokenizer().save_pretrained(&checkpoint).unwrap();

    let records: Vec<serde_json::Value> = (0..12)
        .map(|i| {
            let (content, summary) = article(i);
            serde_json::json!({ "url": i, "content": content, "reference_summary": summary })
        })
        .chain(std::iter::once(
            serde_json::json!({ "content": "wind", "reference_summary": null }),
        ))
        .collect();
    let data_path = dir.path().join("summary.json");
    std::fs::write(&data_path, serde_json::to_string(&records).unwrap()).unwrap();

    let store_dir = dir.path().join("stored");
    let config = DriverConfig {
        models: vec![checkpoint.to_str().unwrap().to_string()],
        article_counts: vec![5, 10],
        version: "v0".to_string(),
        organization: "test-org".to_string(),
        data_path,
        publish: false,
        store_dir: Some(store_dir.clone()),
        orchestrator: offline_options(&dir.path().join("runs")),
        ..Default::default()
    };

    let times = driver::run(&config).unwrap();
    let names: Vec<&str> = times.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        vec!["test-org/tiny-bart_v0_trained_on_10", "test-org/tiny-bart_v0_trained_on_5"]
    );
    assert!(times.values().all(|&secs| secs >= 0.0));

    for count in [5, 10] {
        let stored = store_dir.join(format!("test-org__tiny-bart_v0_trained_on_{}", count));
        assert!(stored.join(MODEL_DIR).join("adapter_model.safetensors").is_file());
        assert!(stored.join(TOKENIZER_DIR).join("tokenizer.json").is_file());
    }
}
