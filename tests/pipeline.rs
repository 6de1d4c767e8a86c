//! End-to-end exercise of the pipeline: load a config, build an agent out
//! of the reference `mem`/`file` plugins, run it briefly, and check that
//! shutdown flushed everything to disk before the output was closed.

use std::io::Write as _;
use std::sync::Once;
use std::time::Duration;

use straw_agent::agent::config::{Loader, Registry};
use straw_agent::inputs::mem::MemInput;
use straw_agent::outputs::file::{FileOutput, FileOutputConfig};
use tokio_util::sync::CancellationToken;

static INIT_LOGGER: Once = Once::new();

fn init_logger() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_input(
        "mem",
        Box::new(|_table| Ok(Box::new(MemInput::with_sampler(|| {
            Ok(straw_agent::inputs::mem::MemStats {
                resident_bytes: 1024,
                virtual_bytes: 2048,
            })
        })) as Box<dyn straw_agent::input::Input>)),
    );
    registry.register_output(
        "file",
        Box::new(|table| {
            let text = toml::to_string(table).unwrap_or_default();
            let config: FileOutputConfig = toml::from_str(&text).unwrap_or_default();
            Ok(Box::new(FileOutput::new(config)) as Box<dyn straw_agent::output::Output>)
        }),
    );
    registry
}

#[tokio::test]
async fn config_to_running_agent_flushes_before_shutdown() {
    init_logger();

    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("out.txt");
    let config_path = dir.path().join("agent.toml");

    let mut config_file = std::fs::File::create(&config_path).unwrap();
    writeln!(
        config_file,
        r#"
        [agent]
        interval = "10ms"
        round_interval = false
        flush_interval = "1h"

        [[inputs.mem]]

        [[outputs.file]]
        files = ["{}"]
        "#,
        out_path.to_string_lossy().replace('\\', "\\\\")
    )
    .unwrap();
    drop(config_file);

    let raw = Loader::parse_file(config_path).load().unwrap();
    let agent = straw_agent::agent::config::build(raw, &registry()).unwrap();

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(agent.run(run_cancel));

    // Give the gather task a few ticks to produce metrics before shutdown.
    tokio::time::sleep(Duration::from_millis(60)).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let contents = std::fs::read_to_string(&out_path).unwrap();
    assert!(!contents.is_empty(), "expected at least one flushed metric line");
    assert!(contents.contains("mem"));
}

#[tokio::test]
async fn loading_a_config_with_no_outputs_is_rejected() {
    init_logger();

    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("agent.toml");
    std::fs::write(&config_path, "[agent]\ninterval = \"1s\"\nflush_interval = \"1s\"\n").unwrap();

    let result = Loader::parse_file(config_path).load();
    assert!(result.is_err());
}
