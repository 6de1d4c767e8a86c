//! A sample output that writes newline-delimited serialized metrics to one
//! or more files (or stdout), mirroring the shape of the original file
//! output this crate is modelled on: a list of targets, "stdout" treated
//! as a reserved name, and a pluggable serializer.

use std::fs::OpenOptions;
use std::io::Write as _;

use async_trait::async_trait;
use serde::Deserialize;

use crate::metric::Metric;
use crate::output::{Output, SerializerConsumer};
use crate::serializer::{Serializer, TextSerializer};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileOutputConfig {
    pub files: Vec<String>,
}

impl Default for FileOutputConfig {
    fn default() -> Self {
        FileOutputConfig {
            files: vec!["stdout".to_string()],
        }
    }
}

enum Writer {
    Stdout,
    File(std::fs::File),
}

impl Writer {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Writer::Stdout => std::io::stdout().write_all(bytes),
            Writer::File(file) => file.write_all(bytes),
        }
    }
}

/// Writes every batch it receives, newline-delimited, to each configured
/// target. Targets are opened on [`connect`](Output::connect); `"stdout"`
/// is a reserved target name, anything else is a file path opened in
/// append mode (created if missing).
pub struct FileOutput {
    targets: Vec<String>,
    writers: Vec<Writer>,
    serializer: Box<dyn Serializer>,
}

impl FileOutput {
    pub fn new(config: FileOutputConfig) -> Self {
        FileOutput {
            targets: config.files,
            writers: Vec::new(),
            serializer: Box::new(TextSerializer),
        }
    }
}

#[async_trait]
impl Output for FileOutput {
    fn sample_config(&self) -> &str {
        "[[outputs.file]]\nfiles = [\"stdout\"]\n"
    }

    fn description(&self) -> &str {
        "writes newline-delimited serialized metrics to one or more files"
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        self.writers = self
            .targets
            .iter()
            .map(|target| -> anyhow::Result<Writer> {
                if target == "stdout" {
                    Ok(Writer::Stdout)
                } else {
                    let file = OpenOptions::new().create(true).append(true).open(target)?;
                    Ok(Writer::File(file))
                }
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(())
    }

    async fn write(&mut self, metrics: &[Metric]) -> anyhow::Result<()> {
        let bytes = self.serializer.serialize_batch(metrics)?;
        for writer in &mut self.writers {
            writer.write_all(&bytes)?;
        }
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.writers.clear();
        Ok(())
    }

    fn as_serializer_consumer_mut(&mut self) -> Option<&mut dyn SerializerConsumer> {
        Some(self)
    }
}

impl SerializerConsumer for FileOutput {
    fn set_serializer(&mut self, serializer: Box<dyn Serializer>) {
        self.serializer = serializer;
    }
}
