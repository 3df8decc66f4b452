//! Training telemetry
//!
//! Fire-and-forget sinks for scalar curves and evaluation frame sequences.
//! A failing sink logs a warning; it never interrupts training.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Result;
use serde::Serialize;

use crate::env::Frame;

/// Tag of the mean episode reward during training
pub const TRAIN_AVERAGE_REWARD: &str = "train/average_reward";
/// Tag of the mean episode reward during evaluation
pub const EVAL_AVERAGE_REWARD: &str = "eval/average_reward";
pub const TRAIN_CRITIC_LOSS: &str = "train/critic_loss";
pub const TRAIN_POLICY_LOSS: &str = "train/policy_loss";
/// Tag of the number of exploits in a generation
pub const TRAIN_EXPLOITS: &str = "train/exploits";

/// Destination for training curves and evaluation recordings
pub trait TelemetrySink {
    /// Record one scalar point
    fn scalar(&mut self, tag: &str, value: f64, step: usize);

    /// Record the rendered frames of one car slot
    fn frames(&mut self, slot: usize, generation: usize, frames: &[Frame]);
}

/// Sink that writes through `tracing`
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) {
        tracing::info!(tag, value, step, "scalar");
    }

    fn frames(&mut self, slot: usize, generation: usize, frames: &[Frame]) {
        tracing::info!(slot, generation, frames = frames.len(), "evaluation frames");
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record<'a> {
    Scalar {
        tag: &'a str,
        value: f64,
        step: usize,
    },
    Frames {
        slot: usize,
        generation: usize,
        count: usize,
        width: usize,
        height: usize,
        path: String,
    },
}

/// Sink that appends JSON lines to `<dir>/telemetry.jsonl`
///
/// Frame sequences are dumped as raw RGB bytes to
/// `<dir>/eval_agent_{slot}_generation_{generation}.rgb`, all frames
/// back to back; the JSON record carries the frame size needed to read them.
#[derive(Debug)]
pub struct JsonlSink {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new().create(true).append(true).open(dir.join("telemetry.jsonl"))?;
        Ok(Self { dir, writer: BufWriter::new(file) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn append(&mut self, record: &Record<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn dump_frames(&self, path: &Path, frames: &[Frame]) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        for frame in frames {
            writer.write_all(&frame.rgb)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl TelemetrySink for JsonlSink {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) {
        if let Err(e) = self.append(&Record::Scalar { tag, value, step }) {
            tracing::warn!(tag, error = %e, "failed to write telemetry");
        }
    }

    fn frames(&mut self, slot: usize, generation: usize, frames: &[Frame]) {
        let path = self.dir.join(format!("eval_agent_{slot}_generation_{generation}.rgb"));
        let (width, height) = frames.first().map(|f| (f.width, f.height)).unwrap_or((0, 0));

        let result = self.dump_frames(&path, frames).and_then(|()| {
            self.append(&Record::Frames {
                slot,
                generation,
                count: frames.len(),
                width,
                height,
                path: path.display().to_string(),
            })
        });
        if let Err(e) = result {
            tracing::warn!(slot, generation, error = %e, "failed to write evaluation frames");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_jsonl_scalars() {
        let dir = tempdir().unwrap();
        let mut sink = JsonlSink::new(dir.path()).unwrap();

        sink.scalar(TRAIN_AVERAGE_REWARD, 1.5, 0);
        sink.scalar(TRAIN_EXPLOITS, 2.0, 1);

        let contents = fs::read_to_string(dir.path().join("telemetry.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> =
            contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "scalar");
        assert_eq!(lines[0]["tag"], "train/average_reward");
        assert_eq!(lines[0]["value"], 1.5);
        assert_eq!(lines[1]["step"], 1);
    }

    #[test]
    fn test_jsonl_appends_across_instances() {
        let dir = tempdir().unwrap();
        JsonlSink::new(dir.path()).unwrap().scalar(EVAL_AVERAGE_REWARD, 1.0, 0);
        JsonlSink::new(dir.path()).unwrap().scalar(EVAL_AVERAGE_REWARD, 2.0, 1);

        let contents = fs::read_to_string(dir.path().join("telemetry.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_jsonl_frames() {
        let dir = tempdir().unwrap();
        let mut sink = JsonlSink::new(dir.path()).unwrap();
        let frame = Frame::new(2, 2, vec![7; 12]).unwrap();

        sink.frames(1, 4, &[frame.clone(), frame]);

        let raw = fs::read(dir.path().join("eval_agent_1_generation_4.rgb")).unwrap();
        assert_eq!(raw.len(), 24);
        let contents = fs::read_to_string(dir.path().join("telemetry.jsonl")).unwrap();
        let record: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(record["kind"], "frames");
        assert_eq!(record["count"], 2);
        assert_eq!(record["width"], 2);
    }
}
