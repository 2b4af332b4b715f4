#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use csv_dedupe::{
    pipeline::{Pipeline, RunConfig, RunSummary},
    schema::SourceOptions,
};
use encoding_rs::UTF_8;
use tempfile::{TempDir, tempdir};

/// Returns the absolute path to a fixture under `tests/data`.
pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        self.write_bytes(name, contents.as_bytes())
    }

    pub fn write_bytes(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents).expect("write temp file contents");
        path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Number of entries currently in the workspace directory.
    pub fn entries(&self) -> usize {
        std::fs::read_dir(self.path()).expect("read workspace").count()
    }
}

pub fn utf8_options() -> SourceOptions {
    SourceOptions {
        encoding: UTF_8,
        ..SourceOptions::default()
    }
}

/// Sniffs, configures and runs `input` into `output`.
pub fn run_pipeline(
    input: &Path,
    options: SourceOptions,
    config: RunConfig,
    output: &Path,
) -> RunSummary {
    Pipeline::new(input, options)
        .sniff()
        .expect("sniff source")
        .configure(config)
        .expect("configure run")
        .run(output)
        .expect("run pipeline")
}
