use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::TempDir;

pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn init() -> std::io::Result<Self> {
        init_tracing();
        let dir = tempfile::tempdir()?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, rel_path: &str, contents: &str) -> std::io::Result<PathBuf> {
        let path = self.dir.path().join(rel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn write_braid_config(&self, contents: &str) -> std::io::Result<PathBuf> {
        self.write_file(".braid.toml", contents)
    }

    pub fn export_file(&self) -> PathBuf {
        self.dir.path().join(".braid").join("tasks.jsonl")
    }

    pub fn meta_file(&self) -> PathBuf {
        self.dir.path().join(".braid").join("tasks_meta.json")
    }

    pub fn read_export(&self) -> String {
        fs::read_to_string(self.export_file()).expect("read export")
    }
}

/// Poll until `check` passes or `timeout` elapses. Returns whether it passed.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}
