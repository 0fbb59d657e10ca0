use std::fs::{File, OpenOptions, create_dir_all};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use log::info;

/// Per-pod sink for pack stdout/stderr. Lines land in the process log and,
/// when a log directory is configured, in `<dir>/<pod_id>.log`.
pub struct LogSink {
    pod_id: String,
    file: Option<Mutex<File>>,
}

impl LogSink {
    pub fn new(pod_id: &str, log_dir: Option<&Path>) -> Self {
        let file = log_dir.and_then(|dir| {
            create_dir_all(dir).ok()?;
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(format!("{pod_id}.log")))
                .ok()
                .map(Mutex::new)
        });
        LogSink {
            pod_id: pod_id.to_string(),
            file,
        }
    }

    pub fn line(&self, stream: &str, line: &str) {
        info!(target: "pack", "[{} {stream}] {line}", self.pod_id);
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            let _ = writeln!(file, "[{stream}] {line}");
        }
    }

    pub fn close(&self) {
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            let _ = file.flush();
        }
    }
}
