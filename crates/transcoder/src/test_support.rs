//! Stand-in encoder for process tests: a shell script that creates its last
//! argument, prints progress ticks in ffmpeg's layout and then exits or sleeps.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use crate::config::TranscodeConfig;

pub(crate) struct FakeEncoder {
    dir: TempDir,
    ticks: Vec<(u64, u64)>,
    hold_secs: u64,
    exit_code: i32,
    stderr_text: Option<String>,
}

impl FakeEncoder {
    pub(crate) fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp dir"),
            ticks: Vec::new(),
            hold_secs: 0,
            exit_code: 0,
            stderr_text: None,
        }
    }

    /// `(frame, total_size)` per tick
    pub(crate) fn ticks(mut self, ticks: Vec<(u64, u64)>) -> Self {
        self.ticks = ticks;
        self
    }

    /// Keep running after the last tick until killed
    pub(crate) fn hold_secs(mut self, secs: u64) -> Self {
        self.hold_secs = secs;
        self
    }

    /// Line written to stderr before the first tick
    pub(crate) fn stderr_text(mut self, text: &str) -> Self {
        self.stderr_text = Some(text.to_string());
        self
    }

    pub(crate) fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub(crate) fn input(&self) -> PathBuf {
        let path = self.dir.path().join("input.mp4");
        if !path.exists() {
            std::fs::write(&path, b"source").expect("write input");
        }
        path
    }

    pub(crate) fn temp_output(&self) -> PathBuf {
        self.dir.path().join("input.mp4.transcode-temp")
    }

    fn script(&self) -> String {
        let mut script = String::from("#!/bin/sh\nfor last; do :; done\n: > \"$last\"\n");
        if let Some(text) = &self.stderr_text {
            let _ = writeln!(script, "cat >&2 <<'ERR'\n{}\nERR", text);
        }
        for (frame, size) in &self.ticks {
            let progress = "continue";
            let _ = write!(
                script,
                "cat <<'TICK'\nframe={frame}\nfps=25.00\nstream_0_0_q=28.0\nbitrate=1024.5kbits/s\n\
                 total_size={size}\nout_time_us=1000000\nout_time_ms=1000000\nout_time=00:00:01.000000\n\
                 dup_frames=0\ndrop_frames=0\nspeed=1.5x\nprogress={progress}\nTICK\nsleep 0.05\n"
            );
        }
        if self.hold_secs > 0 {
            let _ = writeln!(script, "exec sleep {}", self.hold_secs);
        }
        let _ = writeln!(script, "exit {}", self.exit_code);
        script
    }

    /// Config pointing at the script, without `nice` and in quiet mode
    pub(crate) fn config(&self) -> TranscodeConfig {
        use std::os::unix::fs::PermissionsExt;

        let path = self.dir.path().join("fake-ffmpeg.sh");
        std::fs::write(&path, self.script()).expect("write fake encoder");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod fake encoder");

        let mut cfg = TranscodeConfig::default();
        cfg.ffmpeg_bin = path;
        cfg.nice = false;
        cfg.stderr = false;
        cfg.interval_secs = 1;
        cfg
    }

    /// Wait until the script has created its output
    pub(crate) async fn wait_for_temp(&self) {
        let temp = self.temp_output();
        for _ in 0..500 {
            if temp.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fake encoder never created {}", temp.display());
    }
}
