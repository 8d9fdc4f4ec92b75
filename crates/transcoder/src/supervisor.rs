use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use log::{debug, error, warn};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use crate::config::TranscodeConfig;
use crate::error::{TranscodeError, TranscodeResult};
use crate::ffprobe::SourceMetadata;

/// Program and argument vector for one encoder run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    /// Shell-like rendering for logs
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Build the ffmpeg argument vector.
///
/// Layout: input, verbosity, fixed matroska/stream-copy flags, machine
/// readable progress on stdout, configured flags, colour flags of the first
/// video stream, output.
pub fn build_args(
    cfg: &TranscodeConfig,
    input: &Path,
    temp_output: &Path,
    metadata: Option<&SourceMetadata>,
) -> Vec<String> {
    let mut args = Vec::new();

    args.push("-y".to_string());
    args.push("-i".to_string());
    args.push(input.to_string_lossy().to_string());

    if !cfg.stderr {
        args.push("-v".to_string());
        args.push("quiet".to_string());
    }

    for flag in ["-c", "copy", "-c:s", "srt", "-f", "matroska", "-progress", "-"] {
        args.push(flag.to_string());
    }

    args.extend(cfg.flags.split_whitespace().map(str::to_string));

    if let Some(video) = metadata.and_then(|m| m.video_stream()) {
        let color_flags = [
            ("-color_primaries", &video.color_primaries),
            ("-color_range", &video.color_range),
            ("-colorspace", &video.color_space),
            ("-color_trc", &video.color_transfer),
            ("-pix_fmt", &video.pix_fmt),
        ];
        for (flag, value) in color_flags {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.clone());
            }
        }
    }

    args.push(temp_output.to_string_lossy().to_string());
    args
}

/// Full invocation, wrapped with `nice` when configured on Linux
pub fn build_invocation(
    cfg: &TranscodeConfig,
    input: &Path,
    temp_output: &Path,
    metadata: Option<&SourceMetadata>,
) -> Invocation {
    let args = build_args(cfg, input, temp_output, metadata);

    if cfg.use_nice() {
        let mut wrapped = Vec::with_capacity(args.len() + 1);
        wrapped.push(cfg.ffmpeg_bin.to_string_lossy().to_string());
        wrapped.extend(args);
        Invocation { program: PathBuf::from("nice"), args: wrapped }
    } else {
        Invocation { program: cfg.ffmpeg_bin.clone(), args }
    }
}

/// Owns one running encoder process and its temp output
#[derive(Debug)]
pub struct Supervisor {
    child: Child,
    temp_output: PathBuf,
    exit: Option<ExitStatus>,
    kill_attempts: u32,
}

impl Supervisor {
    /// Spawn the encoder. stdout is always piped for progress; stderr is
    /// piped only when it is to be copied.
    pub fn start(
        cfg: &TranscodeConfig,
        input: &Path,
        temp_output: &Path,
        metadata: Option<&SourceMetadata>,
    ) -> TranscodeResult<Self> {
        let invocation = build_invocation(cfg, input, temp_output, metadata);
        debug!("Executing {}", invocation.command_line());

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if cfg.stderr { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn { program: invocation.program.clone(), source })?;

        Ok(Self {
            child,
            temp_output: temp_output.to_path_buf(),
            exit: None,
            kill_attempts: 0,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn temp_output(&self) -> &Path {
        &self.temp_output
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Exit status once observed by [`Supervisor::wait`] or [`Supervisor::kill`]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    pub fn has_exited(&self) -> bool {
        self.exit.is_some()
    }

    /// How many times a kill was actually attempted
    pub fn kill_attempts(&self) -> u32 {
        self.kill_attempts
    }

    /// Block until the encoder exits. A failing exit is logged, not returned.
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.exit {
            return Some(status);
        }

        match self.child.wait().await {
            Ok(status) => {
                if !status.success() {
                    error!("ffmpeg: {}", status);
                }
                self.exit = Some(status);
                Some(status)
            }
            Err(e) => {
                error!("ffmpeg: error waiting for exit: {}", e);
                None
            }
        }
    }

    /// Terminate the encoder, reap it and delete the temp output.
    ///
    /// No-op once the exit has already been observed, so a finished output is
    /// never removed here.
    pub async fn kill(&mut self) {
        if self.exit.is_some() {
            debug!("ffmpeg already exited, nothing to kill");
            return;
        }
        self.kill_attempts += 1;

        if let Err(e) = self.child.start_kill() {
            error!("{}", TranscodeError::Kill(e));
        }

        match self.child.wait().await {
            Ok(status) => self.exit = Some(status),
            Err(e) => error!("Error waiting for process exit: {}", e),
        }

        self.remove_temp_output().await;
        warn!("ffmpeg killed");
    }

    async fn remove_temp_output(&self) {
        match tokio::fs::remove_file(&self.temp_output).await {
            Ok(()) => debug!("Deleted {}", self.temp_output.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Temp output {} was never created", self.temp_output.display())
            }
            Err(source) => error!(
                "{}",
                TranscodeError::Cleanup { path: self.temp_output.clone(), source }
            ),
        }
    }
}
