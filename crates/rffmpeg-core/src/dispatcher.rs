//! Builds and runs the local or remote tool command.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use rffmpeg_proto::{
    ArgPayload, HostRecord, ProtoError, SelectedTarget, ToolInvocation, command_line,
};
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info};

use crate::config::RffmpegConfig;

/// Errors that stop a dispatch before the tool's own exit code is known.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to encode arguments for remote dispatch: {0}")]
    Encoding(#[from] ProtoError),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to route tool stdout to stderr: {0}")]
    Stdio(#[source] std::io::Error),
}

impl DispatchError {
    /// Exit code the dispatcher terminates with for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            // EX_DATAERR, same as the remote decode failure
            DispatchError::Encoding(_) => rffmpeg_proto::DECODE_FAILURE_EXIT_CODE,
            DispatchError::Spawn { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                127
            }
            DispatchError::Spawn { .. } => 126,
            DispatchError::Wait { .. } | DispatchError::Stdio(_) => 1,
        }
    }
}

/// Where the tool's stdout goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdoutRoute {
    Inherit,
    /// Sent to our stderr so a piped media stream stays clean.
    Stderr,
}

/// A fully built command, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub stdout: StdoutRoute,
}

impl DispatchCommand {
    /// Human-readable rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Transport settings for the remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    pub program: PathBuf,
    /// Seconds to keep a master connection alive; 0 disables multiplexing.
    pub persist: u64,
    pub control_path: PathBuf,
}

/// Builds and executes tool commands for a selected target.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    config: RffmpegConfig,
    ssh: SshSettings,
}

impl Dispatcher {
    pub fn new(config: RffmpegConfig) -> Self {
        let ssh = SshSettings {
            program: config.global.ssh.clone(),
            persist: config.global.persist,
            control_path: config.control_path(),
        };
        Self { config, ssh }
    }

    /// Builds the command for `target` without running it.
    pub fn build(
        &self,
        target: &SelectedTarget,
        invocation: &ToolInvocation,
    ) -> Result<DispatchCommand, DispatchError> {
        match target {
            SelectedTarget::Local => Ok(self.build_local(invocation)),
            SelectedTarget::Remote(host) => self.build_remote(host, invocation),
        }
    }

    fn build_local(&self, invocation: &ToolInvocation) -> DispatchCommand {
        DispatchCommand {
            program: self.config.local_binary(invocation.personality).into(),
            args: invocation.args.clone(),
            stdout: stdout_route(invocation),
        }
    }

    fn build_remote(
        &self,
        host: &HostRecord,
        invocation: &ToolInvocation,
    ) -> Result<DispatchCommand, DispatchError> {
        let mut args: Vec<OsString> = Vec::new();
        let mut opt = |value: String| {
            args.push("-o".into());
            args.push(value.into());
        };

        opt("ConnectTimeout=1".to_string());
        opt("ConnectionAttempts=1".to_string());
        opt("StrictHostKeyChecking=no".to_string());
        opt("UserKnownHostsFile=/dev/null".to_string());
        if self.ssh.persist > 0 {
            opt("ControlMaster=auto".to_string());
            opt(format!("ControlPath={}", self.ssh.control_path.display()));
            opt(format!("ControlPersist={}", self.ssh.persist));
        }
        opt(format!("Port={}", host.port));

        let mut full: Vec<OsString> = vec!["-q".into()];
        full.append(&mut args);
        full.push("-i".into());
        full.push(host.identity_file.clone().into());
        full.push(host.destination().into());
        let binary = self.config.remote_binary(invocation.personality);
        let script = remote_payload(&binary, invocation)?;
        full.push(script.into());

        Ok(DispatchCommand {
            program: self.ssh.program.clone().into(),
            args: full,
            stdout: stdout_route(invocation),
        })
    }

    /// Runs the command for `target` and returns the tool's exit code.
    ///
    /// Exactly one child is spawned; nothing is retried.
    pub async fn execute(
        &self,
        target: &SelectedTarget,
        invocation: &ToolInvocation,
    ) -> Result<i32, DispatchError> {
        let command = self.build(target, invocation)?;
        match target {
            SelectedTarget::Local => info!("Local command: {}", command.display()),
            SelectedTarget::Remote(host) => {
                info!("Running as {}", host.destination());
                info!("Remote command: {}", command.display());
            }
        }
        run(&command).await
    }
}

/// Spawns `command` with stdin and stderr inherited and waits for it.
pub async fn run(command: &DispatchCommand) -> Result<i32, DispatchError> {
    let program = command.program.to_string_lossy().into_owned();
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::inherit())
        .stdout(stdout_stdio(command.stdout)?)
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| DispatchError::Spawn {
            program: program.clone(),
            source,
        })?;
    let status = child
        .wait()
        .await
        .map_err(|source| DispatchError::Wait { program, source })?;

    let code = exit_code(status);
    if code != 0 {
        error!(code, "Command failed: {}", command.display());
    }
    Ok(code)
}

/// Encodes the remote command line and checks it survives decoding.
fn remote_payload(binary: &str, invocation: &ToolInvocation) -> Result<String, DispatchError> {
    let args = invocation.utf8_args()?;
    let command = command_line(binary, &args);
    let payload = ArgPayload::encode(&command);
    if payload.decode()? != command {
        return Err(ProtoError::InvalidPayload("payload does not round-trip".to_string()).into());
    }
    Ok(payload.remote_script())
}

fn stdout_route(invocation: &ToolInvocation) -> StdoutRoute {
    if invocation.passes_stdout() {
        StdoutRoute::Inherit
    } else {
        StdoutRoute::Stderr
    }
}

#[cfg(unix)]
fn stdout_stdio(route: StdoutRoute) -> Result<Stdio, DispatchError> {
    use std::os::fd::AsFd;

    match route {
        StdoutRoute::Inherit => Ok(Stdio::inherit()),
        StdoutRoute::Stderr => {
            let fd = std::io::stderr()
                .as_fd()
                .try_clone_to_owned()
                .map_err(DispatchError::Stdio)?;
            Ok(Stdio::from(fd))
        }
    }
}

#[cfg(not(unix))]
fn stdout_stdio(route: StdoutRoute) -> Result<Stdio, DispatchError> {
    match route {
        StdoutRoute::Inherit => Ok(Stdio::inherit()),
        StdoutRoute::Stderr => Ok(Stdio::from(std::io::stderr())),
    }
}

/// Exit code of a finished child; signal deaths map to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rffmpeg_proto::Personality;
    use std::ffi::OsStr;

    fn display_arg(arg: &OsStr) -> String {
        arg.to_string_lossy().into_owned()
    }

    const CONFIG: &str = r"
global:
  ffmpeg: /usr/lib/jellyfin-ffmpeg/ffmpeg
  ffprobe: /usr/lib/jellyfin-ffmpeg/ffprobe
  remote_ffmpeg: /opt/ffmpeg/bin/ffmpeg
  state_dir: /run/rffmpeg
";

    fn dispatcher(extra: &str) -> Dispatcher {
        let yaml = format!("{CONFIG}{extra}");
        Dispatcher::new(RffmpegConfig::parse(&yaml, "/etc/rffmpeg").unwrap())
    }

    fn host() -> HostRecord {
        HostRecord::new("gpu1", "10.0.0.5", "jellyfin", "/etc/rffmpeg/keys/id_rsa").with_port(2222)
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| display_arg(a)).collect()
    }

    /// Pulls the token out of the remote snippet and decodes it.
    fn decode_script(script: &OsStr) -> String {
        let script = display_arg(script);
        let token = script.split_whitespace().nth(2).unwrap();
        ArgPayload::from_token(token).decode().unwrap()
    }

    #[test]
    fn test_local_command_passes_args_verbatim() {
        let inv = ToolInvocation::new(
            Personality::Ffmpeg,
            ["-i", "My Movie.mkv", "-f", "matroska", "pipe:1"],
        );
        let cmd = dispatcher("").build(&SelectedTarget::Local, &inv).unwrap();

        assert_eq!(cmd.program, OsString::from("/usr/lib/jellyfin-ffmpeg/ffmpeg"));
        assert_eq!(
            strings(&cmd.args),
            ["-i", "My Movie.mkv", "-f", "matroska", "pipe:1"]
        );
        assert_eq!(cmd.stdout, StdoutRoute::Stderr);
    }

    #[test]
    fn test_local_probe_keeps_stdout() {
        let inv = ToolInvocation::new(Personality::Ffprobe, ["-show_streams", "in.mkv"]);
        let cmd = dispatcher("").build(&SelectedTarget::Local, &inv).unwrap();

        assert_eq!(cmd.program, OsString::from("/usr/lib/jellyfin-ffmpeg/ffprobe"));
        assert_eq!(cmd.stdout, StdoutRoute::Inherit);
    }

    #[test]
    fn test_remote_command_shape() {
        let inv = ToolInvocation::new(Personality::Ffmpeg, ["-version"]);
        let cmd = dispatcher("")
            .build(&SelectedTarget::Remote(host()), &inv)
            .unwrap();
        let args = strings(&cmd.args);

        assert_eq!(cmd.program, OsString::from("ssh"));
        assert_eq!(
            args[..12],
            [
                "-q",
                "-o",
                "ConnectTimeout=1",
                "-o",
                "ConnectionAttempts=1",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "Port=2222",
                "-i",
            ]
        );
        assert_eq!(args[12], "/etc/rffmpeg/keys/id_rsa");
        assert_eq!(args[13], "jellyfin@10.0.0.5");
        assert_eq!(args.len(), 15);
        assert!(!args.iter().any(|a| a.starts_with("ControlMaster")));
        assert_eq!(cmd.stdout, StdoutRoute::Inherit);
    }

    #[test]
    fn test_remote_payload_decodes_to_quoted_command() {
        let inv = ToolInvocation::new(
            Personality::Ffmpeg,
            ["-i", "it's a movie.mkv", "-vf", "scale=1280:-2", "pipe:1"],
        );
        let cmd = dispatcher("")
            .build(&SelectedTarget::Remote(host()), &inv)
            .unwrap();
        let decoded = decode_script(cmd.args.last().unwrap());
        assert_eq!(
            decoded,
            "/opt/ffmpeg/bin/ffmpeg -i 'it'\\''s a movie.mkv' -vf scale=1280:-2 pipe:1"
        );
        assert_eq!(cmd.stdout, StdoutRoute::Stderr);
    }

    #[test]
    fn test_remote_probe_uses_local_path_by_default() {
        let inv = ToolInvocation::new(Personality::Ffprobe, ["in.mkv"]);
        let cmd = dispatcher("")
            .build(&SelectedTarget::Remote(host()), &inv)
            .unwrap();
        assert_eq!(
            decode_script(cmd.args.last().unwrap()),
            "/usr/lib/jellyfin-ffmpeg/ffprobe in.mkv"
        );
    }

    #[test]
    fn test_persist_enables_multiplexing() {
        let cmd = dispatcher("  persist: 300\n")
            .build(
                &SelectedTarget::Remote(host()),
                &ToolInvocation::new(Personality::Ffmpeg, ["-version"]),
            )
            .unwrap();
        let args = strings(&cmd.args);

        assert!(args.contains(&"ControlMaster=auto".to_string()));
        assert!(args.contains(&"ControlPath=/run/rffmpeg/ssh-%r@%h:%p".to_string()));
        assert!(args.contains(&"ControlPersist=300".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_argument_is_encoding_error() {
        use std::os::unix::ffi::OsStringExt;

        let inv = ToolInvocation::new(
            Personality::Ffmpeg,
            [OsString::from("-i"), OsString::from_vec(vec![0xff, 0xfe])],
        );
        let err = dispatcher("")
            .build(&SelectedTarget::Remote(host()), &inv)
            .unwrap_err();

        assert!(matches!(err, DispatchError::Encoding(_)));
        assert_eq!(err.exit_code(), 65);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_argument_still_runs_locally() {
        use std::os::unix::ffi::OsStringExt;

        let raw = OsString::from_vec(vec![0xff, 0xfe]);
        let inv = ToolInvocation::new(Personality::Ffmpeg, [raw.clone()]);
        let cmd = dispatcher("").build(&SelectedTarget::Local, &inv).unwrap();
        assert_eq!(cmd.args, vec![raw]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_propagates_exit_code() {
        let cmd = DispatchCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 3".into()],
            stdout: StdoutRoute::Stderr,
        };
        assert_eq!(run(&cmd).await.unwrap(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_maps_signal_death() {
        let cmd = DispatchCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "kill -9 $$".into()],
            stdout: StdoutRoute::Inherit,
        };
        assert_eq!(run(&cmd).await.unwrap(), 128 + 9);
    }

    #[tokio::test]
    async fn test_run_missing_binary_is_spawn_error() {
        let cmd = DispatchCommand {
            program: "/nonexistent/rffmpeg-test-binary".into(),
            args: Vec::new(),
            stdout: StdoutRoute::Inherit,
        };
        let err = run(&cmd).await.unwrap_err();
        assert!(matches!(err, DispatchError::Spawn { .. }));
        assert_eq!(err.exit_code(), 127);
    }
}
