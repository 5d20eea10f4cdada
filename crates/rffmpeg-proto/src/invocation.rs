//! The wrapped tool's personalities and the argv a caller handed us.

use std::ffi::OsString;
use std::fmt;
use std::path::Path;

use crate::error::ProtoError;

/// Flags that make the tool print informational output instead of media.
///
/// When one is present stdout can be passed through safely.
pub const INFORMATIONAL_FLAGS: &[&str] = &["-version", "-encoders", "-decoders", "-hwaccels"];

/// Which tool the dispatcher is standing in for, chosen by the invoked name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Personality {
    /// Primary processing tool.
    Ffmpeg,
    /// Inspection-only counterpart.
    Ffprobe,
}

impl Personality {
    /// Picks the personality from `argv[0]`.
    pub fn from_program(program: &Path) -> Self {
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        if name.contains("ffprobe") {
            Personality::Ffprobe
        } else {
            Personality::Ffmpeg
        }
    }

    pub fn command(self) -> &'static str {
        match self {
            Personality::Ffmpeg => "ffmpeg",
            Personality::Ffprobe => "ffprobe",
        }
    }
}

impl fmt::Display for Personality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

/// The tool invocation being dispatched: personality plus the untouched argv tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub personality: Personality,
    pub args: Vec<OsString>,
}

impl ToolInvocation {
    pub fn new<I, S>(personality: Personality, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            personality,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds an invocation from a full argv, `argv[0]` included.
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv = argv.into_iter().map(Into::<OsString>::into);
        let program = argv.next().unwrap_or_default();
        Self {
            personality: Personality::from_program(Path::new(&program)),
            args: argv.collect(),
        }
    }

    /// True when any argument is one of [`INFORMATIONAL_FLAGS`].
    pub fn is_informational(&self) -> bool {
        self.args
            .iter()
            .any(|arg| INFORMATIONAL_FLAGS.iter().any(|flag| arg == *flag))
    }

    /// Whether the tool's stdout may go to our stdout.
    ///
    /// Otherwise it is sent to stderr so a piped media stream is never
    /// corrupted by stray text.
    pub fn passes_stdout(&self) -> bool {
        self.personality == Personality::Ffprobe || self.is_informational()
    }

    /// Arguments as UTF-8, as required for the remote payload.
    pub fn utf8_args(&self) -> Result<Vec<String>, ProtoError> {
        self.args
            .iter()
            .enumerate()
            .map(|(index, arg)| {
                arg.to_str()
                    .map(str::to_string)
                    .ok_or(ProtoError::NonUtf8Argument { index })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_personality_from_symlink_name() {
        assert_eq!(
            Personality::from_program(Path::new("/usr/local/bin/ffprobe")),
            Personality::Ffprobe
        );
        assert_eq!(
            Personality::from_program(Path::new("/usr/local/bin/ffmpeg")),
            Personality::Ffmpeg
        );
        assert_eq!(
            Personality::from_program(Path::new("jellyfin-ffprobe")),
            Personality::Ffprobe
        );
    }

    #[test]
    fn test_from_argv_splits_program() {
        let inv = ToolInvocation::from_argv(["ffmpeg", "-i", "in.mkv", "-f", "null", "-"]);
        assert_eq!(inv.personality, Personality::Ffmpeg);
        assert_eq!(inv.args.len(), 5);
        assert_eq!(inv.args[0], "-i");
    }

    #[test]
    fn test_stdout_routing() {
        let media = ToolInvocation::new(Personality::Ffmpeg, ["-i", "in.mkv", "pipe:1"]);
        assert!(!media.passes_stdout());

        let version = ToolInvocation::new(Personality::Ffmpeg, ["-version"]);
        assert!(version.passes_stdout());

        let hwaccels = ToolInvocation::new(Personality::Ffmpeg, ["-hide_banner", "-hwaccels"]);
        assert!(hwaccels.passes_stdout());

        let probe = ToolInvocation::new(Personality::Ffprobe, ["-i", "in.mkv"]);
        assert!(probe.passes_stdout());
    }

    #[cfg(unix)]
    #[test]
    fn test_utf8_args_reports_bad_index() {
        use std::os::unix::ffi::OsStringExt;

        let bad = OsString::from_vec(vec![0x66, 0xff, 0x6f]);
        let inv = ToolInvocation::new(Personality::Ffmpeg, [OsString::from("-i"), bad]);
        assert_eq!(
            inv.utf8_args(),
            Err(ProtoError::NonUtf8Argument { index: 1 })
        );
    }
}
