//! Repacking of repaired streams with an external audio tool.
//!
//! The decrypted and repaired OGG file is remuxed by `ffmpeg` with stream
//! copy (`-i <input> -c copy <output>`). No re-encoding takes place; the
//! remux mostly serves to validate the repaired container and to rewrite
//! page checksums.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::process::Command;

use crate::{
    config::Config,
    error::{Error, Result},
};

/// Runs the external audio tool with a deadline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Transcoder {
    program: PathBuf,
    timeout: Duration,
}

impl Transcoder {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.ffmpeg, config.transcode_timeout)
    }

    /// Copies all streams of `input` into `output`.
    ///
    /// # Errors
    ///
    /// * `Error::NotFound` if the program cannot be started
    /// * `Error::DeadlineExceeded` if it does not exit within the timeout;
    ///   the child is killed
    /// * `Error::Internal` on a non-zero exit status, with the captured
    ///   standard error as details
    pub async fn repack(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<()> {
        let input = input.as_ref();
        let output = output.as_ref();

        let mut command = Command::new(&self.program);
        command
            .arg("-i")
            .arg(input)
            .args(["-c", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            "repacking {} into {} with {}",
            input.display(),
            output.display(),
            self.program.display()
        );

        let result = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                Error::deadline_exceeded(format!(
                    "{} did not finish within {}s",
                    self.program.display(),
                    self.timeout.as_secs()
                ))
            })?;
        let output = result?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            error!("{} error: {stderr}", self.program.display());
            return Err(Error::internal(format!(
                "{} exited with {}: {stderr}",
                self.program.display(),
                output.status
            )));
        }

        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn zero_exit_is_success() {
        let transcoder = Transcoder::new("true", Duration::from_secs(5));
        transcoder.repack("in.ogg", "out.ogg").await.unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_internal() {
        let transcoder = Transcoder::new("false", Duration::from_secs(5));
        let err = transcoder.repack("in.ogg", "out.ogg").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let transcoder = Transcoder::new("/nonexistent/ffmpeg", Duration::from_secs(5));
        let err = transcoder.repack("in.ogg", "out.ogg").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
