//! External transcriber for inbound voice notes.
//!
//! Runs the configured command with `{{MediaPath}}` substituted, bounded
//! by the configured timeout, and returns trimmed stdout.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::config::TranscriptionSection;

pub fn substitute_args(args: &[String], media_path: &str) -> Vec<String> {
    args.iter()
        .map(|arg| arg.replace("{{MediaPath}}", media_path))
        .collect()
}

pub async fn transcribe(section: &TranscriptionSection, media_path: &str) -> Result<String> {
    let argv = substitute_args(&section.args, media_path);
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| anyhow!("transcription command is empty"))?;

    let output = tokio::time::timeout(
        Duration::from_secs(section.timeout_seconds),
        tokio::process::Command::new(program)
            .args(rest)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| anyhow!("transcriber timed out after {}s", section.timeout_seconds))?
    .with_context(|| format!("running transcriber {program}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "transcriber exited with {}: {}",
            output.status,
            stderr.trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_media_path_everywhere() {
        let args = vec![
            "whisper".to_string(),
            "--input".to_string(),
            "{{MediaPath}}".to_string(),
            "--copy={{MediaPath}}.txt".to_string(),
        ];
        let out = substitute_args(&args, "/tmp/v.ogg");
        assert_eq!(out[2], "/tmp/v.ogg");
        assert_eq!(out[3], "--copy=/tmp/v.ogg.txt");
    }

    #[tokio::test]
    async fn runs_command_and_captures_stdout() {
        let section = TranscriptionSection {
            args: vec!["echo".into(), "transcript of {{MediaPath}}".into()],
            timeout_seconds: 5,
        };
        let text = transcribe(&section, "/tmp/voice.ogg").await.unwrap();
        assert_eq!(text, "transcript of /tmp/voice.ogg");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let section = TranscriptionSection {
            args: vec!["false".into()],
            timeout_seconds: 5,
        };
        assert!(transcribe(&section, "/tmp/x").await.is_err());
    }

    #[tokio::test]
    async fn timeout_kills_slow_transcriber() {
        let section = TranscriptionSection {
            args: vec!["sleep".into(), "5".into()],
            timeout_seconds: 1,
        };
        let err = transcribe(&section, "/tmp/x").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let section = TranscriptionSection {
            args: vec![],
            timeout_seconds: 5,
        };
        assert!(transcribe(&section, "/tmp/x").await.is_err());
    }
}
