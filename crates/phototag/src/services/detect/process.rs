//! Detector backed by an external analyzer process (e.g. a YOLO script).

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use bon::Builder;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{DetectTarget, Detector, DetectorError};

/// Placeholder replaced by the staged image path in configured arguments.
pub const IMAGE_PLACEHOLDER: &str = "{image}";
const STDERR_TAIL_CHARS: usize = 512;

/// How the analyzer reports its labels on stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessOutputFormat {
    /// The first stdout line holding a JSON array of strings.
    #[default]
    JsonArray,
    /// The last non-empty stdout line, split on commas.
    CommaSeparated,
}

/// Spawns `program args...` once per image and parses its stdout.
#[derive(Debug, Clone, Builder)]
pub struct ProcessDetector {
    #[builder(into, default = "object-detector")]
    name: String,
    #[builder(into)]
    program: String,
    #[builder(default)]
    args: Vec<String>,
    #[builder(default)]
    output: ProcessOutputFormat,
}

impl ProcessDetector {
    fn render_args(&self, image: &Path) -> Vec<String> {
        let image = image.to_string_lossy();
        let mut substituted = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains(IMAGE_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(IMAGE_PLACEHOLDER, &image)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(image.into_owned());
        }
        args
    }
}

#[async_trait]
impl Detector for ProcessDetector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn detect(&self, target: &DetectTarget) -> Result<Vec<String>, DetectorError> {
        let args = self.render_args(&target.path);
        debug!(detector = %self.name, program = %self.program, ?args, "spawning analyzer");

        // The child is killed if this future is dropped by a timeout.
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                DetectorError::Unavailable(format!("failed to spawn `{}`: {err}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DetectorError::Unavailable(format!(
                "`{}` exited with {}: {}",
                self.program,
                output.status,
                tail(stderr.trim(), STDERR_TAIL_CHARS)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_labels(&stdout, self.output)
    }
}

/// Extract labels from noisy analyzer output.
pub fn parse_labels(
    stdout: &str,
    format: ProcessOutputFormat,
) -> Result<Vec<String>, DetectorError> {
    match format {
        ProcessOutputFormat::JsonArray => stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('['))
            .find_map(|line| serde_json::from_str::<Vec<String>>(line).ok())
            .ok_or_else(|| {
                DetectorError::MalformedOutput(format!(
                    "no JSON label array in output: {}",
                    tail(stdout.trim(), STDERR_TAIL_CHARS)
                ))
            }),
        ProcessOutputFormat::CommaSeparated => {
            let Some(line) = stdout.lines().map(str::trim).rfind(|line| !line.is_empty()) else {
                return Ok(Vec::new());
            };
            Ok(line
                .split(',')
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(str::to_string)
                .collect())
        }
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn target() -> DetectTarget {
        DetectTarget {
            item: "street.jpg".into(),
            path: PathBuf::from("/tmp/street.jpg"),
            content_type: "image/jpeg".into(),
            remote_url: None,
        }
    }

    fn shell(script: &str) -> ProcessDetector {
        ProcessDetector::builder()
            .program("sh")
            .args(vec!["-c".to_string(), script.to_string()])
            .build()
    }

    #[test]
    fn json_mode_skips_noise_before_the_array() {
        let stdout = "Ultralytics 8.1 loaded\nimage 1/1 384x640 2 cars\n[\"car\", \"person\"]\nSpeed: 3ms\n";
        let labels = parse_labels(stdout, ProcessOutputFormat::JsonArray).expect("labels");
        assert_eq!(labels, ["car", "person"]);
    }

    #[test]
    fn json_mode_skips_broken_arrays() {
        let stdout = "[not json\n[\"dog\"]\n";
        let labels = parse_labels(stdout, ProcessOutputFormat::JsonArray).expect("labels");
        assert_eq!(labels, ["dog"]);
    }

    #[test]
    fn json_mode_rejects_plain_text() {
        let err = parse_labels("Traceback: boom", ProcessOutputFormat::JsonArray)
            .expect_err("malformed");
        assert!(matches!(err, DetectorError::MalformedOutput(_)));
    }

    #[test]
    fn comma_mode_reads_last_line() {
        let stdout = "loading model\nperson, car,dog\n\n";
        let labels = parse_labels(stdout, ProcessOutputFormat::CommaSeparated).expect("labels");
        assert_eq!(labels, ["person", "car", "dog"]);
        assert!(
            parse_labels("", ProcessOutputFormat::CommaSeparated)
                .expect("empty is fine")
                .is_empty()
        );
    }

    #[test]
    fn image_path_is_substituted_or_appended() {
        let detector = ProcessDetector::builder()
            .program("python3")
            .args(vec!["detect.py".into(), "--source={image}".into()])
            .build();
        assert_eq!(
            detector.render_args(Path::new("/s/a.png")),
            ["detect.py", "--source=/s/a.png"]
        );

        let appended = ProcessDetector::builder()
            .program("python3")
            .args(vec!["detect.py".into()])
            .build();
        assert_eq!(
            appended.render_args(Path::new("/s/a.png")),
            ["detect.py", "/s/a.png"]
        );
    }

    #[tokio::test]
    async fn spawned_process_output_is_parsed() {
        let detector = shell("echo 'warming up'; echo '[\"Car\",\"tree\"]'");
        let labels = detector.detect(&target()).await.expect("labels");
        assert_eq!(labels, ["Car", "tree"]);
    }

    #[tokio::test]
    async fn receives_image_path_argument() {
        // `sh -c script arg0` binds the appended image path to `$0`.
        let detector = shell("printf '[\"%s\"]\\n' \"$0\"");
        let labels = detector.detect(&target()).await.expect("labels");
        assert_eq!(labels, ["/tmp/street.jpg"]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_unavailable() {
        let detector = shell("echo 'model missing' >&2; exit 3");
        let err = detector.detect(&target()).await.expect_err("fails");
        match err {
            DetectorError::Unavailable(message) => assert!(message.contains("model missing")),
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let detector = ProcessDetector::builder()
            .program("/definitely/not/a/binary")
            .build();
        let err = detector.detect(&target()).await.expect_err("fails");
        assert!(matches!(err, DetectorError::Unavailable(_)));
    }
}
