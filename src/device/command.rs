//! Mapping of job parameters onto the device tool's command line.

use plotq_shared::config::DeviceConfig;
use plotq_shared::JobParameters;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Base invocation of the device tool (`python -m axicli` by default).
#[derive(Debug, Clone)]
pub struct DeviceCommand {
    program: String,
    args: Vec<String>,
}

impl DeviceCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    /// Command for plotting `input` with `params`. stdout is discarded, stderr is piped
    /// so a failure can be reported with the tool's own diagnostic.
    pub fn plot(&self, input: &Path, params: &JobParameters) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(plot_arguments(input, params))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }

    /// Command for the connectivity probe.
    pub fn probe(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Printable form for logs.
    pub fn describe(&self, input: &Path, params: &JobParameters) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.extend(plot_arguments(input, params).into_iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// Flags appended after the base invocation. Layer filter and delays are omitted when
/// absent or zero; the input path always comes last.
pub fn plot_arguments(input: &Path, params: &JobParameters) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if let Some(layers) = params.layer_filter() {
        args.push("--layer".into());
        args.push(layers.into());
    }
    args.push("--speed_pendown".into());
    args.push(params.speed.to_string().into());
    if params.pen_up_delay > 0 {
        args.push("--pen_delay_up".into());
        args.push(params.pen_up_delay.to_string().into());
    }
    if params.pen_down_delay > 0 {
        args.push("--pen_delay_down".into());
        args.push(params.pen_down_delay.to_string().into());
    }
    if params.preview {
        args.push("--preview".into());
    }
    args.push(input.as_os_str().to_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter().map(|a| a.into_string().unwrap()).collect()
    }

    #[test]
    fn defaults_map_to_speed_and_delays() {
        let args = strings(plot_arguments(Path::new("/data/uploads/cat.svg"), &JobParameters::default()));
        assert_eq!(
            args,
            vec!["--speed_pendown", "25", "--pen_delay_up", "150", "--pen_delay_down", "150", "/data/uploads/cat.svg"]
        );
    }

    #[test]
    fn layers_preview_and_zero_delays() {
        let params = JobParameters {
            layers: Some(" 1,3 ".into()),
            speed: 70,
            pen_up_delay: 0,
            pen_down_delay: 0,
            preview: true,
            ..Default::default()
        };
        let args = strings(plot_arguments(Path::new("in.svg"), &params));
        assert_eq!(args, vec!["--layer", "1,3", "--speed_pendown", "70", "--preview", "in.svg"]);
    }

    #[test]
    fn blank_layer_filter_is_omitted() {
        let params = JobParameters { layers: Some("  ".into()), ..Default::default() };
        let args = strings(plot_arguments(Path::new("in.svg"), &params));
        assert!(!args.contains(&"--layer".to_string()));
    }

    #[test]
    fn describe_includes_base_invocation() {
        let command = DeviceCommand::new("python", vec!["-m".into(), "axicli".into()]);
        let line = command.describe(Path::new("a.svg"), &JobParameters { preview: true, ..Default::default() });
        assert!(line.starts_with("python -m axicli --speed_pendown 25"));
        assert!(line.ends_with("--preview a.svg"));
    }
}
