//! Command-line form of a job for the autosampler control software.

/// Header line of the aux log the instrument appends to.
pub const AUX_LOG_HEADER: &str =
    "Date\tMethod\tTool\tSource\tDestinationTray\tDestinationSlot\tDestinationVial\tVolume";

/// One method file load with its parameter string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCall {
    pub method_file: String,
    pub params: String,
}

impl MethodCall {
    pub fn new(method_file: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            method_file: method_file.into(),
            params: params.into(),
        }
    }
}

/// All method calls of a job, executed in order by one instrument start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCommand {
    pub calls: Vec<MethodCall>,
}

impl JobCommand {
    pub fn new(calls: Vec<MethodCall>) -> Self {
        Self { calls }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Arguments for a direct process launch, one argument per token.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.calls.len() * 3 + 2);
        for call in &self.calls {
            args.push("/loadmethod".to_string());
            args.push(call.method_file.clone());
            args.push(call.params.clone());
        }
        args.push("/start".to_string());
        args.push("/quit".to_string());
        args
    }

    /// Single quoted command line for execution through a remote shell.
    pub fn command_line(&self, executable: &str) -> String {
        let mut line = quote(executable);
        for call in &self.calls {
            line.push_str(" /loadmethod ");
            line.push_str(&quote(&call.method_file));
            line.push(' ');
            line.push_str(&quote(&call.params));
        }
        line.push_str(" /start /quit");
        line
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> JobCommand {
        JobCommand::new(vec![
            MethodCall::new("C:/methods/lcfc_archive.cam", "LS3;200;cell1_we;;;;tray;2;1;4;1;0;0;0;C:/logs/aux.txt"),
            MethodCall::new("C:/methods/lcfc_deep_clean.cam", "LS3;0;;;;;;;;;1;1;1;1;C:/logs/aux.txt"),
        ])
    }

    #[test]
    fn test_args() {
        let args = command().args();
        assert_eq!(args.len(), 8);
        assert_eq!(args[0], "/loadmethod");
        assert_eq!(args[1], "C:/methods/lcfc_archive.cam");
        assert_eq!(&args[6..], &["/start".to_string(), "/quit".to_string()]);
    }

    #[test]
    fn test_command_line() {
        let line = command().command_line("C:/PAL/PAL.exe");
        assert!(line.starts_with("\"C:/PAL/PAL.exe\" /loadmethod \"C:/methods/lcfc_archive.cam\" \"LS3;200;"));
        assert!(line.ends_with(" /start /quit"));
        assert_eq!(line.matches("/loadmethod").count(), 2);
    }

    #[test]
    fn test_header_columns() {
        assert_eq!(AUX_LOG_HEADER.split('\t').count(), 8);
    }
}
