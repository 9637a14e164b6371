// ABOUTME: capture-pane arguments for reading a bounded tail of a session's output

/// What `read_output` asks tmux for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Scrollback lines above the visible pane to include; None for the visible pane only
    pub tail_lines: Option<usize>,
    /// Keep ANSI colour and cursor sequences (`-e`)
    pub include_escape_sequences: bool,
    /// Rejoin lines tmux wrapped at the pane width (`-J`)
    pub join_wrapped_lines: bool,
}

impl CaptureOptions {
    /// Visible pane plus `lines` of scrollback, wrapped lines rejoined.
    pub fn tail(lines: usize) -> Self {
        Self {
            tail_lines: Some(lines),
            include_escape_sequences: false,
            join_wrapped_lines: true,
        }
    }

    pub fn with_escape_sequences(mut self) -> Self {
        self.include_escape_sequences = true;
        self
    }

    /// Arguments for `tmux capture-pane` against `target`.
    pub fn to_args(&self, target: &str) -> Vec<String> {
        let mut args: Vec<String> = ["capture-pane", "-p", "-t", target]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if self.include_escape_sequences {
            args.push("-e".to_string());
        }
        if self.join_wrapped_lines {
            args.push("-J".to_string());
        }
        if let Some(lines) = self.tail_lines {
            args.push(format!("-S-{}", lines));
        }
        args
    }
}

/// Drop the blank rows tmux pads the visible pane with.
pub fn trim_trailing_blank_lines(output: &str) -> &str {
    output.trim_end_matches(|c: char| c == '\n' || c == ' ')
}
