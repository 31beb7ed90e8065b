use thin_vec::ThinVec;

/// Accumulates "at ..." lines while walking a thread's frame stack; the
/// rendered form collapses the middle once the trace grows past ten
/// entries.
#[derive(Debug, Clone, Default)]
pub struct StackTrace {
    message: String,
    lines: ThinVec<String>,
}

impl StackTrace {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            lines: ThinVec::new(),
        }
    }

    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn render(&self) -> String {
        let mut buf: Vec<&str> = Vec::with_capacity(self.lines.len() + 2);
        if !self.message.is_empty() {
            buf.push(&self.message);
        }
        buf.push("stack traceback:");
        for line in &self.lines {
            buf.push(line);
        }
        buf.push("\t[G]: ?");

        let joined = if buf.len() > 10 {
            let mut collapsed: Vec<&str> = Vec::with_capacity(20);
            collapsed.extend_from_slice(&buf[0..7]);
            collapsed.push("\t...");
            collapsed.extend_from_slice(&buf[buf.len() - 7..buf.len() - 1]);
            collapsed.join("\n")
        } else {
            buf.join("\n")
        };

        format!("\n{}", joined)
    }
}

impl std::fmt::Display for StackTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}
