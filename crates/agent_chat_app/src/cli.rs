//! Command-line arguments: `agent-chat [--config <path>] [question...]`.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub config: Option<String>,
    /// Remaining words joined with spaces; `None` when none were given.
    pub question: Option<String>,
}

impl CliArgs {
    /// Parse arguments, excluding the program name.
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parsed = CliArgs::default();
        let mut words = Vec::new();
        let mut args = args.into_iter().map(Into::into);
        while let Some(arg) = args.next() {
            if arg == "--config" {
                parsed.config = args.next();
            } else if let Some(path) = arg.strip_prefix("--config=") {
                parsed.config = Some(path.to_string());
            } else {
                words.push(arg);
            }
        }
        let question = words.join(" ");
        if !question.trim().is_empty() {
            parsed.question = Some(question.trim().to_string());
        }
        parsed
    }
}
