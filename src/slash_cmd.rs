use std::str::FromStr;

/// Chat-ops commands accepted in pull request comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlashCommand {
    /// Rebuild the pull request's preview.
    Preview,
    /// Tear the preview down.
    Delete,
}

impl FromStr for SlashCommand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "/preview" => Ok(SlashCommand::Preview),
            "/delete" => Ok(SlashCommand::Delete),
            _ => Err(anyhow::anyhow!("Invalid slash command: {}", s)),
        }
    }
}

impl SlashCommand {
    /// Finds the command in a comment body. Only the first non-empty line
    /// counts, and it must consist of the command alone.
    pub fn from_comment(body: &str) -> Option<Self> {
        body.lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .and_then(|line| line.parse().ok())
    }
}
