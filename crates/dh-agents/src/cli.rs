use dh_core::types::{AgentInstance, CliType};

// ---------------------------------------------------------------------------
// AgentCli trait
// ---------------------------------------------------------------------------

/// Knows how to invoke one coding-agent CLI non-interactively inside a
/// container.
pub trait AgentCli: Send + Sync {
    /// Which CLI type this template handles.
    fn cli_type(&self) -> CliType;

    /// The binary name on the container's `PATH`.
    fn binary_name(&self) -> &str;

    /// Arguments that are always passed, before any per-agent flags.
    fn default_args(&self) -> Vec<String>;

    /// Where the agent's host config directory is mounted in the container.
    fn config_mount_target(&self) -> &str;

    /// Flag that introduces the prompt, if the CLI takes one.
    fn prompt_flag(&self) -> Option<&str> {
        None
    }

    /// Full argv for one run. The prompt is always the final argument.
    fn build_command(&self, agent: &AgentInstance, prompt: &str) -> Vec<String> {
        let mut argv = Vec::with_capacity(agent.extra_flags.len() + 6);
        argv.push(self.binary_name().to_string());
        argv.extend(self.default_args());
        argv.extend(agent.extra_flags.iter().cloned());
        if let Some(flag) = self.prompt_flag() {
            argv.push(flag.to_string());
        }
        argv.push(prompt.to_string());
        argv
    }
}

// ---------------------------------------------------------------------------
// Claude
// ---------------------------------------------------------------------------

pub struct ClaudeCli;

impl AgentCli for ClaudeCli {
    fn cli_type(&self) -> CliType {
        CliType::Claude
    }

    fn binary_name(&self) -> &str {
        "claude"
    }

    fn default_args(&self) -> Vec<String> {
        vec!["--dangerously-skip-permissions".into()]
    }

    fn config_mount_target(&self) -> &str {
        "/root/.claude"
    }

    fn prompt_flag(&self) -> Option<&str> {
        Some("-p")
    }
}

// ---------------------------------------------------------------------------
// Codex
// ---------------------------------------------------------------------------

pub struct CodexCli;

impl AgentCli for CodexCli {
    fn cli_type(&self) -> CliType {
        CliType::Codex
    }

    fn binary_name(&self) -> &str {
        "codex"
    }

    fn default_args(&self) -> Vec<String> {
        vec!["--approval-mode".into(), "full-auto".into(), "-q".into()]
    }

    fn config_mount_target(&self) -> &str {
        "/root/.codex"
    }
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

pub struct GeminiCli;

impl AgentCli for GeminiCli {
    fn cli_type(&self) -> CliType {
        CliType::Gemini
    }

    fn binary_name(&self) -> &str {
        "gemini"
    }

    fn default_args(&self) -> Vec<String> {
        vec!["--yolo".into()]
    }

    fn config_mount_target(&self) -> &str {
        "/root/.gemini"
    }

    fn prompt_flag(&self) -> Option<&str> {
        Some("-p")
    }
}

// ---------------------------------------------------------------------------
// OpenCode
// ---------------------------------------------------------------------------

pub struct OpenCodeCli;

impl AgentCli for OpenCodeCli {
    fn cli_type(&self) -> CliType {
        CliType::OpenCode
    }

    fn binary_name(&self) -> &str {
        "opencode"
    }

    fn default_args(&self) -> Vec<String> {
        vec!["run".into()]
    }

    fn config_mount_target(&self) -> &str {
        "/root/.config/opencode"
    }
}

/// Template for a CLI type.
pub fn for_cli(cli: CliType) -> &'static dyn AgentCli {
    match cli {
        CliType::Claude => &ClaudeCli,
        CliType::Codex => &CodexCli,
        CliType::Gemini => &GeminiCli,
        CliType::OpenCode => &OpenCodeCli,
    }
}
