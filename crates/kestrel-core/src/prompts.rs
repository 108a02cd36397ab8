// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::Local;
use std::path::Path;

/// All optional contextual blocks that can be injected into the system prompt.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Absolute path to the project root (from `.git` detection).
    pub project_root: Option<&'a Path>,
    /// Pre-formatted git context (branch, commit, dirty status).
    ///
    /// **Caching note**: this field is *volatile* — it changes on every commit
    /// and with every file edit (dirty count). When prompt caching is enabled
    /// this content is placed in a *separate, uncached* system block so that
    /// the stable prefix remains cacheable across turns.
    pub git_context: Option<&'a str>,
    /// Contents of a project context file (e.g. `AGENTS.md`).
    pub project_context_file: Option<&'a str>,
    /// Pre-formatted CI environment block.
    ///
    /// **Caching note**: like `git_context`, this is volatile between CI runs.
    pub ci_context: Option<&'a str>,
    /// Text appended verbatim after the Guidelines section.
    pub append: Option<&'a str>,
}

impl<'a> PromptContext<'a> {
    /// Return a version of this context with the volatile fields cleared.
    ///
    /// Used to build the *stable* (cacheable) portion of the system prompt
    /// when [`kestrel_config::ModelConfig::cache_system_prompt`] is set.
    pub fn stable_only(&self) -> Self {
        Self { git_context: None, ci_context: None, ..*self }
    }

    /// Format the volatile fields (git + CI context) as a block suitable for
    /// appending to the system prompt outside the cached region.
    ///
    /// Returns `None` when neither git nor CI context is present.
    pub fn dynamic_block(&self) -> Option<String> {
        let git = self.git_context.filter(|s| !s.trim().is_empty()).map(str::to_string);
        let ci = self.ci_context.filter(|s| !s.trim().is_empty()).map(str::to_string);
        match (git, ci) {
            (None, None) => None,
            (Some(g), None) => Some(g),
            (None, Some(c)) => Some(c),
            (Some(g), Some(c)) => Some(format!("{g}\n\n{c}")),
        }
    }
}

// ─── Guidelines ───────────────────────────────────────────────────────────────

mod guidelines {
    pub fn general() -> &'static str {
        "- Be concise and precise. Use tools instead of guessing."
    }

    pub fn tool_usage() -> &'static str {
        "- Discovery workflow: search to find files, narrow with a targeted read, then read the \
           specific ranges needed for context.\n\
         - Batch independent tool calls in the same turn whenever they do not depend on each \
           other's output."
    }

    pub fn code_quality() -> &'static str {
        "- Do not create new files proactively unless explicitly requested.\n\
         - Write tests when adding new functionality.\n\
         - Preserve existing code structure and conventions."
    }

    pub fn workflow_efficiency() -> &'static str {
        "- Track multi-step tasks explicitly and report progress as steps complete.\n\
         - Batch independent tool calls in parallel to increase efficiency."
    }

    pub fn error_handling() -> &'static str {
        "- When a tool fails, try a different approach before giving up.\n\
         - Never skip version-control hooks or force-push without explicit user permission."
    }
}

fn build_guidelines_section() -> String {
    format!(
        "## Guidelines\n\n\
         ### General Principles\n\
         {}\n\n\
         ### Tool Usage Patterns\n\
         {}\n\n\
         ### Code Quality\n\
         {}\n\n\
         ### Workflow Efficiency\n\
         {}\n\n\
         ### Error Handling\n\
         {}",
        guidelines::general(),
        guidelines::tool_usage(),
        guidelines::code_quality(),
        guidelines::workflow_efficiency(),
        guidelines::error_handling(),
    )
}

/// Build the default system prompt, or return `custom` verbatim (with
/// `append` still honoured) when the caller supplied one.
///
/// `ctx` carries optional project / CI / git context injected when running
/// headless against a checked-out project.
pub fn system_prompt(custom: Option<&str>, ctx: PromptContext<'_>) -> String {
    if let Some(custom) = custom {
        if let Some(extra) = ctx.append {
            return format!("{}\n\n{}", custom.trim_end(), extra);
        }
        return custom.to_string();
    }

    let agent_identity = format!(
        "You are an autonomous software engineering agent operating in a reason/act loop.\n\n\
         Current date and time: `{current_date_time}`\n\
         Current working directory: `{current_working_directory}`\n\n\
         You can read and write files, run shell commands, and search the codebase. Work \
         systematically, verify your changes, and report progress clearly. Maximize parallel \
         tool calls when the work permits it, and finish the task you were given before ending \
         your turn.",
        current_date_time = Local::now().format("%Y-%m-%d %H:%M:%S"),
        current_working_directory = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "<unknown>".to_string()),
    );

    let project_section = if let Some(root) = ctx.project_root {
        format!(
            "\n\n## Project Context\n\
             Project root directory: `{}`\n\
             - Use this absolute path for all file read/write operations.\n\
             - Prefer absolute paths over relative paths in every tool call.",
            root.display()
        )
    } else {
        String::new()
    };

    let context_file_section = match ctx.project_context_file {
        Some(content) => format!("\n\n## Project Instructions\n\n{content}"),
        None => String::new(),
    };

    let git_section = match ctx.git_context {
        Some(git) => format!("\n\n{git}"),
        None => String::new(),
    };

    let ci_section = match ctx.ci_context {
        Some(ci) => format!("\n\n{ci}"),
        None => String::new(),
    };

    let guidelines_section = build_guidelines_section();

    let append_section = match ctx.append {
        Some(extra) => format!("\n\n{extra}"),
        None => String::new(),
    };

    format!(
        "{agent_identity}{project_section}{context_file_section}\
         {git_section}{ci_section}\n\n\
         {guidelines_section}\
         {append_section}",
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }
    fn empty() -> PromptContext<'static> {
        PromptContext::default()
    }

    #[test]
    fn custom_prompt_is_returned_verbatim() {
        let prompt = system_prompt(Some("Custom instructions here."), empty());
        assert_eq!(prompt, "Custom instructions here.");
    }

    #[test]
    fn custom_prompt_with_append() {
        let ctx = PromptContext { append: Some("Extra rule."), ..Default::default() };
        let prompt = system_prompt(Some("Base."), ctx);
        assert!(prompt.contains("Base."));
        assert!(prompt.contains("Extra rule."));
    }

    #[test]
    fn default_prompt_mentions_reason_act_loop() {
        let pr = system_prompt(None, empty());
        assert!(pr.contains("reason/act loop"));
    }

    #[test]
    fn default_prompt_includes_guidelines_section() {
        let pr = system_prompt(None, empty());
        assert!(pr.contains("## Guidelines"));
    }

    #[test]
    fn guidelines_section_has_multiple_categories() {
        let pr = system_prompt(None, empty());
        assert!(pr.contains("### General Principles"));
        assert!(pr.contains("### Tool Usage Patterns"));
        assert!(pr.contains("### Code Quality"));
        assert!(pr.contains("### Workflow Efficiency"));
        assert!(pr.contains("### Error Handling"));
    }

    #[test]
    fn project_root_appears_in_prompt() {
        let root = p("/home/user/my-project");
        let ctx = PromptContext { project_root: Some(&root), ..Default::default() };
        let pr = system_prompt(None, ctx);
        assert!(pr.contains("/home/user/my-project"));
        assert!(pr.contains("Project Context"));
    }

    #[test]
    fn no_project_root_no_section() {
        let pr = system_prompt(None, empty());
        assert!(!pr.contains("Project Context"));
    }

    #[test]
    fn ci_context_is_appended() {
        let ci = "## CI Environment\nRunning in: GitHub Actions\nBranch: main";
        let ctx = PromptContext { ci_context: Some(ci), ..Default::default() };
        let pr = system_prompt(None, ctx);
        assert!(pr.contains("GitHub Actions"));
        assert!(pr.contains("Branch: main"));
    }

    #[test]
    fn git_context_appears_in_prompt() {
        let git = "## Git Context\nBranch: main\nCommit: abc1234";
        let ctx = PromptContext { git_context: Some(git), ..Default::default() };
        let pr = system_prompt(None, ctx);
        assert!(pr.contains("Git Context"));
        assert!(pr.contains("abc1234"));
    }

    #[test]
    fn project_context_file_appears_in_prompt() {
        let file_content = "Always write tests for every function.";
        let ctx = PromptContext { project_context_file: Some(file_content), ..Default::default() };
        let pr = system_prompt(None, ctx);
        assert!(pr.contains("Project Instructions"));
        assert!(pr.contains("Always write tests"));
    }

    #[test]
    fn append_section_is_added_after_guidelines() {
        let ctx = PromptContext { append: Some("Custom rule: never delete files."), ..Default::default() };
        let pr = system_prompt(None, ctx);
        let guidelines_pos = pr.find("Guidelines").unwrap();
        let append_pos = pr.find("Custom rule").unwrap();
        assert!(append_pos > guidelines_pos);
    }

    #[test]
    fn dynamic_block_combines_git_and_ci() {
        let git = "git-block";
        let ci = "ci-block";
        let ctx = PromptContext { git_context: Some(git), ci_context: Some(ci), ..Default::default() };
        let block = ctx.dynamic_block().unwrap();
        assert!(block.contains("git-block"));
        assert!(block.contains("ci-block"));
    }

    #[test]
    fn dynamic_block_none_when_both_absent() {
        assert!(empty().dynamic_block().is_none());
    }

    #[test]
    fn stable_only_clears_volatile_fields() {
        let ctx = PromptContext {
            git_context: Some("git"),
            ci_context: Some("ci"),
            append: Some("keep"),
            ..Default::default()
        };
        let stable = ctx.stable_only();
        assert!(stable.git_context.is_none());
        assert!(stable.ci_context.is_none());
        assert_eq!(stable.append, Some("keep"));
    }
}
