//! Host checks run before the first step, so a missing container runtime
//! fails with an install hint instead of a half-written cache.

use anyhow::{bail, Result};

/// A host command a build shells out to, and the package that provides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTool {
    pub command: &'static str,
    pub package: &'static str,
}

pub const REQUIRED_TOOLS: &[HostTool] = &[
    HostTool {
        command: "docker",
        package: "docker.io",
    },
    HostTool {
        command: "sh",
        package: "dash",
    },
];

pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Fails listing every tool in `tools` that is not on `PATH`.
pub fn check_required_tools(tools: &[HostTool]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|tool| !command_exists(tool.command))
        .map(|tool| format!("  {} (install: {})", tool.command, tool.package))
        .collect();

    if !missing.is_empty() {
        bail!("build host is missing required tools:\n{}", missing.join("\n"));
    }
    Ok(())
}

pub fn check_build_host() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_shell() {
        assert!(command_exists("sh"));
    }

    #[test]
    fn reports_missing_tool_with_package() {
        let err = check_required_tools(&[
            HostTool {
                command: "sh",
                package: "dash",
            },
            HostTool {
                command: "kiosk-definitely-missing-tool",
                package: "kiosk-extras",
            },
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("build host is missing required tools:"));
        assert!(msg.contains("kiosk-definitely-missing-tool (install: kiosk-extras)"));
        assert!(!msg.contains("dash"));
    }
}
