use std::fmt;
use std::process::{Command, Stdio};
use std::sync::Arc;

use url::Url;

use crate::error::LaunchError;

/// How the external agent is presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Presentation {
    /// Hand the URL to the platform browser.
    #[default]
    SystemBrowser,
    /// Sized secondary surface.
    Popup { width: u32, height: u32 },
    /// Full secondary surface.
    NewTab,
    /// Embedded surface, possibly invisible.
    Frame { visible: bool },
    /// The current context navigates away; the result arrives after reload.
    SamePage,
}

impl Presentation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SystemBrowser => "system_browser",
            Self::Popup { .. } => "popup",
            Self::NewTab => "new_tab",
            Self::Frame { .. } => "frame",
            Self::SamePage => "same_page",
        }
    }
}

impl fmt::Display for Presentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The surface the launcher opened. The engine only ever asks whether it has
/// been closed and, once the operation resolves, asks it to close.
pub trait ExternalSurface: Send + Sync {
    fn is_closed(&self) -> bool;
    fn close(&self);
}

pub trait Launcher: Send + Sync {
    /// Opens the external agent. Called synchronously from `begin`.
    fn launch(
        &self,
        url: &Url,
        presentation: &Presentation,
    ) -> Result<Arc<dyn ExternalSurface>, LaunchError>;
}

/// Surface with no dismissal signal, such as a URL handed to the system
/// browser. Close detection falls back to the operation timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSurface;

impl ExternalSurface for DetachedSurface {
    fn is_closed(&self) -> bool {
        false
    }

    fn close(&self) {}
}

/// Opens URLs by spawning a program (`xdg-open`, `open`, a browser binary)
/// with the URL as its last argument.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Parses a whitespace separated command line such as `firefox --new-window`.
    #[must_use]
    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    #[must_use]
    pub fn platform_default() -> Self {
        if cfg!(target_os = "macos") {
            Self::new("open")
        } else if cfg!(target_os = "windows") {
            Self {
                program: "cmd".to_string(),
                args: vec!["/C".to_string(), "start".to_string(), String::new()],
            }
        } else {
            Self::new("xdg-open")
        }
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Launcher for CommandLauncher {
    fn launch(
        &self,
        url: &Url,
        presentation: &Presentation,
    ) -> Result<Arc<dyn ExternalSurface>, LaunchError> {
        if matches!(presentation, Presentation::SamePage | Presentation::Frame { .. }) {
            return Err(LaunchError::Unsupported {
                presentation: presentation.to_string(),
            });
        }
        Command::new(&self.program)
            .args(&self.args)
            .arg(url.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|error| LaunchError::Spawn {
                program: self.program.clone(),
                message: error.to_string(),
            })?;
        tracing::info!(program = %self.program, %presentation, "Launched external agent");
        Ok(Arc::new(DetachedSurface::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_parsing_splits_program_and_args() {
        let launcher = CommandLauncher::from_command_line("  firefox --new-window ")
            .expect("command line");
        assert_eq!(launcher.program(), "firefox");
        assert_eq!(launcher.args, vec!["--new-window".to_string()]);
        assert!(CommandLauncher::from_command_line("   ").is_none());
    }

    #[test]
    fn command_launcher_rejects_in_page_presentations() {
        let launcher = CommandLauncher::new("true");
        let url = Url::parse("https://example.com/authorize").expect("url");
        let error = launcher
            .launch(&url, &Presentation::SamePage)
            .err()
            .expect("same page unsupported");
        assert!(matches!(error, LaunchError::Unsupported { .. }));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let launcher = CommandLauncher::new("openagents-redirect-no-such-program");
        let url = Url::parse("https://example.com/authorize").expect("url");
        let error = launcher
            .launch(&url, &Presentation::SystemBrowser)
            .err()
            .expect("spawn should fail");
        assert!(matches!(error, LaunchError::Spawn { .. }));
    }

    #[test]
    fn detached_surface_never_reports_closed() {
        let surface = DetachedSurface::default();
        surface.close();
        assert!(!surface.is_closed());
    }
}
