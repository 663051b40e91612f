//! Desktop notifications and browser opening: best-effort glue around the
//! platform tools. Failures here are logged, never escalated.

use std::io;
use std::process::{Command, Stdio};

use log::{debug, info};

/// Per-session notifier. The deep-link URL is set once, when the first build
/// summary for the session arrives.
pub struct Notifier {
    name: String,
    open_url: Option<String>,
}

impl Notifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            open_url: None,
        }
    }

    /// Record the URL the notification should point at. First caller wins;
    /// later polls must not move the link.
    pub fn set_open_url(&mut self, url: &str) {
        if self.open_url.is_none() {
            self.open_url = Some(url.to_string());
        }
    }

    pub fn display(&self, title: &str) {
        if let Some(url) = &self.open_url {
            info!("{}: {title} ({url})", self.name);
        } else {
            info!("{}: {title}", self.name);
        }
        let result = if cfg!(target_os = "macos") {
            let script = format!(
                "display notification \"{}\" with title \"{}\"",
                title.replace('"', ""),
                self.name.replace('"', "")
            );
            spawn_quiet("osascript", &["-e", &script])
        } else {
            spawn_quiet("notify-send", &[&self.name, title])
        };
        if let Err(err) = result {
            debug!("notification failed: {err}");
        }
    }
}

/// Open a URL in the user's default browser.
pub fn open_in_browser(url: &str) -> io::Result<()> {
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    spawn_quiet(opener, &[url])
}

fn spawn_quiet(program: &str, args: &[&str]) -> io::Result<()> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if !status.success() {
        return Err(io::Error::other(format!("{program} exited with {status}")));
    }
    Ok(())
}
