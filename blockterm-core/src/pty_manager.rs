use anyhow::{Context, Result};
use portable_pty::{Child, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionEvent, Connector, SessionKind, EVENT_CHANNEL_CAPACITY};

/// Emits OSC 133 `D;<exit>` then `A` before every prompt.
const BASH_PROMPT_COMMAND: &str = r#"printf '\033]133;D;%s\007\033]133;A\007' "$?""#;

/// `$ZDOTDIR/.zshenv` for the integration dir: runs the user's own
/// `.zshenv`, remembering where their dotfiles live.
const ZSH_ENV: &str = r#"__blockterm_zdotdir="$ZDOTDIR"
ZDOTDIR="${BLOCKTERM_USER_ZDOTDIR:-$HOME}"
[ -f "$ZDOTDIR/.zshenv" ] && source "$ZDOTDIR/.zshenv"
BLOCKTERM_USER_ZDOTDIR="$ZDOTDIR"
ZDOTDIR="$__blockterm_zdotdir"
unset __blockterm_zdotdir
"#;

/// `$ZDOTDIR/.zshrc`: the user's `.zshrc`, then a `precmd` hook that runs
/// before any other so `$?` is still the command's status.
const ZSH_RC: &str = r#"ZDOTDIR="${BLOCKTERM_USER_ZDOTDIR:-$HOME}"
[ -f "$ZDOTDIR/.zshrc" ] && source "$ZDOTDIR/.zshrc"
__blockterm_precmd() { printf '\033]133;D;%s\007\033]133;A\007' "$?" }
precmd_functions=(__blockterm_precmd $precmd_functions)
"#;

const FISH_INIT: &str = r#"function __blockterm_prompt --on-event fish_prompt; printf '\e]133;D;%s\a\e]133;A\a' $status; end"#;

/// Local shell on a native PTY.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtyConnector;

pub struct PtyConnection {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    open: bool,
}

impl std::fmt::Debug for PtyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyConnection")
            .field("master", &"Box<dyn MasterPty + Send>")
            .field("writer", &"Box<dyn Write + Send>")
            .field("child", &"Box<dyn Child + Send + Sync>")
            .field("open", &self.open)
            .finish()
    }
}

impl Connector for PtyConnector {
    fn open(
        &self,
        config: &SessionConfig,
    ) -> Result<(Box<dyn Connection>, mpsc::Receiver<ConnectionEvent>)> {
        let (conn, rx) = PtyConnection::spawn(config)?;
        Ok((Box::new(conn), rx))
    }
}

impl PtyConnection {
    pub fn spawn(config: &SessionConfig) -> Result<(Self, mpsc::Receiver<ConnectionEvent>)> {
        let pty_system = NativePtySystem::default();
        let pair = pty_system
            .openpty(pty_size(config.cols, config.rows))
            .context("Failed to open PTY")?;

        let cmd = shell_command(config);
        let child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn shell process")?;
        // The slave end belongs to the child now.
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;
        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;

        let child = Arc::new(Mutex::new(child));
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        start_reader(reader, child.clone(), tx);

        info!(shell = %config.shell_program(), cols = config.cols, rows = config.rows, "Local shell started");
        Ok((
            Self {
                master: pair.master,
                writer,
                child,
                open: true,
            },
            rx,
        ))
    }

    pub fn child_is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(_) => true,
        }
    }
}

impl Connection for PtyConnection {
    fn kind(&self) -> SessionKind {
        SessionKind::Local
    }

    fn is_open(&self) -> bool {
        self.open && self.child_is_alive()
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).context("Failed to write to PTY")?;
        self.writer.flush().context("Failed to flush PTY writer")
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(pty_size(cols, rows))
            .context("Failed to resize PTY")
    }

    fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(child.try_wait(), Ok(None)) {
            child.kill().context("Failed to kill shell process")?;
        }
        Ok(())
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Blocking reader thread: PTY bytes -> event channel, then the exit status.
fn start_reader(
    mut reader: Box<dyn Read + Send>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    tx: mpsc::Sender<ConnectionEvent>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(ConnectionEvent::Output(buf[..n].to_vec())).is_err() {
                        debug!("PTY event receiver dropped");
                        return;
                    }
                }
                Err(e) => {
                    // EIO is how Linux reports the child hanging up
                    debug!(error = %e, "PTY read ended");
                    break;
                }
            }
        }

        // Poll rather than wait() so the lock is never held while blocking.
        let code = loop {
            let status = child.lock().unwrap_or_else(PoisonError::into_inner).try_wait();
            match status {
                Ok(Some(status)) => break i32::try_from(status.exit_code()).ok(),
                Ok(None) => std::thread::sleep(std::time::Duration::from_millis(20)),
                Err(e) => {
                    warn!(error = %e, "Failed to reap shell process");
                    break None;
                }
            }
        };
        let _ = tx.blocking_send(ConnectionEvent::Exited { code });
    });
}

fn shell_command(config: &SessionConfig) -> CommandBuilder {
    let shell = config.shell_program();
    let mut cmd = CommandBuilder::new(&shell);

    if cfg!(windows) {
        cmd.arg("-NoLogo");
        cmd.arg("-NoExit");
        return cmd;
    }

    cmd.env("TERM", "xterm-256color");
    if config.shell_integration {
        match shell_name(&shell).as_str() {
            "zsh" => {
                if let Err(e) = zsh_integration(&mut cmd) {
                    warn!(error = %e, "zsh shell integration unavailable");
                }
            }
            "fish" => {
                cmd.arg("--init-command");
                cmd.arg(FISH_INIT);
            }
            _ => cmd.env("PROMPT_COMMAND", BASH_PROMPT_COMMAND),
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        cmd.cwd(cwd);
    }
    cmd
}

fn shell_name(shell: &str) -> String {
    let file = shell.rsplit(['/', '\\']).next().unwrap_or(shell);
    let stem = file.split('.').next().unwrap_or(file);
    stem.to_ascii_lowercase()
}

/// zsh ignores `PROMPT_COMMAND`; point `ZDOTDIR` at generated startup files
/// that chain to the user's and add a `precmd` hook.
fn zsh_integration(cmd: &mut CommandBuilder) -> Result<()> {
    let dir = std::env::temp_dir().join(format!("blockterm-zsh-{}", std::process::id()));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    std::fs::write(dir.join(".zshenv"), ZSH_ENV).context("Failed to write .zshenv")?;
    std::fs::write(dir.join(".zshrc"), ZSH_RC).context("Failed to write .zshrc")?;

    if let Ok(user) = std::env::var("ZDOTDIR") {
        cmd.env("BLOCKTERM_USER_ZDOTDIR", user);
    }
    cmd.env("ZDOTDIR", dir.as_os_str());
    debug!(dir = %dir.display(), "zsh integration installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_names_ignore_path_and_extension() {
        assert_eq!(shell_name("/bin/zsh"), "zsh");
        assert_eq!(shell_name("/usr/local/bin/fish"), "fish");
        assert_eq!(shell_name("C:\\Windows\\pwsh.EXE"), "pwsh");
        assert_eq!(shell_name("bash"), "bash");
    }

    #[test]
    fn hooks_report_status_then_prompt() {
        for hook in [BASH_PROMPT_COMMAND, ZSH_RC, FISH_INIT] {
            let d = hook.find("133;D").expect("finished marker");
            let a = hook.find("133;A").expect("prompt marker");
            assert!(d < a, "{hook}");
        }
        assert!(ZSH_RC.contains("precmd_functions=(__blockterm_precmd"));
    }
}
