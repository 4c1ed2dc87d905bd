use super::osc::OscEvent;

/// Semantic shell state derived from OSC markers (prompt vs running).
#[derive(Debug, Clone, Default)]
pub struct SemanticState {
    pub in_prompt: bool,
    pub in_command: bool,
    pub last_exit: Option<i32>,
    pub cwd: Option<String>,
    /// At least one OSC 133 marker has been seen: the shell is integrated
    /// and prompt boundaries can be trusted.
    pub integrated: bool,
}

/// Transitions worth reacting to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemanticEvent {
    CwdChanged(String),
    PromptShown,
    CommandEnded { exit_code: Option<i32> },
}

impl SemanticState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, ev: &OscEvent) -> Option<SemanticEvent> {
        match ev {
            OscEvent::Cwd(p) => {
                if self.cwd.as_deref() == Some(p.as_str()) {
                    return None;
                }
                self.cwd = Some(p.clone());
                Some(SemanticEvent::CwdChanged(p.clone()))
            }
            OscEvent::PromptStart => {
                self.integrated = true;
                self.in_prompt = true;
                self.in_command = false;
                Some(SemanticEvent::PromptShown)
            }
            OscEvent::CommandStart | OscEvent::CommandExecuted => {
                self.integrated = true;
                self.in_command = true;
                self.in_prompt = false;
                None
            }
            OscEvent::CommandFinished { exit_code } => {
                self.integrated = true;
                self.in_command = false;
                self.in_prompt = true;
                self.last_exit = *exit_code;
                Some(SemanticEvent::CommandEnded { exit_code: *exit_code })
            }
            OscEvent::Unknown(_) => None,
        }
    }
}
