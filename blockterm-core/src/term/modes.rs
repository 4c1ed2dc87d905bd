/// DEC private-mode tracker for pass-through output.
///
/// Only a handful of modes matter while a fullscreen program owns the
/// connection:
/// - Alt screen: ?47 / ?1047 / ?1049
/// - Mouse: ?1000/?1002/?1003/?1006/?1015
/// - Bracketed paste: ?2004
/// - App cursor: ?1
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeSnapshot {
    pub alt_screen: bool,
    pub mouse_reporting: bool,
    pub bracketed_paste: bool,
    pub app_cursor: bool,
}

impl ModeSnapshot {
    /// Nothing is asking for a real terminal any more.
    pub fn is_plain(&self) -> bool {
        !self.alt_screen && !self.mouse_reporting
    }
}

/// Alternate-screen edges seen while feeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChange {
    AltScreenEntered,
    AltScreenLeft,
}

#[derive(Debug, Default, Clone)]
pub struct ModeTracker {
    snap: ModeSnapshot,

    state: ParseState,
    cur_num: Option<u16>,
    nums: Vec<u16>,
    private: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ParseState {
    #[default]
    Ground,
    Esc,
    Csi,
}

impl ModeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ModeSnapshot {
        self.snap
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ModeChange> {
        let mut changes = Vec::new();
        for &b in bytes {
            match self.state {
                ParseState::Ground => {
                    if b == 0x1b {
                        self.state = ParseState::Esc;
                    }
                }
                ParseState::Esc => match b {
                    b'[' => {
                        self.state = ParseState::Csi;
                        self.private = false;
                        self.cur_num = None;
                        self.nums.clear();
                    }
                    // RIS: full reset
                    b'c' => {
                        if self.snap.alt_screen {
                            changes.push(ModeChange::AltScreenLeft);
                        }
                        self.snap = ModeSnapshot::default();
                        self.state = ParseState::Ground;
                    }
                    0x1b => {}
                    _ => self.state = ParseState::Ground,
                },
                ParseState::Csi => {
                    if self.nums.is_empty() && self.cur_num.is_none() && !self.private && b == b'?' {
                        self.private = true;
                        continue;
                    }

                    if b.is_ascii_digit() {
                        let d = u16::from(b - b'0');
                        self.cur_num = Some(self.cur_num.unwrap_or(0).saturating_mul(10).saturating_add(d));
                        continue;
                    }

                    if b == b';' {
                        self.nums.push(self.cur_num.take().unwrap_or(0));
                        continue;
                    }

                    if b == 0x1b {
                        // aborted sequence, a new one starts
                        self.state = ParseState::Esc;
                        continue;
                    }

                    // final byte
                    if let Some(n) = self.cur_num.take() {
                        self.nums.push(n);
                    }

                    if self.private && (b == b'h' || b == b'l') {
                        let was_alt = self.snap.alt_screen;
                        self.apply_private_modes(b == b'h');
                        match (was_alt, self.snap.alt_screen) {
                            (false, true) => changes.push(ModeChange::AltScreenEntered),
                            (true, false) => changes.push(ModeChange::AltScreenLeft),
                            _ => {}
                        }
                    }

                    self.state = ParseState::Ground;
                }
            }
        }
        changes
    }

    fn apply_private_modes(&mut self, set: bool) {
        for &m in &self.nums {
            match m {
                47 | 1047 | 1049 => self.snap.alt_screen = set,
                1000 | 1002 | 1003 | 1006 | 1015 => self.snap.mouse_reporting = set,
                2004 => self.snap.bracketed_paste = set,
                1 => self.snap.app_cursor = set,
                _ => {}
            }
        }
    }
}
