use std::borrow::Cow;

/// Shell-integration markers carried in OSC sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OscEvent {
    /// OSC 7;file://host/path  (best-effort decoded path)
    Cwd(String),

    /// OSC 133;A  prompt start
    PromptStart,

    /// OSC 133;B  prompt end, user input begins
    CommandStart,

    /// OSC 133;C  command output begins
    CommandExecuted,

    /// OSC 133;D;<exit>
    CommandFinished { exit_code: Option<i32> },

    /// Anything else (payload string, without terminator)
    Unknown(String),
}

/// Interpret an OSC already split into `;`-separated params (the shape the
/// VT parser hands out).
pub fn parse_osc_params(params: &[&[u8]]) -> OscEvent {
    let payload = params
        .iter()
        .map(|p| String::from_utf8_lossy(p))
        .collect::<Vec<_>>()
        .join(";");
    parse_osc_payload(Cow::Owned(payload))
}

/// Streaming OSC scanner (handles BEL or ST terminators). Only the 7-bit
/// `ESC ]` introducer is recognized: 8-bit C1 bytes collide with UTF-8
/// continuation bytes. Never alters the bytes it is fed.
#[derive(Debug, Default, Clone)]
pub struct OscScanner {
    in_osc: bool,
    saw_esc: bool,
    buf: Vec<u8>,
}

/// Payloads longer than this are not shell markers; stop buffering them.
const MAX_PAYLOAD: usize = 4096;

impl OscScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the OSC events completed within them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<OscEvent> {
        self.feed_positions(bytes).into_iter().map(|(_, ev)| ev).collect()
    }

    /// Like [`feed`](Self::feed), but pairs each event with the offset just
    /// past its terminator.
    pub fn feed_positions(&mut self, bytes: &[u8]) -> Vec<(usize, OscEvent)> {
        let mut out = Vec::new();

        for (i, &b) in bytes.iter().enumerate() {
            if !self.in_osc {
                let introducer = self.saw_esc && b == b']';
                self.saw_esc = b == 0x1b;
                if introducer {
                    self.in_osc = true;
                    self.saw_esc = false;
                    self.buf.clear();
                }
                continue;
            }

            if self.saw_esc {
                self.saw_esc = false;
                if b == b'\\' {
                    // ST
                    out.extend(self.finish_event().map(|ev| (i + 1, ev)));
                    continue;
                }
                // Any other escape aborts the OSC.
                self.in_osc = false;
                self.buf.clear();
                self.saw_esc = b == 0x1b;
                continue;
            }

            match b {
                0x1b => self.saw_esc = true,
                0x07 => out.extend(self.finish_event().map(|ev| (i + 1, ev))),
                // CAN / SUB cancel the sequence
                0x18 | 0x1a => {
                    self.in_osc = false;
                    self.buf.clear();
                }
                _ if self.buf.len() < MAX_PAYLOAD => self.buf.push(b),
                _ => {}
            }
        }

        out
    }

    fn finish_event(&mut self) -> Option<OscEvent> {
        self.in_osc = false;
        if self.buf.is_empty() {
            return None;
        }

        let payload = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(parse_osc_payload(Cow::Owned(payload)))
    }
}

fn parse_osc_payload(payload: Cow<'_, str>) -> OscEvent {
    let s = payload.trim_matches('\0').trim();

    if let Some(rest) = s.strip_prefix("7;") {
        return OscEvent::Cwd(decode_file_uri_to_path(rest));
    }

    // 133;A  133;B  133;C  133;D;0   (extra ;k=v options are ignored)
    if let Some(rest) = s.strip_prefix("133;") {
        let mut fields = rest.split(';');
        match fields.next() {
            Some("A") => return OscEvent::PromptStart,
            Some("B") => return OscEvent::CommandStart,
            Some("C") => return OscEvent::CommandExecuted,
            Some("D") => {
                let exit_code = fields.next().and_then(|x| x.trim().parse::<i32>().ok());
                return OscEvent::CommandFinished { exit_code };
            }
            _ => {}
        }
    }

    OscEvent::Unknown(s.to_string())
}

fn decode_file_uri_to_path(uri: &str) -> String {
    let u = uri.trim();

    let path = match u.strip_prefix("file://") {
        // file:///home/u  or  file://host/home/u
        Some(rest) => match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => rest,
        },
        None => u,
    };

    let decoded = percent_decode(path);

    // file:///C:/Users/x  ->  C:\Users\x
    let bytes = decoded.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'/' && bytes[2] == b':' && bytes[1].is_ascii_alphabetic() {
        return decoded[1..].replace('/', "\\");
    }
    decoded
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
