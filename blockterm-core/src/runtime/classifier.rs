//! Command classifier.
//!
//! Maps a command line to the way it behaves once launched: a quick
//! one-shot, a long-running monitor, or an interactive program. The
//! decision is driven by an ordered rule table (first match wins) so the
//! rules are data and can be extended from configuration.
//!
//! Pipelines and chains are classified by their head segment only:
//! `make && npm start` is a `make`.

use serde::{Deserialize, Serialize};

use crate::config::ClassifierOverrides;

/// Behavioral category of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    /// Runs, prints, exits.
    OneShot,
    /// Runs until interrupted (log followers, monitors, dev servers).
    Continuous,
    /// Reads from the user while it runs (REPLs, shells, db clients).
    Interactive,
}

/// What the classifier knows about a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandProfile {
    pub classification: Classification,
    /// The program takes over the whole terminal (editors, pagers, TUIs).
    /// Only ever set together with [`Classification::Interactive`].
    pub fullscreen_required: bool,
    /// Lower-cased basename of the resolved executable ("" for blank input).
    pub executable: String,
}

impl CommandProfile {
    fn one_shot(executable: String) -> Self {
        Self {
            classification: Classification::OneShot,
            fullscreen_required: false,
            executable,
        }
    }
}

/// Result of a matching rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    OneShot,
    Continuous,
    Interactive,
    Fullscreen,
}

impl Outcome {
    fn profile(self, executable: String) -> CommandProfile {
        let (classification, fullscreen_required) = match self {
            Outcome::OneShot => (Classification::OneShot, false),
            Outcome::Continuous => (Classification::Continuous, false),
            Outcome::Interactive => (Classification::Interactive, false),
            Outcome::Fullscreen => (Classification::Interactive, true),
        };
        CommandProfile {
            classification,
            fullscreen_required,
            executable,
        }
    }
}

/// Condition a rule places on the arguments following the executable
/// (and the subcommand, when the rule names one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgCondition {
    Always,
    /// At least one of these flags is present. Short flags also match inside
    /// clusters (`-fn` has `-f`) and with attached values (`-c3` has `-c`).
    AnyFlag(Vec<String>),
    /// Number of non-flag operands lies in `min..=max`.
    Operands { min: usize, max: Option<usize> },
}

/// One row of the rule table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRule {
    /// Executables this rule applies to; empty means any executable.
    pub executables: Vec<String>,
    pub subcommand: Option<String>,
    pub condition: ArgCondition,
    /// Flags that consume the following token, for operand counting.
    pub value_flags: Vec<String>,
    pub outcome: Outcome,
}

impl ClassificationRule {
    pub fn new(executables: &[&str], condition: ArgCondition, outcome: Outcome) -> Self {
        Self {
            executables: executables.iter().map(|s| s.to_string()).collect(),
            subcommand: None,
            condition,
            value_flags: Vec::new(),
            outcome,
        }
    }

    pub fn always(executables: &[&str], outcome: Outcome) -> Self {
        Self::new(executables, ArgCondition::Always, outcome)
    }

    pub fn with_flags(executables: &[&str], flags: &[&str], outcome: Outcome) -> Self {
        Self::new(executables, ArgCondition::AnyFlag(owned(flags)), outcome)
    }

    pub fn subcommand(mut self, sub: &str) -> Self {
        self.subcommand = Some(sub.to_string());
        self
    }

    pub fn value_flags(mut self, flags: &[&str]) -> Self {
        self.value_flags = owned(flags);
        self
    }

    fn matches(&self, executable: &str, args: &[String]) -> bool {
        if !self.executables.is_empty() && !self.executables.iter().any(|e| e == executable) {
            return false;
        }

        let args = match &self.subcommand {
            Some(sub) => match args.iter().position(|a| !a.starts_with('-')) {
                Some(idx) if args[idx].eq_ignore_ascii_case(sub) => &args[idx + 1..],
                _ => return false,
            },
            None => args,
        };

        match &self.condition {
            ArgCondition::Always => true,
            ArgCondition::AnyFlag(flags) => args
                .iter()
                .take_while(|a| a.as_str() != "--")
                .any(|a| flags.iter().any(|f| flag_matches(a, f))),
            ArgCondition::Operands { min, max } => {
                let n = count_operands(args, &self.value_flags);
                n >= *min && max.map_or(true, |max| n <= max)
            }
        }
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn flag_matches(arg: &str, flag: &str) -> bool {
    if arg == flag {
        return true;
    }
    if let Some(long) = flag.strip_prefix("--") {
        return arg
            .strip_prefix("--")
            .and_then(|a| a.strip_prefix(long))
            .is_some_and(|rest| rest.starts_with('='));
    }
    let Some(short) = flag.strip_prefix('-').and_then(|f| f.chars().next()) else {
        return false;
    };
    match arg.strip_prefix('-') {
        Some(cluster) if !cluster.starts_with('-') && !cluster.is_empty() => {
            // `-c3` (attached value) or `-qfn` (cluster of letters)
            let letters: String = cluster.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
            letters.contains(short)
        }
        _ => false,
    }
}

fn count_operands(args: &[String], value_flags: &[String]) -> usize {
    let mut n = 0;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            return n + iter.count();
        }
        if arg.starts_with('-') && arg.len() > 1 {
            if value_flags.iter().any(|f| f == arg) {
                iter.next();
            }
            continue;
        }
        n += 1;
    }
    n
}

// ════════════════════════════════════════════════════════════════════
// Static lookup tables
// ════════════════════════════════════════════════════════════════════

const EDITORS: &[&str] = &[
    "vi", "vim", "nvim", "view", "vimdiff", "nano", "pico", "emacs", "micro", "hx", "helix",
    "kak", "joe", "ne",
];

const PAGERS: &[&str] = &["less", "more", "most", "man", "info"];

const MONITORS: &[&str] = &[
    "htop", "btop", "btm", "atop", "nvtop", "glances", "iotop", "iftop", "nethogs", "bmon",
    "watch",
];

const TUI_APPS: &[&str] = &[
    "tmux", "screen", "zellij", "mc", "ranger", "nnn", "lf", "yazi", "vifm", "tig", "lazygit",
    "gitui", "k9s", "ncdu", "cmatrix", "alsamixer", "fzf", "dialog", "whiptail", "mutt",
    "neomutt", "weechat", "irssi", "newsboat",
];

const REMOTE_LOGINS: &[&str] = &["ssh", "mosh"];

const SSH_VALUE_FLAGS: &[&str] = &[
    "-b", "-B", "-c", "-D", "-E", "-e", "-F", "-I", "-i", "-J", "-L", "-l", "-m", "-O", "-o",
    "-p", "-Q", "-R", "-S", "-W", "-w",
];

const INTERPRETERS: &[&str] = &[
    "python", "python2", "python3", "ipython", "bpython", "node", "deno", "bun", "ruby", "irb",
    "pry", "php", "perl", "lua", "luajit", "ghci", "r", "julia", "scala", "clojure", "clj",
    "erl", "iex", "ocaml", "utop", "racket", "guile", "sbcl", "tclsh", "bash", "sh", "zsh",
    "fish", "dash", "ksh", "pwsh", "powershell", "bc", "dc",
];

const INTERPRETER_ONE_SHOT_FLAGS: &[&str] = &["-c", "-e", "--eval", "-m", "-p", "--print"];

const DB_CLIENTS: &[&str] = &[
    "psql", "mysql", "mariadb", "sqlite3", "mongo", "mongosh", "redis-cli", "cqlsh", "clickhouse-client",
];

const DB_ONE_SHOT_FLAGS: &[&str] = &["-c", "-e", "--execute", "--command", "-f", "--file", "--eval"];

const DEBUGGERS_AND_CLIENTS: &[&str] = &["gdb", "lldb", "pdb", "ftp", "sftp", "telnet", "nc", "netcat", "ncat"];

const FOLLOWERS: &[(&str, &[&str])] = &[
    ("tail", &["-f", "-F", "--follow"]),
    ("journalctl", &["-f", "--follow"]),
    ("dmesg", &["-w", "-W", "--follow", "--follow-new"]),
    ("tsc", &["-w", "--watch"]),
    ("jest", &["--watch", "--watchAll"]),
];

const CONTINUOUS: &[&str] = &[
    "top", "ping", "ping6", "tcpdump", "tshark", "yes", "nodemon", "http-server", "live-server",
    "serve", "logcat", "entr", "inotifywait", "mtr",
];

const STAT_SAMPLERS: &[&str] = &["vmstat", "iostat", "mpstat", "sar", "pidstat"];

/// The built-in rule table, in evaluation order.
pub fn default_rules() -> Vec<ClassificationRule> {
    use Outcome::*;

    let mut rules = vec![
        // Asking any program for help or its version returns immediately.
        ClassificationRule::with_flags(&[], &["--help", "--version"], OneShot),
        // Bounded pings.
        ClassificationRule::with_flags(
            &["ping", "ping6"],
            &["-c", "-w", "--count", "--deadline"],
            OneShot,
        ),
    ];

    for (exe, flags) in FOLLOWERS {
        rules.push(ClassificationRule::with_flags(&[*exe], flags, Continuous));
    }

    rules.extend([
        ClassificationRule::with_flags(&["docker", "podman", "kubectl"], &["-f", "--follow"], Continuous)
            .subcommand("logs"),
        ClassificationRule::with_flags(&["kubectl"], &["-w", "--watch"], Continuous).subcommand("get"),
        ClassificationRule::with_flags(&["docker", "podman"], &["--no-stream"], OneShot).subcommand("stats"),
        ClassificationRule::always(&["docker", "podman"], Continuous).subcommand("stats"),
        ClassificationRule::always(&["cargo"], Continuous).subcommand("watch"),
        ClassificationRule::always(&["adb"], Continuous).subcommand("logcat"),
        ClassificationRule::always(&["npm", "pnpm", "yarn", "bun"], Continuous).subcommand("start"),
        ClassificationRule::always(&["npm", "pnpm", "yarn", "bun"], Continuous).subcommand("dev"),
        ClassificationRule::with_flags(&["nc", "netcat", "ncat"], &["-l", "--listen"], Continuous),
        // `ssh host cmd` runs cmd remotely and returns; `ssh host` is a login.
        ClassificationRule::new(
            REMOTE_LOGINS,
            ArgCondition::Operands { min: 2, max: None },
            OneShot,
        )
        .value_flags(SSH_VALUE_FLAGS),
        ClassificationRule::always(REMOTE_LOGINS, Fullscreen),
        ClassificationRule::always(EDITORS, Fullscreen),
        ClassificationRule::always(PAGERS, Fullscreen),
        ClassificationRule::always(MONITORS, Fullscreen),
        ClassificationRule::always(TUI_APPS, Fullscreen),
        // `sudo -i` / `sudo -s` with nothing after them open a root shell.
        ClassificationRule::with_flags(&["sudo", "doas"], &["-i", "-s"], Interactive),
        ClassificationRule::with_flags(INTERPRETERS, &["-i"], Interactive),
        ClassificationRule::with_flags(INTERPRETERS, INTERPRETER_ONE_SHOT_FLAGS, OneShot),
        ClassificationRule::new(INTERPRETERS, ArgCondition::Operands { min: 0, max: Some(0) }, Interactive)
            .value_flags(&["-W", "-X", "-O", "-r", "--require", "-I"]),
        ClassificationRule::with_flags(DB_CLIENTS, DB_ONE_SHOT_FLAGS, OneShot),
        ClassificationRule::new(&["sqlite3"], ArgCondition::Operands { min: 2, max: None }, OneShot)
            .value_flags(&["-cmd", "-separator", "-newline", "-nullvalue"]),
        ClassificationRule::always(DB_CLIENTS, Interactive),
        ClassificationRule::always(DEBUGGERS_AND_CLIENTS, Interactive),
        ClassificationRule::new(STAT_SAMPLERS, ArgCondition::Operands { min: 1, max: Some(1) }, Continuous)
            .value_flags(&["-d", "-p", "-t", "-P", "-u"]),
        ClassificationRule::always(CONTINUOUS, Continuous),
    ]);

    rules
}

// ════════════════════════════════════════════════════════════════════
// Tokenizing
// ════════════════════════════════════════════════════════════════════

/// Prefixes that run another command: `(wrapper, flags taking a value)`.
const WRAPPERS: &[(&str, &[&str])] = &[
    ("sudo", &["-u", "-g", "-C", "-p", "-r", "-t", "-U", "-D"]),
    ("doas", &["-u", "-C"]),
    ("env", &["-u", "-C", "-S"]),
    ("time", &["-f", "-o"]),
    ("nohup", &[]),
    ("exec", &["-a"]),
    ("command", &[]),
    ("nice", &["-n"]),
    ("stdbuf", &["-i", "-o", "-e"]),
];

/// The head segment of a pipeline/chain: everything before the first
/// unquoted `|`, `&`, `;` or newline.
fn head_segment(input: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (_, '\\') if quote != Some('\'') => escaped = true,
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '|' | '&' | ';' | '\n') => return &input[..idx],
            _ => {}
        }
    }
    input
}

fn tokenize(segment: &str) -> Vec<String> {
    let segment = segment.trim().trim_start_matches(['(', '{']).trim_start();
    match shell_words::split(segment) {
        Ok(tokens) => tokens,
        Err(err) => {
            // Unbalanced quotes: fall back to whitespace and carry on.
            tracing::debug!(%err, segment, "ambiguous command line; splitting on whitespace");
            segment.split_whitespace().map(str::to_string).collect()
        }
    }
}

fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            let mut chars = name.chars();
            chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// Index of the real executable once assignments and wrappers are skipped.
/// When a wrapper has nothing after it, the wrapper itself is the executable.
fn executable_index(tokens: &[String]) -> usize {
    let mut idx = 0;
    while idx < tokens.len() {
        let token = &tokens[idx];
        if is_assignment(token) {
            idx += 1;
            continue;
        }
        let name = normalize_executable(token);
        let Some((_, value_flags)) = WRAPPERS.iter().find(|(w, _)| *w == name) else {
            return idx;
        };

        let mut next = idx + 1;
        while next < tokens.len() && tokens[next].starts_with('-') {
            if value_flags.contains(&tokens[next].as_str()) {
                next += 1;
            }
            next += 1;
        }
        while next < tokens.len() && name == "env" && is_assignment(&tokens[next]) {
            next += 1;
        }
        if next >= tokens.len() {
            return idx;
        }
        idx = next;
    }
    tokens.len().saturating_sub(1)
}

fn normalize_executable(token: &str) -> String {
    let base = token.rsplit(['/', '\\']).next().unwrap_or(token);
    let lower = base.to_ascii_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

// ════════════════════════════════════════════════════════════════════
// Classifier
// ════════════════════════════════════════════════════════════════════

/// Pure command classifier. Cheap to call; holds only its rule table.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<ClassificationRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl Classifier {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// Built-in table with user overrides evaluated first.
    pub fn with_overrides(overrides: &ClassifierOverrides) -> Self {
        let mut rules = Vec::new();
        let groups = [
            (&overrides.fullscreen, Outcome::Fullscreen),
            (&overrides.interactive, Outcome::Interactive),
            (&overrides.continuous, Outcome::Continuous),
            (&overrides.one_shot, Outcome::OneShot),
        ];
        for (names, outcome) in groups {
            if names.is_empty() {
                continue;
            }
            rules.push(ClassificationRule {
                executables: names.iter().map(|n| normalize_executable(n)).collect(),
                subcommand: None,
                condition: ArgCondition::Always,
                value_flags: Vec::new(),
                outcome,
            });
        }
        rules.extend(default_rules());
        Self::new(rules)
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn classify(&self, command: &str) -> CommandProfile {
        let tokens = tokenize(head_segment(command.trim_start()));
        if tokens.is_empty() {
            return CommandProfile::one_shot(String::new());
        }

        let idx = executable_index(&tokens);
        let executable = normalize_executable(&tokens[idx]);
        let args = &tokens[idx + 1..];

        match self.rules.iter().find(|rule| rule.matches(&executable, args)) {
            Some(rule) => rule.outcome.profile(executable),
            // Unknown programs fail open: treat as a quick one-shot.
            None => CommandProfile::one_shot(executable),
        }
    }
}
