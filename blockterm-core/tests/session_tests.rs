use blockterm_core::{
    BlockField, BlockId, BlockOrigin, BlockStatus, Classification, ConnectionEvent, InputEvent, InputRoute,
    ScriptHandle, ScriptedConnection, Session, SessionConfig, SessionError, SessionEvent, SessionKind,
};
use tokio::sync::broadcast;

const PROMPT: &[u8] = b"\x1b]133;A\x07$ ";

fn session_with(config: SessionConfig) -> (Session, ScriptHandle) {
    let (conn, handle, _events) = ScriptedConnection::new(SessionKind::Local);
    (Session::new(config, Box::new(conn)), handle)
}

/// A session whose shell has already printed its first prompt.
fn session() -> (Session, ScriptHandle) {
    let (mut s, h) = session_with(SessionConfig::default());
    feed(&mut s, PROMPT);
    (s, h)
}

fn feed(s: &mut Session, bytes: &[u8]) {
    s.handle_connection_event(ConnectionEvent::Output(bytes.to_vec()));
}

/// Command-finished with `code`, then the next prompt.
fn finish(s: &mut Session, code: i32) {
    feed(s, format!("\x1b]133;D;{code}\x07\x1b]133;A\x07$ ").as_bytes());
}

fn status(s: &Session, id: BlockId) -> BlockStatus {
    s.block(id).expect("block exists").status()
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

fn live_blocks(s: &Session) -> usize {
    s.blocks().iter().filter(|b| !b.is_terminal()).count()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_new_session_is_empty() {
    let (s, h) = session();
    assert!(!s.is_closed());
    assert!(s.blocks().is_empty());
    assert_eq!(s.focused(), None);
    assert_eq!(s.kind(), SessionKind::Local);
    assert_eq!(s.route(), InputRoute::NewCommand);
    assert_eq!(s.size(), (120, 30));
    assert!(h.written().is_empty());
}

#[test]
fn test_remote_kind_is_reported() {
    let (conn, _h, _rx) = ScriptedConnection::new(SessionKind::Remote);
    let s = Session::new(SessionConfig::default(), Box::new(conn));
    assert_eq!(s.kind(), SessionKind::Remote);
}

#[test]
fn test_one_shot_command_lifecycle() {
    let (mut s, h) = session();
    let mut rx = s.subscribe();

    let id = s.submit("ls").unwrap();
    assert_eq!(status(&s, id), BlockStatus::Running);
    assert_eq!(h.written_text(), "ls\n");
    assert_eq!(s.active_block(), Some(id));
    // one-shot blocks never take focus
    assert_eq!(s.focused(), None);

    feed(&mut s, b"ls\r\nCargo.toml\r\nsrc\r\n");
    finish(&mut s, 0);

    let block = s.block(id).unwrap();
    assert_eq!(block.status(), BlockStatus::Completed);
    assert_eq!(block.exit_code(), Some(0));
    assert_eq!(block.output_text(), "Cargo.toml\nsrc\n");
    assert!(block.completed_at().is_some());
    assert!(block.duration().is_some());
    assert_eq!(s.active_block(), None);

    let events = drain(&mut rx);
    assert_eq!(events.first(), Some(&SessionEvent::BlockAdded(id)));
    assert!(events.contains(&SessionEvent::BlockChanged { id, field: BlockField::Output }));
    assert!(events.contains(&SessionEvent::BlockChanged { id, field: BlockField::ExitCode }));
}

#[test]
fn test_nonzero_exit_fails_block() {
    let (mut s, _h) = session();
    let id = s.submit("cat missing").unwrap();
    feed(&mut s, b"cat missing\r\ncat: missing: No such file or directory\r\n");
    finish(&mut s, 1);

    let block = s.block(id).unwrap();
    assert_eq!(block.status(), BlockStatus::Failed);
    assert_eq!(block.exit_code(), Some(1));
    assert!(block.output_text().contains("No such file"));
}

#[test]
fn test_prompt_marker_alone_completes_block() {
    let (mut s, _h) = session();
    let id = s.submit("pwd").unwrap();
    feed(&mut s, b"pwd\r\n/home/me\r\n\x1b]133;A\x07$ ");
    assert_eq!(status(&s, id), BlockStatus::Completed);
    assert_eq!(s.block(id).unwrap().exit_code(), None);
}

#[test]
fn test_first_prompt_does_not_complete_a_block() {
    let (mut s, _h) = session_with(SessionConfig::default());
    let id = s.submit("ls").unwrap();
    // the prompt hook reports a status before the shell's first prompt
    feed(&mut s, b"\x1b]133;D;0\x07\x1b]133;A\x07$ ");
    assert_eq!(status(&s, id), BlockStatus::Running);
    feed(&mut s, b"ls\r\nfile\r\n");
    finish(&mut s, 0);
    assert_eq!(status(&s, id), BlockStatus::Completed);
    assert_eq!(s.block(id).unwrap().exit_code(), Some(0));
    assert_eq!(s.block(id).unwrap().output_text(), "file\n");
}

#[test]
fn test_output_before_first_prompt_is_dropped() {
    let (mut s, _h) = session_with(SessionConfig::default());
    let id = s.submit("ls").unwrap();
    feed(&mut s, b"Last login: Mon Oct 19\r\n");
    feed(&mut s, b"\x1b]133;D;0\x07\x1b]133;A\x07me@host:~$ ls\r\nfile\r\n");
    finish(&mut s, 0);
    assert_eq!(status(&s, id), BlockStatus::Completed);
    assert_eq!(s.block(id).unwrap().output_text(), "file\n");
}

#[test]
fn test_finished_marker_after_first_prompt_completes() {
    let (mut s, _h) = session_with(SessionConfig::default());
    feed(&mut s, b"\x1b]133;D;0\x07\x1b]133;A\x07$ ");
    let id = s.submit("false").unwrap();
    feed(&mut s, b"false\r\n");
    finish(&mut s, 1);
    assert_eq!(status(&s, id), BlockStatus::Failed);
    assert_eq!(s.block(id).unwrap().exit_code(), Some(1));
}

#[test]
fn test_markers_split_across_chunks() {
    let (mut s, _h) = session();
    let id = s.submit("echo hi").unwrap();
    feed(&mut s, b"echo hi\r\nhi\r\n\x1b]13");
    assert_eq!(status(&s, id), BlockStatus::Running);
    feed(&mut s, b"3;D;0\x07\x1b]133;A\x07$ ");
    assert_eq!(status(&s, id), BlockStatus::Completed);
    assert_eq!(s.block(id).unwrap().output_text(), "hi\n");
}

#[test]
fn test_ids_are_monotonic_and_ordered() {
    let (mut s, _h) = session();
    let mut ids = Vec::new();
    for cmd in ["ls", "pwd", "whoami"] {
        let id = s.submit(cmd).unwrap();
        finish(&mut s, 0);
        ids.push(id);
    }
    assert_eq!(ids, vec![BlockId(0), BlockId(1), BlockId(2)]);
    let listed: Vec<BlockId> = s.blocks().iter().map(|b| b.id).collect();
    assert_eq!(listed, ids);
}

#[test]
fn test_submit_while_block_in_flight_is_rejected() {
    let (mut s, h) = session();
    s.submit("sleep 10").unwrap();
    let err = s.submit("ls").unwrap_err();
    assert!(matches!(err, SessionError::BlockInFlight));
    assert_eq!(s.blocks().len(), 1);
    assert_eq!(h.written_text(), "sleep 10\n");
}

#[test]
fn test_blank_command_is_one_shot() {
    let (mut s, _h) = session();
    let id = s.submit("").unwrap();
    let block = s.block(id).unwrap();
    assert_eq!(block.classification, Classification::OneShot);
    assert!(!block.fullscreen_required);
}

// ============================================================================
// Output isolation
// ============================================================================

#[test]
fn test_output_does_not_bleed_between_blocks() {
    let (mut s, _h) = session();
    let first = s.submit("echo one").unwrap();
    feed(&mut s, b"echo one\r\none\r\n");
    finish(&mut s, 0);

    // stray output between commands belongs to nobody
    feed(&mut s, b"late noise\r\n");

    let second = s.submit("echo two").unwrap();
    feed(&mut s, b"echo two\r\ntwo\r\n");
    finish(&mut s, 0);

    assert_eq!(s.block(first).unwrap().output_text(), "one\n");
    assert_eq!(s.block(second).unwrap().output_text(), "two\n");
}

#[test]
fn test_completed_block_is_frozen() {
    let (mut s, _h) = session();
    let id = s.submit("ls").unwrap();
    feed(&mut s, b"ls\r\na\r\n");
    finish(&mut s, 0);

    let before = s.block(id).unwrap().snapshot();
    feed(&mut s, b"more output\r\n");
    finish(&mut s, 3);
    let after = s.block(id).unwrap().snapshot();
    assert_eq!(before, after);
}

#[test]
fn test_escape_sequences_are_filtered_from_blocks() {
    let (mut s, _h) = session();
    let id = s.submit("ls --color").unwrap();
    feed(&mut s, b"ls --color\r\n\x1b[2K\x1b[1;34msrc\x1b[0m\r\n\x1b[?25l");
    finish(&mut s, 0);
    assert_eq!(s.block(id).unwrap().output_text(), "\x1b[1;34msrc\x1b[0m\n");
}

#[test]
fn test_bell_is_reported() {
    let (mut s, _h) = session();
    let mut rx = s.subscribe();
    s.submit("printf '\\a'").unwrap();
    feed(&mut s, b"\x07");
    assert!(drain(&mut rx).contains(&SessionEvent::Bell));
}

#[test]
fn test_cwd_tracking() {
    let (mut s, _h) = session();
    let mut rx = s.subscribe();
    feed(&mut s, b"\x1b]7;file://host/home/me/project\x07");
    assert_eq!(s.cwd(), Some("/home/me/project"));
    assert!(drain(&mut rx).contains(&SessionEvent::CwdChanged("/home/me/project".to_string())));

    let id = s.submit("ls").unwrap();
    assert_eq!(s.block(id).unwrap().cwd.as_deref(), Some("/home/me/project"));
}

#[test]
fn test_latin1_encoding() {
    let config = SessionConfig { encoding: "latin1".to_string(), ..Default::default() };
    let (mut s, _h) = session_with(config);
    feed(&mut s, PROMPT);
    let id = s.submit("cat old.txt").unwrap();
    feed(&mut s, b"cat old.txt\r\ncaf\xe9\r\n");
    finish(&mut s, 0);
    assert_eq!(s.block(id).unwrap().output_text(), "caf\u{e9}\n");
}

// ============================================================================
// Prompt detection without markers
// ============================================================================

#[test]
fn test_prompt_pattern_completes_block() {
    let config = SessionConfig { prompt_pattern: Some(r"\$ $".to_string()), ..Default::default() };
    let (mut s, _h) = session_with(config);
    let id = s.submit("ls").unwrap();
    feed(&mut s, b"ls\r\nfile\r\n");
    assert_eq!(status(&s, id), BlockStatus::Running);
    feed(&mut s, b"user@host:~$ ");
    assert_eq!(status(&s, id), BlockStatus::Completed);
}

#[test]
fn test_invalid_prompt_pattern_falls_back_to_default() {
    let config = SessionConfig { prompt_pattern: Some("([unclosed".to_string()), ..Default::default() };
    let (mut s, _h) = session_with(config);
    let id = s.submit("ls").unwrap();
    feed(&mut s, b"ls\r\nfile\r\nready> ");
    assert_eq!(status(&s, id), BlockStatus::Running);
    feed(&mut s, b"\r\nuser@host:~$ ");
    assert_eq!(status(&s, id), BlockStatus::Completed);
}

#[test]
fn test_unmarked_shell_prompt_completes_block() {
    let (mut s, _h) = session_with(SessionConfig::default());
    let id = s.submit("ls").unwrap();
    feed(&mut s, b"ls\r\nfile\r\nme@host:~$ ");
    assert_eq!(status(&s, id), BlockStatus::Completed);
    assert_eq!(s.block(id).unwrap().output_text(), "file\n");

    let next = s.submit("pwd").unwrap();
    feed(&mut s, b"pwd\r\n/home/me\r\n[me@host ~]# ");
    assert_eq!(status(&s, next), BlockStatus::Completed);
    assert_eq!(s.block(next).unwrap().output_text(), "/home/me\n");
}

#[test]
fn test_unmarked_output_that_is_not_a_prompt_keeps_running() {
    let (mut s, _h) = session_with(SessionConfig::default());
    let id = s.submit("make").unwrap();
    feed(&mut s, b"make\r\nbuilding 50%");
    assert_eq!(status(&s, id), BlockStatus::Running);
    feed(&mut s, b"\r\ncost: $ 3");
    assert_eq!(status(&s, id), BlockStatus::Running);
}

#[test]
fn test_markers_switch_off_the_prompt_heuristic() {
    let (mut s, _h) = session();
    let id = s.submit("ls").unwrap();
    feed(&mut s, b"ls\r\nme@host:~$ \r\n");
    feed(&mut s, b"me@host:~$ ");
    assert_eq!(status(&s, id), BlockStatus::Running);
}

#[test]
fn test_repl_prompt_marks_block_interactive() {
    let (mut s, _h) = session();
    let id = s.submit("python3").unwrap();
    assert_eq!(s.block(id).unwrap().classification, Classification::Interactive);
    assert_eq!(status(&s, id), BlockStatus::Running);

    feed(&mut s, b"python3\r\nPython 3.12.1\r\n>>> ");
    assert_eq!(status(&s, id), BlockStatus::Interactive);
    assert_eq!(s.focused(), Some(id));
}

// ============================================================================
// Input
// ============================================================================

#[test]
fn test_raw_input_goes_to_focused_block() {
    let (mut s, h) = session();
    let id = s.submit("top").unwrap();
    assert_eq!(s.focused(), Some(id));

    s.send_raw_input(b"q").unwrap();
    assert_eq!(h.log().writes.last().map(Vec::as_slice), Some(&b"q"[..]));
    assert_eq!(status(&s, id), BlockStatus::Interactive);
}

#[test]
fn test_raw_input_without_focus_is_rejected() {
    let (mut s, h) = session();
    assert!(matches!(s.send_raw_input(b"x"), Err(SessionError::NoFocusTarget)));

    s.submit("sleep 5").unwrap();
    assert!(matches!(s.send_raw_input(b"x"), Err(SessionError::NoFocusTarget)));
    assert_eq!(h.written_text(), "sleep 5\n");
}

#[test]
fn test_handle_input_routes_lines() {
    let (mut s, h) = session();

    let id = s.handle_input(InputEvent::Line("tail -f app.log".to_string())).unwrap();
    let id = id.expect("new block");
    assert_eq!(s.focused(), Some(id));

    // focused: the line is typed into the program
    assert_eq!(s.handle_input(InputEvent::Line("hello".to_string())).unwrap(), None);
    assert!(h.written_text().ends_with("hello\n"));
    assert_eq!(s.blocks().len(), 1);

    // unfocused live block: new commands are refused
    s.clear_focus();
    assert_eq!(s.route(), InputRoute::Blocked(id));
    assert!(matches!(
        s.handle_input(InputEvent::Line("ls".to_string())),
        Err(SessionError::BlockInFlight)
    ));
}

#[test]
fn test_write_failure_fails_block() {
    let (mut s, h) = session();
    let mut rx = s.subscribe();
    h.fail_writes(true);

    let id = s.submit("ls").unwrap();
    assert_eq!(status(&s, id), BlockStatus::Failed);
    assert!(!s.is_closed());
    assert!(drain(&mut rx).iter().any(|e| matches!(e, SessionEvent::ConnectionError(_))));

    h.fail_writes(false);
    let next = s.submit("ls").unwrap();
    assert_eq!(status(&s, next), BlockStatus::Running);
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_cancel_focused_interrupts_and_cancels() {
    let (mut s, h) = session();
    let id = s.submit("ping host").unwrap();
    feed(&mut s, b"ping host\r\nPING host (10.0.0.1)\r\n");

    assert_eq!(s.cancel_focused().unwrap(), id);
    assert_eq!(status(&s, id), BlockStatus::Cancelled);
    assert_eq!(h.log().interrupts, 1);
    assert_eq!(h.written().last(), Some(&0x03));
    assert_eq!(s.focused(), None);
    assert_eq!(s.active_block(), None);
}

#[test]
fn test_cancel_focused_without_focus() {
    let (mut s, _h) = session();
    assert!(matches!(s.cancel_focused(), Err(SessionError::NoFocusTarget)));
}

#[test]
fn test_cancel_unknown_block() {
    let (mut s, _h) = session();
    assert!(matches!(s.cancel(BlockId(99)), Err(SessionError::UnknownBlock(BlockId(99)))));
}

#[test]
fn test_cancel_terminal_block_is_a_no_op() {
    let (mut s, h) = session();
    let id = s.submit("ls").unwrap();
    finish(&mut s, 0);
    let before = s.block(id).unwrap().snapshot();

    assert!(!s.cancel(id).unwrap());
    assert_eq!(s.block(id).unwrap().snapshot(), before);
    assert_eq!(h.log().interrupts, 0);
}

#[test]
fn test_output_after_cancel_is_discarded_until_prompt() {
    let (mut s, _h) = session();
    let ping = s.submit("ping host").unwrap();
    feed(&mut s, b"ping host\r\n64 bytes\r\n");
    s.cancel_focused().unwrap();
    let frozen = s.block(ping).unwrap().output_text();

    feed(&mut s, b"64 bytes\r\n^C\r\n--- host ping statistics ---\r\n");
    feed(&mut s, b"\x1b]133;D;130\x07\x1b]133;A\x07$ ");
    assert_eq!(s.block(ping).unwrap().output_text(), frozen);
    assert_eq!(status(&s, ping), BlockStatus::Cancelled);

    let next = s.submit("echo ok").unwrap();
    feed(&mut s, b"echo ok\r\nok\r\n");
    finish(&mut s, 0);
    assert_eq!(s.block(next).unwrap().output_text(), "ok\n");
    assert_eq!(status(&s, next), BlockStatus::Completed);
}

#[test]
fn test_cancelled_block_accepts_new_submission() {
    let (mut s, _h) = session();
    let id = s.submit("sleep 100").unwrap();
    assert!(s.cancel(id).unwrap());
    assert!(s.submit("ls").is_ok());
}

// ============================================================================
// Resize, clear, close
// ============================================================================

#[test]
fn test_resize_forwards_to_connection() {
    let (mut s, h) = session();
    s.resize(100, 40).unwrap();
    assert_eq!(h.log().resizes, vec![(100, 40)]);
    assert_eq!(s.size(), (100, 40));
}

#[test]
fn test_resize_after_close_is_a_no_op() {
    let (mut s, h) = session();
    s.close();
    s.resize(80, 24).unwrap();
    assert!(h.log().resizes.is_empty());
}

#[test]
fn test_clear_all_keeps_connection_and_ids() {
    let (mut s, h) = session();
    let mut rx = s.subscribe();
    s.submit("ls").unwrap();
    finish(&mut s, 0);
    let live = s.submit("tail -f x").unwrap();

    s.clear_all().unwrap();
    assert!(s.blocks().is_empty());
    assert_eq!(s.focused(), None);
    assert!(!s.is_closed());
    assert!(!h.is_closed());
    assert_eq!(h.log().interrupts, 1);
    assert!(drain(&mut rx).contains(&SessionEvent::Cleared));

    let next = s.submit("pwd").unwrap();
    assert!(next > live);
}

#[test]
fn test_close_releases_blocks_and_connection() {
    let (mut s, h) = session();
    let mut rx = s.subscribe();
    let done = s.submit("ls").unwrap();
    finish(&mut s, 0);
    let live = s.submit("top").unwrap();

    let blocks = s.close();
    assert!(s.is_closed());
    assert!(h.is_closed());
    assert!(s.blocks().is_empty());
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].id, done);
    assert_eq!(blocks[0].status(), BlockStatus::Completed);
    assert_eq!(blocks[1].id, live);
    assert_eq!(blocks[1].status(), BlockStatus::Cancelled);
    assert_eq!(s.focused(), None);
    assert_eq!(drain(&mut rx).last(), Some(&SessionEvent::Closed));
}

#[test]
fn test_operations_after_close() {
    let (mut s, _h) = session();
    s.close();
    assert!(matches!(s.submit("ls"), Err(SessionError::SessionClosed)));
    assert!(matches!(s.send_raw_input(b"x"), Err(SessionError::SessionClosed)));
    assert!(matches!(s.clear_all(), Err(SessionError::SessionClosed)));
    assert!(matches!(s.request_focus(BlockId(0)), Err(SessionError::SessionClosed)));
    // closing twice is harmless
    assert!(s.close().is_empty());
}

// ============================================================================
// Connection events
// ============================================================================

#[test]
fn test_connection_exit_completes_active_block_and_closes() {
    let (mut s, _h) = session();
    let mut rx = s.subscribe();
    let id = s.submit("exit 2").unwrap();
    s.handle_connection_event(ConnectionEvent::Exited { code: Some(2) });

    assert!(s.is_closed());
    assert_eq!(status(&s, id), BlockStatus::Failed);
    assert_eq!(s.block(id).unwrap().exit_code(), Some(2));
    assert_eq!(drain(&mut rx).last(), Some(&SessionEvent::Closed));
    assert!(matches!(s.submit("ls"), Err(SessionError::SessionClosed)));
}

#[test]
fn test_connection_error_fails_active_block() {
    let (mut s, _h) = session();
    let mut rx = s.subscribe();
    let id = s.submit("ls").unwrap();
    s.handle_connection_event(ConnectionEvent::Error("read failed".to_string()));

    assert_eq!(status(&s, id), BlockStatus::Failed);
    // the connection itself is still up
    assert!(!s.is_closed());
    assert!(drain(&mut rx).contains(&SessionEvent::ConnectionError("read failed".to_string())));
}

#[test]
fn test_connection_lost_closes_session() {
    let (mut s, h) = session();
    let id = s.submit("sleep 5").unwrap();
    h.disconnect();
    s.connection_lost();

    assert!(s.is_closed());
    assert_eq!(status(&s, id), BlockStatus::Failed);
    assert_eq!(live_blocks(&s), 0);
}

#[test]
fn test_submit_on_dead_connection() {
    let (mut s, h) = session();
    h.disconnect();
    assert!(matches!(s.submit("ls"), Err(SessionError::SessionClosed)));
    assert!(s.blocks().is_empty());
}

#[test]
fn test_events_after_close_are_ignored() {
    let (mut s, _h) = session();
    let id = s.submit("ls").unwrap();
    let blocks = s.close();
    feed(&mut s, b"late\r\n");
    assert!(s.is_closed());
    assert_eq!(blocks[0].id, id);
    assert_eq!(blocks[0].output_text(), "");
}

// ============================================================================
// Snapshots
// ============================================================================

#[test]
fn test_snapshot_serializes() {
    let (mut s, _h) = session();
    let id = s.submit("ls").unwrap();
    feed(&mut s, b"ls\r\nREADME.md\r\n");
    finish(&mut s, 0);

    let snap = s.snapshot();
    assert_eq!(snap.len(), 1);
    assert_eq!(snap[0].id, id);
    assert_eq!(snap[0].status, BlockStatus::Completed);
    assert_eq!(snap[0].origin, BlockOrigin::Command);

    let json = serde_json::to_value(&snap[0]).unwrap();
    assert_eq!(json["id"], 0);
    assert_eq!(json["command"], "ls");
    assert_eq!(json["exit_code"], 0);
    assert_eq!(json["accepts_input"], false);
}

// ============================================================================
// The walkthrough: ls, top, ping, vi
// ============================================================================

#[test]
fn test_end_to_end_walkthrough() {
    let (mut s, h) = session();
    let mut rx = s.subscribe();

    // ls: one-shot, never focused
    let ls = s.submit("ls").unwrap();
    assert_eq!(s.focused(), None);
    feed(&mut s, b"ls\r\nCargo.toml\r\nsrc\r\n");
    finish(&mut s, 0);
    assert_eq!(status(&s, ls), BlockStatus::Completed);
    assert_eq!(s.block(ls).unwrap().output_text(), "Cargo.toml\nsrc\n");

    // top: continuous, auto-focused, keystrokes reach it, quits with q
    let top = s.submit("top").unwrap();
    assert_eq!(s.block(top).unwrap().classification, Classification::Continuous);
    assert_eq!(s.focused(), Some(top));
    s.send_raw_input(b"q").unwrap();
    finish(&mut s, 0);
    assert_eq!(status(&s, top), BlockStatus::Completed);
    assert_eq!(s.focused(), None);

    // ping: continuous, cancelled by the user
    let ping = s.submit("ping host").unwrap();
    assert_eq!(s.focused(), Some(ping));
    feed(&mut s, b"ping host\r\n64 bytes from host\r\n");
    assert_eq!(s.cancel_focused().unwrap(), ping);
    assert_eq!(status(&s, ping), BlockStatus::Cancelled);
    feed(&mut s, b"^C\r\n\x1b]133;D;130\x07\x1b]133;A\x07$ ");

    // vi: fullscreen hand-off, then a summary block
    let vi = s.submit("vi f.txt").unwrap();
    assert!(s.handoff().is_some());
    assert_eq!(s.route(), InputRoute::Fullscreen);
    feed(&mut s, b"\x1b[?1049h\x1b[H~\r\n~\r\n");
    s.send_raw_input(b":wq\r").unwrap();
    feed(&mut s, b"\x1b[?1049l\x1b]133;D;0\x07\x1b]133;A\x07$ ");

    assert!(s.handoff().is_none());
    assert_eq!(s.route(), InputRoute::NewCommand);
    assert_eq!(status(&s, vi), BlockStatus::Completed);
    let summary = s.blocks().last().unwrap();
    assert_eq!(summary.origin, BlockOrigin::FullscreenSummary);
    assert_eq!(summary.status(), BlockStatus::Completed);
    assert_eq!(summary.exit_code(), Some(0));
    assert_eq!(summary.summary.as_deref(), Some("vi f.txt exited with code 0"));

    assert!(h.written_text().contains("vi f.txt\n:wq\r"));
    assert_eq!(live_blocks(&s), 0);

    let events = drain(&mut rx);
    assert!(events.contains(&SessionEvent::FocusChanged(Some(top))));
    assert!(events.contains(&SessionEvent::FocusChanged(Some(ping))));
    assert!(events.contains(&SessionEvent::FullscreenStarted { block: vi, command: "vi f.txt".to_string() }));
    assert!(events.contains(&SessionEvent::FullscreenEnded { block: vi, exit_code: Some(0), graceful: true }));
    assert!(events.iter().any(|e| matches!(e, SessionEvent::FullscreenOutput(_))));
}
