// blockterm-core/src/bin/session_probe.rs

use anyhow::{Context, Result};
use blockterm_core::{
    BlockField, BlockId, BlockStatus, InputEvent, PtyConnector, SessionConfig, SessionEngine, SessionEvent,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    // RUST_LOG=blockterm_core=debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

const HELP: &str = "\
commands are run as blocks; meta commands:
  :cancel      interrupt the focused block (or close the fullscreen view)
  :focus N     focus block #N
  :blocks      list blocks
  :clear       drop all blocks
  :close-fs    close the fullscreen view
  :quit        close the session and exit";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = SessionConfig::load_or_default().context("Failed to load config")?;
    let engine = SessionEngine::start(&PtyConnector, config)
        .await
        .context("SessionEngine::start failed")?;
    eprintln!("[session_probe] started ({HELP})");

    // Task: print block output as blocks finish; fullscreen bytes go straight to stdout.
    let mut events = engine.subscribe().await;
    let session = engine.session.clone();
    tokio::spawn(async move {
        let mut out = tokio::io::stdout();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    eprintln!("[session_probe] dropped {n} events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match event {
                SessionEvent::FullscreenOutput(bytes) => {
                    let _ = out.write_all(&bytes).await;
                    let _ = out.flush().await;
                }
                SessionEvent::BlockChanged { id, field: BlockField::Status } | SessionEvent::BlockAdded(id) => {
                    let finished = {
                        let s = session.lock().await;
                        s.block(id).filter(|b| b.is_terminal()).map(|block| {
                            let header = format!("[{} {} {}]", block.id, block.command, block.status());
                            let text = block.summary.clone().unwrap_or_else(|| block.output_text());
                            (header, text)
                        })
                    };
                    if let Some((header, text)) = finished {
                        eprintln!("{header}");
                        let _ = out.write_all(text.as_bytes()).await;
                        let _ = out.flush().await;
                    }
                }
                SessionEvent::Bell => eprint!("\x07"),
                SessionEvent::CwdChanged(cwd) => eprintln!("[cwd] {cwd}"),
                SessionEvent::ConnectionError(e) => eprintln!("[connection error] {e}"),
                SessionEvent::Closed => {
                    eprintln!("[session_probe] session closed");
                    break;
                }
                _ => {}
            }
        }
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if let Err(e) = engine.cancel_focused().await {
                    eprintln!("[session_probe] {e}");
                }
            }

            line = lines.next_line() => {
                let Some(line) = line.context("stdin read failed")? else {
                    eprintln!("\n[session_probe] stdin closed, exiting…");
                    break;
                };

                let trimmed = line.trim();
                let result = match trimmed {
                    ":quit" => break,
                    ":cancel" => engine.cancel_focused().await.map(|_| ()),
                    ":close-fs" => engine.close_fullscreen().await.map(|_| ()),
                    ":clear" => engine.clear_all().await,
                    ":blocks" => {
                        for b in engine.snapshot().await {
                            let focus = if engine.focused().await == Some(b.id) { "*" } else { " " };
                            eprintln!("{focus}{} {:<11} {:?} {}", b.id, b.status, b.classification, b.command);
                        }
                        Ok(())
                    }
                    _ if trimmed.starts_with(":focus") => {
                        match trimmed[":focus".len()..].trim().trim_start_matches('#').parse::<u64>() {
                            Ok(n) => engine.request_focus(BlockId(n)).await,
                            Err(_) => {
                                eprintln!("usage: :focus N");
                                Ok(())
                            }
                        }
                    }
                    _ => engine.handle_input(InputEvent::Line(line)).await.map(|_| ()),
                };

                if let Err(e) = result {
                    eprintln!("[session_probe] {e}");
                }
                if engine.is_closed().await {
                    break;
                }
            }
        }
    }

    let blocks = engine.close().await;
    let failed = blocks.iter().filter(|b| b.status() == BlockStatus::Failed).count();
    eprintln!("[session_probe] {} blocks, {} failed", blocks.len(), failed);
    Ok(())
}
