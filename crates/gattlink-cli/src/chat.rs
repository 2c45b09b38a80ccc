//! 交互式聊天：stdin 每行作为一条消息发送，收到的通知实时输出

use crate::events;
use anyhow::Result;
use gattlink_core::{ScanError, Session, SessionEvent, State};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;

/// 去掉首尾空白；空行不发送
fn outgoing(line: &str) -> Option<&str> {
    let text = line.trim();
    (!text.is_empty()).then_some(text)
}

/// 运行到 EOF、Ctrl-C 或会话结束，返回是否曾经连接成功
pub async fn run(session: &Session, json: bool) -> Result<bool> {
    let mut events = session.connect().await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut connected = false;
    let mut scan_error: Option<ScanError> = None;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    events::print(&event, json);
                    match event {
                        SessionEvent::Ready => connected = true,
                        SessionEvent::ScanFailed(e) => scan_error = Some(e),
                        _ => {}
                    }
                }
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    let Some(text) = outgoing(&line) else {
                        continue;
                    };
                    if let Err(e) = session.send_message(text) {
                        eprintln!("⚠️  {}", e);
                    }
                }
                None => {
                    tracing::debug!("stdin closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::debug!("Interrupted");
                break;
            }
        }
    }

    // 断开期间继续输出事件，避免事件通道写满
    tokio::join!(session.disconnect(), events::drain(&mut events, json));

    if let Some(e) = scan_error {
        return Err(e.into());
    }
    if let State::Failed(reason) = session.state() {
        return Err(reason.into());
    }
    Ok(connected)
}
