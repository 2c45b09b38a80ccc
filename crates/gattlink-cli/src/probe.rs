//! 固定流程探测：连接 -> 读取 -> 写入 -> 等待一条通知 -> 断开

use crate::events;
use anyhow::{Context, Result, anyhow, bail};
use gattlink_core::{Message, Session, SessionEvent, SessionEvents};
use std::time::Duration;
use tokio_stream::{Stream, StreamExt};

/// 写入之后等待回复的时间
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(session: &Session, message: &str) -> Result<()> {
    let mut events = session.connect().await?;

    let result = match wait_ready(&mut events).await {
        Ok(()) => exchange(session, &mut events, message).await,
        Err(e) => Err(e),
    };

    tokio::join!(session.disconnect(), events::drain(&mut events, false));
    result
}

async fn wait_ready(events: &mut SessionEvents) -> Result<()> {
    while let Some(event) = events.next().await {
        events::print(&event, false);
        match event {
            SessionEvent::Ready => return Ok(()),
            SessionEvent::ScanFailed(e) => return Err(e.into()),
            SessionEvent::Failed(reason) => return Err(reason.into()),
            _ => {}
        }
    }
    bail!("Session ended before it was ready")
}

async fn exchange(session: &Session, events: &mut SessionEvents, message: &str) -> Result<()> {
    let value = session.read().await?;
    println!("📖 读取: {}", String::from_utf8_lossy(&value));

    session.send_message(message)?;
    let reply = tokio::time::timeout(REPLY_TIMEOUT, next_reply(events))
        .await
        .with_context(|| format!("No notification within {}s", REPLY_TIMEOUT.as_secs()))??;
    println!("📨 回复: {}", reply.text());
    Ok(())
}

/// 等待写入确认后的第一条通知；确认之前到达的通知只打印不作为回复
async fn next_reply<S>(events: &mut S) -> Result<Message>
where
    S: Stream<Item = SessionEvent> + Unpin,
{
    let mut acknowledged = false;
    while let Some(event) = events.next().await {
        events::print(&event, false);
        match event {
            SessionEvent::MessageSent(_) => acknowledged = true,
            SessionEvent::MessageReceived(message) if acknowledged => return Ok(message),
            SessionEvent::WriteFailed { reason, .. } => bail!("Write failed: {}", reason),
            SessionEvent::Failed(reason) => return Err(reason.into()),
            _ => {}
        }
    }
    Err(anyhow!("Session ended while waiting for a notification"))
}
