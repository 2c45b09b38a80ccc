//! 会话事件的终端输出（纯文本或 JSON 行）

use gattlink_core::{Message, SessionEvent, SessionEvents};
use serde::Serialize;
use tokio_stream::StreamExt;

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EventRecord {
    Scanning {
        target: String,
    },
    DeviceFound {
        address: String,
        name: Option<String>,
        rssi: Option<i16>,
    },
    ScanFailed {
        error: String,
    },
    Connecting,
    DiscoveringServices,
    Ready,
    MessageReceived {
        text: String,
        timestamp: String,
    },
    MessageSent {
        text: String,
        timestamp: String,
    },
    WriteFailed {
        text: String,
        reason: String,
    },
    Failed {
        reason: String,
    },
    Closed,
}

impl From<&SessionEvent> for EventRecord {
    fn from(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::Scanning { target } => EventRecord::Scanning {
                target: target.to_string(),
            },
            SessionEvent::DeviceFound(candidate) => EventRecord::DeviceFound {
                address: candidate.address.clone(),
                name: candidate.name.clone(),
                rssi: candidate.rssi,
            },
            SessionEvent::ScanFailed(e) => EventRecord::ScanFailed {
                error: e.to_string(),
            },
            SessionEvent::Connecting => EventRecord::Connecting,
            SessionEvent::DiscoveringServices => EventRecord::DiscoveringServices,
            SessionEvent::Ready => EventRecord::Ready,
            SessionEvent::MessageReceived(message) => EventRecord::MessageReceived {
                text: message.text().into_owned(),
                timestamp: message.timestamp.to_rfc3339(),
            },
            SessionEvent::MessageSent(message) => EventRecord::MessageSent {
                text: message.text().into_owned(),
                timestamp: message.timestamp.to_rfc3339(),
            },
            SessionEvent::WriteFailed { payload, reason } => EventRecord::WriteFailed {
                text: String::from_utf8_lossy(payload).into_owned(),
                reason: reason.clone(),
            },
            SessionEvent::Failed(reason) => EventRecord::Failed {
                reason: reason.to_string(),
            },
            SessionEvent::Closed => EventRecord::Closed,
        }
    }
}

pub fn to_json(event: &SessionEvent) -> serde_json::Result<String> {
    serde_json::to_string(&EventRecord::from(event))
}

fn message_line(prefix: &str, message: &Message) -> String {
    format!(
        "[{}] {} {}",
        message.timestamp.format("%H:%M:%S"),
        prefix,
        message.text()
    )
}

pub fn to_line(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Scanning { target } => format!("🔍 扫描 {} ...", target),
        SessionEvent::DeviceFound(candidate) => format!("   发现设备: {}", candidate),
        SessionEvent::ScanFailed(e) => format!("❌ 扫描失败: {}", e),
        SessionEvent::Connecting => "🔗 连接中...".to_string(),
        SessionEvent::DiscoveringServices => "   发现服务...".to_string(),
        SessionEvent::Ready => "✅ 已连接，输入文本回车发送".to_string(),
        SessionEvent::MessageReceived(message) => message_line("<", message),
        SessionEvent::MessageSent(message) => message_line(">", message),
        SessionEvent::WriteFailed { payload, reason } => format!(
            "⚠️  发送失败 ({}): {}",
            reason,
            String::from_utf8_lossy(payload)
        ),
        SessionEvent::Failed(reason) => format!("❌ 会话失败: {}", reason),
        SessionEvent::Closed => "⏹️  已断开".to_string(),
    }
}

pub fn print(event: &SessionEvent, json: bool) {
    if !json {
        println!("{}", to_line(event));
        return;
    }
    match to_json(event) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!("Failed to encode event: {}", e),
    }
}

/// 输出剩余事件直到会话结束
pub async fn drain(events: &mut SessionEvents, json: bool) {
    while let Some(event) = events.next().await {
        print(&event, json);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattlink_core::{FailureReason, Identifier};

    #[test]
    fn test_lifecycle_events_as_json() {
        assert_eq!(to_json(&SessionEvent::Ready).unwrap(), r#"{"event":"ready"}"#);
        assert_eq!(
            to_json(&SessionEvent::Failed(FailureReason::ConnectionLost)).unwrap(),
            r#"{"event":"failed","reason":"Connection lost"}"#
        );

        let scanning = SessionEvent::Scanning {
            target: Identifier::from_short(0xffe0),
        };
        let value: serde_json::Value = serde_json::from_str(&to_json(&scanning).unwrap()).unwrap();
        assert_eq!(value["event"], "scanning");
        assert_eq!(value["target"], "0000ffe0-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_message_events_carry_text() {
        let event = SessionEvent::MessageReceived(Message::inbound(b"hello".to_vec()));
        let value: serde_json::Value = serde_json::from_str(&to_json(&event).unwrap()).unwrap();
        assert_eq!(value["event"], "message_received");
        assert_eq!(value["text"], "hello");
        assert!(value["timestamp"].is_string());

        assert!(to_line(&event).ends_with("< hello"));
    }

    #[test]
    fn test_write_failure_line() {
        let event = SessionEvent::WriteFailed {
            payload: b"lost".to_vec(),
            reason: "session closed".to_string(),
        };
        assert!(to_line(&event).contains("lost"));
        assert!(to_line(&event).contains("session closed"));
    }
}
