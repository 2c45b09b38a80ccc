//! Message Channel - 文本消息与 GATT 负载之间的转换
//!
//! - 出站：文本按 UTF-8 编码后进入会话的写入队列，立即返回
//! - 入站：通知负载按 UTF-8 解码（非法序列替换为 U+FFFD），追加到消息日志
//!
//! 消息日志只允许追加，插入顺序即显示顺序。

use log::debug;

use crate::session::driver::Command;
use crate::session::{SessionError, State};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub direction: Direction,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn inbound(payload: Vec<u8>) -> Self {
        Self {
            direction: Direction::Inbound,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn outbound(payload: Vec<u8>) -> Self {
        Self {
            direction: Direction::Outbound,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// 负载的文本形式
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// 只追加的消息日志，可被观察者并发读取
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    inner: Arc<RwLock<Vec<Message>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, message: Message) {
        self.inner.write().push(message);
    }

    /// 当前日志的拷贝
    pub fn snapshot(&self) -> Vec<Message> {
        self.inner.read().clone()
    }

    /// 从 `index` 开始的新消息，用于增量刷新
    pub fn since(&self, index: usize) -> Vec<Message> {
        let log = self.inner.read();
        log.get(index..).map(<[Message]>::to_vec).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn last(&self) -> Option<Message> {
        self.inner.read().last().cloned()
    }
}

/// 会话的消息通道
#[derive(Clone)]
pub struct MessageChannel {
    log: MessageLog,
    /// 弱引用：会话句柄被丢弃后驱动任务的命令队列随之关闭
    commands: mpsc::WeakUnboundedSender<Command>,
    state: watch::Receiver<State>,
}

impl MessageChannel {
    pub(crate) fn new(
        log: MessageLog,
        commands: mpsc::WeakUnboundedSender<Command>,
        state: watch::Receiver<State>,
    ) -> Self {
        Self {
            log,
            commands,
            state,
        }
    }

    pub fn encode(text: &str) -> Vec<u8> {
        text.as_bytes().to_vec()
    }

    /// 将文本排入写入队列，不等待写入完成
    ///
    /// 会话不处于 `Ready` 时返回 [`SessionError::NotReady`]，消息不会被静默丢弃。
    pub fn send(&self, text: &str) -> Result<(), SessionError> {
        let state = self.state.borrow().clone();
        if state != State::Ready {
            return Err(SessionError::NotReady(state));
        }
        let commands = self.commands.upgrade().ok_or(SessionError::Closed)?;
        commands
            .send(Command::Send(Self::encode(text)))
            .map_err(|_| SessionError::Closed)
    }

    /// 处理入站通知，空负载视为空消息
    pub fn on_notification(&self, payload: Vec<u8>) -> Message {
        let message = Message::inbound(payload);
        debug!("Received: {}", message.text());
        self.log.append(message.clone());
        message
    }

    /// 记录已确认的出站写入
    pub fn on_write_complete(&self, payload: Vec<u8>) -> Message {
        let message = Message::outbound(payload);
        debug!("Sent: {}", message.text());
        self.log.append(message.clone());
        message
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }
}
