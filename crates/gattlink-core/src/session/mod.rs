//! Session Facade - 会话的唯一公共入口
//!
//! 一个 [`Session`] 对应一次从连接到断开的完整生命周期：
//!
//! 1. `Session::create` 创建会话（Idle），启动驱动任务
//! 2. `connect` 扫描广播目标 UUID 的外设并连接，返回事件流
//! 3. `send_message` / `read` 在 Ready 状态下收发数据
//! 4. `disconnect` 在任何状态下都可以调用，释放扫描和连接
//!
//! Closed 和 Failed 是终态，重连需要新建会话。
//!
//! # 示例
//!
//! ```ignore
//! use gattlink_core::{BtleplugTransport, Identifier, Session, SessionConfig, SessionEvent};
//! use tokio_stream::StreamExt;
//!
//! let id = Identifier::parse(&scanned_text)?;
//! let transport = std::sync::Arc::new(BtleplugTransport::new().await?);
//! let session = Session::create(id, transport, SessionConfig::default());
//!
//! let mut events = session.connect().await?;
//! while let Some(event) = events.next().await {
//!     if event == SessionEvent::Ready {
//!         session.send_message("hello")?;
//!     }
//! }
//! ```

pub mod channel;
pub(crate) mod driver;
pub mod machine;

pub use channel::{Direction, Message, MessageChannel, MessageLog};
pub use machine::{ConnectionStateMachine, FailureReason, State};

use crate::ble::{
    BleTransport, Identifier, PeripheralCandidate, ScanCoordinator, ScanError,
};
use crate::config::SessionConfig;
use driver::{Command, Driver};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;

/// 会话事件流
pub type SessionEvents = ReceiverStream<SessionEvent>;

/// 会话生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Scanning { target: Identifier },
    DeviceFound(PeripheralCandidate),
    /// 扫描超时或被取消，会话仍为 Idle
    ScanFailed(ScanError),
    Connecting,
    DiscoveringServices,
    Ready,
    MessageReceived(Message),
    MessageSent(Message),
    /// 写入失败，会话状态不变，可重试
    WriteFailed { payload: Vec<u8>, reason: String },
    Failed(FailureReason),
    Closed,
}

/// 会话错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session is not ready (state: {0})")]
    NotReady(State),

    #[error("Operation not valid in state {0}")]
    InvalidState(State),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Read failed: {0}")]
    Read(String),

    #[error(transparent)]
    Failed(#[from] FailureReason),

    #[error("Session closed")]
    Closed,
}

pub struct Session {
    identifier: Identifier,
    config: SessionConfig,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<State>,
    channel: MessageChannel,
    scanner: Arc<ScanCoordinator>,
}

impl Session {
    /// 创建会话并启动驱动任务，必须在 tokio 运行时中调用
    pub fn create(
        identifier: Identifier,
        transport: Arc<dyn BleTransport>,
        config: SessionConfig,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(State::Idle);
        let scanner = Arc::new(ScanCoordinator::new(transport.clone()));
        let log = MessageLog::new();

        let driver_channel = MessageChannel::new(log.clone(), commands.downgrade(), state.clone());
        let driver = Driver::new(
            transport,
            scanner.clone(),
            config.clone(),
            identifier,
            driver_channel,
            state_tx,
        );
        tokio::spawn(driver.run(commands_rx));

        let channel = MessageChannel::new(log, commands.downgrade(), state.clone());
        Self {
            identifier,
            config,
            commands,
            state,
            channel,
            scanner,
        }
    }

    /// 扫描并连接，返回本次连接尝试的事件流
    ///
    /// 只有 Idle 状态可以连接。扫描失败后事件流结束，会话保持 Idle，可再次调用。
    pub async fn connect(&self) -> Result<SessionEvents, SessionError> {
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (reply, response) = oneshot::channel();

        self.commands
            .send(Command::Connect {
                events: events_tx,
                reply,
            })
            .map_err(|_| SessionError::InvalidState(self.state()))?;

        match response.await {
            Ok(result) => result.map(|()| ReceiverStream::new(events_rx)),
            Err(_) => Err(SessionError::InvalidState(self.state())),
        }
    }

    /// 发送文本，不等待写入完成
    pub fn send_message(&self, text: &str) -> Result<(), SessionError> {
        self.channel.send(text)
    }

    /// 读取目标特征的当前值
    pub async fn read(&self) -> Result<Vec<u8>, SessionError> {
        let state = self.state();
        if state != State::Ready {
            return Err(SessionError::NotReady(state));
        }

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Read { reply })
            .map_err(|_| SessionError::NotReady(self.state()))?;
        response
            .await
            .unwrap_or_else(|_| Err(SessionError::NotReady(self.state())))
    }

    /// 断开并等待会话进入终态
    ///
    /// 任何状态下都可以调用；重复调用没有副作用。
    pub async fn disconnect(&self) {
        self.scanner.cancel();
        if self.commands.send(Command::Disconnect).is_err() {
            return;
        }
        let mut state = self.state.clone();
        let _ = state.wait_for(State::is_terminal).await;
    }

    pub fn state(&self) -> State {
        self.state.borrow().clone()
    }

    /// 订阅状态变化
    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.state.clone()
    }

    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    pub fn characteristic(&self) -> Identifier {
        self.config.characteristic_for(self.identifier)
    }

    pub fn messages(&self) -> &MessageLog {
        self.channel.log()
    }
}
