//! 连接状态机
//!
//! 纯状态机，不做任何 IO：输入 [`Input`]，输出需要执行的 [`Action`]。
//! 由会话驱动任务独占，保证所有状态转换串行发生。
//!
//! ```text
//! Idle -> Connecting -> ServiceDiscovery -> Ready -> Closing -> Closed
//!            \                \                \
//!             +----------------+----------------+--> Failed
//! ```
//!
//! 同一时间最多一个写入在途，其余按提交顺序排队。

use log::{debug, info, trace, warn};

use crate::ble::{ConnectionHandle, Identifier, PeripheralCandidate, ServiceInfo};
use crate::session::SessionError;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// 会话进入 Failed 的原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Service not found: {0}")]
    ServiceNotFound(Identifier),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Identifier),

    #[error("Service discovery failed: {0}")]
    Discovery(String),

    #[error("Enabling notifications failed: {0}")]
    Subscribe(String),

    #[error("Connection lost")]
    ConnectionLost,
}

/// 会话状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    ServiceDiscovery,
    Ready,
    Closing,
    Closed,
    Failed(FailureReason),
}

impl State {
    /// Closed 和 Failed 不会再发生任何转换
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Closed | State::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Idle => "Idle",
            State::Connecting => "Connecting",
            State::ServiceDiscovery => "ServiceDiscovery",
            State::Ready => "Ready",
            State::Closing => "Closing",
            State::Closed => "Closed",
            State::Failed(_) => "Failed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Failed(reason) => write!(f, "Failed({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// 状态机输入：用户命令和传输层回调
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Connect(PeripheralCandidate),
    Connected(ConnectionHandle),
    ConnectFailed(FailureReason),
    /// 连接超时；平台连接仍在进行，完成后释放
    ConnectTimedOut(Duration),
    ServicesDiscovered(Vec<ServiceInfo>),
    DiscoveryFailed(String),
    Subscribed,
    SubscribeFailed(String),
    Send(Vec<u8>),
    WriteCompleted(Result<(), String>),
    Notification(Vec<u8>),
    Disconnect,
    Disconnected,
}

/// 需要驱动任务执行的副作用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Connect(PeripheralCandidate),
    DiscoverServices(ConnectionHandle),
    Subscribe(ConnectionHandle),
    Write(ConnectionHandle, Vec<u8>),
    /// 释放连接句柄（平台 disconnect）
    Release(ConnectionHandle),
    /// 入站通知交给消息通道
    Deliver(Vec<u8>),
    WriteSucceeded(Vec<u8>),
    WriteRejected(Vec<u8>, String),
}

pub struct ConnectionStateMachine {
    state: State,
    service: Identifier,
    characteristic: Identifier,
    handle: Option<ConnectionHandle>,
    connect_pending: bool,
    in_flight: Option<Vec<u8>>,
    queue: VecDeque<Vec<u8>>,
}

impl ConnectionStateMachine {
    pub fn new(service: Identifier, characteristic: Identifier) -> Self {
        Self {
            state: State::Idle,
            service,
            characteristic,
            handle: None,
            connect_pending: false,
            in_flight: None,
            queue: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    /// 在途写入 + 排队写入数量
    pub fn pending_writes(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    pub fn apply(&mut self, input: Input) -> Result<Vec<Action>, SessionError> {
        trace!("[{}] <- {:?}", self.state, input);
        let mut actions = Vec::new();

        match input {
            Input::Connect(candidate) => {
                if self.state != State::Idle {
                    return Err(SessionError::InvalidState(self.state.clone()));
                }
                self.connect_pending = true;
                self.transition(State::Connecting);
                actions.push(Action::Connect(candidate));
            }

            Input::Connected(handle) => {
                self.connect_pending = false;
                match self.state {
                    State::Connecting => {
                        self.handle = Some(handle.clone());
                        self.transition(State::ServiceDiscovery);
                        actions.push(Action::DiscoverServices(handle));
                    }
                    State::Closing => {
                        // 连接在 disconnect() 之后才完成，立即释放
                        debug!("Late connection to {} released", handle);
                        self.handle = Some(handle.clone());
                        actions.push(Action::Release(handle));
                    }
                    _ => {
                        debug!("Stray connection {} in state {}, releasing", handle, self.state);
                        actions.push(Action::Release(handle));
                    }
                }
            }

            Input::ConnectFailed(reason) => {
                self.connect_pending = false;
                match self.state {
                    State::Connecting => self.fail(reason, &mut actions),
                    State::Closing => self.transition(State::Closed),
                    _ => trace!("Ignoring connect failure in state {}", self.state),
                }
            }

            Input::ConnectTimedOut(timeout) => match self.state {
                State::Connecting if self.connect_pending => {
                    self.fail(FailureReason::ConnectTimeout(timeout), &mut actions);
                }
                State::Closing if self.connect_pending && self.handle.is_none() => {
                    // 不再等待连接完成；晚到的句柄由 Connected 分支释放
                    self.transition(State::Closed);
                }
                _ => trace!("Connect timer expired in state {}", self.state),
            },

            Input::ServicesDiscovered(services) => {
                if self.state != State::ServiceDiscovery {
                    trace!("Ignoring discovery result in state {}", self.state);
                    return Ok(actions);
                }
                match services.iter().find(|s| s.uuid == self.service) {
                    None => self.fail(FailureReason::ServiceNotFound(self.service), &mut actions),
                    Some(s) if !s.characteristics.contains(&self.characteristic) => self.fail(
                        FailureReason::CharacteristicNotFound(self.characteristic),
                        &mut actions,
                    ),
                    Some(_) => {
                        self.transition(State::Ready);
                        if let Some(handle) = &self.handle {
                            actions.push(Action::Subscribe(handle.clone()));
                        }
                    }
                }
            }

            Input::DiscoveryFailed(error) => {
                if self.state == State::ServiceDiscovery {
                    self.fail(FailureReason::Discovery(error), &mut actions);
                }
            }

            Input::Subscribed => debug!("Notifications enabled on {}", self.characteristic),

            Input::SubscribeFailed(error) => {
                if self.state == State::Ready {
                    self.fail(FailureReason::Subscribe(error), &mut actions);
                }
            }

            Input::Send(payload) => {
                if self.state != State::Ready {
                    return Err(SessionError::NotReady(self.state.clone()));
                }
                if self.in_flight.is_some() {
                    trace!("Write queued ({} ahead)", self.pending_writes());
                    self.queue.push_back(payload);
                } else if let Some(handle) = &self.handle {
                    self.in_flight = Some(payload.clone());
                    actions.push(Action::Write(handle.clone(), payload));
                }
            }

            Input::WriteCompleted(result) => {
                let Some(payload) = self.in_flight.take() else {
                    warn!("Write completion without a write in flight");
                    return Ok(actions);
                };
                match result {
                    Ok(()) => actions.push(Action::WriteSucceeded(payload)),
                    Err(e) => actions.push(Action::WriteRejected(payload, e)),
                }
                if self.state == State::Ready {
                    self.issue_next_write(&mut actions);
                }
            }

            Input::Notification(payload) => {
                if self.state == State::Ready {
                    actions.push(Action::Deliver(payload));
                } else {
                    trace!("Dropping notification in state {}", self.state);
                }
            }

            Input::Disconnect => match self.state {
                State::Idle => {
                    self.transition(State::Closing);
                    self.transition(State::Closed);
                }
                State::Connecting => {
                    self.transition(State::Closing);
                    if !self.connect_pending {
                        self.transition(State::Closed);
                    }
                }
                State::ServiceDiscovery | State::Ready => {
                    self.transition(State::Closing);
                    self.drop_queue(&mut actions);
                    match self.handle.clone() {
                        Some(handle) => actions.push(Action::Release(handle)),
                        None => self.transition(State::Closed),
                    }
                }
                State::Closing | State::Closed | State::Failed(_) => {
                    trace!("Disconnect in state {} is a no-op", self.state);
                }
            },

            Input::Disconnected => match self.state {
                State::Closing => {
                    self.handle = None;
                    if !self.connect_pending {
                        self.transition(State::Closed);
                    }
                }
                State::Connecting | State::ServiceDiscovery | State::Ready => {
                    warn!("Peripheral disconnected unexpectedly");
                    self.handle = None;
                    self.fail(FailureReason::ConnectionLost, &mut actions);
                }
                _ => trace!("Ignoring disconnect in state {}", self.state),
            },
        }

        Ok(actions)
    }

    fn transition(&mut self, next: State) {
        if self.state != next {
            info!("Session state: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn fail(&mut self, reason: FailureReason, actions: &mut Vec<Action>) {
        self.drop_queue(actions);
        if let Some(handle) = self.handle.take() {
            actions.push(Action::Release(handle));
        }
        self.transition(State::Failed(reason));
    }

    fn issue_next_write(&mut self, actions: &mut Vec<Action>) {
        let Some(handle) = &self.handle else {
            return;
        };
        if let Some(payload) = self.queue.pop_front() {
            self.in_flight = Some(payload.clone());
            actions.push(Action::Write(handle.clone(), payload));
        }
    }

    fn drop_queue(&mut self, actions: &mut Vec<Action>) {
        for payload in self.queue.drain(..) {
            actions.push(Action::WriteRejected(payload, "session closed".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> Identifier {
        Identifier::from_short(0xffe1)
    }

    fn candidate() -> PeripheralCandidate {
        PeripheralCandidate {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            name: Some("esp32".to_string()),
            services: vec![id()],
            rssi: None,
        }
    }

    fn handle() -> ConnectionHandle {
        ConnectionHandle::new("AA:BB:CC:DD:EE:FF")
    }

    fn ready_machine() -> ConnectionStateMachine {
        let mut m = ConnectionStateMachine::new(id(), id());
        m.apply(Input::Connect(candidate())).unwrap();
        m.apply(Input::Connected(handle())).unwrap();
        let actions = m
            .apply(Input::ServicesDiscovered(vec![ServiceInfo {
                uuid: id(),
                characteristics: vec![id()],
            }]))
            .unwrap();
        assert_eq!(actions, vec![Action::Subscribe(handle())]);
        assert_eq!(m.state(), &State::Ready);
        m
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut m = ConnectionStateMachine::new(id(), id());
        assert_eq!(
            m.apply(Input::Connect(candidate())).unwrap(),
            vec![Action::Connect(candidate())]
        );
        assert_eq!(m.state(), &State::Connecting);

        assert_eq!(
            m.apply(Input::Connected(handle())).unwrap(),
            vec![Action::DiscoverServices(handle())]
        );
        assert_eq!(m.state(), &State::ServiceDiscovery);
    }

    #[test]
    fn test_only_connect_valid_from_idle() {
        let mut m = ConnectionStateMachine::new(id(), id());
        assert_eq!(
            m.apply(Input::Send(b"x".to_vec())),
            Err(SessionError::NotReady(State::Idle))
        );
        m.apply(Input::Connect(candidate())).unwrap();
        assert_eq!(
            m.apply(Input::Connect(candidate())),
            Err(SessionError::InvalidState(State::Connecting))
        );
    }

    #[test]
    fn test_missing_service_fails_without_subscribe() {
        let mut m = ConnectionStateMachine::new(id(), id());
        m.apply(Input::Connect(candidate())).unwrap();
        m.apply(Input::Connected(handle())).unwrap();

        let actions = m
            .apply(Input::ServicesDiscovered(vec![ServiceInfo {
                uuid: Identifier::from_short(0x180a),
                characteristics: vec![id()],
            }]))
            .unwrap();

        assert_eq!(actions, vec![Action::Release(handle())]);
        assert_eq!(m.state(), &State::Failed(FailureReason::ServiceNotFound(id())));
    }

    #[test]
    fn test_missing_characteristic_fails() {
        let mut m = ConnectionStateMachine::new(id(), Identifier::from_short(0xffe2));
        m.apply(Input::Connect(candidate())).unwrap();
        m.apply(Input::Connected(handle())).unwrap();
        m.apply(Input::ServicesDiscovered(vec![ServiceInfo {
            uuid: id(),
            characteristics: vec![id()],
        }]))
        .unwrap();

        assert_eq!(
            m.state(),
            &State::Failed(FailureReason::CharacteristicNotFound(
                Identifier::from_short(0xffe2)
            ))
        );
    }

    #[test]
    fn test_writes_are_serialized_fifo() {
        let mut m = ready_machine();

        assert_eq!(
            m.apply(Input::Send(b"a".to_vec())).unwrap(),
            vec![Action::Write(handle(), b"a".to_vec())]
        );
        assert!(m.apply(Input::Send(b"b".to_vec())).unwrap().is_empty());
        assert!(m.apply(Input::Send(b"c".to_vec())).unwrap().is_empty());
        assert_eq!(m.pending_writes(), 3);

        assert_eq!(
            m.apply(Input::WriteCompleted(Ok(()))).unwrap(),
            vec![
                Action::WriteSucceeded(b"a".to_vec()),
                Action::Write(handle(), b"b".to_vec())
            ]
        );
        assert_eq!(
            m.apply(Input::WriteCompleted(Err("gatt error 133".to_string())))
                .unwrap(),
            vec![
                Action::WriteRejected(b"b".to_vec(), "gatt error 133".to_string()),
                Action::Write(handle(), b"c".to_vec())
            ]
        );
        // 写入失败不改变状态
        assert_eq!(m.state(), &State::Ready);
    }

    #[test]
    fn test_notification_keeps_state() {
        let mut m = ready_machine();
        assert_eq!(
            m.apply(Input::Notification(b"hello".to_vec())).unwrap(),
            vec![Action::Deliver(b"hello".to_vec())]
        );
        assert_eq!(m.state(), &State::Ready);
    }

    #[test]
    fn test_disconnect_from_ready_releases_and_drops_queue() {
        let mut m = ready_machine();
        m.apply(Input::Send(b"a".to_vec())).unwrap();
        m.apply(Input::Send(b"b".to_vec())).unwrap();

        let actions = m.apply(Input::Disconnect).unwrap();
        assert_eq!(
            actions,
            vec![
                Action::WriteRejected(b"b".to_vec(), "session closed".to_string()),
                Action::Release(handle())
            ]
        );
        assert_eq!(m.state(), &State::Closing);

        // 第二次 disconnect 无副作用
        assert!(m.apply(Input::Disconnect).unwrap().is_empty());

        m.apply(Input::Disconnected).unwrap();
        assert_eq!(m.state(), &State::Closed);

        // 在途写入的完成仍然被报告，但不再发起新的写入
        assert_eq!(
            m.apply(Input::WriteCompleted(Ok(()))).unwrap(),
            vec![Action::WriteSucceeded(b"a".to_vec())]
        );
    }

    #[test]
    fn test_disconnect_from_idle_closes() {
        let mut m = ConnectionStateMachine::new(id(), id());
        assert!(m.apply(Input::Disconnect).unwrap().is_empty());
        assert_eq!(m.state(), &State::Closed);
        assert!(m.apply(Input::Disconnect).unwrap().is_empty());
        assert_eq!(
            m.apply(Input::Connect(candidate())),
            Err(SessionError::InvalidState(State::Closed))
        );
    }

    #[test]
    fn test_disconnect_while_connecting_releases_late_handle() {
        let mut m = ConnectionStateMachine::new(id(), id());
        m.apply(Input::Connect(candidate())).unwrap();
        m.apply(Input::Disconnect).unwrap();
        assert_eq!(m.state(), &State::Closing);

        assert_eq!(
            m.apply(Input::Connected(handle())).unwrap(),
            vec![Action::Release(handle())]
        );
        assert_eq!(m.state(), &State::Closing);

        m.apply(Input::Disconnected).unwrap();
        assert_eq!(m.state(), &State::Closed);
    }

    #[test]
    fn test_connect_timeout_releases_late_connection() {
        let mut m = ConnectionStateMachine::new(id(), id());
        m.apply(Input::Connect(candidate())).unwrap();

        let timeout = Duration::from_secs(15);
        assert!(m.apply(Input::ConnectTimedOut(timeout)).unwrap().is_empty());
        assert_eq!(
            m.state(),
            &State::Failed(FailureReason::ConnectTimeout(timeout))
        );

        // 平台连接在超时之后才完成
        assert_eq!(
            m.apply(Input::Connected(handle())).unwrap(),
            vec![Action::Release(handle())]
        );
        assert_eq!(
            m.state(),
            &State::Failed(FailureReason::ConnectTimeout(timeout))
        );
    }

    #[test]
    fn test_connect_timer_ignored_once_connected() {
        let mut m = ready_machine();
        assert!(m
            .apply(Input::ConnectTimedOut(Duration::from_secs(15)))
            .unwrap()
            .is_empty());
        assert_eq!(m.state(), &State::Ready);
    }

    #[test]
    fn test_connect_timer_closes_while_closing() {
        let mut m = ConnectionStateMachine::new(id(), id());
        m.apply(Input::Connect(candidate())).unwrap();
        m.apply(Input::Disconnect).unwrap();
        assert_eq!(m.state(), &State::Closing);

        m.apply(Input::ConnectTimedOut(Duration::from_secs(15)))
            .unwrap();
        assert_eq!(m.state(), &State::Closed);
        assert_eq!(
            m.apply(Input::Connected(handle())).unwrap(),
            vec![Action::Release(handle())]
        );
    }

    #[test]
    fn test_discovery_error_fails_and_releases() {
        let mut m = ConnectionStateMachine::new(id(), id());
        m.apply(Input::Connect(candidate())).unwrap();
        m.apply(Input::Connected(handle())).unwrap();

        let actions = m
            .apply(Input::DiscoveryFailed("gatt error 129".to_string()))
            .unwrap();
        assert_eq!(actions, vec![Action::Release(handle())]);
        assert_eq!(
            m.state(),
            &State::Failed(FailureReason::Discovery("gatt error 129".to_string()))
        );
    }

    #[test]
    fn test_subscribe_error_fails_ready_session() {
        let mut m = ready_machine();
        m.apply(Input::Send(b"a".to_vec())).unwrap();
        m.apply(Input::Send(b"b".to_vec())).unwrap();

        let actions = m
            .apply(Input::SubscribeFailed("cccd write rejected".to_string()))
            .unwrap();
        assert_eq!(
            actions,
            vec![
                Action::WriteRejected(b"b".to_vec(), "session closed".to_string()),
                Action::Release(handle())
            ]
        );
        assert_eq!(
            m.state(),
            &State::Failed(FailureReason::Subscribe("cccd write rejected".to_string()))
        );
    }

    #[test]
    fn test_unexpected_disconnect_fails_session() {
        let mut m = ready_machine();
        assert!(m.apply(Input::Disconnected).unwrap().is_empty());
        assert_eq!(m.state(), &State::Failed(FailureReason::ConnectionLost));
        assert!(m.handle().is_none());
    }

    #[test]
    fn test_terminal_states_ignore_transport_noise() {
        let mut m = ConnectionStateMachine::new(id(), id());
        m.apply(Input::Connect(candidate())).unwrap();
        m.apply(Input::ConnectFailed(FailureReason::ConnectTimeout(
            Duration::from_secs(15),
        )))
        .unwrap();
        let failed = m.state().clone();
        assert!(failed.is_terminal());

        assert!(m.apply(Input::Notification(vec![])).unwrap().is_empty());
        assert!(m.apply(Input::Disconnected).unwrap().is_empty());
        assert!(m.apply(Input::Disconnect).unwrap().is_empty());
        assert_eq!(m.state(), &failed);
    }
}
