//! 会话驱动任务
//!
//! 每个会话一个任务，独占状态机和消息通道。用户命令与传输层回调分别进入
//! 两个队列，由同一个 `select!` 循环依次处理，因此任何两个回调都不会交错修改状态。
//!
//! 传输操作都在独立任务中执行，完成后作为 [`Input`] 回到队列；
//! 驱动任务本身从不等待平台调用，也从不等待事件流的消费者。

use log::{debug, info, trace, warn};

use crate::ble::{
    BleTransport, Identifier, PeripheralCandidate, ScanCoordinator, ScanError, TransportEvent,
};
use crate::config::SessionConfig;
use crate::session::channel::MessageChannel;
use crate::session::machine::{Action, ConnectionStateMachine, FailureReason, Input, State};
use crate::session::{SessionError, SessionEvent};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// 来自会话句柄的命令
pub(crate) enum Command {
    Connect {
        events: mpsc::Sender<SessionEvent>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Send(Vec<u8>),
    Read {
        reply: oneshot::Sender<Result<Vec<u8>, SessionError>>,
    },
    Disconnect,
}

/// 后台操作和传输事件
enum Io {
    ScanFinished(Result<PeripheralCandidate, ScanError>),
    /// 一个后台操作完成
    Done(Input),
    /// 传输层主动推送
    Event(Input),
}

pub(crate) struct Driver {
    transport: Arc<dyn BleTransport>,
    scanner: Arc<ScanCoordinator>,
    config: SessionConfig,
    service: Identifier,
    characteristic: Identifier,
    machine: ConnectionStateMachine,
    channel: MessageChannel,
    state_tx: watch::Sender<State>,
    events: Option<mpsc::Sender<SessionEvent>>,
    io_tx: mpsc::UnboundedSender<Io>,
    io_rx: Option<mpsc::UnboundedReceiver<Io>>,
    pending: usize,
    scanning: bool,
    /// 扫描期间收到 disconnect，等扫描停止后再关闭
    close_after_scan: bool,
}

impl Driver {
    pub(crate) fn new(
        transport: Arc<dyn BleTransport>,
        scanner: Arc<ScanCoordinator>,
        config: SessionConfig,
        service: Identifier,
        channel: MessageChannel,
        state_tx: watch::Sender<State>,
    ) -> Self {
        let characteristic = config.characteristic_for(service);
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            scanner,
            config,
            service,
            characteristic,
            machine: ConnectionStateMachine::new(service, characteristic),
            channel,
            state_tx,
            events: None,
            io_tx,
            io_rx: Some(io_rx),
            pending: 0,
            scanning: false,
            close_after_scan: false,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let Some(mut io_rx) = self.io_rx.take() else {
            return;
        };
        let mut commands_open = true;

        debug!("Session driver for {} started", self.service);
        loop {
            if self.machine.state().is_terminal() && self.pending == 0 && !self.scanning {
                break;
            }

            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("Session handle dropped, disconnecting");
                        commands_open = false;
                        self.disconnect();
                    }
                },
                Some(io) = io_rx.recv() => self.on_io(io),
            }
        }
        debug!(
            "Session driver for {} exited in state {}",
            self.service,
            self.machine.state()
        );
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { events, reply } => {
                let result = self.start_connect(events);
                let _ = reply.send(result);
            }
            Command::Send(payload) => {
                if let Err(e) = self.feed(Input::Send(payload.clone())) {
                    // 入队与状态检查之间会话已离开 Ready
                    self.emit(SessionEvent::WriteFailed {
                        payload,
                        reason: e.to_string(),
                    });
                }
            }
            Command::Read { reply } => match self.machine.handle() {
                Some(handle) if self.machine.state() == &State::Ready => {
                    let transport = self.transport.clone();
                    let handle = handle.clone();
                    let (service, characteristic) = (self.service, self.characteristic);
                    tokio::spawn(async move {
                        let result = transport
                            .read(&handle, service, characteristic)
                            .await
                            .map_err(|e| SessionError::Read(e.to_string()));
                        let _ = reply.send(result);
                    });
                }
                _ => {
                    let _ = reply.send(Err(SessionError::NotReady(self.machine.state().clone())));
                }
            },
            Command::Disconnect => self.disconnect(),
        }
    }

    fn disconnect(&mut self) {
        self.scanner.cancel();
        if self.scanning {
            // 射频扫描停止后（ScanFinished）才进入 Closed
            debug!("Disconnect requested during scan, waiting for the scan to stop");
            self.close_after_scan = true;
            return;
        }
        let _ = self.feed(Input::Disconnect);
    }

    fn start_connect(
        &mut self,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<(), SessionError> {
        if self.scanning {
            return Err(ScanError::AlreadyActive.into());
        }
        if self.machine.state() != &State::Idle {
            return Err(SessionError::InvalidState(self.machine.state().clone()));
        }

        let scan = self.scanner.begin()?;
        self.scanning = true;
        self.events = Some(events);
        self.emit(SessionEvent::Scanning {
            target: self.service,
        });

        let (target, timeout) = (self.service, self.config.scan_timeout());
        let io = self.io_tx.clone();
        tokio::spawn(async move {
            let result = scan.run(target, timeout).await;
            let _ = io.send(Io::ScanFinished(result));
        });
        Ok(())
    }

    fn on_io(&mut self, io: Io) {
        match io {
            Io::ScanFinished(result) => {
                self.scanning = false;
                if self.close_after_scan {
                    self.close_after_scan = false;
                    trace!("Scan stopped, closing session");
                    let _ = self.feed(Input::Disconnect);
                    return;
                }
                if self.machine.state() != &State::Idle {
                    trace!("Scan result arrived in state {}", self.machine.state());
                    return;
                }
                match result {
                    Ok(candidate) => {
                        self.emit(SessionEvent::DeviceFound(candidate.clone()));
                        let _ = self.feed(Input::Connect(candidate));
                    }
                    Err(e) => {
                        info!("Scan failed: {}", e);
                        self.emit(SessionEvent::ScanFailed(e));
                        // 本次连接尝试的事件流到此结束，会话回到 Idle 可重试
                        self.events = None;
                    }
                }
            }
            Io::Done(input) => {
                self.pending = self.pending.saturating_sub(1);
                let _ = self.feed(input);
            }
            Io::Event(input) => {
                let _ = self.feed(input);
            }
        }
    }

    fn feed(&mut self, input: Input) -> Result<(), SessionError> {
        let before = self.machine.state().clone();
        let actions = self.machine.apply(input)?;

        let after = self.machine.state().clone();
        if after != before {
            self.state_tx.send_replace(after.clone());
            if let Some(event) = lifecycle_event(&after) {
                self.emit(event);
            }
        }

        for action in actions {
            self.execute(action);
        }
        Ok(())
    }

    fn execute(&mut self, action: Action) {
        trace!("Executing {:?}", action);
        match action {
            Action::Connect(candidate) => {
                let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer.max(1));
                self.forward_transport_events(event_rx);

                // 平台连接不会被中途丢弃：超时后仍等待其完成，晚到的连接由状态机释放
                let transport = self.transport.clone();
                self.spawn_op(async move {
                    match transport.connect(&candidate, event_tx).await {
                        Ok(handle) => Input::Connected(handle),
                        Err(e) => Input::ConnectFailed(FailureReason::ConnectFailed(e.to_string())),
                    }
                });

                let timeout = self.config.connect_timeout();
                let io = self.io_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = io.send(Io::Event(Input::ConnectTimedOut(timeout)));
                });
            }
            Action::DiscoverServices(handle) => {
                let transport = self.transport.clone();
                self.spawn_op(async move {
                    match transport.discover_services(&handle).await {
                        Ok(services) => Input::ServicesDiscovered(services),
                        Err(e) => Input::DiscoveryFailed(e.to_string()),
                    }
                });
            }
            Action::Subscribe(handle) => {
                let transport = self.transport.clone();
                let (service, characteristic) = (self.service, self.characteristic);
                self.spawn_op(async move {
                    match transport
                        .set_notify(&handle, service, characteristic, true)
                        .await
                    {
                        Ok(()) => Input::Subscribed,
                        Err(e) => Input::SubscribeFailed(e.to_string()),
                    }
                });
            }
            Action::Write(handle, payload) => {
                let transport = self.transport.clone();
                let (service, characteristic) = (self.service, self.characteristic);
                let mode = self.config.write_mode;
                self.spawn_op(async move {
                    let result = transport
                        .write(&handle, service, characteristic, &payload, mode)
                        .await
                        .map_err(|e| e.to_string());
                    Input::WriteCompleted(result)
                });
            }
            Action::Release(handle) => {
                let transport = self.transport.clone();
                self.spawn_op(async move {
                    if let Err(e) = transport.disconnect(&handle).await {
                        warn!("Releasing {} failed: {}", handle, e);
                    }
                    Input::Disconnected
                });
            }
            Action::Deliver(payload) => {
                let message = self.channel.on_notification(payload);
                self.emit(SessionEvent::MessageReceived(message));
            }
            Action::WriteSucceeded(payload) => {
                let message = self.channel.on_write_complete(payload);
                self.emit(SessionEvent::MessageSent(message));
            }
            Action::WriteRejected(payload, reason) => {
                warn!("Write failed: {}", reason);
                self.emit(SessionEvent::WriteFailed { payload, reason });
            }
        }
    }

    fn spawn_op<F>(&mut self, op: F)
    where
        F: Future<Output = Input> + Send + 'static,
    {
        self.pending += 1;
        let io = self.io_tx.clone();
        tokio::spawn(async move {
            let input = op.await;
            let _ = io.send(Io::Done(input));
        });
    }

    /// 把传输层事件转成状态机输入，只保留目标特征的通知
    fn forward_transport_events(&self, mut events: mpsc::Receiver<TransportEvent>) {
        let io = self.io_tx.clone();
        let characteristic = self.characteristic;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let input = match event {
                    TransportEvent::Notification {
                        characteristic: from,
                        payload,
                    } if from == characteristic => Input::Notification(payload),
                    TransportEvent::Notification {
                        characteristic: from,
                        ..
                    } => {
                        trace!("Ignoring notification from {}", from);
                        continue;
                    }
                    TransportEvent::Disconnected => Input::Disconnected,
                };
                if io.send(Io::Event(input)).is_err() {
                    break;
                }
            }
        });
    }

    /// 投递事件，从不等待消费者；通道已满时丢弃该事件
    fn emit(&mut self, event: SessionEvent) {
        let Some(tx) = &self.events else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Event stream is full, dropping {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event stream dropped by consumer");
                self.events = None;
            }
        }
    }
}

fn lifecycle_event(state: &State) -> Option<SessionEvent> {
    match state {
        State::Connecting => Some(SessionEvent::Connecting),
        State::ServiceDiscovery => Some(SessionEvent::DiscoveringServices),
        State::Ready => Some(SessionEvent::Ready),
        State::Failed(reason) => Some(SessionEvent::Failed(reason.clone())),
        State::Closed => Some(SessionEvent::Closed),
        State::Idle | State::Closing => None,
    }
}
