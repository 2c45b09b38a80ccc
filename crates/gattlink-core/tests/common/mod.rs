//! 测试用内存传输
//!
//! 可编排的 BleTransport：预设广播设备、服务列表、连接/写入延迟和失败，
//! 并按顺序记录所有调用。

#![allow(dead_code)]

use async_trait::async_trait;
use gattlink_core::{
    BleTransport, ConnectionHandle, Identifier, PeripheralCandidate, ServiceInfo, SessionEvent,
    SessionEvents, TransportError, TransportEvent, WriteMode,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

pub const ADDRESS: &str = "24:0A:C4:00:11:22";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(Identifier),
    StopScan,
    Connect(String),
    DiscoverServices,
    SetNotify(Identifier, bool),
    Write(Vec<u8>),
    Read,
    Disconnect,
}

#[derive(Default)]
pub struct MockTransport {
    pub advertisers: Mutex<Vec<PeripheralCandidate>>,
    pub services: Mutex<Vec<ServiceInfo>>,
    pub connect_delay: Mutex<Option<Duration>>,
    pub connect_error: Mutex<Option<String>>,
    pub discover_error: Mutex<Option<String>>,
    pub notify_error: Mutex<Option<String>>,
    pub read_error: Mutex<Option<String>>,
    /// 每次写入完成前的延迟，按写入顺序消费
    pub write_delays: Mutex<VecDeque<Duration>>,
    /// 按写入顺序消费的失败结果
    pub write_failures: Mutex<VecDeque<Option<String>>>,
    pub read_value: Mutex<Vec<u8>>,
    pub calls: Mutex<Vec<Call>>,
    pub scanning: AtomicBool,
    pub writes_in_flight: AtomicUsize,
    pub max_writes_in_flight: AtomicUsize,
    scan_tx: Mutex<Option<mpsc::Sender<PeripheralCandidate>>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl MockTransport {
    /// 广播 `service` 且服务中包含同名特征的外设
    pub fn with_peripheral(service: Identifier) -> Self {
        let transport = Self::default();
        transport.advertise(service);
        transport
    }

    /// 之后的扫描都能发现该外设
    pub fn advertise(&self, service: Identifier) {
        self.advertisers.lock().push(PeripheralCandidate {
            address: ADDRESS.to_string(),
            name: Some("esp32-chat".to_string()),
            services: vec![service],
            rssi: Some(-58),
        });
        self.services.lock().push(ServiceInfo {
            uuid: service,
            characteristics: vec![service],
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Write(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    /// 模拟外设推送通知
    pub async fn notify(&self, characteristic: Identifier, payload: &[u8]) {
        let sender = self.events.lock().clone();
        if let Some(tx) = sender {
            tx.send(TransportEvent::Notification {
                characteristic,
                payload: payload.to_vec(),
            })
            .await
            .expect("session stopped listening");
        }
    }

    /// 模拟外设意外断开
    pub async fn drop_link(&self) {
        let sender = self.events.lock().take();
        if let Some(tx) = sender {
            let _ = tx.send(TransportEvent::Disconnected).await;
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn start_scan(
        &self,
        filter: Identifier,
    ) -> Result<mpsc::Receiver<PeripheralCandidate>, TransportError> {
        self.record(Call::StartScan(filter));
        let (tx, rx) = mpsc::channel(16);
        for candidate in self.advertisers.lock().iter() {
            let _ = tx.try_send(candidate.clone());
        }
        *self.scan_tx.lock() = Some(tx);
        self.scanning.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(Call::StopScan);
        self.scan_tx.lock().take();
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(
        &self,
        candidate: &PeripheralCandidate,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<ConnectionHandle, TransportError> {
        self.record(Call::Connect(candidate.address.clone()));
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let error = self.connect_error.lock().clone();
        if let Some(e) = error {
            return Err(TransportError::Platform(e));
        }
        *self.events.lock() = Some(events);
        Ok(ConnectionHandle::new(candidate.address.clone()))
    }

    async fn discover_services(
        &self,
        _handle: &ConnectionHandle,
    ) -> Result<Vec<ServiceInfo>, TransportError> {
        self.record(Call::DiscoverServices);
        let error = self.discover_error.lock().clone();
        if let Some(e) = error {
            return Err(TransportError::Platform(e));
        }
        Ok(self.services.lock().clone())
    }

    async fn set_notify(
        &self,
        _handle: &ConnectionHandle,
        _service: Identifier,
        characteristic: Identifier,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.record(Call::SetNotify(characteristic, enabled));
        let error = self.notify_error.lock().clone();
        if let Some(e) = error {
            return Err(TransportError::Platform(e));
        }
        Ok(())
    }

    async fn write(
        &self,
        _handle: &ConnectionHandle,
        _service: Identifier,
        _characteristic: Identifier,
        payload: &[u8],
        _mode: WriteMode,
    ) -> Result<(), TransportError> {
        self.record(Call::Write(payload.to_vec()));
        let now = self.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_writes_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.write_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.writes_in_flight.fetch_sub(1, Ordering::SeqCst);

        let failure = self.write_failures.lock().pop_front().flatten();
        match failure {
            Some(e) => Err(TransportError::Platform(e)),
            None => Ok(()),
        }
    }

    async fn read(
        &self,
        _handle: &ConnectionHandle,
        _service: Identifier,
        _characteristic: Identifier,
    ) -> Result<Vec<u8>, TransportError> {
        self.record(Call::Read);
        let error = self.read_error.lock().clone();
        if let Some(e) = error {
            return Err(TransportError::Platform(e));
        }
        Ok(self.read_value.lock().clone())
    }

    async fn disconnect(&self, _handle: &ConnectionHandle) -> Result<(), TransportError> {
        self.record(Call::Disconnect);
        self.events.lock().take();
        Ok(())
    }
}

/// 取下一个事件，60 秒内没有事件视为测试失败
pub async fn next_event(events: &mut SessionEvents) -> Option<SessionEvent> {
    tokio::time::timeout(Duration::from_secs(60), events.next())
        .await
        .expect("timed out waiting for a session event")
}

/// 读取事件直到满足条件，返回途经的所有事件
pub async fn events_until(
    events: &mut SessionEvents,
    mut done: impl FnMut(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Some(event) = next_event(events).await {
        let stop = done(&event);
        seen.push(event);
        if stop {
            break;
        }
    }
    seen
}
