//! btleplug 传输实现
//!
//! 使用系统默认（第一个）蓝牙适配器作为 GATT Central。
//!
//! 流程:
//! 1. 按服务 UUID 过滤扫描，发现的外设按地址缓存
//! 2. 连接后为每个连接启动转发任务，把通知流和适配器断开事件写入会话通道
//! 3. 读写/订阅时按 (service, characteristic) 查找特征

use log::{debug, info, trace, warn};

use crate::ble::{
    BleTransport, ConnectionHandle, Identifier, PeripheralCandidate, ServiceInfo, TransportError,
    TransportEvent, WriteMode,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        TransportError::Platform(e.to_string())
    }
}

impl From<WriteMode> for WriteType {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        }
    }
}

pub struct BtleplugTransport {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<String, PlatformPeripheral>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            scan_task: Mutex::new(None),
        })
    }

    fn peripheral(&self, address: &str) -> Result<PlatformPeripheral, TransportError> {
        self.peripherals
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(address.to_string()))
    }

    fn find_characteristic(
        peripheral: &PlatformPeripheral,
        service: Identifier,
        characteristic: Identifier,
    ) -> Result<Characteristic, TransportError> {
        for s in peripheral.services() {
            if s.uuid == service.as_uuid() {
                for c in s.characteristics {
                    if c.uuid == characteristic.as_uuid() {
                        return Ok(c);
                    }
                }
            }
        }
        Err(TransportError::CharacteristicNotFound(characteristic))
    }
}

async fn to_candidate(peripheral: &PlatformPeripheral) -> Option<PeripheralCandidate> {
    let props = peripheral.properties().await.ok()??;
    Some(PeripheralCandidate {
        address: props.address.to_string(),
        name: props.local_name,
        services: props.services.into_iter().map(Identifier::from).collect(),
        rssi: props.rssi,
    })
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn start_scan(
        &self,
        filter: Identifier,
    ) -> Result<mpsc::Receiver<PeripheralCandidate>, TransportError> {
        let mut events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![filter.as_uuid()],
            })
            .await?;

        let (tx, rx) = mpsc::channel(16);
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Some(candidate) = to_candidate(&peripheral).await else {
                    continue;
                };
                trace!(
                    "Advertisement from {}: {} service(s)",
                    candidate.address,
                    candidate.services.len()
                );
                peripherals
                    .lock()
                    .insert(candidate.address.clone(), peripheral);
                if tx.send(candidate).await.is_err() {
                    break;
                }
            }
        });

        let previous = self.scan_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let task = self.scan_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.adapter.stop_scan().await?;
        debug!("Radio scan stopped");
        Ok(())
    }

    async fn connect(
        &self,
        candidate: &PeripheralCandidate,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<ConnectionHandle, TransportError> {
        let peripheral = self.peripheral(&candidate.address)?;

        info!("Connecting to {}", candidate.address);
        peripheral.connect().await?;

        let mut notifications = peripheral.notifications().await?;
        let mut central_events = self.adapter.events().await?;
        let id = peripheral.id();
        let address = candidate.address.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) => {
                            let event = TransportEvent::Notification {
                                characteristic: Identifier::from(n.uuid),
                                payload: n.value,
                            };
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            // 部分平台断开时只结束通知流
                            let _ = events.send(TransportEvent::Disconnected).await;
                            break;
                        }
                    },
                    event = central_events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                            debug!("{} disconnected", address);
                            let _ = events.send(TransportEvent::Disconnected).await;
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            trace!("Event forwarder for {} stopped", address);
        });

        Ok(ConnectionHandle::new(candidate.address.clone()))
    }

    async fn discover_services(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<Vec<ServiceInfo>, TransportError> {
        let peripheral = self.peripheral(handle.id())?;
        peripheral.discover_services().await?;

        let services: Vec<ServiceInfo> = peripheral
            .services()
            .into_iter()
            .map(|s| ServiceInfo {
                uuid: Identifier::from(s.uuid),
                characteristics: s
                    .characteristics
                    .into_iter()
                    .map(|c| Identifier::from(c.uuid))
                    .collect(),
            })
            .collect();
        debug!("{} exposes {} service(s)", handle, services.len());
        Ok(services)
    }

    async fn set_notify(
        &self,
        handle: &ConnectionHandle,
        service: Identifier,
        characteristic: Identifier,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle.id())?;
        let c = Self::find_characteristic(&peripheral, service, characteristic)?;
        if enabled {
            peripheral.subscribe(&c).await?;
        } else {
            peripheral.unsubscribe(&c).await?;
        }
        Ok(())
    }

    async fn write(
        &self,
        handle: &ConnectionHandle,
        service: Identifier,
        characteristic: Identifier,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle.id())?;
        let c = Self::find_characteristic(&peripheral, service, characteristic)?;
        peripheral.write(&c, payload, mode.into()).await?;
        Ok(())
    }

    async fn read(
        &self,
        handle: &ConnectionHandle,
        service: Identifier,
        characteristic: Identifier,
    ) -> Result<Vec<u8>, TransportError> {
        let peripheral = self.peripheral(handle.id())?;
        let c = Self::find_characteristic(&peripheral, service, characteristic)?;
        Ok(peripheral.read(&c).await?)
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle.id())?;
        if let Err(e) = peripheral.disconnect().await {
            warn!("Disconnect from {} failed: {}", handle, e);
            return Err(e.into());
        }
        Ok(())
    }
}
