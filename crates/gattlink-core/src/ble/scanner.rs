//! Scan Coordinator - 查找广播目标服务的外设
//!
//! 每次扫描最多产出一个候选设备：第一个匹配的广播即结束扫描。
//!
//! # 资源释放
//!
//! 扫描期间射频扫描处于开启状态。[`ActiveScan`] 负责在所有退出路径上
//! （找到设备、超时、取消、错误、future 被丢弃）关闭射频扫描并释放扫描槽位。

use log::{debug, info, trace, warn};

use crate::ble::{BleTransport, Identifier, PeripheralCandidate, TransportError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 扫描错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("No matching peripheral found within {0:?}")]
    Timeout(Duration),

    #[error("A scan is already active for this session")]
    AlreadyActive,

    #[error("Scan cancelled")]
    Cancelled,

    #[error("Scan stream ended before a matching peripheral was found")]
    StreamClosed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// 单会话扫描协调器
pub struct ScanCoordinator {
    transport: Arc<dyn BleTransport>,
    active: Arc<AtomicBool>,
    cancel: Mutex<CancellationToken>,
}

impl ScanCoordinator {
    pub fn new(transport: Arc<dyn BleTransport>) -> Self {
        Self {
            transport,
            active: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// 扫描直到找到第一个广播 `target` 的外设或超时
    pub async fn start_scan(
        &self,
        target: Identifier,
        timeout: Duration,
    ) -> Result<PeripheralCandidate, ScanError> {
        self.begin()?.run(target, timeout).await
    }

    /// 占用扫描槽位
    ///
    /// 同步完成，之后的 [`cancel`](Self::cancel) 一定能作用到这次扫描。
    pub fn begin(&self) -> Result<ActiveScan, ScanError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ScanError::AlreadyActive);
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        Ok(ActiveScan {
            transport: self.transport.clone(),
            active: self.active.clone(),
            token,
            radio_on: false,
        })
    }

    /// 取消进行中的扫描，可重复调用
    pub fn cancel(&self) {
        let token = self.cancel.lock();
        if !token.is_cancelled() {
            debug!("Cancelling scan");
            token.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// 已占用槽位的一次扫描
pub struct ActiveScan {
    transport: Arc<dyn BleTransport>,
    active: Arc<AtomicBool>,
    token: CancellationToken,
    radio_on: bool,
}

impl ActiveScan {
    pub async fn run(
        mut self,
        target: Identifier,
        timeout: Duration,
    ) -> Result<PeripheralCandidate, ScanError> {
        if self.token.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        info!(
            "Starting BLE scan for {} ({} seconds)",
            target,
            timeout.as_secs()
        );
        let mut candidates = self.transport.start_scan(target).await?;
        self.radio_on = true;

        let timeout_fut = tokio::time::sleep(timeout);
        tokio::pin!(timeout_fut);

        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ScanError::Cancelled),
            _ = &mut timeout_fut => Err(ScanError::Timeout(timeout)),
            found = first_match(&mut candidates, &target) => found.ok_or(ScanError::StreamClosed),
        };

        self.stop_radio().await;

        match &outcome {
            Ok(candidate) => info!("Scan complete: found {}", candidate),
            Err(e) => info!("Scan ended without a match: {}", e),
        }
        outcome
    }

    async fn stop_radio(&mut self) {
        if !self.radio_on {
            return;
        }
        self.radio_on = false;
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan cleanly: {}", e);
        }
    }
}

impl Drop for ActiveScan {
    fn drop(&mut self) {
        // future 被丢弃时 run() 没有机会关闭射频扫描
        if self.radio_on {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let transport = self.transport.clone();
                    runtime.spawn(async move {
                        if let Err(e) = transport.stop_scan().await {
                            warn!("Failed to stop abandoned scan: {}", e);
                        }
                    });
                }
                Err(_) => warn!("Scan dropped outside a runtime; radio scan left running"),
            }
        }
        self.active.store(false, Ordering::Release);
    }
}

async fn first_match(
    candidates: &mut mpsc::Receiver<PeripheralCandidate>,
    target: &Identifier,
) -> Option<PeripheralCandidate> {
    while let Some(candidate) = candidates.recv().await {
        if candidate.advertises(target) {
            return Some(candidate);
        }
        trace!("Ignoring {}: does not advertise {}", candidate.address, target);
    }
    None
}
