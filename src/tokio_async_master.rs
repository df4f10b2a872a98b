//! Asynchronous facade over [`Master`].
//!
//! Serial exchanges block, so every call runs on tokio's blocking thread pool.
//! The master stays shared, and its lock still serializes all exchanges, also
//! between async and blocking callers.

use crate::{
    error::Result,
    frame::ModbusResponse,
    master::{Master, RequestError, Statistics},
    transport::{SerialConfig, Transport},
};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Asynchronous Modbus RTU master.
pub struct AsyncMaster<T> {
    master: Arc<Master<T>>,
}

impl<T> Clone for AsyncMaster<T> {
    fn clone(&self) -> Self {
        Self {
            master: self.master.clone(),
        }
    }
}

impl<T: Transport + 'static> AsyncMaster<T> {
    pub fn new(master: Master<T>) -> Self {
        Self {
            master: Arc::new(master),
        }
    }

    /// Creates an `AsyncMaster` from a master that is also used elsewhere.
    pub fn from_shared(master: Arc<Master<T>>) -> Self {
        Self { master }
    }

    pub fn clone_shared(&self) -> Arc<Master<T>> {
        self.master.clone()
    }

    async fn run<R, F>(&self, operation: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&Master<T>) -> R + Send + 'static,
    {
        let master = self.master.clone();
        match tokio::task::spawn_blocking(move || operation(&master)).await {
            Ok(result) => result,
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        }
    }

    pub async fn connect(&self, config: SerialConfig) -> Result<()> {
        self.run(move |master| master.connect(config)).await
    }

    pub async fn disconnect(&self) {
        self.run(|master| master.disconnect()).await
    }

    pub fn is_connected(&self) -> bool {
        self.master.is_connected()
    }

    pub fn statistics(&self) -> Statistics {
        self.master.statistics()
    }

    pub fn reset_statistics(&self) {
        self.master.reset_statistics()
    }

    pub async fn send_frame(&self, frame: Vec<u8>) -> ModbusResponse {
        self.run(move |master| master.send_frame(&frame)).await
    }

    pub async fn read_holding_registers(
        &self,
        slave_id: u8,
        start: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, RequestError> {
        self.run(move |master| master.read_holding_registers(slave_id, start, count))
            .await
    }

    pub async fn read_input_registers(
        &self,
        slave_id: u8,
        start: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, RequestError> {
        self.run(move |master| master.read_input_registers(slave_id, start, count))
            .await
    }

    pub async fn write_single_register(
        &self,
        slave_id: u8,
        address: u16,
        value: u16,
    ) -> std::result::Result<(), RequestError> {
        self.run(move |master| master.write_single_register(slave_id, address, value))
            .await
    }

    pub async fn write_multiple_registers(
        &self,
        slave_id: u8,
        start: u16,
        values: Vec<u16>,
    ) -> std::result::Result<(), RequestError> {
        self.run(move |master| master.write_multiple_registers(slave_id, start, &values))
            .await
    }

    pub async fn read_coils(
        &self,
        slave_id: u8,
        start: u16,
        count: u16,
    ) -> std::result::Result<Vec<bool>, RequestError> {
        self.run(move |master| master.read_coils(slave_id, start, count))
            .await
    }

    pub async fn write_single_coil(
        &self,
        slave_id: u8,
        address: u16,
        on: bool,
    ) -> std::result::Result<(), RequestError> {
        self.run(move |master| master.write_single_coil(slave_id, address, on))
            .await
    }

    pub async fn probe_device(&self, slave_id: u8) -> ModbusResponse {
        self.run(move |master| master.probe_device(slave_id)).await
    }

    /// Scans `range` without progress reporting.
    pub async fn scan_slaves(&self, range: RangeInclusive<u8>) -> Vec<(u8, ModbusResponse)> {
        self.run(move |master| master.scan_slaves(range, |_, _| ()))
            .await
    }

    pub async fn test_communication(&self, slave_id: u8) -> bool {
        self.run(move |master| master.test_communication(slave_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::tests::{register_device, test_config};
    use crate::transport::fake::FakeTransport;
    use std::sync::Mutex;

    fn device() -> (AsyncMaster<FakeTransport>, Arc<Mutex<Vec<u16>>>) {
        let registers = Arc::new(Mutex::new(vec![0; 16]));
        let transport = FakeTransport::with_responder(register_device(1, registers.clone()));
        (AsyncMaster::new(Master::new(transport)), registers)
    }

    #[tokio::test]
    async fn async_register_access() {
        let (master, registers) = device();
        master.connect(test_config()).await.unwrap();
        assert!(master.is_connected());

        master.write_single_register(1, 2, 77).await.unwrap();
        master.write_multiple_registers(1, 4, vec![5, 6]).await.unwrap();
        assert_eq!(
            master.read_holding_registers(1, 2, 4).await,
            Ok(vec![77, 0, 5, 6])
        );
        assert_eq!(registers.lock().unwrap()[..6], [0, 0, 77, 0, 5, 6]);
        assert_eq!(master.statistics().requests_sent, 3);

        master.disconnect().await;
        assert!(!master.is_connected());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_line() {
        let (master, _) = device();
        master.connect(test_config()).await.unwrap();

        let tasks: Vec<_> = (0..4u16)
            .map(|address| {
                let master = master.clone();
                tokio::spawn(async move { master.read_holding_registers(1, address, 1).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(vec![0]));
        }
        let stats = master.statistics();
        assert_eq!(stats.requests_sent, 4);
        assert_eq!(stats.responses_received, 4);
    }

    #[tokio::test]
    async fn async_scan() {
        let (master, _) = device();
        master.connect(test_config()).await.unwrap();
        let found = master.scan_slaves(1..=3).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, 1);
        assert!(master.probe_device(2).await.is_timeout());
    }
}
