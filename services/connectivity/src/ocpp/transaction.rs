//! Connector and transaction bookkeeping
//!
//! All mutable charge-point state lives in one struct behind one mutex in
//! the adapter. Invariant: a connector's `current_transaction` is present
//! exactly when a non-Ended transaction exists for it, and there is at most
//! one of those per connector.

use crate::error::{AdapterError, Result};
use crate::ocpp::types::ConnectorStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Charging-session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionStatus {
    Started,
    Updated,
    Ended,
}

/// One charging session, StartTransaction to StopTransaction
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: i32,
    pub connector_id: u32,
    pub tag_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Meter register at start, Wh
    pub meter_start: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_stop: Option<f64>,
    pub status: TransactionStatus,
    /// Energy delivered this session, Wh
    pub energy: f64,
    /// Present charging power, W
    pub power: f64,
    pub duration_secs: i64,
}

/// One charging port
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    pub status: ConnectorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_transaction: Option<i32>,
}

/// The whole mutable state of one charge point session
pub struct ChargePointState {
    connectors: BTreeMap<u32, Connector>,
    active: HashMap<u32, Transaction>,
    completed: Vec<Transaction>,
    next_transaction_id: i32,
}

impl ChargePointState {
    pub fn new(connector_count: u32) -> Self {
        let connectors = (1..=connector_count)
            .map(|id| {
                (
                    id,
                    Connector {
                        status: ConnectorStatus::Available,
                        current_transaction: None,
                    },
                )
            })
            .collect();
        Self {
            connectors,
            active: HashMap::new(),
            completed: Vec::new(),
            next_transaction_id: 1,
        }
    }

    fn connector_mut(&mut self, connector_id: u32) -> Result<&mut Connector> {
        self.connectors
            .get_mut(&connector_id)
            .ok_or(AdapterError::InvalidConnector { connector_id })
    }

    pub fn connector_status(&self, connector_id: u32) -> Result<ConnectorStatus> {
        self.connectors
            .get(&connector_id)
            .map(|c| c.status)
            .ok_or(AdapterError::InvalidConnector { connector_id })
    }

    /// Apply a device-originated StatusNotification
    pub fn set_connector_status(&mut self, connector_id: u32, status: ConnectorStatus) -> Result<()> {
        self.connector_mut(connector_id)?.status = status;
        Ok(())
    }

    /// Snapshot of every connector, keyed by id
    pub fn connectors(&self) -> BTreeMap<u32, Connector> {
        self.connectors.clone()
    }

    pub fn active_transaction(&self, connector_id: u32) -> Option<&Transaction> {
        self.active.get(&connector_id)
    }

    pub fn active_connectors(&self) -> Vec<u32> {
        self.active.keys().copied().collect()
    }

    /// Start a session: connector must exist, be startable, and be idle
    pub fn start_transaction(
        &mut self,
        connector_id: u32,
        tag_id: &str,
        meter_start: f64,
    ) -> Result<Transaction> {
        let connector = self
            .connectors
            .get(&connector_id)
            .ok_or(AdapterError::InvalidConnector { connector_id })?;
        if connector.current_transaction.is_some() {
            return Err(AdapterError::TransactionAlreadyActive { connector_id });
        }
        if !connector.status.can_start_transaction() {
            return Err(AdapterError::InvalidConnector { connector_id });
        }

        let id = self.next_transaction_id;
        self.next_transaction_id += 1;
        let transaction = Transaction {
            id,
            connector_id,
            tag_id: tag_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            meter_start,
            meter_stop: None,
            status: TransactionStatus::Started,
            energy: 0.0,
            power: 0.0,
            duration_secs: 0,
        };
        self.active.insert(connector_id, transaction.clone());
        let connector = self.connector_mut(connector_id)?;
        connector.status = ConnectorStatus::Charging;
        connector.current_transaction = Some(id);
        Ok(transaction)
    }

    /// Fold a device meter reading into the active session. `meter_wh` is
    /// the absolute register; energy never decreases.
    pub fn record_meter(
        &mut self,
        connector_id: u32,
        meter_wh: Option<f64>,
        power_w: Option<f64>,
    ) -> Result<Transaction> {
        let transaction = self
            .active
            .get_mut(&connector_id)
            .ok_or(AdapterError::NoActiveTransaction { connector_id })?;
        if let Some(meter) = meter_wh {
            let delivered = (meter - transaction.meter_start).max(0.0);
            transaction.energy = transaction.energy.max(delivered);
        }
        if let Some(power) = power_w {
            transaction.power = power;
        }
        transaction.status = TransactionStatus::Updated;
        transaction.duration_secs = (Utc::now() - transaction.start_time).num_seconds();
        Ok(transaction.clone())
    }

    /// Timer-driven advance: integrate present power over `elapsed`
    pub fn tick(&mut self, connector_id: u32, elapsed: Duration) -> Result<Transaction> {
        let transaction = self
            .active
            .get_mut(&connector_id)
            .ok_or(AdapterError::NoActiveTransaction { connector_id })?;
        transaction.energy += transaction.power * elapsed.as_secs_f64() / 3600.0;
        transaction.status = TransactionStatus::Updated;
        transaction.duration_secs = (Utc::now() - transaction.start_time).num_seconds();
        Ok(transaction.clone())
    }

    /// End the session on a connector
    pub fn stop_transaction(
        &mut self,
        connector_id: u32,
        meter_stop: Option<f64>,
    ) -> Result<Transaction> {
        let mut transaction = self
            .active
            .remove(&connector_id)
            .ok_or(AdapterError::NoActiveTransaction { connector_id })?;
        transaction.end_time = Some(Utc::now());
        transaction.meter_stop =
            Some(meter_stop.unwrap_or(transaction.meter_start + transaction.energy));
        transaction.status = TransactionStatus::Ended;
        transaction.duration_secs = (Utc::now() - transaction.start_time).num_seconds();

        let connector = self.connector_mut(connector_id)?;
        connector.status = ConnectorStatus::Available;
        connector.current_transaction = None;

        self.completed.push(transaction.clone());
        Ok(transaction)
    }

    /// End a session addressed by transaction id (device-originated stops)
    pub fn stop_by_transaction(
        &mut self,
        transaction_id: i32,
        meter_stop: Option<f64>,
    ) -> Result<Transaction> {
        let connector_id = self
            .active
            .iter()
            .find(|(_, t)| t.id == transaction_id)
            .map(|(c, _)| *c)
            .ok_or(AdapterError::NoActiveTransaction { connector_id: 0 })?;
        self.stop_transaction(connector_id, meter_stop)
    }

    pub fn completed(&self) -> &[Transaction] {
        &self.completed
    }
}
