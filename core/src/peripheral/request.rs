//! Per-transaction request/response objects
//!
//! A response starts from the characteristic's stored value, is mutated by
//! at most one handler call, and is then consumed to build exactly one
//! [`TransactionReply`].

use crate::codec;
use crate::gatt::{CharId, DeviceId, GattStatus, ServiceId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error raised by an application handler; the transaction fails
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Value rejected: {0}")]
    Rejected(String),
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Protocol reply for one inbound transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReply {
    pub device: DeviceId,
    pub request_id: u32,
    pub status: GattStatus,
    pub offset: u16,
    pub value: Vec<u8>,
}

impl TransactionReply {
    /// Reply carrying no value, used for failures
    pub fn failure(device: DeviceId, request_id: u32, status: GattStatus) -> Self {
        Self {
            device,
            request_id,
            status,
            offset: 0,
            value: Vec::new(),
        }
    }
}

// ============================================================================
// READ
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub device: DeviceId,
    pub request_id: u32,
    pub service_id: ServiceId,
    pub characteristic: CharId,
    pub offset: u16,
}

#[derive(Debug)]
pub struct ReadResponse {
    value: Vec<u8>,
    status: GattStatus,
}

impl ReadResponse {
    pub(crate) fn new(current: Vec<u8>) -> Self {
        Self {
            value: current,
            status: GattStatus::Success,
        }
    }

    pub fn set_status(&mut self, status: GattStatus) {
        self.status = status;
    }

    /// Replace the characteristic value returned (and stored)
    pub fn write(&mut self, value: impl Into<Vec<u8>>) {
        self.value = value.into();
    }

    /// Write a u32 as little-endian bytes
    pub fn write_int(&mut self, value: u32) {
        self.value = codec::encode_u32_le(value).to_vec();
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn status(&self) -> GattStatus {
        self.status
    }

    /// Consume the response; yields the reply and the value to store
    pub(crate) fn finish(self, request: &ReadRequest) -> (TransactionReply, Vec<u8>) {
        let reply = if self.status.is_success() {
            TransactionReply {
                device: request.device.clone(),
                request_id: request.request_id,
                status: self.status,
                offset: request.offset,
                value: self
                    .value
                    .get(usize::from(request.offset)..)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default(),
            }
        } else {
            TransactionReply::failure(request.device.clone(), request.request_id, self.status)
        };
        (reply, self.value)
    }
}

// ============================================================================
// WRITE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub device: DeviceId,
    pub request_id: u32,
    pub service_id: ServiceId,
    pub characteristic: CharId,
    pub prepared_write: bool,
    pub response_needed: bool,
    pub offset: u16,
    pub value: Vec<u8>,
}

impl WriteRequest {
    /// Written value as a little-endian u32
    pub fn int_value(&self) -> Option<u32> {
        codec::decode_u32_le(&self.value).ok()
    }
}

#[derive(Debug)]
pub struct WriteResponse {
    value: Vec<u8>,
    status: GattStatus,
}

impl WriteResponse {
    pub(crate) fn new(current: Vec<u8>) -> Self {
        Self {
            value: current,
            status: GattStatus::Success,
        }
    }

    pub fn set_status(&mut self, status: GattStatus) {
        self.status = status;
    }

    /// Store a new characteristic value
    pub fn write(&mut self, value: impl Into<Vec<u8>>) {
        self.value = value.into();
    }

    pub fn write_int(&mut self, value: u32) {
        self.value = codec::encode_u32_le(value).to_vec();
    }

    /// Stored value as seen by the handler
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn status(&self) -> GattStatus {
        self.status
    }

    /// Consume the response; the reply is only built when one was requested
    pub(crate) fn finish(self, request: &WriteRequest) -> (Option<TransactionReply>, Vec<u8>) {
        let reply = request.response_needed.then(|| {
            if self.status.is_success() {
                TransactionReply {
                    device: request.device.clone(),
                    request_id: request.request_id,
                    status: self.status,
                    offset: request.offset,
                    value: request.value.clone(),
                }
            } else {
                TransactionReply::failure(request.device.clone(), request.request_id, self.status)
            }
        });
        (reply, self.value)
    }
}

/// Write to a descriptor of a local characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorWriteRequest {
    pub device: DeviceId,
    pub request_id: u32,
    pub service_id: ServiceId,
    pub characteristic: CharId,
    pub descriptor: Uuid,
    pub response_needed: bool,
    pub offset: u16,
    pub value: Vec<u8>,
}

impl DescriptorWriteRequest {
    /// Success reply echoing the written value
    pub fn success_reply(&self) -> TransactionReply {
        TransactionReply {
            device: self.device.clone(),
            request_id: self.request_id,
            status: GattStatus::Success,
            offset: self.offset,
            value: self.value.clone(),
        }
    }
}
