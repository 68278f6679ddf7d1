//! Decoders for the dense telemetry payloads
//!
//! The binary layouts of ADC configuration, sample arrays, power
//! calculations and service data belong to the firmware. The dispatcher only
//! needs a function from bytes to a structured value for each of them, which
//! is what [`PayloadDecoder`] provides. Every method has a usable default so
//! [`DefaultDecoder`] works out of the box; applications override the methods
//! whose layouts they know.

use std::collections::BTreeMap;

use crate::error::Error;
use crate::parsing::format_mac_address;
use crate::Result;

/// Structured value produced by a payload decoder
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Decoded>),
    Record(BTreeMap<String, Decoded>),
}

impl Decoded {
    /// Look up a field of a record
    pub fn field(&self, name: &str) -> Option<&Decoded> {
        match self {
            Decoded::Record(fields) => fields.get(name),
            _ => None,
        }
    }
}

/// State of a single Crownstone as reported through the mesh
#[derive(Debug, Clone, PartialEq)]
pub struct MeshState {
    /// Id of the Crownstone the state belongs to
    pub crownstone_id: u8,
    /// Decoded state
    pub state: Decoded,
}

/// Pure `bytes -> value` decoders for collaborator-owned payloads
pub trait PayloadDecoder: Send + Sync {
    /// Own Crownstone id
    fn crownstone_id(&self, payload: &[u8]) -> Result<u8> {
        payload
            .first()
            .copied()
            .ok_or_else(|| Error::decode("Empty crownstone id payload"))
    }

    /// Own MAC address, `None` when the payload does not hold a valid address
    fn mac_address(&self, payload: &[u8]) -> Result<Option<String>> {
        let Ok(mac) = <[u8; 6]>::try_from(payload) else {
            return Ok(None);
        };
        if mac.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        Ok(Some(format_mac_address(&mac)))
    }

    /// ADC configuration
    fn adc_config(&self, payload: &[u8]) -> Result<Decoded> {
        Ok(Decoded::Bytes(payload.to_vec()))
    }

    /// Current samples, plain or filtered
    fn current_samples(&self, payload: &[u8]) -> Result<Decoded> {
        Ok(Decoded::Bytes(payload.to_vec()))
    }

    /// Voltage samples, plain or filtered
    fn voltage_samples(&self, payload: &[u8]) -> Result<Decoded> {
        Ok(Decoded::Bytes(payload.to_vec()))
    }

    /// Calculated power
    fn power_calculation(&self, payload: &[u8]) -> Result<Decoded> {
        Ok(Decoded::Bytes(payload.to_vec()))
    }

    /// Service data advertised by the connected Crownstone itself
    fn service_data(&self, payload: &[u8]) -> Result<Decoded> {
        Ok(Decoded::Bytes(payload.to_vec()))
    }

    /// Service data relayed through the mesh: `[DATA_TYPE][SERVICE_DATA (15)]`
    ///
    /// Returns `None` when the data does not identify a Crownstone.
    fn mesh_service_data(&self, payload: &[u8]) -> Result<Option<MeshState>> {
        if payload.len() < 2 {
            return Ok(None);
        }
        Ok(Some(MeshState {
            crownstone_id: payload[1],
            state: Decoded::Bytes(payload.to_vec()),
        }))
    }
}

/// Decoder using the default implementation of every method
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecoder;

impl PayloadDecoder for DefaultDecoder {}
