//! Identifier generation

use bech32::Bech32m;
use uuid7::uuid7;

pub const INVOICE_HRP: &str = "nf_";
pub const SHIPMENT_HRP: &str = "cc_";
pub const ORDER_HRP: &str = "pd_";
pub const EVENT_HRP: &str = "ev_";

// construct a unique record id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

pub(crate) fn new_id(hrp: &str) -> crate::error::Result<String> {
    new_uuid_to_bech32(hrp).map_err(crate::error::WorkflowError::internal)
}
