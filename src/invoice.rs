use std::str::FromStr as _;

use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;

use crate::error::{Error, Result};

fn parse(invoice: &str) -> Result<Bolt11Invoice> {
    Bolt11Invoice::from_str(invoice).map_err(|e| Error::Invoice(format!("parse BOLT11: {e:?}")))
}

pub fn payment_hash_from_bolt11(invoice: &str) -> Result<[u8; 32]> {
    Ok(parse(invoice)?.payment_hash().to_byte_array())
}

/// Whole satoshis; sub-satoshi remainders are rejected.
pub fn amount_sats_from_bolt11(invoice: &str) -> Result<Option<u64>> {
    match parse(invoice)?.amount_milli_satoshis() {
        None => Ok(None),
        Some(msat) if msat % 1_000 == 0 => Ok(Some(msat / 1_000)),
        Some(msat) => Err(Error::Invoice(format!(
            "amount {msat} msat is not a whole number of satoshis"
        ))),
    }
}

/// The coordinator's invoice must commit to our preimage hash, otherwise
/// paying it does not unlock our claim.
pub fn ensure_payment_hash(invoice: &str, preimage_hash: &[u8; 32]) -> Result<()> {
    let hash = payment_hash_from_bolt11(invoice)?;
    if hash != *preimage_hash {
        return Err(Error::Invoice(format!(
            "invoice payment hash {} does not match preimage hash {}",
            hex::encode(hash),
            hex::encode(preimage_hash)
        )));
    }
    Ok(())
}
