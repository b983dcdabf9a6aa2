use alloy::primitives::U256;

use crate::error::{Error, Result};

/// Boltz-side amounts use 8 decimals, EVM chains use 18.
pub const SATS_TO_WEI_EXPONENT: u32 = 10;

pub fn wei_per_sat() -> U256 {
    U256::from(10u64).pow(U256::from(SATS_TO_WEI_EXPONENT))
}

pub fn sats_to_wei(sats: u64) -> U256 {
    U256::from(sats) * wei_per_sat()
}

/// Truncates dust below one satoshi.
pub fn wei_to_sats(wei: U256) -> Result<u64> {
    let sats = wei / wei_per_sat();
    u64::try_from(sats).map_err(|_| Error::InvalidResponse(format!("wei amount {wei} overflows u64 sats")))
}

/// The fee budget of a claim transaction. Never clamped: a lockup that cannot
/// cover the promised amount is a corrupted or malicious response.
pub fn fee_budget(input_sum: u64, receive_amount: u64) -> Result<u64> {
    input_sum
        .checked_sub(receive_amount)
        .ok_or(Error::InsufficientFunds {
            input_sum,
            receive_amount,
        })
}

/// Amount the user receives for `send_amount` under a pair's fee schedule.
pub fn receive_amount(send_amount: u64, fee_percentage: f64, miner_fees: u64) -> Result<u64> {
    if !(0.0..100.0).contains(&fee_percentage) {
        return Err(Error::InvalidResponse(format!(
            "fee percentage out of range: {fee_percentage}"
        )));
    }
    let service_fee = (send_amount as f64 * fee_percentage / 100.0).ceil() as u64;
    send_amount
        .checked_sub(service_fee)
        .and_then(|rest| rest.checked_sub(miner_fees))
        .ok_or_else(|| {
            Error::InvalidResponse(format!(
                "fees exceed amount: amount={send_amount} service_fee={service_fee} miner_fees={miner_fees}"
            ))
        })
}

/// Number of blocks covering `window_secs`, rounded up.
pub fn blocks_for_duration(window_secs: u64, block_time_secs: u64) -> u32 {
    if block_time_secs == 0 {
        return 0;
    }
    u32::try_from(window_secs.div_ceil(block_time_secs)).unwrap_or(u32::MAX)
}
